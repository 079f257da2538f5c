//! Requests, events and invocation responses.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolResult;
use crate::gas::{GasConfig, GasDescriptor, GasSnapshot};
use crate::ids::{CallId, ExecutionToken, FunctionHandle, HeapPointer};
use crate::value::WireValue;

/// A request sent from the host bridge to the engine.
///
/// Every request carries the [`CallId`] its settlement will be correlated
/// by; the engine answers with [`Event::CallFinished`] or
/// [`Event::FatalError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Request {
    /// Bind a global.
    #[serde(rename_all = "camelCase")]
    SetGlobal {
        /// Correlation id.
        call_id: CallId,
        /// Global name.
        global_name: String,
        /// Encoded value.
        global_value: WireValue,
    },
    /// Read a global.
    #[serde(rename_all = "camelCase")]
    GetGlobal {
        /// Correlation id.
        call_id: CallId,
        /// Global name.
        global_name: String,
    },
    /// Evaluate source text.
    #[serde(rename_all = "camelCase")]
    Eval {
        /// Correlation id.
        call_id: CallId,
        /// Script source.
        code: String,
    },
    /// Call a sandbox function previously handed to the host.
    #[serde(rename_all = "camelCase")]
    CallFunctionByPointer {
        /// Correlation id.
        call_id: CallId,
        /// Heap pointer of the function.
        pointer: HeapPointer,
        /// Encoded positional arguments.
        args: Vec<WireValue>,
    },
    /// Replace the context with a fresh one. The result is the new
    /// context handle.
    #[serde(rename_all = "camelCase")]
    FlushContext {
        /// Correlation id.
        call_id: CallId,
        /// Gas settings for the fresh context.
        new_gas: GasConfig,
    },
    /// Read the gas state.
    #[serde(rename_all = "camelCase")]
    GetGas {
        /// Correlation id.
        call_id: CallId,
    },
    /// Overwrite the gas state.
    #[serde(rename_all = "camelCase")]
    SetGas {
        /// Correlation id.
        call_id: CallId,
        /// New gas state.
        gas_data: GasDescriptor,
    },
}

impl Request {
    /// The correlation id of this request.
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::SetGlobal { call_id, .. }
            | Self::GetGlobal { call_id, .. }
            | Self::Eval { call_id, .. }
            | Self::CallFunctionByPointer { call_id, .. }
            | Self::FlushContext { call_id, .. }
            | Self::GetGas { call_id }
            | Self::SetGas { call_id, .. } => call_id,
        }
    }

    /// Short name of the request kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetGlobal { .. } => "setGlobal",
            Self::GetGlobal { .. } => "getGlobal",
            Self::Eval { .. } => "eval",
            Self::CallFunctionByPointer { .. } => "callFunctionByPointer",
            Self::FlushContext { .. } => "flushContext",
            Self::GetGas { .. } => "getGas",
            Self::SetGas { .. } => "setGas",
        }
    }

    /// Serialize to wire text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TooDeep`](crate::ProtocolError) if a carried
    /// value nests past [`MAX_VALUE_DEPTH`](crate::MAX_VALUE_DEPTH), or
    /// [`ProtocolError::Malformed`](crate::ProtocolError) if serialization
    /// fails.
    pub fn to_wire(&self) -> ProtocolResult<String> {
        self.check_depth()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`](crate::ProtocolError) if the text
    /// is not a known request, or
    /// [`ProtocolError::TooDeep`](crate::ProtocolError) if it carries a value
    /// nested past the cap.
    pub fn from_wire(text: &str) -> ProtocolResult<Self> {
        let request: Self = serde_json::from_str(text)?;
        request.check_depth()?;
        Ok(request)
    }

    fn check_depth(&self) -> ProtocolResult<()> {
        match self {
            Self::SetGlobal { global_value, .. } => global_value.check_depth(),
            Self::CallFunctionByPointer { args, .. } => {
                args.iter().try_for_each(WireValue::check_depth)
            },
            _ => Ok(()),
        }
    }
}

/// Severity of a sandbox log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

/// A notification emitted by the engine.
///
/// The set is closed: an unknown `event` tag fails to parse at the
/// boundary instead of falling into a catch-all arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    /// Running script called a host function and is suspended until
    /// the host answers at `token`.
    #[serde(rename_all = "camelCase")]
    InvokeFunction {
        /// Registry handle of the function.
        handle: FunctionHandle,
        /// Encoded positional arguments.
        args: Vec<WireValue>,
        /// Where to deliver the [`InvocationResponse`].
        token: ExecutionToken,
    },
    /// A request completed.
    #[serde(rename_all = "camelCase")]
    CallFinished {
        /// Correlation id of the request.
        call_id: CallId,
        /// Result value, when present. A present `null` stays `Some`.
        #[serde(
            default,
            deserialize_with = "present",
            skip_serializing_if = "Option::is_none"
        )]
        result: Option<WireValue>,
        /// Uncaught error value, when the request failed.
        #[serde(
            default,
            deserialize_with = "present",
            skip_serializing_if = "Option::is_none"
        )]
        error: Option<WireValue>,
    },
    /// The engine aborted a request (gas exhaustion or an internal fault).
    #[serde(rename_all = "camelCase")]
    FatalError {
        /// Correlation id of the aborted request.
        call_id: CallId,
        /// Gas state at the time of the fault.
        gas_info: GasSnapshot,
    },
    /// Diagnostic output from the sandbox.
    #[serde(rename_all = "camelCase")]
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
}

impl Event {
    /// Serialize to wire text.
    ///
    /// No depth check happens here: an over-deep result still reaches the
    /// host, which rejects the call it settles.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`](crate::ProtocolError) if
    /// serialization fails.
    pub fn to_wire(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire text.
    ///
    /// When this fails, [`EventHeader::peek`] can usually still tell which
    /// call or invocation the event was meant for.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`](crate::ProtocolError) if the text
    /// is not a known event, or
    /// [`ProtocolError::TooDeep`](crate::ProtocolError) if it carries a value
    /// nested past [`MAX_VALUE_DEPTH`](crate::MAX_VALUE_DEPTH).
    pub fn from_wire(text: &str) -> ProtocolResult<Self> {
        let event: Self = serde_json::from_str(text)?;
        match &event {
            Self::InvokeFunction { args, .. } => {
                args.iter().try_for_each(WireValue::check_depth)?;
            },
            Self::CallFinished { result, error, .. } => {
                result.iter().chain(error).try_for_each(WireValue::check_depth)?;
            },
            Self::FatalError { .. } | Self::Log { .. } => {},
        }
        Ok(event)
    }
}

/// The routing fields of an event.
///
/// Parsed without descending into payload values, so it is readable even
/// when the full event is not.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    /// The `event` tag.
    pub event: String,
    /// Correlation id, on settlement events.
    #[serde(default)]
    pub call_id: Option<CallId>,
    /// Suspension token, on invocation events.
    #[serde(default)]
    pub token: Option<ExecutionToken>,
}

impl EventHeader {
    /// Read the header of raw event text. Returns `None` if the text is not
    /// a JSON object with an `event` tag.
    #[must_use]
    pub fn peek(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Keeps an explicit `null` distinguishable from an absent field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<WireValue>, D::Error> {
    WireValue::deserialize(deserializer).map(Some)
}

/// The host's answer to [`Event::InvokeFunction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationResponse {
    /// The host function returned a value.
    Resolved(WireValue),
    /// The host function failed; the value is rethrown in the sandbox.
    Rejected(WireValue),
}

impl InvocationResponse {
    /// The carried value.
    #[must_use]
    pub fn value(&self) -> &WireValue {
        match self {
            Self::Resolved(value) | Self::Rejected(value) => value,
        }
    }

    /// Serialize to wire text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TooDeep`](crate::ProtocolError) if the value
    /// nests past [`MAX_VALUE_DEPTH`](crate::MAX_VALUE_DEPTH), or
    /// [`ProtocolError::Malformed`](crate::ProtocolError) if serialization
    /// fails.
    pub fn to_wire(&self) -> ProtocolResult<String> {
        self.value().check_depth()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`](crate::ProtocolError) if the text
    /// is not a response, or [`ProtocolError::TooDeep`](crate::ProtocolError)
    /// if its value nests past the cap.
    pub fn from_wire(text: &str) -> ProtocolResult<Self> {
        let response: Self = serde_json::from_str(text)?;
        response.value().check_depth()?;
        Ok(response)
    }
}
