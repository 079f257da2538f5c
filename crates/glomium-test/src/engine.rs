//! An in-process [`Engine`] backed by the toy interpreter.
//!
//! Each context runs on its own named thread that drains a request queue,
//! so a script suspended on a host function blocks only its own context.
//! A flushed context gets a fresh heap on the same thread and a new handle
//! aliasing the same queue until `replace_context` retires the old one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use glomium_wire::{
    ContextHandle, Engine, EngineError, Event, EventSink, ExecutionToken, FunctionHandle,
    GasConfig, GasSnapshot, InvocationResponse, LogLevel, Request, WireValue,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::gas::GasMeter;
use crate::interp::{Abort, Heap, HostLink};

struct Worker {
    id: u64,
    queue: mpsc::UnboundedSender<String>,
}

struct Suspended {
    worker: u64,
    reply: oneshot::Sender<String>,
}

#[derive(Default)]
struct Shared {
    contexts: Mutex<HashMap<ContextHandle, Worker>>,
    invocations: Mutex<HashMap<ExecutionToken, Suspended>>,
    next_handle: AtomicU64,
    next_token: AtomicU64,
}

impl Shared {
    fn contexts(&self) -> MutexGuard<'_, HashMap<ContextHandle, Worker>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invocations(&self) -> MutexGuard<'_, HashMap<ExecutionToken, Suspended>> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> ContextHandle {
        ContextHandle(self.next_handle.fetch_add(1, Ordering::Relaxed).saturating_add(1))
    }
}

/// Script engine for integration tests.
///
/// Speaks the full request/event protocol: globals, `eval`, calls by
/// pointer, flushes, gas reads and writes, host function invocations and
/// `print` logging.
#[derive(Default)]
pub struct ToyEngine {
    shared: Arc<Shared>,
}

impl ToyEngine {
    /// A new engine with no contexts.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live context handles.
    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.shared.contexts().len()
    }

    /// Number of scripts currently suspended on a host function.
    #[must_use]
    pub fn suspended_invocations(&self) -> usize {
        self.shared.invocations().len()
    }
}

impl Engine for ToyEngine {
    fn create_context(
        &self,
        gas: GasConfig,
        events: EventSink,
    ) -> Result<ContextHandle, EngineError> {
        let handle = self.shared.handle();
        let (queue, requests) = mpsc::unbounded_channel();
        let worker = WorkerLoop {
            id: handle.0,
            shared: Arc::downgrade(&self.shared),
            heap: Heap::new(gas),
            events,
        };

        thread::Builder::new()
            .name(format!("toy-context-{handle}"))
            .spawn(move || worker.run(requests))
            .map_err(|e| EngineError::CreateContext(e.to_string()))?;

        self.shared.contexts().insert(
            handle,
            Worker {
                id: handle.0,
                queue,
            },
        );
        debug!(context = %handle, "Created toy context");
        Ok(handle)
    }

    fn dispatch(&self, context: ContextHandle, request: String) {
        let contexts = self.shared.contexts();
        match contexts.get(&context) {
            Some(worker) => {
                if worker.queue.send(request).is_err() {
                    warn!(context = %context, "Toy context worker has exited");
                }
            },
            None => warn!(context = %context, "Dispatch to unknown toy context"),
        }
    }

    fn notify_pending_invocation(&self, token: ExecutionToken, response: String) {
        let suspended = self.shared.invocations().remove(&token);
        match suspended {
            Some(suspended) => {
                let _ = suspended.reply.send(response);
            },
            None => debug!(token = %token, "Response for unknown invocation"),
        }
    }

    fn replace_context(&self, old: ContextHandle, new: ContextHandle) -> ContextHandle {
        let mut contexts = self.shared.contexts();
        if old != new {
            contexts.remove(&old);
        }
        new
    }

    fn destroy_context(&self, context: ContextHandle) {
        let Some(worker) = self.shared.contexts().remove(&context) else {
            return;
        };
        // Dropping the reply senders wakes any script blocked on the host.
        self.shared
            .invocations()
            .retain(|_, suspended| suspended.worker != worker.id);
        debug!(context = %context, "Destroyed toy context");
    }
}

struct WorkerLoop {
    id: u64,
    shared: Weak<Shared>,
    heap: Heap,
    events: EventSink,
}

impl WorkerLoop {
    fn run(mut self, mut requests: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = requests.blocking_recv() {
            let request = match Request::from_wire(&text) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Toy context received malformed request");
                    continue;
                },
            };
            let call_id = request.call_id().clone();
            let event = match self.handle(request) {
                Ok(result) => Event::CallFinished {
                    call_id,
                    result: Some(result),
                    error: None,
                },
                Err(Abort::Throw(thrown)) => Event::CallFinished {
                    call_id,
                    result: None,
                    error: Some(self.heap.error_payload(&thrown)),
                },
                Err(Abort::OutOfGas) => Event::FatalError {
                    call_id,
                    gas_info: self.heap.meter.snapshot(),
                },
                Err(Abort::Fault(reason)) => {
                    debug!(reason = %reason, "Toy context aborted a request");
                    Event::FatalError {
                        call_id,
                        gas_info: self.heap.meter.snapshot(),
                    }
                },
            };
            emit(&self.events, &event);
        }
        debug!(worker = self.id, "Toy context worker exiting");
    }

    fn handle(&mut self, request: Request) -> Result<WireValue, Abort> {
        let link = Link {
            shared: &self.shared,
            worker: self.id,
            events: &self.events,
        };
        match request {
            Request::SetGlobal {
                global_name,
                global_value,
                ..
            } => {
                self.heap.set_global(&global_name, global_value)?;
                Ok(WireValue::undefined())
            },
            Request::GetGlobal { global_name, .. } => self.heap.get_global(&global_name),
            Request::Eval { code, .. } => {
                ensure_gas(&self.heap.meter)?;
                self.heap.eval(&code, &link)
            },
            Request::CallFunctionByPointer { pointer, args, .. } => {
                ensure_gas(&self.heap.meter)?;
                self.heap.call_pointer(pointer, args, &link)
            },
            Request::FlushContext { new_gas, .. } => {
                let handle = self.alias()?;
                self.heap = Heap::new(new_gas);
                Ok(WireValue::Number(handle_number(handle)))
            },
            Request::GetGas { .. } => Ok(snapshot_value(self.heap.meter.snapshot())),
            Request::SetGas { gas_data, .. } => {
                self.heap.meter = GasMeter::from_descriptor(gas_data);
                Ok(snapshot_value(self.heap.meter.snapshot()))
            },
        }
    }

    /// Register a new handle for this worker's queue.
    fn alias(&self) -> Result<ContextHandle, Abort> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| Abort::Fault("engine dropped".to_owned()))?;
        let mut contexts = shared.contexts();
        let queue = contexts
            .values()
            .find(|worker| worker.id == self.id)
            .map(|worker| worker.queue.clone())
            .ok_or_else(|| Abort::Fault("context destroyed".to_owned()))?;
        let handle = shared.handle();
        contexts.insert(handle, Worker { id: self.id, queue });
        Ok(handle)
    }
}

struct Link<'a> {
    shared: &'a Weak<Shared>,
    worker: u64,
    events: &'a EventSink,
}

impl HostLink for Link<'_> {
    fn invoke(
        &self,
        handle: FunctionHandle,
        args: Vec<WireValue>,
    ) -> Result<InvocationResponse, Abort> {
        let (reply, answer) = oneshot::channel();
        let token = {
            let shared = self
                .shared
                .upgrade()
                .ok_or_else(|| Abort::Fault("engine dropped".to_owned()))?;
            let token = ExecutionToken(shared.next_token.fetch_add(1, Ordering::Relaxed));
            shared.invocations().insert(
                token,
                Suspended {
                    worker: self.worker,
                    reply,
                },
            );
            token
        };

        emit(
            self.events,
            &Event::InvokeFunction {
                handle,
                args,
                token,
            },
        );

        let text = answer
            .blocking_recv()
            .map_err(|_| Abort::Fault("host invocation abandoned".to_owned()))?;
        InvocationResponse::from_wire(&text).map_err(|e| Abort::Fault(e.to_string()))
    }

    fn log(&self, message: String) {
        emit(
            self.events,
            &Event::Log {
                level: LogLevel::Info,
                message,
            },
        );
    }
}

fn emit(events: &EventSink, event: &Event) {
    match event.to_wire() {
        Ok(text) => events(text),
        Err(e) => warn!(error = %e, "Failed to encode toy engine event"),
    }
}

fn ensure_gas(meter: &GasMeter) -> Result<(), Abort> {
    if meter.is_exhausted() {
        return Err(Abort::OutOfGas);
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn handle_number(handle: ContextHandle) -> f64 {
    handle.0 as f64
}

fn snapshot_value(snapshot: GasSnapshot) -> WireValue {
    serde_json::to_value(snapshot).map_or_else(|_| WireValue::Null, WireValue::from_json)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use glomium_wire::{CallId, Escape, GasDescriptor};

    use super::*;

    struct Harness {
        engine: Arc<ToyEngine>,
        context: ContextHandle,
        events: std_mpsc::Receiver<Event>,
    }

    impl Harness {
        fn new(gas: GasConfig) -> Self {
            let engine = ToyEngine::new();
            let (tx, events) = std_mpsc::channel();
            let tx = Mutex::new(tx);
            let sink: EventSink = Arc::new(move |text: String| {
                let event = Event::from_wire(&text).unwrap();
                let _ = tx.lock().unwrap().send(event);
            });
            let context = engine.create_context(gas, sink).unwrap();
            Self {
                engine,
                context,
                events,
            }
        }

        fn send(&self, request: &Request) -> Event {
            self.engine
                .dispatch(self.context, request.to_wire().unwrap());
            self.next()
        }

        fn next(&self) -> Event {
            self.events.recv_timeout(Duration::from_secs(5)).unwrap()
        }
    }

    fn eval(code: &str) -> Request {
        Request::Eval {
            call_id: CallId::new("c"),
            code: code.into(),
        }
    }

    #[test]
    fn evaluates_and_reports_results() {
        let harness = Harness::new(GasConfig::new(10_000, 1));
        let event = harness.send(&eval("1 + 2"));
        assert_eq!(
            event,
            Event::CallFinished {
                call_id: CallId::new("c"),
                result: Some(WireValue::from(3)),
                error: None,
            }
        );
    }

    #[test]
    fn runaway_script_is_fatal() {
        let harness = Harness::new(GasConfig::new(200, 1));
        let Event::FatalError { gas_info, .. } = harness.send(&eval("loop 0")) else {
            panic!("expected a fatal error");
        };
        assert!(gas_info.is_exhausted());

        // Still exhausted: rejected before evaluation.
        assert!(matches!(
            harness.send(&eval("1")),
            Event::FatalError { .. }
        ));

        let restored = harness.send(&Request::SetGas {
            call_id: CallId::new("g"),
            gas_data: GasDescriptor {
                limit: 200,
                memory_byte_cost: 1,
                used: 0,
            },
        });
        assert!(matches!(restored, Event::CallFinished { error: None, .. }));
        assert!(matches!(
            harness.send(&eval("1")),
            Event::CallFinished { error: None, .. }
        ));
    }

    #[test]
    fn flush_aliases_the_worker() {
        let harness = Harness::new(GasConfig::new(10_000, 1));
        harness.send(&eval("x = 1"));
        let Event::CallFinished {
            result: Some(WireValue::Number(n)),
            ..
        } = harness.send(&Request::FlushContext {
            call_id: CallId::new("f"),
            new_gas: GasConfig::new(10_000, 1),
        })
        else {
            panic!("expected a new handle");
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let new = ContextHandle(n as u64);
        assert_ne!(new, harness.context);
        assert_eq!(harness.engine.live_contexts(), 2);

        assert_eq!(harness.engine.replace_context(harness.context, new), new);
        assert_eq!(harness.engine.live_contexts(), 1);

        harness
            .engine
            .dispatch(new, eval("x").to_wire().unwrap());
        assert!(matches!(
            harness.next(),
            Event::CallFinished { error: Some(_), .. }
        ));
    }

    #[test]
    fn host_invocation_suspends_until_notified() {
        let harness = Harness::new(GasConfig::new(10_000, 1));
        harness.send(&Request::SetGlobal {
            call_id: CallId::new("s"),
            global_name: "f".into(),
            global_value: WireValue::Escape(Escape::HostFunction {
                handle: FunctionHandle::new(0, 0),
                name: "f".into(),
            }),
        });

        let event = harness.send(&eval("f(3) + 1"));
        let Event::InvokeFunction { args, token, .. } = event else {
            panic!("expected an invocation");
        };
        assert_eq!(args, vec![WireValue::from(3)]);
        assert_eq!(harness.engine.suspended_invocations(), 1);

        harness.engine.notify_pending_invocation(
            token,
            InvocationResponse::Resolved(WireValue::from(41))
                .to_wire()
                .unwrap(),
        );
        assert!(matches!(
            harness.next(),
            Event::CallFinished { result: Some(WireValue::Number(n)), .. } if n == 42.0
        ));
    }

    #[test]
    fn destroy_abandons_suspended_invocations() {
        let harness = Harness::new(GasConfig::new(10_000, 1));
        harness.send(&Request::SetGlobal {
            call_id: CallId::new("s"),
            global_name: "f".into(),
            global_value: WireValue::Escape(Escape::HostFunction {
                handle: FunctionHandle::new(0, 0),
                name: "f".into(),
            }),
        });
        assert!(matches!(
            harness.send(&eval("f()")),
            Event::InvokeFunction { .. }
        ));

        harness.engine.destroy_context(harness.context);
        assert_eq!(harness.engine.live_contexts(), 0);
        assert_eq!(harness.engine.suspended_invocations(), 0);
        assert!(matches!(harness.next(), Event::FatalError { .. }));
    }
}
