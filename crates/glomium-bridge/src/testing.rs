//! Scripted engine for unit tests.

use std::sync::{Arc, Mutex};

use glomium_wire::{
    ContextHandle, Engine, EngineError, Event, EventSink, ExecutionToken, GasConfig,
    InvocationResponse, Request, WireValue,
};
use tokio::sync::Notify;

type Responder = Box<dyn Fn(&Request) -> Option<WireValue> + Send + Sync>;

/// Records everything the bridge sends and lets the test emit events.
///
/// With a responder, every dispatched request is answered synchronously
/// with `callFinished` carrying the responder's result.
pub(crate) struct MockEngine {
    sink: Mutex<Option<EventSink>>,
    requests: Mutex<Vec<Request>>,
    notifications: Mutex<Vec<(ExecutionToken, InvocationResponse)>>,
    replaced: Mutex<Vec<(ContextHandle, ContextHandle)>>,
    destroyed: Mutex<Vec<ContextHandle>>,
    responder: Option<Responder>,
    changed: Notify,
}

impl MockEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::with_responder(None))
    }

    pub(crate) fn answering(
        responder: impl Fn(&Request) -> Option<WireValue> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::with_responder(Some(Box::new(responder))))
    }

    fn with_responder(responder: Option<Responder>) -> Self {
        Self {
            sink: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            responder,
            changed: Notify::new(),
        }
    }

    pub(crate) fn emit(&self, event: &Event) {
        self.emit_raw(&event.to_wire().unwrap());
    }

    pub(crate) fn emit_raw(&self, text: &str) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(text.to_owned());
        }
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn replaced(&self) -> Vec<(ContextHandle, ContextHandle)> {
        self.replaced.lock().unwrap().clone()
    }

    pub(crate) fn destroyed(&self) -> Vec<ContextHandle> {
        self.destroyed.lock().unwrap().clone()
    }

    /// Wait until request number `index` has been dispatched.
    pub(crate) async fn wait_for_request(&self, index: usize) -> Request {
        loop {
            let notified = self.changed.notified();
            if let Some(request) = self.requests.lock().unwrap().get(index) {
                return request.clone();
            }
            notified.await;
        }
    }

    /// Wait for the next invocation response, in delivery order.
    pub(crate) async fn next_notification(&self) -> (ExecutionToken, InvocationResponse) {
        loop {
            let notified = self.changed.notified();
            {
                let mut notifications = self.notifications.lock().unwrap();
                if !notifications.is_empty() {
                    return notifications.remove(0);
                }
            }
            notified.await;
        }
    }
}

impl Engine for MockEngine {
    fn create_context(
        &self,
        _gas: GasConfig,
        events: EventSink,
    ) -> Result<ContextHandle, EngineError> {
        *self.sink.lock().unwrap() = Some(events);
        Ok(ContextHandle(1))
    }

    fn dispatch(&self, _context: ContextHandle, request: String) {
        let request = Request::from_wire(&request).unwrap();
        self.requests.lock().unwrap().push(request.clone());
        self.changed.notify_waiters();

        if let Some(result) = self.responder.as_ref().and_then(|r| r(&request)) {
            self.emit(&Event::CallFinished {
                call_id: request.call_id().clone(),
                result: Some(result),
                error: None,
            });
        }
    }

    fn notify_pending_invocation(&self, token: ExecutionToken, response: String) {
        let response = InvocationResponse::from_wire(&response).unwrap();
        self.notifications.lock().unwrap().push((token, response));
        self.changed.notify_waiters();
    }

    fn replace_context(&self, old: ContextHandle, new: ContextHandle) -> ContextHandle {
        self.replaced.lock().unwrap().push((old, new));
        new
    }

    fn destroy_context(&self, context: ContextHandle) {
        self.destroyed.lock().unwrap().push(context);
    }
}
