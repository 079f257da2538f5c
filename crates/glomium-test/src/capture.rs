//! In-memory capture of tracing events.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// One captured event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLog {
    /// Event level.
    pub level: Level,
    /// Event target.
    pub target: String,
    /// Rendered `message` field.
    pub message: String,
}

/// A [`Layer`] that records every event it sees.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    records: Arc<Mutex<Vec<CapturedLog>>>,
}

impl LogCapture {
    /// Create an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make this capture the default subscriber for the current thread
    /// until the guard drops.
    #[must_use]
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// Make this capture the global subscriber.
    ///
    /// Returns `false` if a global subscriber was already set.
    pub fn install_global(&self) -> bool {
        tracing::subscriber::set_global_default(tracing_subscriber::registry().with(self.clone()))
            .is_ok()
    }

    /// Everything captured so far.
    #[must_use]
    pub fn records(&self) -> Vec<CapturedLog> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Captured events for one target.
    #[must_use]
    pub fn for_target(&self, target: &str) -> Vec<CapturedLog> {
        self.records()
            .into_iter()
            .filter(|record| record.target == target)
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedLog {
                level: *metadata.level(),
                target: metadata.target().to_owned(),
                message: visitor.message,
            });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_level_target_and_message() {
        let capture = LogCapture::new();
        {
            let _guard = capture.install();
            tracing::warn!(target: "capture::test", answer = 42, "hello {}", "there");
            tracing::info!("elsewhere");
        }
        tracing::error!(target: "capture::test", "not captured");

        let records = capture.for_target("capture::test");
        assert_eq!(
            records,
            vec![CapturedLog {
                level: Level::WARN,
                target: "capture::test".into(),
                message: "hello there".into(),
            }]
        );
        assert_eq!(capture.records().len(), 2);
    }
}
