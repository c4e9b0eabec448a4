//! Error aggregation with de-duplication.
//!
//! Periodic tasks never propagate errors upward; they record the latest
//! failure per operation here. An entry only reaches the telemetry sink
//! when the same operation fails again on a later cycle — a transient
//! error recovered on the next tick is cleared and never reported.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::error;

use crate::CLIENT_VERSION;

/// Destination for errors that persisted across retries.
pub trait ErrorSink: Send + Sync {
    fn notify(&self, class: &str, message: &str, host_context: &str);
}

/// Default sink: structured error events on the log stream.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn notify(&self, class: &str, message: &str, host_context: &str) {
        error!(class, host = %host_context, "{message}");
    }
}

/// Concurrent map of operation name to its last observed error.
pub struct ErrorMap {
    inner: DashMap<String, String>,
    sink: Arc<dyn ErrorSink>,
    host_context: String,
}

impl ErrorMap {
    #[must_use]
    pub fn new(host_id: &str) -> Self {
        Self::with_sink(host_id, Arc::new(TracingSink))
    }

    #[must_use]
    pub fn with_sink(host_id: &str, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            inner: DashMap::new(),
            sink,
            host_context: format!(
                "{host_id} os: {} version: {CLIENT_VERSION}",
                std::env::consts::OS
            ),
        }
    }

    /// Store the latest error for an operation.
    pub fn write(&self, name: &str, err: &dyn std::fmt::Display) {
        self.inner.insert(name.to_string(), err.to_string());
    }

    /// Forget an operation's stored error; called after a successful run.
    pub fn clear(&self, name: &str) {
        self.inner.remove(name);
    }

    /// Emit the stored error (if any) to the sink, then forget it.
    pub fn report(&self, name: &str) {
        if let Some((_, message)) = self.inner.remove(name) {
            self.sink.notify(name, &message, &self.host_context);
        }
    }

    /// Record a failed run: whatever was already stored has now persisted
    /// across a full cycle and is reported before the new error replaces
    /// it.
    pub fn record_failure(&self, name: &str, err: &dyn std::fmt::Display) {
        self.report(name);
        self.write(name, err);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}
