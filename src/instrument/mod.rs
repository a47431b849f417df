//! Operation duration instrumentation
//!
//! Each backend adapter owns an [`OpInstrument`] constructed alongside
//! it; there is no process-wide singleton. The wrapper is purely
//! observational: it never alters results or error propagation, and when
//! the debug threshold is disabled the clock is never read at all.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::Level;

/// Closed set of instrumented backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Search,
    Add,
    Modify,
    Remove,
    Exists,
    Count,
    Authenticate,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Search => "search",
            OperationKind::Add => "add",
            OperationKind::Modify => "modify",
            OperationKind::Remove => "remove",
            OperationKind::Exists => "exists",
            OperationKind::Count => "count",
            OperationKind::Authenticate => "authenticate",
        }
    }
}

/// Debug-logging capability composed into an adapter's instrumentation.
pub trait DebugLog: Send + Sync {
    /// Whether the debug threshold is currently enabled. When false the
    /// duration is not even computed.
    fn is_enabled(&self) -> bool;

    fn log_debug(&self, operation: &str, duration: Duration);
}

/// [`DebugLog`] over the `tracing` debug level.
pub struct TracingDebugLog {
    backend: &'static str,
}

impl TracingDebugLog {
    pub fn new(backend: &'static str) -> Self {
        TracingDebugLog { backend }
    }
}

impl DebugLog for TracingDebugLog {
    fn is_enabled(&self) -> bool {
        tracing::enabled!(Level::DEBUG)
    }

    fn log_debug(&self, operation: &str, duration: Duration) {
        tracing::debug!(
            backend = self.backend,
            operation,
            duration_ms = duration.as_millis() as u64,
            "operation completed"
        );
    }
}

/// Measures backend operations and reports their latency through the
/// composed [`DebugLog`].
pub struct OpInstrument {
    log: Box<dyn DebugLog>,
}

impl OpInstrument {
    pub fn new(backend: &'static str) -> Self {
        OpInstrument {
            log: Box::new(TracingDebugLog::new(backend)),
        }
    }

    pub fn with_log(log: Box<dyn DebugLog>) -> Self {
        OpInstrument { log }
    }

    /// Runs `operation`, logging its duration when debug logging is
    /// enabled. Transparent to the wrapped output.
    pub async fn measure<T, F>(&self, kind: OperationKind, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        if !self.log.is_enabled() {
            return operation.await;
        }
        let started = Instant::now();
        let output = operation.await;
        self.log.log_debug(kind.name(), started.elapsed());
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingLog {
        enabled: bool,
        records: Arc<Mutex<Vec<String>>>,
    }

    impl DebugLog for RecordingLog {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn log_debug(&self, operation: &str, _duration: Duration) {
            self.records.lock().unwrap().push(operation.to_string());
        }
    }

    #[tokio::test]
    async fn test_measure_logs_when_enabled() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let instrument = OpInstrument::with_log(Box::new(RecordingLog {
            enabled: true,
            records: records.clone(),
        }));
        let value = instrument
            .measure(OperationKind::Search, async { 42 })
            .await;
        assert_eq!(value, 42);
        assert_eq!(records.lock().unwrap().as_slice(), ["search"]);
    }

    #[tokio::test]
    async fn test_measure_skips_when_disabled() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let instrument = OpInstrument::with_log(Box::new(RecordingLog {
            enabled: false,
            records: records.clone(),
        }));
        instrument.measure(OperationKind::Add, async {}).await;
        assert!(records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_measure_preserves_errors() {
        let instrument = OpInstrument::new("sql");
        let out: Result<(), &str> = instrument
            .measure(OperationKind::Remove, async { Err("boom") })
            .await;
        assert_eq!(out, Err("boom"));
    }
}
