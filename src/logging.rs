use std::sync::Mutex;
use tracing::Level;

// ---------------------------------------------------------------------------
// Startup logging
// ---------------------------------------------------------------------------

/// A single buffered log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    /// RFC 3339 capture time, preserved through buffering so flushed records
    /// keep their original timestamps.
    pub timestamp: String,
}

/// Destination for flushed log records.
pub trait LogSink: Send + Sync {
    fn log(&self, record: &LogRecord);
}

/// Flushes records as `tracing` events.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, record: &LogRecord) {
        match record.level {
            Level::ERROR => tracing::error!(captured_at = %record.timestamp, "{}", record.message),
            Level::WARN => tracing::warn!(captured_at = %record.timestamp, "{}", record.message),
            Level::INFO => tracing::info!(captured_at = %record.timestamp, "{}", record.message),
            Level::DEBUG => tracing::debug!(captured_at = %record.timestamp, "{}", record.message),
            Level::TRACE => tracing::trace!(captured_at = %record.timestamp, "{}", record.message),
        }
    }
}

/// Two-phase logger for the bootstrap window.
///
/// Records emitted while the endpoint is still starting have no concrete sink
/// yet; they are buffered in order. Once startup wires the real sink,
/// [`attach`](StartupLogger::attach) takes ownership of it, flushes the
/// buffered records in their original order, and routes everything after that
/// straight through. There is no process-wide static: the logger is owned by
/// the endpoint that created it.
pub struct StartupLogger {
    state: Mutex<State>,
}

enum State {
    Buffering(Vec<LogRecord>),
    Attached(Box<dyn LogSink>),
}

impl StartupLogger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Buffering(Vec::new())),
        }
    }

    /// Log a message. Buffered until a sink is attached.
    pub fn log(&self, level: Level, message: impl Into<String>) {
        let record = LogRecord {
            level,
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Buffering(records) => records.push(record),
            State::Attached(sink) => sink.log(&record),
        }
    }

    /// Attach the real sink, flushing buffered records in original order.
    ///
    /// Later `attach` calls replace the sink without re-flushing.
    pub fn attach(&self, sink: Box<dyn LogSink>) {
        let mut state = self.state.lock().unwrap();
        if let State::Buffering(records) = &mut *state {
            for record in records.drain(..) {
                sink.log(&record);
            }
        }
        *state = State::Attached(sink);
    }

    /// Number of records still waiting for a sink.
    pub fn buffered_len(&self) -> usize {
        match &*self.state.lock().unwrap() {
            State::Buffering(records) => records.len(),
            State::Attached(_) => 0,
        }
    }
}

impl Default for StartupLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl LogSink for RecordingSink {
        fn log(&self, record: &LogRecord) {
            self.messages.lock().unwrap().push(record.message.clone());
        }
    }

    #[test]
    fn buffers_until_attached_then_flushes_in_order() {
        let logger = StartupLogger::new();
        logger.log(Level::INFO, "first");
        logger.log(Level::WARN, "second");
        assert_eq!(logger.buffered_len(), 2);

        let sink = RecordingSink::default();
        logger.attach(Box::new(sink.clone()));

        assert_eq!(logger.buffered_len(), 0);
        assert_eq!(*sink.messages.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn logs_directly_after_attach() {
        let logger = StartupLogger::new();
        let sink = RecordingSink::default();
        logger.attach(Box::new(sink.clone()));

        logger.log(Level::INFO, "live");
        assert_eq!(*sink.messages.lock().unwrap(), vec!["live"]);
        assert_eq!(logger.buffered_len(), 0);
    }

    #[test]
    fn reattach_does_not_replay() {
        let logger = StartupLogger::new();
        logger.log(Level::INFO, "early");

        let first = RecordingSink::default();
        logger.attach(Box::new(first.clone()));

        let second = RecordingSink::default();
        logger.attach(Box::new(second.clone()));

        assert_eq!(*first.messages.lock().unwrap(), vec!["early"]);
        assert!(second.messages.lock().unwrap().is_empty());
    }
}
