use std::fmt;

// ---------------------------------------------------------------------------
// Main crate error type
// ---------------------------------------------------------------------------

/// Errors raised while bridging host-delivered messages into the pipeline.
///
/// All variants carry string payloads (or boxed `BuslinkError` sources) so the
/// enum is `Clone`: an [`ErrorContext`](crate::message::ErrorContext) holds a
/// clone of the triggering error while the original instance is rethrown to
/// the host unmodified.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuslinkError {
    /// A message handler (or the pipeline executing it) failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Processing was aborted because the host requested cancellation.
    ///
    /// Distinguished from [`BuslinkError::Handler`] so a host-initiated
    /// shutdown does not route the in-flight message to the error pipeline;
    /// the message is redelivered after restart instead.
    #[error("processing cancelled")]
    Cancelled,

    /// An operation was invoked on an endpoint not configured for it.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Endpoint misconfiguration, detected before any message is processed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A transaction could not be enlisted, completed, or committed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Host-boundary wrapper for a message whose failure was not absorbed by
    /// the error pipeline. The original failure is preserved as the source.
    #[error("Failed to process message {message_id}")]
    ProcessingFailed {
        message_id: String,
        #[source]
        source: Box<BuslinkError>,
    },
}

impl BuslinkError {
    /// Returns `true` if this error represents host-requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuslinkError::Cancelled)
    }

    /// Walks to the innermost error of a [`BuslinkError::ProcessingFailed`]
    /// chain. Returns `self` for all other variants.
    pub fn root_cause(&self) -> &BuslinkError {
        match self {
            BuslinkError::ProcessingFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for BuslinkError {
    fn from(err: serde_json::Error) -> Self {
        BuslinkError::Serialization(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Result type alias
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, BuslinkError>;

// ---------------------------------------------------------------------------
// Display helper for logging error chains
// ---------------------------------------------------------------------------

/// Formats an error together with its source chain, `outer: inner` style.
pub(crate) struct ErrorChain<'a>(pub &'a BuslinkError);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(inner) = source {
            write!(f, ": {}", inner)?;
            source = inner.source();
        }
        Ok(())
    }
}
