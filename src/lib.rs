#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(warnings)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Allowed pedantic lints for existing codebase compatibility
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::single_match_else)]
#![allow(clippy::map_unwrap_or)]
//! # buslink: serverless host adapter for message-bus pipelines
//!
//! `buslink` runs a message-bus processing pipeline inside a serverless
//! function host. The host delivers one externally-triggered queue message at
//! a time and expects the call to return to signal ack/abandon; the pipeline
//! was built for long-running receivers that register a message pump and poll
//! continuously. This crate bridges the two, and guarantees that completing
//! the inbound message is atomic with the pipeline's outgoing sends when the
//! configured transaction mode demands it.
//!
//! ## Processing a trigger message
//!
//! ```rust,ignore
//! use buslink::{EndpointConfig, ServerlessEndpoint, ShutdownToken, TriggerEnvelope};
//!
//! let config = EndpointConfig::builder("orders")
//!     .connection_string("Endpoint=sb://example/;...")
//!     .build()?;
//!
//! // `runtime` is the message-bus pipeline, `queue` the host's queueing
//! // client. The pipeline is started lazily on the first message.
//! let endpoint = ServerlessEndpoint::new(config, runtime, queue);
//!
//! // Host trigger callback, invoked once per delivered message:
//! let envelope: TriggerEnvelope = serde_json::from_slice(&raw)?;
//! endpoint.process(envelope, &ShutdownToken::never()).await?;
//! ```
//!
//! ## Failure handoff
//!
//! When the pipeline fails, the failure is re-entered through a parallel
//! error pipeline under a **fresh** transaction, since the original transaction
//! may be poisoned by the failure. If the error pipeline absorbs the failure
//! the message is completed under the new transaction; otherwise the original
//! error is rethrown so the host's native redelivery and retry counting
//! apply.
//!
//! ## Features
//!
//! - **Async-first**: built on `tokio`, no step blocks on network I/O
//! - **Three transaction modes**: none, receive-only (at-least-once), and
//!   sends-atomic-with-receive (all-or-nothing)
//! - **Lazy startup**: the pipeline starts on the first message, exactly
//!   once, with retry after a failed start
//! - **Explicit dispositions**: every message ends in exactly one of
//!   acknowledge, abandon, or propagate

pub mod config;
pub mod endpoint;
pub mod errors;
pub mod invoker;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod processor;
pub mod shutdown;
pub mod transaction;
pub mod transport;

/// Test doubles for the queue client and the pipeline runtime.
#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use config::{
    EndpointConfig, EndpointConfigBuilder, CONNECTION_SETTING_KEY, ENV_APP_NAME,
    ENV_CONNECTION_STRING, ENV_LICENSE,
};
pub use endpoint::ServerlessEndpoint;
pub use errors::{BuslinkError, Result};
pub use invoker::PipelineInvoker;
pub use logging::{LogRecord, LogSink, StartupLogger, TracingSink};
pub use message::{
    ErrorContext, InboundMessage, MessageContext, OutgoingMessage, TRANSPORT_ENCODING_HEADER,
};
pub use pipeline::{
    BoxFuture, ErrorHandleResult, MessageReceiver, OnErrorFn, OnMessageFn, PipelineEndpoint,
    PipelineRuntime, PushRuntimeSettings,
};
pub use processor::{MessageProcessor, ProcessingOutcome};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownToken};
pub use transaction::{
    strategy_for, AtomicSendsWithReceiveStrategy, NoTransactionStrategy, ReceiveOnlyStrategy,
    TransactionHandle, TransactionState, TransactionStrategy, TransportTransaction,
    TransportTransactionMode,
};
pub use transport::{DynQueueClient, QueueClient, TriggerEnvelope};
