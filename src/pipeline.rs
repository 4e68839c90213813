use crate::config::EndpointConfig;
use crate::errors::Result;
use crate::invoker::PipelineInvoker;
use crate::message::{ErrorContext, MessageContext, OutgoingMessage};
use crate::transaction::TransportTransaction;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed future used for the pipeline callback types.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The pipeline runtime's message callback: executes the handler pipeline for
/// one inbound message. Must be reentrant: the host may deliver independent
/// messages concurrently.
pub type OnMessageFn = Arc<dyn Fn(MessageContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The pipeline runtime's failure callback: runs the recoverability pipeline
/// for a failed message and reports whether the failure was absorbed.
pub type OnErrorFn =
    Arc<dyn Fn(ErrorContext) -> BoxFuture<'static, Result<ErrorHandleResult>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Error-pipeline outcome
// ---------------------------------------------------------------------------

/// What the error pipeline decided about a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandleResult {
    /// The failure was absorbed (e.g. the message was routed to the error
    /// queue). The inbound message can be completed.
    Handled,
    /// The failure was not absorbed. The original error propagates to the
    /// host so its native redelivery and retry counting apply.
    RetryRequired,
}

// ---------------------------------------------------------------------------
// Receiver registration contract
// ---------------------------------------------------------------------------

/// Throughput limits the pipeline runtime passes to a receiver at
/// registration time.
#[derive(Debug, Clone, Copy)]
pub struct PushRuntimeSettings {
    /// Maximum number of messages processed concurrently.
    pub max_concurrency: usize,
}

impl Default for PushRuntimeSettings {
    fn default() -> Self {
        Self { max_concurrency: 10 }
    }
}

/// The pull-based registration contract the pipeline runtime drives.
///
/// A pipeline runtime built for long-running, continuously-polling receivers
/// registers its message pump through this trait: `initialize` hands over the
/// `on_message` / `on_error` callbacks, then `start_receive` / `stop_receive`
/// control the pump. Under this adapter the pump is suppressed (delivery is
/// driven externally by the host trigger), so [`PipelineInvoker`] implements
/// `start_receive` and `stop_receive` as no-ops.
#[async_trait::async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Register the runtime's processing callbacks with this receiver.
    async fn initialize(
        &self,
        limitations: PushRuntimeSettings,
        on_message: OnMessageFn,
        on_error: OnErrorFn,
    ) -> Result<()>;

    /// Start the receive loop. No-op under this adapter.
    async fn start_receive(&self) -> Result<()>;

    /// Stop the receive loop. No-op under this adapter.
    async fn stop_receive(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Pipeline runtime collaborators
// ---------------------------------------------------------------------------

/// The message-bus pipeline runtime: an external collaborator that owns
/// handler dispatch, recoverability, serialization and routing.
///
/// `start` boots the runtime, during which the runtime registers its
/// callbacks on the supplied receiver (usually more than once when secondary
/// queues are configured; only the main receiver's registration is kept, see
/// [`PipelineInvoker::initialize`](crate::pipeline::MessageReceiver::initialize)).
#[async_trait::async_trait]
pub trait PipelineRuntime: Send + Sync {
    /// Start the pipeline and return the outbound endpoint surface.
    async fn start(
        &self,
        config: &EndpointConfig,
        receiver: Arc<PipelineInvoker>,
    ) -> Result<Arc<dyn PipelineEndpoint>>;
}

/// Outbound operations of a started pipeline.
///
/// When invoked from within a handler under the atomic transaction mode, the
/// supplied [`TransportTransaction`] carries the transaction the operation
/// must enlist in.
#[async_trait::async_trait]
pub trait PipelineEndpoint: Send + Sync {
    /// Send a message to a specific destination.
    async fn send(
        &self,
        destination: &str,
        message: OutgoingMessage,
        transaction: &TransportTransaction,
    ) -> Result<()>;

    /// Publish an event to all subscribers.
    async fn publish(
        &self,
        event: OutgoingMessage,
        transaction: &TransportTransaction,
    ) -> Result<()>;

    /// Subscribe this endpoint to an event type.
    async fn subscribe(&self, event_type: &str) -> Result<()>;
}
