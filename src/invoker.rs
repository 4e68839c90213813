use crate::errors::{BuslinkError, Result};
use crate::message::{ErrorContext, MessageContext};
use crate::pipeline::{ErrorHandleResult, MessageReceiver, OnErrorFn, OnMessageFn, PushRuntimeSettings};
use std::sync::OnceLock;

/// Adapts the pull-based pipeline registration contract into a pair of
/// synchronous-call entry points.
///
/// The pipeline runtime was built for long-running receivers that register a
/// message pump via [`MessageReceiver::initialize`] and then poll
/// continuously. Inside a serverless host there is no pump: the host trigger
/// delivers one message at a time and expects the call to return. The invoker
/// captures the callbacks the runtime registers and exposes them as
/// [`push_message`](PipelineInvoker::push_message) /
/// [`push_failed_message`](PipelineInvoker::push_failed_message) for the
/// message processor to drive.
///
/// Stateless after initialization: concurrent pushes for independent messages
/// are expected and safe, the captured callbacks are reentrant.
pub struct PipelineInvoker {
    callbacks: OnceLock<Callbacks>,
}

struct Callbacks {
    on_message: OnMessageFn,
    on_error: OnErrorFn,
}

impl PipelineInvoker {
    pub fn new() -> Self {
        Self {
            callbacks: OnceLock::new(),
        }
    }

    /// Whether a receiver registration has been captured yet.
    pub fn is_initialized(&self) -> bool {
        self.callbacks.get().is_some()
    }

    /// Invoke the captured `on_message` callback for one inbound message.
    ///
    /// Errors from the pipeline propagate to the caller unmodified.
    pub async fn push_message(&self, context: MessageContext) -> Result<()> {
        let callbacks = self.callbacks()?;
        (callbacks.on_message)(context).await
    }

    /// Invoke the captured `on_error` callback for a failed message.
    pub async fn push_failed_message(&self, context: ErrorContext) -> Result<ErrorHandleResult> {
        let callbacks = self.callbacks()?;
        (callbacks.on_error)(context).await
    }

    fn callbacks(&self) -> Result<&Callbacks> {
        self.callbacks.get().ok_or_else(|| {
            BuslinkError::InvalidOperation(
                "pipeline has not registered its receiver callbacks yet".to_string(),
            )
        })
    }
}

impl Default for PipelineInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageReceiver for PipelineInvoker {
    /// Capture the runtime's callbacks.
    ///
    /// The runtime may construct receiver instances for secondary queues and
    /// initialize each of them; only the first (main input queue) registration
    /// is kept so exactly one external-invocation channel exists. Later
    /// registrations are deliberately ignored.
    async fn initialize(
        &self,
        _limitations: PushRuntimeSettings,
        on_message: OnMessageFn,
        on_error: OnErrorFn,
    ) -> Result<()> {
        let _ = self.callbacks.set(Callbacks { on_message, on_error });
        Ok(())
    }

    /// Message delivery is driven by the host trigger, not by polling.
    async fn start_receive(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_receive(&self) -> Result<()> {
        Ok(())
    }
}
