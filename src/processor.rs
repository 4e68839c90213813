use crate::config::EndpointConfig;
use crate::errors::{BuslinkError, ErrorChain, Result};
use crate::invoker::PipelineInvoker;
use crate::message::{ErrorContext, InboundMessage, MessageContext};
use crate::pipeline::ErrorHandleResult;
use crate::shutdown::ShutdownToken;
use crate::transaction::{strategy_for, TransactionStrategy, TransportTransactionMode};
use crate::transport::DynQueueClient;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How an inbound message was disposed of.
///
/// The third possible disposition, an unhandled failure that propagates to
/// the host, is the `Err` arm of [`MessageProcessor::process`]. Exactly one
/// of {acknowledge, abandon, propagate} happens per inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The pipeline processed the message and it was completed.
    Completed,
    /// The pipeline failed but the error pipeline absorbed the failure; the
    /// message was completed under the fresh error-handling transaction.
    HandledByErrorPipeline,
}

// ---------------------------------------------------------------------------
// Message processor
// ---------------------------------------------------------------------------

/// Drives the receive → process → complete/abandon protocol for one
/// host-delivered message at a time.
///
/// The host invokes [`process`](MessageProcessor::process) concurrently for
/// independent messages; each invocation owns its message and its transaction
/// handles exclusively, and executes its steps strictly in order.
pub struct MessageProcessor {
    invoker: Arc<PipelineInvoker>,
    strategy: Arc<dyn TransactionStrategy>,
    queue: DynQueueClient,
    mode: TransportTransactionMode,
    receive_address: String,
    send_only: bool,
    outbox_enabled: bool,
}

impl MessageProcessor {
    pub fn new(
        config: &EndpointConfig,
        invoker: Arc<PipelineInvoker>,
        queue: DynQueueClient,
    ) -> Self {
        let mode = config.transaction_mode();
        Self {
            invoker,
            strategy: strategy_for(mode, queue.clone()),
            queue,
            mode,
            receive_address: config.name().to_string(),
            send_only: config.send_only(),
            outbox_enabled: config.outbox_enabled(),
        }
    }

    /// Process one inbound message to a terminal disposition.
    ///
    /// On success the message was completed (acknowledged), either directly
    /// or, after a pipeline failure, under the error pipeline's fresh
    /// transaction. On `Err` nothing was completed: the error is the one the
    /// host should observe, and for the atomic mode an unhandled failure has
    /// already abandoned the message explicitly.
    pub async fn process(
        &self,
        message: InboundMessage,
        shutdown: &ShutdownToken,
    ) -> Result<ProcessingOutcome> {
        if self.send_only {
            return Err(BuslinkError::InvalidOperation(format!(
                "endpoint '{}' is configured as send-only and cannot process incoming messages",
                self.receive_address
            )));
        }

        // The outbox coordinates its own completion record; it cannot be
        // enlisted in the host-level transaction, so committing both would
        // silently lose messages on a crash between the two.
        if self.outbox_enabled && self.mode == TransportTransactionMode::SendsAtomicWithReceive {
            return Err(BuslinkError::InvalidOperation(
                "atomic sends-with-receive processing is incompatible with the outbox feature"
                    .to_string(),
            ));
        }

        tracing::debug!(
            message_id = %message.message_id(),
            delivery_count = message.delivery_count(),
            mode = %self.mode,
            "processing message"
        );

        let transaction = self.strategy.create_transaction();
        let transport_transaction =
            Arc::new(self.strategy.create_transport_transaction(transaction.as_ref()));
        let context = MessageContext::new(&message, transport_transaction);

        match self.invoker.push_message(context).await {
            Ok(()) => {
                self.strategy.complete(&message, transaction).await?;
                tracing::debug!(message_id = %message.message_id(), "message completed");
                Ok(ProcessingOutcome::Completed)
            }
            Err(error) => {
                // The main attempt's transaction is dropped uncommitted here:
                // it may be poisoned by the failure and must never carry the
                // error pipeline's side effects.
                drop(transaction);

                if error.is_cancelled() && shutdown.is_shutting_down() {
                    tracing::info!(
                        message_id = %message.message_id(),
                        "processing cancelled by host shutdown, leaving message for redelivery"
                    );
                    return Err(error);
                }

                self.handle_failure(message, error).await
            }
        }
    }

    /// Run the error pipeline for a failed message under a fresh transaction.
    async fn handle_failure(
        &self,
        message: InboundMessage,
        error: BuslinkError,
    ) -> Result<ProcessingOutcome> {
        tracing::warn!(
            message_id = %message.message_id(),
            error = %ErrorChain(&error),
            "message processing failed, entering error pipeline"
        );

        // A second, independent transaction, causally after the failed one.
        let transaction = self.strategy.create_transaction();
        let transport_transaction =
            Arc::new(self.strategy.create_transport_transaction(transaction.as_ref()));
        let error_context = ErrorContext::new(
            &message,
            error.clone(),
            self.receive_address.clone(),
            transport_transaction,
        );

        match self.invoker.push_failed_message(error_context).await {
            Ok(ErrorHandleResult::Handled) => {
                self.strategy.complete(&message, transaction).await?;
                tracing::info!(
                    message_id = %message.message_id(),
                    "failure handled by error pipeline, message completed"
                );
                Ok(ProcessingOutcome::HandledByErrorPipeline)
            }
            Ok(ErrorHandleResult::RetryRequired) => {
                drop(transaction);

                // Under the atomic mode the receive is only released by an
                // explicit abandon; it runs outside any transaction scope so
                // a later failure cannot roll it back.
                if self.mode == TransportTransactionMode::SendsAtomicWithReceive {
                    self.queue.abandon_message(&message).await?;
                }

                tracing::warn!(
                    message_id = %message.message_id(),
                    "error pipeline requires retry, rethrowing original error"
                );
                Err(error)
            }
            Err(pipeline_error) => {
                // Never swallowed: losing this error could lose the message.
                tracing::error!(
                    message_id = %message.message_id(),
                    error = %ErrorChain(&pipeline_error),
                    "error pipeline itself failed"
                );
                Err(pipeline_error)
            }
        }
    }
}
