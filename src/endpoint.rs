use crate::config::EndpointConfig;
use crate::errors::{BuslinkError, Result};
use crate::invoker::PipelineInvoker;
use crate::logging::{StartupLogger, TracingSink};
use crate::message::OutgoingMessage;
use crate::pipeline::{PipelineEndpoint, PipelineRuntime};
use crate::processor::{MessageProcessor, ProcessingOutcome};
use crate::shutdown::ShutdownToken;
use crate::transaction::TransportTransaction;
use crate::transport::{DynQueueClient, TriggerEnvelope};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::Level;

/// The process-wide endpoint: lazy pipeline startup plus the host trigger
/// entry point and the outbound send/publish/subscribe facade.
///
/// Pipeline startup is expensive and a function host may cold-start without
/// any message ever arriving, so the pipeline runtime is started lazily on
/// first use, exactly once even under concurrent first arrivals. If startup
/// fails, the failure propagates to every waiting caller and the endpoint
/// stays unstarted so the next invocation retries instead of wedging the
/// process permanently.
///
/// # Example
///
/// ```rust,ignore
/// use buslink::{EndpointConfig, ServerlessEndpoint, ShutdownToken, TriggerEnvelope};
///
/// let config = EndpointConfig::builder("orders")
///     .connection_string("Endpoint=sb://example/;...")
///     .build()?;
///
/// let endpoint = ServerlessEndpoint::new(config, runtime, queue_client);
///
/// // Host trigger callback, invoked once per delivered message:
/// endpoint.process(envelope, &ShutdownToken::never()).await?;
/// ```
pub struct ServerlessEndpoint {
    config: EndpointConfig,
    runtime: Arc<dyn PipelineRuntime>,
    queue: DynQueueClient,
    invoker: Arc<PipelineInvoker>,
    started: OnceCell<Started>,
    startup_logger: StartupLogger,
}

struct Started {
    pipeline: Arc<dyn PipelineEndpoint>,
    processor: Arc<MessageProcessor>,
}

impl ServerlessEndpoint {
    pub fn new(
        config: EndpointConfig,
        runtime: Arc<dyn PipelineRuntime>,
        queue: DynQueueClient,
    ) -> Self {
        Self {
            config,
            runtime,
            queue,
            invoker: Arc::new(PipelineInvoker::new()),
            started: OnceCell::new(),
            startup_logger: StartupLogger::new(),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Whether the underlying pipeline has been started yet.
    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Start the underlying pipeline if it has not been started yet.
    ///
    /// Idempotent and safe to call concurrently: callers racing for the first
    /// start all wait for the single start routine, then proceed.
    pub async fn ensure_started(&self) -> Result<()> {
        self.started().await.map(|_| ())
    }

    async fn started(&self) -> Result<&Started> {
        self.started
            .get_or_try_init(|| self.start())
            .await
    }

    async fn start(&self) -> Result<Started> {
        self.startup_logger.log(
            Level::INFO,
            format!("starting endpoint '{}'", self.config.name()),
        );

        if self.config.diagnostics() {
            self.startup_logger.log(
                Level::INFO,
                format!(
                    "endpoint '{}': transaction mode {}, instance id {}, error queue '{}'",
                    self.config.name(),
                    self.config.transaction_mode(),
                    self.config.instance_id(),
                    self.config.error_queue(),
                ),
            );
        }

        let pipeline = self
            .runtime
            .start(&self.config, self.invoker.clone())
            .await?;

        let processor = Arc::new(MessageProcessor::new(
            &self.config,
            self.invoker.clone(),
            self.queue.clone(),
        ));

        // The real sink is available now; buffered bootstrap records flush
        // through it in their original order.
        self.startup_logger.attach(Box::new(TracingSink));
        tracing::info!(endpoint = %self.config.name(), "endpoint started");

        Ok(Started { pipeline, processor })
    }

    // ------------------------------------------------------------------
    // Host trigger entry point
    // ------------------------------------------------------------------

    /// Process one host-delivered message.
    ///
    /// This is the trigger callback target: the host invokes it once per
    /// delivered message, concurrently for independent messages. A failure
    /// not absorbed by the error pipeline surfaces as
    /// [`BuslinkError::ProcessingFailed`] with the original error as source,
    /// except host-shutdown cancellation, which passes through unwrapped so
    /// the host can tell recycling apart from processing failure.
    pub async fn process(
        &self,
        envelope: TriggerEnvelope,
        shutdown: &ShutdownToken,
    ) -> Result<ProcessingOutcome> {
        let started = self.started().await?;
        let message = envelope.into_inbound_message();
        let message_id = message.message_id().to_string();

        started
            .processor
            .process(message, shutdown)
            .await
            .map_err(|error| {
                if error.is_cancelled() {
                    error
                } else {
                    BuslinkError::ProcessingFailed {
                        message_id: message_id.clone(),
                        source: Box::new(error),
                    }
                }
            })
    }

    // ------------------------------------------------------------------
    // Outbound facade
    // ------------------------------------------------------------------

    /// Send a message to a destination queue.
    pub async fn send(&self, destination: &str, message: OutgoingMessage) -> Result<()> {
        let started = self.started().await?;
        started
            .pipeline
            .send(destination, message, &TransportTransaction::new())
            .await
    }

    /// Publish an event to all subscribers.
    pub async fn publish(&self, event: OutgoingMessage) -> Result<()> {
        let started = self.started().await?;
        started
            .pipeline
            .publish(event, &TransportTransaction::new())
            .await
    }

    /// Subscribe this endpoint to an event type.
    pub async fn subscribe(&self, event_type: &str) -> Result<()> {
        let started = self.started().await?;
        started.pipeline.subscribe(event_type).await
    }
}
