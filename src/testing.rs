//! Test doubles for the host queueing service and the pipeline runtime.
//!
//! The acceptance suite drives the real processor/endpoint code against these
//! fakes: a queue client that records every acknowledgement primitive and
//! applies transactional operations only once their transaction commits, and
//! a pipeline runtime whose `on_message` / `on_error` behavior is scripted
//! per test.
//!
//! ```rust,ignore
//! use buslink::testing::{FakePipelineRuntime, FakeQueueClient};
//!
//! let queue = FakeQueueClient::new();
//! let runtime = FakePipelineRuntime::succeeding(queue.share());
//! // ... build a ServerlessEndpoint on top and assert on queue.complete_calls()
//! ```

use crate::config::EndpointConfig;
use crate::errors::{BuslinkError, Result};
use crate::invoker::PipelineInvoker;
use crate::message::{InboundMessage, OutgoingMessage};
use crate::pipeline::{
    ErrorHandleResult, MessageReceiver, OnErrorFn, OnMessageFn, PipelineEndpoint, PipelineRuntime,
    PushRuntimeSettings,
};
use crate::transaction::{TransactionHandle, TransportTransaction};
use crate::transport::{DynQueueClient, QueueClient};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Fake queue client
// ---------------------------------------------------------------------------

/// One recorded acknowledgement or send primitive.
#[derive(Debug, Clone)]
pub struct RecordedOp {
    pub kind: OpKind,
    pub message_id: String,
    /// Destination queue for sends.
    pub destination: Option<String>,
    /// The transaction the operation was enlisted in, if any.
    pub transaction: Option<TransactionHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Complete,
    Abandon,
    Send,
}

impl RecordedOp {
    /// Whether the operation's effect is visible: non-transactional
    /// operations take effect immediately, transactional ones only once
    /// their transaction committed.
    pub fn is_effective(&self) -> bool {
        match &self.transaction {
            None => true,
            Some(tx) => tx.is_committed(),
        }
    }

    pub fn transaction_id(&self) -> Option<u64> {
        self.transaction.as_ref().map(TransactionHandle::id)
    }
}

/// In-memory queue client recording every host primitive invocation.
#[derive(Debug, Clone, Default)]
pub struct FakeQueueClient {
    ops: Arc<Mutex<Vec<RecordedOp>>>,
}

impl FakeQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A type-erased handle sharing this client's recorded state.
    pub fn share(&self) -> DynQueueClient {
        Arc::new(self.clone())
    }

    /// All recorded operations, in invocation order.
    pub fn ops(&self) -> Vec<RecordedOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Recorded complete-message calls (effective or not).
    pub fn complete_calls(&self) -> Vec<RecordedOp> {
        self.ops_of(OpKind::Complete)
    }

    /// Recorded abandon-message calls.
    pub fn abandon_calls(&self) -> Vec<RecordedOp> {
        self.ops_of(OpKind::Abandon)
    }

    /// Recorded send calls.
    pub fn send_calls(&self) -> Vec<RecordedOp> {
        self.ops_of(OpKind::Send)
    }

    /// Operations whose effect is visible right now: the all-or-nothing view
    /// a crash-and-replay would observe.
    pub fn effective_ops(&self) -> Vec<RecordedOp> {
        self.ops().into_iter().filter(RecordedOp::is_effective).collect()
    }

    fn ops_of(&self, kind: OpKind) -> Vec<RecordedOp> {
        self.ops()
            .into_iter()
            .filter(|op| op.kind == kind)
            .collect()
    }

    fn record(&self, op: RecordedOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait::async_trait]
impl QueueClient for FakeQueueClient {
    async fn complete_message(
        &self,
        message: &InboundMessage,
        transaction: Option<&TransactionHandle>,
    ) -> Result<()> {
        self.record(RecordedOp {
            kind: OpKind::Complete,
            message_id: message.message_id().to_string(),
            destination: None,
            transaction: transaction.cloned(),
        });
        Ok(())
    }

    async fn abandon_message(&self, message: &InboundMessage) -> Result<()> {
        self.record(RecordedOp {
            kind: OpKind::Abandon,
            message_id: message.message_id().to_string(),
            destination: None,
            transaction: None,
        });
        Ok(())
    }

    async fn send_message(
        &self,
        destination: &str,
        headers: HashMap<String, String>,
        _body: Vec<u8>,
        transaction: Option<&TransactionHandle>,
    ) -> Result<()> {
        self.record(RecordedOp {
            kind: OpKind::Send,
            message_id: headers.get("message-id").cloned().unwrap_or_default(),
            destination: Some(destination.to_string()),
            transaction: transaction.cloned(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake pipeline runtime
// ---------------------------------------------------------------------------

/// A scripted pipeline runtime.
///
/// `start` registers the scripted callbacks on the supplied receiver, exactly
/// like a real runtime registering its main input-queue receiver, and returns
/// a [`FakePipelineEndpoint`] that forwards outbound operations to the queue
/// client (enlisting in the transport transaction's handle when one is
/// present).
pub struct FakePipelineRuntime {
    on_message: OnMessageFn,
    on_error: OnErrorFn,
    queue: DynQueueClient,
    start_calls: AtomicUsize,
    failing_starts: AtomicUsize,
}

impl FakePipelineRuntime {
    /// A runtime with fully scripted callbacks.
    pub fn with_handlers(
        queue: DynQueueClient,
        on_message: OnMessageFn,
        on_error: OnErrorFn,
    ) -> Self {
        Self {
            on_message,
            on_error,
            queue,
            start_calls: AtomicUsize::new(0),
            failing_starts: AtomicUsize::new(0),
        }
    }

    /// A runtime whose handlers always succeed.
    pub fn succeeding(queue: DynQueueClient) -> Self {
        Self::with_handlers(
            queue,
            Arc::new(|_ctx| Box::pin(async { Ok(()) })),
            Arc::new(|_ctx| Box::pin(async { Ok(ErrorHandleResult::Handled) })),
        )
    }

    /// A runtime whose handler always fails with the given message, and whose
    /// error pipeline reports the given outcome.
    pub fn failing(
        queue: DynQueueClient,
        handler_error: impl Into<String>,
        error_outcome: ErrorHandleResult,
    ) -> Self {
        let handler_error = handler_error.into();
        Self::with_handlers(
            queue,
            Arc::new(move |_ctx| {
                let msg = handler_error.clone();
                Box::pin(async move { Err(BuslinkError::Handler(msg)) })
            }),
            Arc::new(move |_ctx| Box::pin(async move { Ok(error_outcome) })),
        )
    }

    /// Make the next `n` start attempts fail, to exercise startup retry.
    pub fn fail_next_starts(&self, n: usize) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    /// How many times `start` was invoked.
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PipelineRuntime for FakePipelineRuntime {
    async fn start(
        &self,
        _config: &EndpointConfig,
        receiver: Arc<PipelineInvoker>,
    ) -> Result<Arc<dyn PipelineEndpoint>> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(BuslinkError::Config(
                "simulated pipeline startup failure".to_string(),
            ));
        }

        receiver
            .initialize(
                PushRuntimeSettings::default(),
                self.on_message.clone(),
                self.on_error.clone(),
            )
            .await?;

        Ok(Arc::new(FakePipelineEndpoint {
            queue: self.queue.clone(),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }
}

/// Outbound surface of the fake runtime: forwards sends and publishes to the
/// queue client, enlisted in the transport transaction when one is carried.
pub struct FakePipelineEndpoint {
    queue: DynQueueClient,
    subscriptions: Mutex<Vec<String>>,
}

impl FakePipelineEndpoint {
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PipelineEndpoint for FakePipelineEndpoint {
    async fn send(
        &self,
        destination: &str,
        message: OutgoingMessage,
        transaction: &TransportTransaction,
    ) -> Result<()> {
        let body = serde_json::to_vec(&message.body)?;
        self.queue
            .send_message(destination, message.headers, body, transaction.transaction())
            .await
    }

    async fn publish(
        &self,
        event: OutgoingMessage,
        transaction: &TransportTransaction,
    ) -> Result<()> {
        let destination = format!("events/{}", event.message_type);
        let body = serde_json::to_vec(&event.body)?;
        self.queue
            .send_message(&destination, event.headers, body, transaction.transaction())
            .await
    }

    async fn subscribe(&self, event_type: &str) -> Result<()> {
        self.subscriptions.lock().unwrap().push(event_type.to_string());
        Ok(())
    }
}
