use crate::errors::{BuslinkError, Result};
use crate::message::InboundMessage;
use crate::transport::QueueClient;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Transaction mode
// ---------------------------------------------------------------------------

/// How the receive operation relates to the pipeline's outgoing sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportTransactionMode {
    /// No transactional coordination. Used when the transport cannot provide
    /// atomicity, and for send-only endpoints.
    None,
    /// The inbound message is completed unconditionally after successful
    /// pipeline execution, without cross-entity atomicity. A crash between
    /// pipeline success and completion redelivers the message, so handlers
    /// may run more than once (at-least-once delivery).
    #[default]
    ReceiveOnly,
    /// Outgoing sends and the completion of the inbound message commit or
    /// roll back together under one serializable transaction.
    SendsAtomicWithReceive,
}

impl TransportTransactionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportTransactionMode::None => "none",
            TransportTransactionMode::ReceiveOnly => "receive-only",
            TransportTransactionMode::SendsAtomicWithReceive => "sends-atomic-with-receive",
        }
    }
}

impl std::fmt::Display for TransportTransactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transaction handle
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`TransactionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Active = 0,
    Committed = 1,
    RolledBack = 2,
}

impl TransactionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TransactionState::Active,
            1 => TransactionState::Committed,
            _ => TransactionState::RolledBack,
        }
    }
}

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// A distributed-transaction handle with serializable isolation and an
/// effectively-unbounded timeout.
///
/// Created fresh for every logical processing attempt: one for the main
/// attempt and a separate one for the error-handling attempt. Handles are
/// never reused across attempts: reuse would commit side effects made under
/// a transaction whose outcome is already indeterminate.
///
/// Clones share state (the handle is a cheap `Arc` wrapper); each distinct
/// attempt gets a handle with a distinct `id`.
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    inner: Arc<TxInner>,
}

#[derive(Debug)]
struct TxInner {
    id: u64,
    state: AtomicU8,
}

impl TransactionHandle {
    /// Open a new serializable transaction.
    pub fn serializable() -> Self {
        Self {
            inner: Arc::new(TxInner {
                id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
                state: AtomicU8::new(TransactionState::Active as u8),
            }),
        }
    }

    /// Unique identifier of this transaction. Distinct per attempt.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_committed(&self) -> bool {
        self.state() == TransactionState::Committed
    }

    /// Commit the transaction. Fails if it was already committed or rolled
    /// back; at most one completion commits under any given handle.
    pub fn commit(&self) -> Result<()> {
        let prev = self.inner.state.compare_exchange(
            TransactionState::Active as u8,
            TransactionState::Committed as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match prev {
            Ok(_) => Ok(()),
            Err(state) => Err(BuslinkError::Transaction(format!(
                "transaction {} is no longer active (state: {:?})",
                self.inner.id,
                TransactionState::from_u8(state)
            ))),
        }
    }

    /// Roll the transaction back. Idempotent for an already-rolled-back
    /// handle; fails on a committed one.
    pub fn rollback(&self) -> Result<()> {
        let prev = self.inner.state.compare_exchange(
            TransactionState::Active as u8,
            TransactionState::RolledBack as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match prev {
            Ok(_) => Ok(()),
            Err(state) if TransactionState::from_u8(state) == TransactionState::RolledBack => {
                Ok(())
            }
            Err(_) => Err(BuslinkError::Transaction(format!(
                "transaction {} was already committed",
                self.inner.id
            ))),
        }
    }

    /// Isolation level. Always serializable for this transport.
    pub fn isolation(&self) -> &'static str {
        "serializable"
    }

    /// Transaction timeout. Effectively unbounded; the host invocation
    /// timeout is the real upper limit.
    pub fn timeout(&self) -> Duration {
        Duration::MAX
    }
}

// ---------------------------------------------------------------------------
// Transport transaction (typed bag)
// ---------------------------------------------------------------------------

/// A typed bag attached to an optional [`TransactionHandle`], carrying the
/// handles the queueing client needs to enlist further operations (sends,
/// completion) in the same transaction.
///
/// Built by the active [`TransactionStrategy`] and threaded through to both
/// the pipeline invocation and the final complete-message operation.
#[derive(Default)]
pub struct TransportTransaction {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl TransportTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value of the same type.
    pub fn set<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieve a stored value by type.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    /// The transaction handle this context is rooted in, if any.
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.get::<TransactionHandle>()
    }
}

impl std::fmt::Debug for TransportTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportTransaction")
            .field("entries", &self.entries.len())
            .field("transaction_id", &self.transaction().map(TransactionHandle::id))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Transaction strategy
// ---------------------------------------------------------------------------

/// Encapsulates how receive-is-atomic-with-sends is achieved for a given
/// [`TransportTransactionMode`].
///
/// Contract for all variants: `create_transaction` is called fresh for every
/// logical attempt; the returned handle (possibly `None`) is threaded through
/// to exactly one `complete` call and never reused.
#[async_trait::async_trait]
pub trait TransactionStrategy: Send + Sync {
    /// Open a transaction for one processing attempt, if the mode uses one.
    fn create_transaction(&self) -> Option<TransactionHandle>;

    /// Build the transport transaction the pipeline enlists operations in.
    fn create_transport_transaction(
        &self,
        transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction;

    /// Acknowledge the inbound message after successful processing, and
    /// commit the transaction when the mode carries one.
    async fn complete(
        &self,
        message: &InboundMessage,
        transaction: Option<TransactionHandle>,
    ) -> Result<()>;
}

/// Strategy for [`TransportTransactionMode::None`]: no transaction, empty
/// transport context, completion is a no-op (the host's own return-based
/// acknowledgement applies).
pub struct NoTransactionStrategy;

#[async_trait::async_trait]
impl TransactionStrategy for NoTransactionStrategy {
    fn create_transaction(&self) -> Option<TransactionHandle> {
        None
    }

    fn create_transport_transaction(
        &self,
        _transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction {
        TransportTransaction::new()
    }

    async fn complete(
        &self,
        _message: &InboundMessage,
        _transaction: Option<TransactionHandle>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Strategy for [`TransportTransactionMode::ReceiveOnly`]: no transactional
/// enlistment, but the inbound message is completed unconditionally after
/// successful pipeline execution.
pub struct ReceiveOnlyStrategy {
    queue: Arc<dyn QueueClient>,
}

impl ReceiveOnlyStrategy {
    pub fn new(queue: Arc<dyn QueueClient>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl TransactionStrategy for ReceiveOnlyStrategy {
    fn create_transaction(&self) -> Option<TransactionHandle> {
        None
    }

    fn create_transport_transaction(
        &self,
        _transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction {
        TransportTransaction::new()
    }

    async fn complete(
        &self,
        message: &InboundMessage,
        _transaction: Option<TransactionHandle>,
    ) -> Result<()> {
        self.queue.complete_message(message, None).await
    }
}

/// Strategy for [`TransportTransactionMode::SendsAtomicWithReceive`]: opens a
/// serializable transaction, enlists the queue client in the transport
/// context so pipeline sends join the transaction, and completes the inbound
/// message inside that same transaction before committing. Removal of the
/// inbound message and any outgoing sends happen or roll back together.
pub struct AtomicSendsWithReceiveStrategy {
    queue: Arc<dyn QueueClient>,
}

impl AtomicSendsWithReceiveStrategy {
    pub fn new(queue: Arc<dyn QueueClient>) -> Self {
        Self { queue }
    }
}

#[async_trait::async_trait]
impl TransactionStrategy for AtomicSendsWithReceiveStrategy {
    fn create_transaction(&self) -> Option<TransactionHandle> {
        Some(TransactionHandle::serializable())
    }

    fn create_transport_transaction(
        &self,
        transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction {
        let mut ttx = TransportTransaction::new();
        if let Some(tx) = transaction {
            ttx.set(tx.clone());
        }
        ttx.set(self.queue.clone());
        ttx
    }

    async fn complete(
        &self,
        message: &InboundMessage,
        transaction: Option<TransactionHandle>,
    ) -> Result<()> {
        let tx = transaction.ok_or_else(|| {
            BuslinkError::Transaction(
                "atomic completion requires an active transaction".to_string(),
            )
        })?;

        // Completion enlists in the same transaction as the pipeline's sends,
        // then the commit makes all of them effective at once.
        self.queue.complete_message(message, Some(&tx)).await?;
        tx.commit()
    }
}

/// Select the strategy for a transaction mode.
pub fn strategy_for(
    mode: TransportTransactionMode,
    queue: Arc<dyn QueueClient>,
) -> Arc<dyn TransactionStrategy> {
    match mode {
        TransportTransactionMode::None => Arc::new(NoTransactionStrategy),
        TransportTransactionMode::ReceiveOnly => Arc::new(ReceiveOnlyStrategy::new(queue)),
        TransportTransactionMode::SendsAtomicWithReceive => {
            Arc::new(AtomicSendsWithReceiveStrategy::new(queue))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_distinct() {
        let a = TransactionHandle::serializable();
        let b = TransactionHandle::serializable();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn commit_is_single_shot() {
        let tx = TransactionHandle::serializable();
        assert!(tx.commit().is_ok());
        assert!(tx.is_committed());
        assert!(tx.commit().is_err());
    }

    #[test]
    fn rollback_after_commit_fails() {
        let tx = TransactionHandle::serializable();
        tx.commit().unwrap();
        assert!(tx.rollback().is_err());
    }

    #[test]
    fn rollback_is_idempotent() {
        let tx = TransactionHandle::serializable();
        assert!(tx.rollback().is_ok());
        assert!(tx.rollback().is_ok());
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[test]
    fn clones_share_state() {
        let tx = TransactionHandle::serializable();
        let clone = tx.clone();
        tx.commit().unwrap();
        assert!(clone.is_committed());
        assert_eq!(tx.id(), clone.id());
    }

    #[test]
    fn transport_transaction_typed_bag() {
        let mut ttx = TransportTransaction::new();
        assert!(ttx.transaction().is_none());

        let tx = TransactionHandle::serializable();
        ttx.set(tx.clone());
        ttx.set("partition-7".to_string());

        assert_eq!(ttx.transaction().map(TransactionHandle::id), Some(tx.id()));
        assert_eq!(ttx.get::<String>().map(String::as_str), Some("partition-7"));
        assert!(ttx.get::<u64>().is_none());
    }
}
