use crate::errors::BuslinkError;
use crate::transaction::TransportTransaction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Infrastructure headers
// ---------------------------------------------------------------------------

/// Header naming the wire encoding used by the transport for the body.
///
/// Internal to the transport layer; stripped before the message reaches the
/// pipeline so handlers never observe it.
pub const TRANSPORT_ENCODING_HEADER: &str = "buslink.transport.encoding";

/// Headers removed from every inbound message during construction.
const STRIPPED_HEADERS: &[&str] = &[TRANSPORT_ENCODING_HEADER];

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// A single message delivered by the host trigger, normalized for processing.
///
/// Immutable once constructed; each processing attempt owns its message
/// exclusively. The message id is taken from the trigger metadata when
/// present, otherwise a fresh UUID is generated so the same id is used
/// consistently across the pipeline context and any resulting error context.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    message_id: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    delivery_count: u32,
    partition_key: Option<String>,
}

impl InboundMessage {
    /// Build an inbound message from raw trigger parts.
    ///
    /// Generates a message id when `message_id` is `None` or empty, and
    /// strips infrastructure headers such as the transport encoding marker.
    pub fn new(
        message_id: Option<String>,
        mut headers: HashMap<String, String>,
        body: Vec<u8>,
        delivery_count: u32,
        partition_key: Option<String>,
    ) -> Self {
        let message_id = match message_id {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };

        for key in STRIPPED_HEADERS {
            headers.remove(*key);
        }

        Self {
            message_id,
            headers,
            body,
            delivery_count,
            partition_key,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// How many times the host has delivered this message, as reported by the
    /// host metadata. Read once and passed through unmodified.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Partition / session key used for transactional enlistment, if any.
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Outgoing message
// ---------------------------------------------------------------------------

/// A message sent or published through the started pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Dot-namespaced message type (e.g. `order.placed`).
    #[serde(rename = "type")]
    pub message_type: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// JSON-encoded body.
    #[serde(default)]
    pub body: serde_json::Value,
}

impl OutgoingMessage {
    pub fn new(message_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            headers: HashMap::new(),
            body,
        }
    }

    /// Add a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Pipeline contexts
// ---------------------------------------------------------------------------

/// The context handed to the pipeline's `on_message` callback.
///
/// Carries the normalized message parts plus the transport transaction the
/// pipeline must enlist outgoing operations in.
#[derive(Clone)]
pub struct MessageContext {
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub transport_transaction: Arc<TransportTransaction>,
}

impl MessageContext {
    pub fn new(message: &InboundMessage, transport_transaction: Arc<TransportTransaction>) -> Self {
        Self {
            message_id: message.message_id().to_string(),
            headers: message.headers().clone(),
            body: message.body().to_vec(),
            transport_transaction,
        }
    }
}

/// The context handed to the pipeline's `on_error` callback.
///
/// Constructed only on failure and consumed once. The transport transaction
/// here is always rooted in a fresh [`TransactionHandle`], never the one
/// that was active during the failed attempt.
///
/// [`TransactionHandle`]: crate::transaction::TransactionHandle
#[derive(Clone)]
pub struct ErrorContext {
    /// The error that caused the main processing attempt to fail.
    pub error: BuslinkError,
    pub message_id: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Host-reported delivery count, passed through unmodified.
    pub delivery_count: u32,
    /// Address of the queue the message was received from.
    pub receive_address: String,
    pub transport_transaction: Arc<TransportTransaction>,
}

impl ErrorContext {
    pub fn new(
        message: &InboundMessage,
        error: BuslinkError,
        receive_address: impl Into<String>,
        transport_transaction: Arc<TransportTransaction>,
    ) -> Self {
        Self {
            error,
            message_id: message.message_id().to_string(),
            headers: message.headers().clone(),
            body: message.body().to_vec(),
            delivery_count: message.delivery_count(),
            receive_address: receive_address.into(),
            transport_transaction,
        }
    }
}
