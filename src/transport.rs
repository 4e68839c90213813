use crate::errors::Result;
use crate::message::InboundMessage;
use crate::transaction::TransactionHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Queue client capability trait
// ---------------------------------------------------------------------------

/// The host queueing service's message-acknowledgement and send primitives.
///
/// The cloud provider's queue and transaction machinery is an external
/// dependency; this trait is the capability set the adapter needs from it.
/// Operations that accept a [`TransactionHandle`] enlist in it: their effect
/// becomes visible only when that transaction commits.
///
/// Implement this for a concrete queueing client, or use
/// [`FakeQueueClient`](crate::testing::FakeQueueClient) in tests.
#[async_trait::async_trait]
pub trait QueueClient: Send + Sync + Debug {
    /// Complete (acknowledge) a received message so the host does not
    /// redeliver it.
    async fn complete_message(
        &self,
        message: &InboundMessage,
        transaction: Option<&TransactionHandle>,
    ) -> Result<()>;

    /// Abandon a received message, returning it to the queue for redelivery.
    /// Always runs outside any transaction scope so it cannot be rolled back.
    async fn abandon_message(&self, message: &InboundMessage) -> Result<()>;

    /// Send a message to a destination queue, optionally enlisted in a
    /// transaction.
    async fn send_message(
        &self,
        destination: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        transaction: Option<&TransactionHandle>,
    ) -> Result<()>;
}

/// A cloneable, type-erased queue client handle.
pub type DynQueueClient = Arc<dyn QueueClient>;

// ---------------------------------------------------------------------------
// Trigger envelope
// ---------------------------------------------------------------------------

/// The wire shape of one message as delivered by the host trigger callback.
///
/// Field defaults are lenient: triggers differ in which metadata they attach,
/// and a missing message id is repaired by id generation in
/// [`InboundMessage::new`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerEnvelope {
    /// Message id assigned by the queueing service, if any.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Application and transport headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Raw message body.
    #[serde(default, with = "body_encoding")]
    pub body: Vec<u8>,

    /// How many times the host has delivered this message (1-indexed).
    #[serde(rename = "deliveryCount", default = "default_delivery_count")]
    pub delivery_count: u32,

    /// Partition / session key used for transactional enlistment.
    #[serde(rename = "partitionKey", default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

fn default_delivery_count() -> u32 {
    1
}

impl TriggerEnvelope {
    /// Normalize the envelope into an [`InboundMessage`], generating a
    /// message id when absent and stripping infrastructure headers.
    pub fn into_inbound_message(self) -> InboundMessage {
        InboundMessage::new(
            self.message_id,
            self.headers,
            self.body,
            self.delivery_count,
            self.partition_key,
        )
    }
}

/// Message bodies travel as UTF-8 strings on the JSON wire but are raw bytes
/// in the data model.
mod body_encoding {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TRANSPORT_ENCODING_HEADER;

    #[test]
    fn envelope_deserializes_with_defaults() {
        let raw = r#"{"body":"{\"Type\":\"HappyDayMessage\"}"}"#;
        let envelope: TriggerEnvelope = serde_json::from_str(raw).unwrap();

        assert!(envelope.message_id.is_none());
        assert_eq!(envelope.delivery_count, 1);
        assert_eq!(envelope.body, br#"{"Type":"HappyDayMessage"}"#);
    }

    #[test]
    fn envelope_normalizes_into_inbound_message() {
        let raw = r#"{
            "messageId": "m-42",
            "headers": {"buslink.transport.encoding": "byte-array", "app": "yes"},
            "body": "payload",
            "deliveryCount": 3,
            "partitionKey": "session-1"
        }"#;
        let envelope: TriggerEnvelope = serde_json::from_str(raw).unwrap();
        let message = envelope.into_inbound_message();

        assert_eq!(message.message_id(), "m-42");
        assert_eq!(message.delivery_count(), 3);
        assert_eq!(message.partition_key(), Some("session-1"));
        assert!(!message.headers().contains_key(TRANSPORT_ENCODING_HEADER));
        assert_eq!(message.headers().get("app").map(String::as_str), Some("yes"));
    }
}
