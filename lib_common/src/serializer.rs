//! # Binary Serializer
//!
//! Per-connection decoder turning inbound WebSocket frame bytes into
//! dispatch-ready [`Record`]s. The serializer attaches itself to every
//! record it produces as the record's [`AckTarget`]: when a reliable sink
//! has durably accepted the record, it calls [`Record::ack`] and the record
//! travels back over the process-wide ack channel to the ack router, which
//! binds it to the owning socket. The record never reaches back into the
//! connection directly.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::identity::RequestIdentity;
use crate::telemetry::StreamMessage;

/// Frame decoding failures. Logged per frame; never terminate a connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame bytes are not a valid `StreamMessage` envelope.
    #[error("invalid stream message envelope: {0}")]
    Envelope(#[from] prost::DecodeError),
    /// The envelope decoded but carries no topic to dispatch on.
    #[error("stream message has no topic")]
    MissingTopic,
}

/// Acknowledgement channel attached to a [`Record`].
///
/// Implemented by the [`BinarySerializer`]; modeled as an interface value so
/// sinks can signal completion without holding a connection reference.
pub trait AckTarget: Send + Sync {
    /// Hand a durably-accepted record back to the engine's ack path.
    fn deliver(&self, record: Record);
}

/// A decoded, dispatch-ready unit originating from one WebSocket frame or
/// from a synthetic connectivity event. Read-only after creation; cloned
/// handles share the underlying buffers.
#[derive(Clone)]
pub struct Record {
    /// Dispatch topic from the envelope.
    pub topic: String,
    /// Record-type label selecting the reliable-ack source.
    pub tx_type: String,
    /// UUID of the socket manager that created this record.
    pub connection_id: Uuid,
    /// Transaction id echoed back in the reliable ack.
    pub txid: Vec<u8>,
    /// The original frame bytes, untouched.
    pub raw: Bytes,
    /// The decoded envelope, populated when the connection asked for
    /// decoded transmission.
    pub decoded: Option<StreamMessage>,
    /// Whether a reliable-ack source is configured for this record type.
    pub reply_enabled: bool,
    /// Unix seconds at decode time.
    pub produced_at: u64,
    ack_target: Option<Arc<dyn AckTarget>>,
}

impl Record {
    /// Signal that a sink durably accepted this record. No-op for records
    /// without an attached serializer.
    pub fn ack(&self) {
        if let Some(target) = &self.ack_target {
            target.deliver(self.clone());
        }
    }

    /// Whether the record still carries its serializer back-reference.
    pub fn has_ack_target(&self) -> bool {
        self.ack_target.is_some()
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("topic", &self.topic)
            .field("tx_type", &self.tx_type)
            .field("connection_id", &self.connection_id)
            .field("txid", &self.txid)
            .field("reply_enabled", &self.reply_enabled)
            .field("raw_len", &self.raw.len())
            .finish()
    }
}

/// The serializer's reply hook: delivers acknowledged records onto the
/// process-wide ack channel. One per serializer, shared by every record the
/// serializer produces.
struct AckHook {
    sender_id: String,
    ack_tx: mpsc::UnboundedSender<Record>,
}

impl AckTarget for AckHook {
    fn deliver(&self, record: Record) {
        // The receiver lives for the process lifetime; a send failure means
        // shutdown is underway and the ack is dropped.
        if self.ack_tx.send(record).is_err() {
            log::warn!("ack channel closed; dropping ack for sender {}", self.sender_id);
        }
    }
}

/// Per-connection frame decoder, parameterized by the connection's identity
/// and the process-wide reliable-ack source snapshot.
pub struct BinarySerializer {
    identity: RequestIdentity,
    ack_sources: Arc<HashMap<String, String>>,
    hook: Arc<AckHook>,
}

impl BinarySerializer {
    /// Create a serializer for one connection. `ack_sources` is the
    /// read-only `tx_type → dispatcher_name` mapping built at startup;
    /// `ack_tx` is a clone of the engine's ack-channel sender.
    pub fn new(
        identity: RequestIdentity,
        ack_sources: Arc<HashMap<String, String>>,
        ack_tx: mpsc::UnboundedSender<Record>,
    ) -> Self {
        let hook = Arc::new(AckHook { sender_id: identity.sender_id.clone(), ack_tx });
        Self { identity, ack_sources, hook }
    }

    /// The identity of the connection this serializer decodes for.
    pub fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    /// Parse one binary frame into a [`Record`] tagged with its dispatch
    /// topic, record type, and the reply hook back to this serializer.
    pub fn decode(
        &self,
        frame: Bytes,
        connection_id: Uuid,
        transmit_decoded: bool,
    ) -> Result<Record, DecodeError> {
        let msg = StreamMessage::decode(frame.as_ref())?;

        let topic = String::from_utf8_lossy(&msg.topic).into_owned();
        if topic.is_empty() {
            return Err(DecodeError::MissingTopic);
        }

        // The envelope carries no separate record-type field; the topic is
        // the record-type label.
        let tx_type = topic.clone();
        let reply_enabled = self.ack_sources.contains_key(&tx_type);

        Ok(Record {
            txid: msg.txid.clone(),
            decoded: transmit_decoded.then(|| msg),
            topic,
            tx_type,
            connection_id,
            raw: frame,
            reply_enabled,
            produced_at: chrono::Utc::now().timestamp() as u64,
            ack_target: Some(self.hook.clone() as Arc<dyn AckTarget>),
        })
    }
}
