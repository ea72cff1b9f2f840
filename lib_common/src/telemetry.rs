//! # Telemetry Wire Types
//!
//! Rust representations of the protobuf messages the engine observes on the
//! wire. It uses the `prost` framework for binary encoding and decoding;
//! the structs are written out by hand so the field tags stay visible at the
//! point of use.
//!
//! The ingress never interprets a record's `payload` bytes; everything else
//! in the [`StreamMessage`] envelope is engine-visible routing metadata.

use prost::Message;

/// The wire-level envelope carried by every binary WebSocket frame, inbound
/// and synthetic alike.
///
/// All identifiers are opaque byte strings. `topic` selects the dispatch
/// fan-out rule for the decoded record.
#[derive(Clone, PartialEq, Message)]
pub struct StreamMessage {
    /// Client-chosen transaction id, echoed back in reliable acks
    #[prost(bytes = "vec", tag = "1")]
    pub txid: Vec<u8>,

    /// Combined sender identity, `<client_type>.<device_id>`
    #[prost(bytes = "vec", tag = "2")]
    pub sender_id: Vec<u8>,

    /// The device identifier (a VIN for vehicle devices)
    #[prost(bytes = "vec", tag = "3")]
    pub device_id: Vec<u8>,

    /// The class of device that produced the record (e.g. "vehicle_device")
    #[prost(bytes = "vec", tag = "4")]
    pub device_type: Vec<u8>,

    /// Dispatch topic
    #[prost(bytes = "vec", tag = "5")]
    pub topic: Vec<u8>,

    /// Opaque record body; never interpreted by the engine
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,

    /// Creation time, unix seconds
    #[prost(uint32, tag = "7")]
    pub created_at: u32,
}

/// Outbound acknowledgement frame body.
///
/// Written back to the originating socket once a reliable sink has durably
/// accepted the record (`message_type = "ack"`), or when the reply path
/// failed (`message_type = "error"`, reason in `detail`).
#[derive(Clone, PartialEq, Message)]
pub struct StreamAck {
    /// Transaction id of the record being acknowledged
    #[prost(bytes = "vec", tag = "1")]
    pub txid: Vec<u8>,

    /// "ack" on success, "error" on a negative acknowledgement
    #[prost(bytes = "vec", tag = "2")]
    pub message_type: Vec<u8>,

    /// Sink-defined acknowledgement body, or the error text on a NACK
    #[prost(bytes = "vec", tag = "3")]
    pub detail: Vec<u8>,
}

/// Synthetic lifecycle payload emitted on the `connectivity` topic when a
/// socket registers and deregisters.
#[derive(Clone, PartialEq, Message)]
pub struct VehicleConnectivity {
    /// The device identity extracted from the client certificate
    #[prost(string, tag = "1")]
    pub vin: String,

    /// Server-generated UUID of the connection
    #[prost(string, tag = "2")]
    pub connection_id: String,

    /// Best-effort label of the network path the peer is using
    #[prost(string, tag = "3")]
    pub network_interface: String,

    /// Event time, unix seconds
    #[prost(int64, tag = "4")]
    pub created_at: i64,

    /// Whether the socket just connected or disconnected.
    /// Maps to the [`ConnectivityStatus`] enum.
    #[prost(enumeration = "ConnectivityStatus", tag = "5")]
    pub status: i32,
}

/// Lifecycle state carried by a [`VehicleConnectivity`] record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectivityStatus {
    /// The socket completed its upgrade and entered the registry
    Connected = 0,
    /// The socket left the registry
    Disconnected = 1,
}

/// Topic reserved for synthetic lifecycle records.
pub const CONNECTIVITY_TOPIC: &str = "connectivity";

/// `device_type` stamped on synthetic connectivity envelopes.
pub const VEHICLE_DEVICE_TYPE: &str = "vehicle_device";

/// Encode a [`StreamMessage`] to its wire form.
pub fn encode_envelope(msg: &StreamMessage) -> Vec<u8> {
    msg.encode_to_vec()
}
