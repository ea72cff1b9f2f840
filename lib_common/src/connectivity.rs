//! # Connectivity Emitter
//!
//! Synthesizes CONNECTED/DISCONNECTED lifecycle records onto the
//! `connectivity` topic. Events ride the normal record pipeline (payload
//! into envelope, envelope through the connection's serializer, record
//! through the dispatcher) so observers get one ordered stream and the
//! topic obeys the same dispatch rules as everything else. No retry, no
//! persistence; a deployment that omits `connectivity` from its dispatch
//! rules skips the work at the dispatch step.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use uuid::Uuid;

use crate::core::dispatcher::Dispatcher;
use crate::core::socket_manager::SocketManager;
use crate::serializer::BinarySerializer;
use crate::telemetry::{
    encode_envelope, ConnectivityStatus, StreamMessage, VehicleConnectivity, CONNECTIVITY_TOPIC,
    VEHICLE_DEVICE_TYPE,
};

/// Emit one lifecycle record for the given socket. Best-effort: failures
/// are logged and never block register/deregister.
pub fn emit(
    status: ConnectivityStatus,
    sm: &SocketManager,
    serializer: &BinarySerializer,
    dispatcher: &Dispatcher,
) {
    let now = chrono::Utc::now().timestamp();
    let identity = sm.identity();

    let payload = VehicleConnectivity {
        vin: identity.device_id.clone(),
        connection_id: sm.uuid().to_string(),
        network_interface: sm.network_interface().to_string(),
        created_at: now,
        status: status as i32,
    };

    let envelope = StreamMessage {
        txid: Uuid::new_v4().to_string().into_bytes(),
        sender_id: identity.sender_id.clone().into_bytes(),
        device_id: identity.device_id.clone().into_bytes(),
        device_type: VEHICLE_DEVICE_TYPE.as_bytes().to_vec(),
        topic: CONNECTIVITY_TOPIC.as_bytes().to_vec(),
        payload: payload.encode_to_vec(),
        created_at: now as u32,
    };

    match serializer.decode(Bytes::from(encode_envelope(&envelope)), sm.uuid(), false) {
        Ok(record) => {
            log::debug!("connection {} {:?}", sm.uuid(), status);
            dispatcher.dispatch(Arc::new(record));
        }
        Err(e) => {
            log::warn!("failed to emit {:?} record for connection {}: {}", status, sm.uuid(), e);
        }
    }
}
