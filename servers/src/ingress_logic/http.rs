//! The HTTP surface: WebSocket upgrades at `/`, liveness at `/status`,
//! per-request logging with a generated request id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lib_common::core::socket_manager::run_connection;
use lib_common::identity::{
    extract_identity, DirectCertOrder, RequestIdentity, TlsPassThrough,
};
use lib_common::serializer::{BinarySerializer, Record};
use lib_common::{Dispatcher, SocketManager, SocketRegistry};

use crate::ingress_logic::serve::PeerCertificates;

/// Header a vehicle device sets to label its network path (wifi, cellular).
const NETWORK_INTERFACE_HEADER: &str = "x-network-interface";

/// Everything the request handlers need, shared across connections.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<SocketRegistry>,
    pub ack_sources: Arc<HashMap<String, String>>,
    pub ack_tx: mpsc::UnboundedSender<Record>,
    pub pass_through: TlsPassThrough,
    pub cert_order: DirectCertOrder,
    pub transmit_decoded: bool,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/status", get(status_handler))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn status_handler() -> &'static str {
    "mtls ok"
}

async fn log_request(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    log::info!(
        "[{}] {} {} from {} -> {} in {:?}",
        request_id,
        method,
        path,
        remote,
        response.status(),
        start.elapsed()
    );
    response
}

/// `GET /`: authenticate the peer, then upgrade to the binary WebSocket.
///
/// Identity extraction runs before the upgrade is accepted: a request
/// without usable certificate material never becomes a connection, is never
/// registered, and emits no connectivity event.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    peer_certs: Option<Extension<PeerCertificates>>,
) -> Response {
    let chain = peer_certs.map(|Extension(PeerCertificates(chain))| chain);

    let identity = match extract_identity(
        state.pass_through,
        &headers,
        chain.as_ref().map(|c| c.as_slice()),
        state.cert_order,
    ) {
        Ok(identity) => identity,
        Err(e) => {
            log::warn!("rejecting upgrade: {}", e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let network_interface = headers
        .get(NETWORK_INTERFACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ws.protocols(["binary"])
        .on_upgrade(move |socket| handle_socket(socket, state, identity, network_interface))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: RequestIdentity,
    network_interface: String,
) {
    let (writer, reader) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(SocketManager::outbound_buffer());

    let sm = Arc::new(SocketManager::new(
        identity,
        network_interface,
        state.transmit_decoded,
        out_tx,
        state.shutdown.child_token(),
    ));
    let serializer = Arc::new(BinarySerializer::new(
        sm.identity().clone(),
        state.ack_sources.clone(),
        state.ack_tx.clone(),
    ));

    log::info!("connection {} established for {}", sm.uuid(), sm.identity().sender_id);

    run_connection(
        sm.clone(),
        reader,
        writer,
        out_rx,
        serializer,
        state.dispatcher.clone(),
        state.registry.clone(),
    )
    .await;

    log::info!("connection {} closed for {}", sm.uuid(), sm.identity().sender_id);
}
