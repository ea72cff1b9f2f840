//! # Socket Manager
//!
//! Owns one upgraded WebSocket for its whole life: the read loop decoding
//! binary telemetry frames, the outbound path writing acknowledgement
//! frames, and the cancellation scope tying both to server shutdown.
//!
//! The write half of the socket is owned by a single forwarding task fed
//! from a bounded channel; [`SocketManager::respond_to_vehicle`] only
//! enqueues, so it is safe to call from the ack router concurrently with
//! the read loop, and frames can never interleave.
//!
//! Connection state machine:
//!
//! ```text
//! INIT → UPGRADED → RUNNING → CLOSING → CLOSED
//!                    │
//!                    └─(any read error)→ CLOSING
//! ```
//!
//! `CONNECTED` is emitted on entering RUNNING (before any telemetry record
//! from the socket), `DISCONNECTED` on entering CLOSING (after the read
//! loop exits); both are best-effort.

use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use prost::Message as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connectivity;
use crate::core::dispatcher::Dispatcher;
use crate::core::registry::SocketRegistry;
use crate::identity::RequestIdentity;
use crate::serializer::{BinarySerializer, Record};
use crate::telemetry::{ConnectivityStatus, StreamAck};

/// Outbound frames buffered per connection before ACK writes are dropped.
const OUTBOUND_BUFFER: usize = 256;

/// Per-connection state: identity, outbound channel, cancellation scope.
pub struct SocketManager {
    uuid: Uuid,
    identity: RequestIdentity,
    network_interface: String,
    transmit_decoded: bool,
    out_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl SocketManager {
    /// Create the manager for a freshly upgraded socket. The UUID is
    /// generated here and identifies the connection in the registry for
    /// its whole life.
    pub fn new(
        identity: RequestIdentity,
        network_interface: String,
        transmit_decoded: bool,
        out_tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            identity,
            network_interface,
            transmit_decoded,
            out_tx,
            cancel,
        }
    }

    /// Channel capacity to pair with the `out_tx` handed to [`new`].
    ///
    /// [`new`]: SocketManager::new
    pub fn outbound_buffer() -> usize {
        OUTBOUND_BUFFER
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn identity(&self) -> &RequestIdentity {
        &self.identity
    }

    /// Best-effort label of the network path the peer is using, taken from
    /// the `X-Network-Interface` request header at upgrade time. Used only
    /// for connectivity events.
    pub fn network_interface(&self) -> &str {
        &self.network_interface
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run the frame pump until the peer closes, a read error occurs, or
    /// the connection scope is cancelled. Binary frames decode and
    /// dispatch; non-binary frames and decode failures are counted and
    /// skipped without tearing the connection down.
    pub async fn process_telemetry<R>(
        &self,
        reader: &mut R,
        serializer: &Arc<BinarySerializer>,
        dispatcher: &Dispatcher,
    ) where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let mut dispatched: u64 = 0;
        let mut decode_errors: u64 = 0;
        let mut skipped_frames: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("connection {} cancelled", self.uuid);
                    break;
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        match serializer.decode(data, self.uuid, self.transmit_decoded) {
                            Ok(record) => {
                                dispatcher.dispatch(Arc::new(record));
                                dispatched += 1;
                            }
                            Err(e) => {
                                decode_errors += 1;
                                log::warn!(
                                    "connection {} sender {}: dropping undecodable frame: {}",
                                    self.uuid, self.identity.sender_id, e
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        log::debug!("connection {} closed by peer", self.uuid);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/ping/pong carry no telemetry.
                        skipped_frames += 1;
                    }
                    Some(Err(e)) => {
                        log::warn!("connection {} read error: {}", self.uuid, e);
                        break;
                    }
                    None => {
                        log::debug!("connection {} stream ended", self.uuid);
                        break;
                    }
                }
            }
        }

        log::info!(
            "connection {} read loop done: {} dispatched, {} decode errors, {} non-binary frames",
            self.uuid, dispatched, decode_errors, skipped_frames
        );
    }

    /// Write an ACK (or NACK, when `error` is set) frame back to the
    /// vehicle. Called by the ack router; enqueue-only, so concurrent with
    /// the read loop and serialized against other writes by the forwarding
    /// task. Failures are logged and dropped, never retried.
    pub fn respond_to_vehicle(&self, record: &Record, error: Option<&str>) {
        let ack = StreamAck {
            txid: record.txid.clone(),
            message_type: if error.is_some() { b"error".to_vec() } else { b"ack".to_vec() },
            detail: error.map(|e| e.as_bytes().to_vec()).unwrap_or_default(),
        };

        let frame = Message::Binary(Bytes::from(ack.encode_to_vec()));
        if let Err(e) = self.out_tx.try_send(frame) {
            log::warn!(
                "connection {} sender {}: failed to enqueue ack for txid {:?}: {}",
                self.uuid,
                self.identity.sender_id,
                String::from_utf8_lossy(&record.txid),
                e
            );
        }
    }
}

/// Drive one registered connection to completion.
///
/// Registers the manager, emits `CONNECTED`, then runs the read loop to
/// completion; only a read failure, peer close, or cancellation ends the
/// connection. The outbound forwarder runs as its own task: a failed ACK
/// write stops forwarding and is logged, nothing more. On exit the manager
/// emits `DISCONNECTED`, deregisters, and reaps the forwarder.
pub async fn run_connection<R, W>(
    sm: Arc<SocketManager>,
    mut reader: R,
    writer: W,
    out_rx: mpsc::Receiver<Message>,
    serializer: Arc<BinarySerializer>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SocketRegistry>,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: std::fmt::Display,
{
    registry.register(sm.clone());
    connectivity::emit(ConnectivityStatus::Connected, &sm, &serializer, &dispatcher);

    let forwarder = tokio::spawn(forward_outbound(out_rx, writer, sm.cancellation().clone()));

    sm.process_telemetry(&mut reader, &serializer, &dispatcher).await;

    connectivity::emit(ConnectivityStatus::Disconnected, &sm, &serializer, &dispatcher);
    registry.deregister(&sm);

    // The connection scope is over; abort any pending ACK writes.
    sm.cancellation().cancel();
    let _ = forwarder.await;
}

/// Own the write half: drain the outbound channel into the socket until
/// cancellation or channel closure. A write failure stops forwarding (later
/// ACKs are logged and dropped at the enqueue side once the buffer fills);
/// it never ends the connection, which belongs to the read loop alone.
async fn forward_outbound<W>(
    mut out_rx: mpsc::Receiver<Message>,
    mut writer: W,
    cancel: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        log::warn!("outbound write failed, no longer forwarding acks: {}", e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::dispatcher::{DispatchRules, Producer};
    use crate::serializer::tests::{encoded_frame, test_identity, test_serializer};
    use crate::sinks::memory::CollectingSink;
    use crate::telemetry::CONNECTIVITY_TOPIC;
    use futures_util::stream;

    pub(crate) fn test_manager() -> (Arc<SocketManager>, mpsc::Receiver<Message>) {
        let (out_tx, out_rx) = mpsc::channel(SocketManager::outbound_buffer());
        let sm = Arc::new(SocketManager::new(
            test_identity(),
            "unknown".to_string(),
            false,
            out_tx,
            CancellationToken::new(),
        ));
        (sm, out_rx)
    }

    fn single_rule(topic: &str, sink: Arc<CollectingSink>) -> DispatchRules {
        DispatchRules::from([(topic.to_string(), vec![sink as Arc<dyn Producer>])])
    }

    #[test]
    fn ack_frame_echoes_txid() {
        let (sm, mut out_rx) = test_manager();
        let (serializer, _ack_rx) = test_serializer(&[("V", "kafka")]);
        let record = serializer.decode(encoded_frame("V", "T1"), sm.uuid(), false).unwrap();

        sm.respond_to_vehicle(&record, None);

        let frame = out_rx.try_recv().expect("ack enqueued");
        let Message::Binary(bytes) = frame else { panic!("ack must be a binary frame") };
        let ack = StreamAck::decode(bytes.as_ref()).unwrap();
        assert_eq!(ack.txid, b"T1");
        assert_eq!(ack.message_type, b"ack");
        assert!(ack.detail.is_empty());
    }

    #[test]
    fn nack_frame_carries_error_detail() {
        let (sm, mut out_rx) = test_manager();
        let (serializer, _ack_rx) = test_serializer(&[]);
        let record = serializer.decode(encoded_frame("V", "T2"), sm.uuid(), false).unwrap();

        sm.respond_to_vehicle(&record, Some("sink rejected"));

        let Message::Binary(bytes) = out_rx.try_recv().unwrap() else {
            panic!("nack must be a binary frame")
        };
        let ack = StreamAck::decode(bytes.as_ref()).unwrap();
        assert_eq!(ack.message_type, b"error");
        assert_eq!(ack.detail, b"sink rejected");
    }

    #[test]
    fn respond_after_writer_gone_does_not_panic() {
        let (sm, out_rx) = test_manager();
        drop(out_rx);
        let (serializer, _ack_rx) = test_serializer(&[]);
        let record = serializer.decode(encoded_frame("V", "T3"), sm.uuid(), false).unwrap();
        sm.respond_to_vehicle(&record, None);
    }

    #[tokio::test]
    async fn read_loop_dispatches_binary_frames_in_order() {
        let (sm, _out_rx) = test_manager();
        let sink = Arc::new(CollectingSink::new("kafka_stub"));
        let dispatcher = Dispatcher::new(single_rule("V", sink.clone()));
        let (serializer, _ack_rx) = test_serializer(&[]);

        let frames = vec![
            Ok(Message::Binary(encoded_frame("V", "T1"))),
            Ok(Message::Text("not telemetry".into())),
            Ok(Message::Binary(Bytes::from_static(&[0xff, 0xff]))),
            Ok(Message::Binary(encoded_frame("V", "T2"))),
            Ok(Message::Close(None)),
        ];
        let mut reader = stream::iter(frames);

        sm.process_telemetry(&mut reader, &serializer, &dispatcher).await;

        let txids: Vec<Vec<u8>> = sink.records().iter().map(|r| r.txid.clone()).collect();
        assert_eq!(txids, vec![b"T1".to_vec(), b"T2".to_vec()]);
        assert!(sink.records().iter().all(|r| r.connection_id == sm.uuid()));
    }

    #[tokio::test]
    async fn read_error_terminates_the_loop() {
        let (sm, _out_rx) = test_manager();
        let sink = Arc::new(CollectingSink::new("kafka_stub"));
        let dispatcher = Dispatcher::new(single_rule("V", sink.clone()));
        let (serializer, _ack_rx) = test_serializer(&[]);

        let frames = vec![
            Ok(Message::Binary(encoded_frame("V", "T1"))),
            Err(axum::Error::new("connection reset")),
            Ok(Message::Binary(encoded_frame("V", "T2"))),
        ];
        let mut reader = stream::iter(frames);

        sm.process_telemetry(&mut reader, &serializer, &dispatcher).await;

        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_read_loop() {
        let (sm, _out_rx) = test_manager();
        let dispatcher = Dispatcher::new(DispatchRules::new());
        let (serializer, _ack_rx) = test_serializer(&[]);

        sm.cancellation().cancel();
        let mut reader = stream::pending();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            sm.process_telemetry(&mut reader, &serializer, &dispatcher),
        )
        .await
        .expect("cancelled loop exits promptly");
    }

    #[tokio::test]
    async fn concurrent_connections_preserve_per_connection_order() {
        const CONNECTIONS: usize = 100;
        const FRAMES: usize = 10;

        let shared = Arc::new(CollectingSink::new("kafka_stub"));
        let lifecycle = Arc::new(CollectingSink::new("log_stub"));
        let rules = DispatchRules::from([
            ("V".to_string(), vec![shared.clone() as Arc<dyn Producer>]),
            (CONNECTIVITY_TOPIC.to_string(), vec![lifecycle.clone() as Arc<dyn Producer>]),
        ]);
        let dispatcher = Arc::new(Dispatcher::new(rules));
        let registry = Arc::new(SocketRegistry::new());

        let mut tasks = Vec::new();
        for c in 0..CONNECTIONS {
            let (sm, out_rx) = test_manager();
            let (serializer, _ack_rx) = test_serializer(&[]);
            let dispatcher = dispatcher.clone();
            let registry = registry.clone();

            tasks.push(tokio::spawn(async move {
                let mut frames: Vec<Result<Message, axum::Error>> = (0..FRAMES)
                    .map(|f| Ok(Message::Binary(encoded_frame("V", &format!("c{c}-f{f}")))))
                    .collect();
                frames.push(Ok(Message::Close(None)));

                let uuid = sm.uuid();
                run_connection(
                    sm,
                    stream::iter(frames),
                    futures_util::sink::drain(),
                    out_rx,
                    serializer,
                    dispatcher,
                    registry,
                )
                .await;
                uuid
            }));
        }

        let mut uuids = Vec::new();
        for task in tasks {
            uuids.push(task.await.unwrap());
        }

        let records = shared.records();
        assert_eq!(records.len(), CONNECTIONS * FRAMES);

        // Frames from one connection arrive at the sink in decode order,
        // whatever the interleaving across connections.
        for uuid in &uuids {
            let txids: Vec<Vec<u8>> = records
                .iter()
                .filter(|r| r.connection_id == *uuid)
                .map(|r| r.txid.clone())
                .collect();
            assert_eq!(txids.len(), FRAMES);
            let mut sorted = txids.clone();
            sorted.sort();
            assert_eq!(txids, sorted, "per-connection order lost for {uuid}");
        }

        // One CONNECTED and one DISCONNECTED per connection, and nothing
        // left registered.
        assert_eq!(lifecycle.len(), CONNECTIONS * 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn run_connection_brackets_telemetry_with_lifecycle_records() {
        let (sm, out_rx) = test_manager();
        let telemetry_sink = Arc::new(CollectingSink::new("kafka_stub"));
        let lifecycle_sink = Arc::new(CollectingSink::new("log_stub"));
        let shared = Arc::new(CollectingSink::new("everything"));

        let rules = DispatchRules::from([
            (
                "V".to_string(),
                vec![
                    telemetry_sink.clone() as Arc<dyn Producer>,
                    shared.clone() as Arc<dyn Producer>,
                ],
            ),
            (
                CONNECTIVITY_TOPIC.to_string(),
                vec![
                    lifecycle_sink.clone() as Arc<dyn Producer>,
                    shared.clone() as Arc<dyn Producer>,
                ],
            ),
        ]);
        let dispatcher = Arc::new(Dispatcher::new(rules));
        let registry = Arc::new(SocketRegistry::new());
        let (serializer, _ack_rx) = test_serializer(&[]);

        let frames = vec![
            Ok(Message::Binary(encoded_frame("V", "T1"))),
            Ok(Message::Close(None)),
        ];
        let reader = stream::iter(frames);
        let writer = futures_util::sink::drain();

        run_connection(
            sm.clone(),
            reader,
            writer,
            out_rx,
            serializer,
            dispatcher,
            registry.clone(),
        )
        .await;

        // Lifecycle bracket: CONNECTED strictly before telemetry, then
        // DISCONNECTED strictly after.
        let topics: Vec<String> = shared.records().iter().map(|r| r.topic.clone()).collect();
        assert_eq!(topics, vec!["connectivity", "V", "connectivity"]);
        assert_eq!(lifecycle_sink.len(), 2);
        assert_eq!(telemetry_sink.len(), 1);

        // And the socket left the registry on exit.
        assert!(registry.lookup(sm.uuid()).is_none());
    }
}
