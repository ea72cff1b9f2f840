//! # Reliable-Ack Router
//!
//! The single consumer of the process-wide ack channel. Sinks that durably
//! accept a record hand it back through the record's ack hook; the router
//! binds each acknowledged record to the socket that produced it (via the
//! registry) and triggers the ACK write. Connections that are already gone
//! become a `reliable_ack_miss` count, silently.
//!
//! The router must stay single-consumer: per-record ordering toward one
//! socket relies on it. Many sinks may publish concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::registry::SocketRegistry;
use crate::metrics::{RELIABLE_ACK, RELIABLE_ACK_MISS};
use crate::serializer::Record;

/// Drains the ack channel for the life of the process.
pub struct AckRouter {
    registry: Arc<SocketRegistry>,
    ack_sources: Arc<HashMap<String, String>>,
    ack_rx: mpsc::UnboundedReceiver<Record>,
    cancel: CancellationToken,
}

impl AckRouter {
    pub fn new(
        registry: Arc<SocketRegistry>,
        ack_sources: Arc<HashMap<String, String>>,
        ack_rx: mpsc::UnboundedReceiver<Record>,
        cancel: CancellationToken,
    ) -> Self {
        Self { registry, ack_sources, ack_rx, cancel }
    }

    /// Consume acks until cancellation or until every sender is gone.
    pub async fn run(mut self) {
        log::info!("ack router started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("ack router shutting down");
                    break;
                }
                record = self.ack_rx.recv() => match record {
                    Some(record) => self.route(record),
                    None => {
                        log::info!("ack channel closed, ack router exiting");
                        break;
                    }
                }
            }
        }
    }

    fn route(&self, record: Record) {
        // A record without its serializer back-reference cannot have come
        // through the normal decode path; the sink emitted a malformed ack.
        if !record.has_ack_target() {
            log::warn!("dropping ack without serializer for txid {:?}", record.txid);
            return;
        }

        let dispatcher = self.ack_sources.get(&record.tx_type).cloned().unwrap_or_default();

        match self.registry.lookup(record.connection_id) {
            Some(sm) => {
                counter!(
                    RELIABLE_ACK,
                    "record_type" => record.tx_type.clone(),
                    "dispatcher" => dispatcher
                )
                .increment(1);
                sm.respond_to_vehicle(&record, None);
            }
            None => {
                counter!(
                    RELIABLE_ACK_MISS,
                    "record_type" => record.tx_type.clone(),
                    "dispatcher" => dispatcher
                )
                .increment(1);
                log::debug!(
                    "ack for departed connection {} (txid {:?})",
                    record.connection_id,
                    String::from_utf8_lossy(&record.txid)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::{DispatchRules, Dispatcher, Producer};
    use crate::core::socket_manager::tests::test_manager;
    use crate::serializer::tests::{encoded_frame, test_serializer};
    use crate::sinks::memory::CollectingSink;
    use crate::telemetry::StreamAck;
    use axum::extract::ws::Message;
    use futures_util::stream;
    use prost::Message as _;
    use std::time::Duration;

    #[tokio::test]
    async fn routed_ack_reaches_the_registered_socket() {
        let registry = Arc::new(SocketRegistry::new());
        let (sm, mut out_rx) = test_manager();
        registry.register(sm.clone());

        let (serializer, ack_rx) = test_serializer(&[("V", "kafka")]);
        let sources = Arc::new(HashMap::from([("V".to_string(), "kafka".to_string())]));
        let cancel = CancellationToken::new();
        let router = AckRouter::new(registry.clone(), sources, ack_rx, cancel.clone());
        let router_task = tokio::spawn(router.run());

        // The sink acks the record it accepted.
        let record = serializer.decode(encoded_frame("V", "T1"), sm.uuid(), false).unwrap();
        record.ack();

        let frame = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("ack written promptly")
            .expect("socket still open");
        let Message::Binary(bytes) = frame else { panic!("ack must be binary") };
        let ack = StreamAck::decode(bytes.as_ref()).unwrap();
        assert_eq!(ack.txid, b"T1");

        cancel.cancel();
        router_task.await.unwrap();
    }

    #[tokio::test]
    async fn ack_for_departed_connection_writes_nothing() {
        let registry = Arc::new(SocketRegistry::new());
        let (sm, mut out_rx) = test_manager();
        registry.register(sm.clone());

        let (serializer, ack_rx) = test_serializer(&[("V", "kafka")]);
        let record = serializer.decode(encoded_frame("V", "T1"), sm.uuid(), false).unwrap();

        // The client disconnects before the sink acks.
        registry.deregister(&sm);

        let sources = Arc::new(HashMap::from([("V".to_string(), "kafka".to_string())]));
        let cancel = CancellationToken::new();
        let router = AckRouter::new(registry, sources, ack_rx, cancel.clone());
        let router_task = tokio::spawn(router.run());

        record.ack();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(out_rx.try_recv().is_err(), "no frame may reach a departed socket");

        cancel.cancel();
        router_task.await.unwrap();
    }

    /// The full reliable-ack path: frame in, fan-out to a durable sink and
    /// a log-style sink, ack routed back, ACK frame on the socket.
    #[tokio::test]
    async fn durable_sink_ack_reaches_the_socket_end_to_end() {
        let registry = Arc::new(SocketRegistry::new());
        let (sm, mut out_rx) = test_manager();
        registry.register(sm.clone());

        let kafka = Arc::new(CollectingSink::acking("kafka_stub"));
        let logs = Arc::new(CollectingSink::new("log_stub"));
        let rules = DispatchRules::from([(
            "V".to_string(),
            vec![kafka.clone() as Arc<dyn Producer>, logs.clone() as Arc<dyn Producer>],
        )]);
        let dispatcher = Dispatcher::new(rules);

        let (serializer, ack_rx) = test_serializer(&[("V", "kafka")]);
        let sources = Arc::new(HashMap::from([("V".to_string(), "kafka".to_string())]));
        let cancel = CancellationToken::new();
        let router = AckRouter::new(registry.clone(), sources, ack_rx, cancel.clone());
        let router_task = tokio::spawn(router.run());

        let frames =
            vec![Ok(Message::Binary(encoded_frame("V", "T1"))), Ok(Message::Close(None))];
        let mut reader = stream::iter(frames);
        sm.process_telemetry(&mut reader, &serializer, &dispatcher).await;

        // Both sinks saw the record.
        assert_eq!(kafka.len(), 1);
        assert_eq!(logs.len(), 1);

        // And the durable sink's ack came back as a frame on the socket.
        let frame = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("ack routed promptly")
            .expect("socket still open");
        let Message::Binary(bytes) = frame else { panic!("ack must be binary") };
        let ack = StreamAck::decode(bytes.as_ref()).unwrap();
        assert_eq!(ack.txid, b"T1");
        assert_eq!(ack.message_type, b"ack");

        cancel.cancel();
        router_task.await.unwrap();
    }

    #[tokio::test]
    async fn router_exits_when_all_senders_drop() {
        let registry = Arc::new(SocketRegistry::new());
        let (serializer, ack_rx) = test_serializer(&[]);
        let router =
            AckRouter::new(registry, Arc::new(HashMap::new()), ack_rx, CancellationToken::new());
        let task = tokio::spawn(router.run());

        drop(serializer);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("router exits once the channel closes")
            .unwrap();
    }
}
