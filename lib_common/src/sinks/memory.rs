//! In-memory collecting sink, for tests and local diagnostics.

use std::sync::{Arc, Mutex};

use crate::core::dispatcher::Producer;
use crate::serializer::Record;

/// Collects every record it receives. With [`CollectingSink::acking`] it
/// also acks each record immediately, standing in for a durable broker
/// producer on the reliable-ack path.
pub struct CollectingSink {
    name: String,
    ack_on_produce: bool,
    records: Mutex<Vec<Arc<Record>>>,
}

impl CollectingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ack_on_produce: false, records: Mutex::new(Vec::new()) }
    }

    /// A collecting sink that acknowledges every record it accepts.
    pub fn acking(name: impl Into<String>) -> Self {
        Self { name: name.into(), ack_on_produce: true, records: Mutex::new(Vec::new()) }
    }

    /// Snapshot of everything produced so far, in arrival order.
    pub fn records(&self) -> Vec<Arc<Record>> {
        self.records.lock().expect("collecting sink lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("collecting sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Producer for CollectingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self, record: Arc<Record>) {
        self.records.lock().expect("collecting sink lock poisoned").push(record.clone());
        if self.ack_on_produce && record.reply_enabled {
            record.ack();
        }
    }
}
