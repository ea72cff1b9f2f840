//! Log sink: writes one line per record through the process logger.

use std::sync::Arc;

use crate::core::dispatcher::Producer;
use crate::serializer::Record;

/// Logs every record it receives. Never acks; reliable-ack deployments pair
/// it with a broker producer.
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Producer for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self, record: Arc<Record>) {
        log::info!(
            "[{}] topic={} txid={} connection={} bytes={}",
            self.name,
            record.topic,
            String::from_utf8_lossy(&record.txid),
            record.connection_id,
            record.raw.len()
        );
    }
}
