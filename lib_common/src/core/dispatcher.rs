//! # Record Dispatcher
//!
//! The fan-out engine for decoded telemetry. A record's topic selects an
//! ordered list of producers built once from configuration; the dispatcher
//! hands the record to each of them and moves on.
//!
//! ## Core Design Principles:
//!
//! 1. **Zero-copy fan-out**: records are wrapped in an `Arc` once and every
//!    producer receives a pointer to the same block of memory.
//!
//! 2. **Fire-and-forget**: producers must accept the call promptly (they
//!    buffer internally); the dispatcher never awaits broker
//!    acknowledgement. Retry and backoff are each sink's own policy.
//!
//! 3. **Silent drop for unrouted topics**: a topic with no configured rule
//!    is dropped without error. This is also how the `connectivity` topic
//!    is made optional: omit it from the rules and lifecycle records cost
//!    nothing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::serializer::Record;

/// A downstream consumer of records (broker producer, log writer, local
/// socket). Implementations buffer internally and may later signal
/// reliable-ack completion through the record's ack hook.
pub trait Producer: Send + Sync {
    /// Name of the dispatcher backing this producer (used in logs and
    /// reliable-ack metric labels).
    fn name(&self) -> &str;

    /// Accept one record. Must not block the caller beyond an internal
    /// buffer handoff.
    fn produce(&self, record: Arc<Record>);
}

/// `topic → ordered producers`, built once at startup and read-only after.
pub type DispatchRules = HashMap<String, Vec<Arc<dyn Producer>>>;

/// The central fan-out engine. Cheap to share behind an `Arc`; holds no
/// interior mutability.
pub struct Dispatcher {
    rules: DispatchRules,
}

impl Dispatcher {
    /// Build a dispatcher over a finished rule set.
    pub fn new(rules: DispatchRules) -> Self {
        Self { rules }
    }

    /// Fan one record out to every producer configured for its topic, in
    /// declared order. Records on unrouted topics are dropped silently.
    pub fn dispatch(&self, record: Arc<Record>) {
        match self.rules.get(&record.topic) {
            Some(producers) => {
                for producer in producers {
                    producer.produce(Arc::clone(&record));
                }
            }
            None => {
                log::trace!("no dispatch rule for topic '{}', dropping record", record.topic);
            }
        }
    }

    /// Topics with at least one configured producer.
    pub fn topic_count(&self) -> usize {
        self.rules.len()
    }
}
