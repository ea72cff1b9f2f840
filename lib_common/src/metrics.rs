//! Engine counters, registered exactly once per process lifetime.
//!
//! The exporter (Prometheus scrape endpoint, statsd, …) is installed by the
//! deployment; the engine only describes and increments its counters
//! through the `metrics` facade.

use std::sync::Once;

use metrics::describe_counter;

/// Counter: ACK successfully routed to a live socket.
/// Labels: `record_type`, `dispatcher`.
pub const RELIABLE_ACK: &str = "reliable_ack";

/// Counter: ACK arrived for a connection that is gone.
/// Labels: `record_type`, `dispatcher`.
pub const RELIABLE_ACK_MISS: &str = "reliable_ack_miss";

static REGISTER: Once = Once::new();

/// Describe the engine's counters. Safe to call from multiple entry points;
/// only the first call does anything.
pub fn register() {
    REGISTER.call_once(|| {
        describe_counter!(RELIABLE_ACK, "Reliable acks routed to a live connection");
        describe_counter!(RELIABLE_ACK_MISS, "Reliable acks whose connection was gone");
    });
}
