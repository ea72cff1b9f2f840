//! # Shipped Record Sinks
//!
//! The [`Producer`](crate::core::dispatcher::Producer) implementations that
//! come with the engine. Broker producers (Kafka, Kinesis, and friends) are
//! external collaborators that plug into the same trait; what lives here is
//! the log sink used in every deployment and the in-memory collecting sink
//! backing tests and local diagnostics.

pub mod logger;
pub mod memory;

// --- Public API Re-exports ---
pub use logger::LogSink;
pub use memory::CollectingSink;
