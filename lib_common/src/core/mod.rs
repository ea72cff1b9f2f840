//! # Core Engine Module
//!
//! The heart of the telemetry ingress: everything between an upgraded
//! WebSocket and the configured sinks.
//!
//! ## Core Components:
//!
//! - **`registry`**: the process-wide `connection_id → SocketManager` map.
//!   Sink acknowledgements are bound back to live connections through it;
//!   a lookup after deregistration returns absent, never a dangling handle.
//!
//! - **`socket_manager`**: owns one upgraded WebSocket. Drives the frame
//!   pump (read loop), serializes outbound ACK writes through a dedicated
//!   forwarding task, and carries the per-connection cancellation scope.
//!
//! - **`dispatcher`**: the fan-out engine. Resolves a record's topic to its
//!   ordered producer list and hands the record to each producer without
//!   waiting for broker acknowledgement.
//!
//! - **`ack_router`**: the single consumer of the process-wide ack channel.
//!   Looks up the owning socket for each acknowledged record and triggers
//!   the reply, counting hits and misses.

pub mod ack_router;
pub mod dispatcher;
pub mod registry;
pub mod socket_manager;

// --- Public API Re-exports ---
pub use ack_router::AckRouter;
pub use dispatcher::{DispatchRules, Dispatcher, Producer};
pub use registry::SocketRegistry;
pub use socket_manager::SocketManager;
