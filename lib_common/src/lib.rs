//! # Fleet Telemetry Ingress Engine
//!
//! The connection-and-dispatch engine behind the telemetry ingress server.
//! Vehicle devices connect over mutually-authenticated WebSockets, stream
//! binary telemetry frames, and receive application-level acknowledgements
//! once a configured sink has durably accepted a record.
//!
//! ## Contained Modules:
//! - **`identity`**: derives the device identity from mTLS material (direct
//!   peer chain or load-balancer pass-through headers).
//! - **`telemetry`**: the protobuf wire types the engine observes
//!   (`StreamMessage` envelope, `StreamAck`, `VehicleConnectivity`).
//! - **`serializer`**: decodes inbound frame bytes into dispatch-ready
//!   [`serializer::Record`]s and carries the reliable-ack reply hook.
//! - **`core`**: the engine proper: socket registry, per-socket manager,
//!   dispatch fan-out, and the ack router.
//! - **`connectivity`**: synthesizes connect/disconnect lifecycle records
//!   onto the `connectivity` topic.
//! - **`sinks`**: the [`core::dispatcher::Producer`] trait implementations
//!   shipped with the engine; broker producers live outside and plug into
//!   the same seam.
//! - **`metrics`**: one-time registration of the engine's counters.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connectivity;
pub mod core;
pub mod identity;
pub mod metrics;
pub mod serializer;
pub mod sinks;
pub mod telemetry;

// --- Public API Re-exports ---
// Make the primary structs directly accessible.
pub use crate::core::ack_router::AckRouter;
pub use crate::core::dispatcher::{Dispatcher, Producer};
pub use crate::core::registry::SocketRegistry;
pub use crate::core::socket_manager::SocketManager;
pub use identity::{IdentityError, RequestIdentity, TlsPassThrough};
pub use serializer::{AckTarget, BinarySerializer, DecodeError, Record};
