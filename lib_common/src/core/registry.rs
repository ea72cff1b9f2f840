//! # Socket Registry
//!
//! Process-wide `connection_id → SocketManager` map. Entries live from
//! `register` to `deregister`; a lookup outside that window returns absent,
//! never a dangling reference. The engine never iterates the registry, so
//! a mutex-guarded map is all that is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::core::socket_manager::SocketManager;

/// Concurrent registry of live socket managers.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: Mutex<HashMap<Uuid, Arc<SocketManager>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly upgraded socket. UUIDs are generated per connection
    /// so a duplicate insert indicates a bug; the existing entry wins.
    pub fn register(&self, sm: Arc<SocketManager>) {
        let mut sockets = self.sockets.lock().expect("registry lock poisoned");
        let uuid = sm.uuid();
        if sockets.contains_key(&uuid) {
            log::error!("connection {uuid} already registered, keeping existing entry");
            return;
        }
        sockets.insert(uuid, sm);
        log::debug!("connection {uuid} registered ({} live)", sockets.len());
    }

    /// Remove a socket at the end of its life. Absent entries are ignored.
    pub fn deregister(&self, sm: &SocketManager) {
        let mut sockets = self.sockets.lock().expect("registry lock poisoned");
        if sockets.remove(&sm.uuid()).is_some() {
            log::debug!("connection {} deregistered ({} live)", sm.uuid(), sockets.len());
        }
    }

    /// Resolve a connection id to its live manager, if still registered.
    pub fn lookup(&self, uuid: Uuid) -> Option<Arc<SocketManager>> {
        self.sockets.lock().expect("registry lock poisoned").get(&uuid).cloned()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.sockets.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
