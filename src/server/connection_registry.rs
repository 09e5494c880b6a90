use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::server::connection::{Connection, ConnectionId};

/// All live connections of a server, by id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
    count: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry::default()
    }

    pub fn store(&self, id: ConnectionId, conn: Arc<Connection>) {
        if self.connections.write().insert(id, conn).is_none() {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        trace!("stored connection {:?}", id);
    }

    pub fn delete(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            trace!("deleted connection {:?}", id);
        }
        removed
    }

    pub fn load(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Calls `f` for every connection until it returns `false`. Iteration works on a snapshot,
    ///  so `f` may close connections or register new ones.
    pub fn range(&self, mut f: impl FnMut(&Arc<Connection>) -> bool) {
        for conn in self.snapshot() {
            if !f(&conn) {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
