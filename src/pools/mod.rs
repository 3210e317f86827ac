pub mod handle;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

pub use handle::{
    run_read_loop, InFlightTaskInfo, SendTaskError, WorkerHandle, WorkerSnapshot, WorkerStatus,
};

// Owns every live worker handle. The dispatcher and the heartbeat monitor
// iterate over snapshots and must tolerate entries disappearing between
// the snapshot and their use.
#[derive(Default)]
pub struct WorkerRegistry {
    records: Mutex<HashMap<Uuid, Arc<WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<WorkerHandle>) {
        self.records
            .lock()
            .expect("worker registry lock poisoned")
            .insert(handle.worker_id(), handle);
    }

    pub fn remove(&self, worker_id: &Uuid) -> Option<Arc<WorkerHandle>> {
        self.records
            .lock()
            .expect("worker registry lock poisoned")
            .remove(worker_id)
    }

    pub fn get(&self, worker_id: &Uuid) -> Option<Arc<WorkerHandle>> {
        self.records
            .lock()
            .expect("worker registry lock poisoned")
            .get(worker_id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.records
            .lock()
            .expect("worker registry lock poisoned")
            .len()
    }

    pub fn snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.records
            .lock()
            .expect("worker registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn drain_all(&self) -> Vec<Arc<WorkerHandle>> {
        self.records
            .lock()
            .expect("worker registry lock poisoned")
            .drain()
            .map(|(_, handle)| handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::server::test_support::connected_pair;

    use super::{WorkerHandle, WorkerRegistry};

    #[test]
    fn insert_get_remove_round_trip() {
        let registry = WorkerRegistry::new();
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        let worker_id = handle.worker_id();

        registry.insert(Arc::clone(&handle));
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&worker_id).is_some());

        let removed = registry.remove(&worker_id).expect("handle should remove");
        assert_eq!(removed.worker_id(), worker_id);
        assert_eq!(registry.count(), 0);
        assert!(registry.remove(&worker_id).is_none());
    }

    #[test]
    fn snapshot_is_detached_from_the_registry() {
        let registry = WorkerRegistry::new();
        let (conn_a, _client_a) = connected_pair();
        let (conn_b, _client_b) = connected_pair();
        let handle_a = WorkerHandle::new(conn_a);
        registry.insert(Arc::clone(&handle_a));
        registry.insert(WorkerHandle::new(conn_b));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);

        registry.remove(&handle_a.worker_id());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = WorkerRegistry::new();
        let (conn, _client) = connected_pair();
        registry.insert(WorkerHandle::new(conn));

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.count(), 0);
    }
}
