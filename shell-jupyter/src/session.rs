//! Kernel session state
//!
//! Shared by the shell and control loops. Each piece of state has its own
//! lock and no lock is held while a handler awaits or runs a callback.

use crate::comm::CommCallbacks;
use crate::content::CommInfo;
use crate::message::KernelMessage;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// An open comm: the target it was opened against and the callbacks that
/// target had at the time
#[derive(Clone)]
pub struct ActiveComm {
    pub target_name: String,
    pub callbacks: Arc<CommCallbacks>,
}

#[derive(Default)]
pub struct Session {
    execution_count: AtomicU32,
    last_message: Mutex<Option<KernelMessage>>,
    registered_comms: RwLock<HashMap<String, Arc<CommCallbacks>>>,
    active_comms: Mutex<HashMap<String, ActiveComm>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count.load(Ordering::SeqCst)
    }

    /// Advance the execution counter, returning the new value
    pub fn increment_execution_count(&self) -> u32 {
        self.execution_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Remember the most recently received message
    pub fn record(&self, msg: &KernelMessage) {
        *lock(&self.last_message) = Some(msg.clone());
    }

    pub fn last_message(&self) -> Option<KernelMessage> {
        lock(&self.last_message).clone()
    }

    /// Register callbacks for a comm target, replacing any previous ones
    pub fn register_comm(&self, target_name: &str, callbacks: Arc<CommCallbacks>) {
        self.registered_comms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_name.to_string(), callbacks);
    }

    /// Remove a comm target. Comms already open against it stay open.
    pub fn unregister_comm(&self, target_name: &str) -> bool {
        self.registered_comms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target_name)
            .is_some()
    }

    pub fn registered_comm(&self, target_name: &str) -> Option<Arc<CommCallbacks>> {
        self.registered_comms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target_name)
            .cloned()
    }

    pub fn insert_comm(&self, comm_id: &str, comm: ActiveComm) {
        lock(&self.active_comms).insert(comm_id.to_string(), comm);
    }

    pub fn active_comm(&self, comm_id: &str) -> Option<ActiveComm> {
        lock(&self.active_comms).get(comm_id).cloned()
    }

    pub fn remove_comm(&self, comm_id: &str) -> Option<ActiveComm> {
        lock(&self.active_comms).remove(comm_id)
    }

    /// Open comms and their target names, optionally limited to one target
    pub fn comm_snapshot(&self, target_name: Option<&str>) -> BTreeMap<String, CommInfo> {
        lock(&self.active_comms)
            .iter()
            .filter(|(_, comm)| target_name.map_or(true, |t| comm.target_name == t))
            .map(|(id, comm)| {
                (
                    id.clone(),
                    CommInfo {
                        target_name: comm.target_name.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_count_increments() {
        let session = Session::new();
        assert_eq!(session.execution_count(), 0);
        assert_eq!(session.increment_execution_count(), 1);
        assert_eq!(session.increment_execution_count(), 2);
        assert_eq!(session.execution_count(), 2);
    }

    #[test]
    fn test_last_registration_wins() {
        let session = Session::new();
        let first = Arc::new(CommCallbacks::new());
        let second = Arc::new(CommCallbacks::new());
        session.register_comm("plots", first);
        session.register_comm("plots", second.clone());

        let found = session.registered_comm("plots").unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[test]
    fn test_comm_snapshot_filters_by_target() {
        let session = Session::new();
        let callbacks = Arc::new(CommCallbacks::new());
        for (id, target) in [("a", "plots"), ("b", "widgets"), ("c", "plots")] {
            session.insert_comm(
                id,
                ActiveComm {
                    target_name: target.to_string(),
                    callbacks: callbacks.clone(),
                },
            );
        }

        assert_eq!(session.comm_snapshot(None).len(), 3);
        let plots = session.comm_snapshot(Some("plots"));
        assert_eq!(plots.keys().collect::<Vec<_>>(), vec!["a", "c"]);

        session.remove_comm("a");
        assert!(session.active_comm("a").is_none());
        assert_eq!(session.comm_snapshot(Some("plots")).len(), 1);
    }
}
