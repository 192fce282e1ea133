//! Process-wide registry of running workflows.
//!
//! Entries live until the process exits; nothing is persisted.

use crate::publisher::EventHub;
use crate::state::{CancelFlag, WorkflowState};
use deal_core::{EngineError, Result};
use deal_protocol::WorkflowId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One registered workflow: its state, event hub and live publisher task
#[derive(Debug)]
pub struct WorkflowEntry {
    state: Mutex<WorkflowState>,
    hub: Arc<EventHub>,
    cancel: CancelFlag,
    publisher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowEntry {
    /// Wrap a freshly created state
    pub fn new(state: WorkflowState, event_capacity: usize) -> Self {
        let hub = Arc::new(EventHub::new(state.id(), event_capacity));
        let cancel = state.cancel_flag();
        Self {
            state: Mutex::new(state),
            hub,
            cancel,
            publisher: Mutex::new(None),
        }
    }

    /// The state lock. Take it before touching the hub, never the other way round.
    pub fn state(&self) -> &Mutex<WorkflowState> {
        &self.state
    }

    /// Event hub
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Cancel flag shared with workers and the publisher
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub(crate) fn take_publisher(&self) -> Option<JoinHandle<()>> {
        self.publisher.lock().take()
    }

    pub(crate) fn set_publisher(&self, handle: JoinHandle<()>) {
        *self.publisher.lock() = Some(handle);
    }
}

/// Registry of workflows keyed by id
#[derive(Debug, Default, Clone)]
pub struct WorkflowStore {
    entries: Arc<RwLock<HashMap<WorkflowId, Arc<WorkflowEntry>>>>,
}

impl WorkflowStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry
    pub async fn insert(&self, entry: Arc<WorkflowEntry>) -> Result<()> {
        let id = entry.state.lock().id();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(EngineError::InvalidRequest(format!(
                "workflow {id} already exists"
            )));
        }
        entries.insert(id, entry);
        Ok(())
    }

    /// Look an entry up
    pub async fn get(&self, id: WorkflowId) -> Result<Arc<WorkflowEntry>> {
        self.entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::WorkflowNotFound(id))
    }

    /// Drop an entry
    pub async fn remove(&self, id: WorkflowId) -> Result<Arc<WorkflowEntry>> {
        self.entries
            .write()
            .await
            .remove(&id)
            .ok_or(EngineError::WorkflowNotFound(id))
    }

    /// Every entry, in no particular order
    pub async fn list(&self) -> Vec<Arc<WorkflowEntry>> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Number of entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deal_protocol::{DealContext, StartRequest};

    fn entry() -> Arc<WorkflowEntry> {
        let state = WorkflowState::new(
            WorkflowId::new(),
            StartRequest {
                context: DealContext::new("Bizzi", "https://bizzi.vn"),
                stages: vec![],
                documents: vec![],
            },
        )
        .expect("state");
        Arc::new(WorkflowEntry::new(state, 8))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let store = WorkflowStore::new();
        let e = entry();
        let id = e.state().lock().id();

        store.insert(e.clone()).await.expect("insert");
        assert!(store.insert(e).await.is_err());
        assert_eq!(store.len().await, 1);
        assert!(store.get(id).await.is_ok());

        store.remove(id).await.expect("remove");
        assert!(matches!(
            store.get(id).await,
            Err(EngineError::WorkflowNotFound(missing)) if missing == id
        ));
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_entry_shares_cancel_flag_with_state() {
        let e = entry();
        e.state().lock().cancel().expect("cancel");
        assert!(e.cancel_flag().is_cancelled());
    }
}
