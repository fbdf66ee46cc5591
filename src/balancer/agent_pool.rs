use std::sync::Arc;

use super::worker::{WorkerHandle, WorkerSnapshot};

/// Worker handles kept sorted ascending by connection count.
///
/// Handles with equal counts keep their relative order; a handle whose count
/// changes is moved behind every other handle with the same count.
#[derive(Debug, Default)]
pub struct AgentPool {
    agents: Vec<Arc<WorkerHandle>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// The least loaded handle.
    pub fn first(&self) -> Option<&Arc<WorkerHandle>> {
        self.agents.first()
    }

    #[cfg(test)]
    fn contains(&self, handle: &Arc<WorkerHandle>) -> bool {
        self.position(handle).is_some()
    }

    /// Cloned handles in pool order.
    pub fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.agents.clone()
    }

    pub fn insert(&mut self, handle: Arc<WorkerHandle>) {
        self.place(handle);
    }

    /// Move `handle` to the position matching its current count. No-op if absent.
    pub fn reorder(&mut self, handle: &Arc<WorkerHandle>) {
        if let Some(index) = self.position(handle) {
            let handle = self.agents.remove(index);
            self.place(handle);
        }
    }

    /// Drop `handle` by identity. Returns false if it was not pooled.
    pub fn remove(&mut self, handle: &Arc<WorkerHandle>) -> bool {
        match self.position(handle) {
            Some(index) => {
                self.agents.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take every handle out of the pool.
    pub fn drain(&mut self) -> Vec<Arc<WorkerHandle>> {
        std::mem::take(&mut self.agents)
    }

    /// Count a new connection on `handle` and restore the order.
    pub fn acquire(&mut self, handle: &Arc<WorkerHandle>) {
        handle.add_connection();
        self.reorder(handle);
    }

    /// Count a closed connection on `handle` and restore the order.
    pub fn release(&mut self, handle: &Arc<WorkerHandle>) {
        handle.remove_connection();
        self.reorder(handle);
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.agents.iter().map(|handle| handle.snapshot()).collect()
    }

    /// Connection counts in pool order.
    pub fn distribution(&self) -> Vec<usize> {
        self.agents.iter().map(|handle| handle.connections()).collect()
    }

    fn is_sorted(&self) -> bool {
        self.agents.is_sorted_by_key(|handle| handle.connections())
    }

    fn position(&self, handle: &Arc<WorkerHandle>) -> Option<usize> {
        self.agents.iter().position(|pooled| Arc::ptr_eq(pooled, handle))
    }

    // first slot whose count is strictly greater, else the end
    fn place(&mut self, handle: Arc<WorkerHandle>) {
        let count = handle.connections();
        let index = self
            .agents
            .iter()
            .position(|pooled| pooled.connections() > count)
            .unwrap_or(self.agents.len());
        self.agents.insert(index, handle);
        debug_assert!(self.is_sorted(), "pool out of order: {:?}", self.distribution());
    }
}
