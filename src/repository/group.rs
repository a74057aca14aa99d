use indexmap::IndexMap;
use tracing::trace;

use crate::SerializedFlowExecutionSnapshot;

/// Snapshots of one conversation, oldest first.
#[derive(Debug)]
pub struct SnapshotGroup {
    snapshots: IndexMap<u64, SerializedFlowExecutionSnapshot>,
    next_id: u64,
    /// 0 means unbounded.
    max_snapshots: usize,
}

impl SnapshotGroup {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: IndexMap::new(),
            next_id: 1,
            max_snapshots,
        }
    }

    /// Reserves the next snapshot id; ids are never reused.
    pub fn next_snapshot_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn get(
        &self,
        snapshot_id: u64,
    ) -> Option<&SerializedFlowExecutionSnapshot> {
        self.snapshots.get(&snapshot_id)
    }

    /// Stores `snapshot`, evicting the oldest snapshots beyond the bound.
    pub fn add(
        &mut self,
        snapshot_id: u64,
        snapshot: SerializedFlowExecutionSnapshot,
    ) {
        self.snapshots.insert(snapshot_id, snapshot);
        while self.max_snapshots > 0 && self.snapshots.len() > self.max_snapshots {
            if let Some((evicted, _)) = self.snapshots.shift_remove_index(0) {
                trace!("evicted snapshot {} from group", evicted);
            }
        }
    }

    pub fn remove(
        &mut self,
        snapshot_id: u64,
    ) -> Option<SerializedFlowExecutionSnapshot> {
        self.snapshots.shift_remove(&snapshot_id)
    }

    pub fn remove_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn snapshot_ids(&self) -> Vec<u64> {
        self.snapshots.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
