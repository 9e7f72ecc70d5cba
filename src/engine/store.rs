//! In-memory workspace state
//!
//! One `WorkspaceState` per workspace, sharded in a top-level map and
//! guarded by a single `RwLock` per workspace — reads (pull/getServerVersion)
//! take a read lock, writes (push/GC/cursor updates) take a write lock
//! scoped to the smallest critical section that touches the counter, rows,
//! and log together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

use crate::types::{
    ChangeLogEntry, DeviceCursor, DeviceId, ReplicatedRow, TableName, Tombstone, WorkspaceId,
};

/// All mutable state for a single workspace.
#[derive(Default, Clone)]
pub struct WorkspaceState {
    /// Last allocated server_version for this workspace.
    pub server_version: u64,
    /// Replicated rows, keyed by table then primary key.
    pub rows: HashMap<TableName, HashMap<String, ReplicatedRow>>,
    /// Tombstones, keyed by table then primary key.
    pub tombstones: HashMap<TableName, HashMap<String, Tombstone>>,
    /// Append-only change log, ordered by `server_version`.
    pub change_log: Vec<ChangeLogEntry>,
    /// `op_id -> server_version` for idempotent push.
    pub op_index: HashMap<String, u64>,
    /// Per-device replication cursors.
    pub cursors: HashMap<DeviceId, DeviceCursor>,
}

impl WorkspaceState {
    pub fn min_cursor(&self) -> u64 {
        self.cursors
            .values()
            .map(|c| c.last_seen_version)
            .min()
            .unwrap_or(0)
    }
}

/// One workspace's state plus a notifier that `watch` subscribers wait on;
/// signalled on every successful `push` append.
pub struct WorkspaceSlot {
    pub state: RwLock<WorkspaceState>,
    pub notify: Notify,
}

impl Default for WorkspaceSlot {
    fn default() -> Self {
        Self {
            state: RwLock::new(WorkspaceState::default()),
            notify: Notify::new(),
        }
    }
}

/// Top-level, process-wide store: one slot per workspace, created lazily.
#[derive(Default)]
pub struct SyncStore {
    workspaces: RwLock<HashMap<WorkspaceId, Arc<WorkspaceSlot>>>,
}

impl SyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for a workspace.
    pub fn slot(&self, workspace_id: &str) -> Arc<WorkspaceSlot> {
        if let Some(slot) = self.workspaces.read().unwrap().get(workspace_id) {
            return Arc::clone(slot);
        }
        let mut workspaces = self.workspaces.write().unwrap();
        Arc::clone(
            workspaces
                .entry(workspace_id.to_string())
                .or_insert_with(|| Arc::new(WorkspaceSlot::default())),
        )
    }

    /// Workspace ids with any change-log activity, most useful for the GC
    /// discovery cron which only wants to consider active workspaces.
    pub fn known_workspaces(&self) -> Vec<WorkspaceId> {
        self.workspaces.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_created_lazily_and_reused() {
        let store = SyncStore::new();
        let a = store.slot("ws1");
        let b = store.slot("ws1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.known_workspaces(), vec!["ws1".to_string()]);
    }

    #[test]
    fn min_cursor_is_zero_with_no_devices() {
        let state = WorkspaceState::default();
        assert_eq!(state.min_cursor(), 0);
    }
}
