//! Garbage collection of change-log rows and tombstones
//!
//! Bounded-batch, resumable passes over one workspace's history, driven by
//! a self-continuing scheduler: a batch that reports `has_more` reschedules
//! itself after `GC_CONTINUATION_DELAY_MS` rather than looping in place,
//! so a single slow workspace cannot starve the others sharing the runtime.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::time::sleep;

use crate::types::TableName;

use super::store::{SyncStore, WorkspaceState};

pub const DEFAULT_GC_BATCH_SIZE: usize = 100;
pub const GC_CONTINUATION_DELAY_MS: u64 = 60_000;
pub const DEFAULT_RETENTION_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Copy, Default)]
pub struct GcBatchReport {
    pub purged: usize,
    pub has_more: bool,
    pub next_cursor: u64,
}

/// Delete change-log rows with `server_version < min_cursor` and
/// `created_at < cutoff`, scanning forward from `cursor`.
pub fn gc_change_log(
    state: &mut WorkspaceState,
    cursor: u64,
    batch_size: usize,
    cutoff: u64,
) -> GcBatchReport {
    let min_cursor = state.min_cursor();
    let start = state
        .change_log
        .partition_point(|e| e.server_version <= cursor);

    let mut purged = 0;
    let mut next_cursor = cursor;
    let mut scanned = 0;
    let mut to_remove = Vec::new();

    for entry in &state.change_log[start..] {
        if scanned >= batch_size + 1 {
            break;
        }
        scanned += 1;
        next_cursor = entry.server_version;

        if entry.server_version < min_cursor && entry.created_at < cutoff {
            to_remove.push(entry.server_version);
            purged += 1;
        }
    }

    let has_more = scanned > batch_size;

    if !to_remove.is_empty() {
        let removed: std::collections::HashSet<u64> = to_remove.into_iter().collect();
        state.change_log.retain(|e| !removed.contains(&e.server_version));
    }

    GcBatchReport {
        purged,
        has_more,
        next_cursor,
    }
}

/// Delete tombstones with `server_version < min_cursor` and
/// `deleted_at < cutoff`. Tombstones have no natural ordering key for
/// cursoring like the change log does, so this walks the full set each
/// call — acceptable since tombstone counts are bounded by live+deleted
/// keys, not by history depth.
pub fn gc_tombstones(state: &mut WorkspaceState, batch_size: usize, cutoff: u64) -> GcBatchReport {
    let min_cursor = state.min_cursor();

    let mut eligible: Vec<(TableName, String)> = Vec::new();
    for (table, table_tombstones) in state.tombstones.iter() {
        for (pk, t) in table_tombstones.iter() {
            if t.server_version < min_cursor && t.deleted_at < cutoff {
                eligible.push((*table, pk.clone()));
            }
        }
    }

    let has_more = eligible.len() > batch_size;
    let to_purge = &eligible[..eligible.len().min(batch_size)];

    for (table, pk) in to_purge {
        if let Some(table_tombstones) = state.tombstones.get_mut(table) {
            table_tombstones.remove(pk);
        }
    }

    GcBatchReport {
        purged: to_purge.len(),
        has_more,
        next_cursor: 0,
    }
}

/// Run one GC pass (change log + tombstones) for a workspace, and if either
/// reports `has_more`, reschedule itself after `GC_CONTINUATION_DELAY_MS`.
pub async fn run_workspace_gc(
    store: Arc<SyncStore>,
    workspace_id: String,
    changelog_cursor: u64,
    retention_secs: u64,
    now_fn: impl Fn() -> u64 + Send + Sync + Copy + 'static,
) {
    let slot = store.slot(&workspace_id);
    let cutoff = now_fn().saturating_sub(retention_secs);

    let (changelog_report, tombstone_report) = {
        let mut state = slot.state.write().unwrap();
        let cl = gc_change_log(&mut state, changelog_cursor, DEFAULT_GC_BATCH_SIZE, cutoff);
        let ts = gc_tombstones(&mut state, DEFAULT_GC_BATCH_SIZE, cutoff);
        (cl, ts)
    };

    debug!(
        "gc workspace={} purged_changelog={} purged_tombstones={}",
        workspace_id, changelog_report.purged, tombstone_report.purged
    );

    if changelog_report.has_more || tombstone_report.has_more {
        tokio::spawn(async move {
            sleep(Duration::from_millis(GC_CONTINUATION_DELAY_MS)).await;
            Box::pin(run_workspace_gc(
                store,
                workspace_id,
                changelog_report.next_cursor,
                retention_secs,
                now_fn,
            ))
            .await;
        });
    }
}

/// Workspace-discovery cron: enqueue a GC run for each known workspace,
/// staggering starts by one second to smooth load.
pub async fn discover_and_schedule(
    store: Arc<SyncStore>,
    retention_secs: u64,
    now_fn: impl Fn() -> u64 + Send + Sync + Copy + 'static,
) {
    let workspaces = store.known_workspaces();
    info!("gc discovery found {} workspace(s)", workspaces.len());
    for workspace_id in workspaces {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            run_workspace_gc(store, workspace_id, 0, retention_secs, now_fn).await;
        });
        sleep(Duration::from_secs(1)).await;
    }
}
