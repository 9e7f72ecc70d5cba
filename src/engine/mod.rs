//! Workspace synchronization engine
//!
//! `SyncEngine` is the facade the wire protocol (see `protocol::rpc`) talks
//! to: authorize, then dispatch into the change log / conflict resolver /
//! cursor store, all scoped to one workspace's `RwLock`-guarded state.

pub mod auth;
pub mod blob;
pub mod changelog;
pub mod conflict;
pub mod cursors;
pub mod gc;
pub mod ratelimit;
pub mod store;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::error::{Result, SyncError};
use crate::types::{
    ChangeLogEntry, ClientOp, DeviceId, FileKind, OpKind, OpResult, PullResult, TableName,
    WorkspaceId,
};

use auth::Authorizer;
use blob::BlobGateway;
use ratelimit::{CheckResult, RateLimiter, Stats};
use store::SyncStore;

pub const MAX_PUSH_OPS: usize = 100;
pub const MAX_PULL_LIMIT: usize = 500;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct SyncEngine {
    store: Arc<SyncStore>,
    authorizer: Arc<dyn Authorizer>,
    blob: Arc<BlobGateway>,
    rate_limiter: RateLimiter,
}

impl SyncEngine {
    pub fn new(store: Arc<SyncStore>, authorizer: Arc<dyn Authorizer>, blob: BlobGateway) -> Self {
        Self {
            store,
            authorizer,
            blob: Arc::new(blob),
            rate_limiter: RateLimiter::new(),
        }
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// A cloneable handle to the blob gateway, for callers (like the
    /// periodic snapshot flush) that need to hold it across a
    /// `spawn_blocking` boundary.
    pub fn blob(&self) -> Arc<BlobGateway> {
        Arc::clone(&self.blob)
    }

    pub fn push(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        ops: Vec<ClientOp>,
    ) -> Result<(Vec<OpResult>, u64)> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;

        if ops.len() > MAX_PUSH_OPS {
            return Err(SyncError::batch_too_large(ops.len(), MAX_PUSH_OPS));
        }

        let now = now_ms();
        let slot = self.store.slot(workspace_id);
        let mut state = slot.state.write().unwrap();

        let mut results = Vec::with_capacity(ops.len());
        let mut applicable: Vec<(usize, TableName)> = Vec::new();

        for (i, op) in ops.iter().enumerate() {
            if let Some(&existing_version) = state.op_index.get(&op.op_id) {
                results.push((i, OpResult::ok(op.op_id.clone(), existing_version)));
                continue;
            }
            match TableName::from_name(&op.table_name) {
                Some(table) => applicable.push((i, table)),
                None => {
                    results.push((
                        i,
                        OpResult::err(op.op_id.clone(), format!("unknown table '{}'", op.table_name)),
                    ));
                }
            }
        }

        let new_count = applicable.len() as u64;
        let first_version = changelog::allocate_versions(&mut state, new_count);
        let mut max_version = first_version.saturating_sub(1);

        for (offset, (i, table)) in applicable.into_iter().enumerate() {
            let op = &ops[i];
            let server_version = first_version + offset as u64;

            match conflict::apply_op(&mut state, table, op, now) {
                Ok(applied_payload) => {
                    if op.operation == OpKind::Delete {
                        if let Some(tomb) = state.tombstones.entry(table).or_default().get_mut(&op.pk) {
                            if tomb.clock == op.clock {
                                tomb.server_version = server_version;
                            }
                        }
                    }

                    changelog::append(
                        &mut state,
                        ChangeLogEntry {
                            server_version,
                            table_name: table,
                            pk: op.pk.clone(),
                            op: op.operation,
                            payload: applied_payload,
                            clock: op.clock,
                            hlc: op.hlc.clone(),
                            device_id: op.device_id.clone(),
                            op_id: op.op_id.clone(),
                            created_at: now,
                        },
                    );
                    max_version = max_version.max(server_version);
                    results.push((i, OpResult::ok(op.op_id.clone(), server_version)));
                }
                Err(e) => {
                    warn!("push op {} rejected: {}", op.op_id, e);
                    results.push((i, OpResult::err(op.op_id.clone(), e.to_string())));
                }
            }
        }

        drop(state);
        slot.notify.notify_waiters();

        results.sort_by_key(|(i, _)| *i);
        Ok((results.into_iter().map(|(_, r)| r).collect(), max_version))
    }

    pub fn pull(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        cursor: u64,
        limit: usize,
        tables: Option<&[TableName]>,
    ) -> Result<PullResult> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;
        let limit = limit.min(MAX_PULL_LIMIT);

        let slot = self.store.slot(workspace_id);
        let state = slot.state.read().unwrap();
        let (changes, next_cursor, has_more) = changelog::scan(&state, cursor, limit, tables);

        Ok(PullResult {
            changes,
            next_cursor,
            has_more,
        })
    }

    /// Re-run `pull` once the workspace is signalled, or after `idle_timeout`
    /// elapses with no signal — whichever comes first. Callers loop this to
    /// implement a reactive subscription.
    pub async fn watch_once(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        cursor: u64,
        limit: usize,
        idle_timeout: std::time::Duration,
    ) -> Result<PullResult> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;
        let slot = self.store.slot(workspace_id);

        let notified = slot.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(idle_timeout) => {}
        }

        self.pull(workspace_id, user_id, cursor, limit, None)
    }

    pub fn update_device_cursor(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        device_id: DeviceId,
        last_seen_version: u64,
    ) -> Result<()> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;
        let slot = self.store.slot(workspace_id);
        let mut state = slot.state.write().unwrap();
        cursors::update_cursor(&mut state, device_id, last_seen_version, now_ms());
        Ok(())
    }

    pub fn get_server_version(&self, workspace_id: &WorkspaceId, user_id: &str) -> Result<u64> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;
        let slot = self.store.slot(workspace_id);
        Ok(slot.state.read().unwrap().server_version)
    }

    pub fn generate_upload_url(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        hash: &str,
        mime_type: Option<&str>,
        size_bytes: Option<u64>,
    ) -> Result<String> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;
        self.blob
            .generate_upload_url(workspace_id, hash, mime_type, size_bytes, now_ms() / 1000)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn commit_upload(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        hash: String,
        storage_id: String,
        provider_id: String,
        mime_type: String,
        size_bytes: u64,
        name: String,
        kind: Option<FileKind>,
        width: Option<u32>,
        height: Option<u32>,
        page_count: Option<u32>,
    ) -> Result<()> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;
        self.blob.commit_upload(
            workspace_id,
            hash,
            storage_id,
            provider_id,
            mime_type,
            size_bytes,
            name,
            kind,
            width,
            height,
            page_count,
        )
    }

    pub fn get_file_url(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        hash: &str,
    ) -> Result<Option<String>> {
        auth::require_member(self.authorizer.as_ref(), workspace_id, user_id)?;
        self.blob.get_file_url(workspace_id, hash, now_ms() / 1000)
    }

    /// Administrative: delete soft-deleted, unreferenced `file_meta` rows
    /// past retention. Requires the owner role.
    pub fn gc_deleted_files(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &str,
        retention_secs: u64,
        limit: usize,
    ) -> Result<usize> {
        auth::require_owner(self.authorizer.as_ref(), workspace_id, user_id)?;
        self.blob
            .gc_deleted_files(workspace_id, retention_secs, now_ms() / 1000, limit)
    }

    pub fn check_rate_limit(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
    ) -> CheckResult {
        self.rate_limiter
            .check_and_record(key, window_ms, max_requests, now_ms())
    }

    pub fn rate_limit_stats(&self, key: &str, window_ms: u64, max_requests: u32) -> Stats {
        self.rate_limiter.get_stats(key, window_ms, max_requests, now_ms())
    }

    /// Daily housekeeping: purge rate-limit buckets whose window ended more
    /// than 48 hours ago, in batches of 500, capped at 5 passes so one tick
    /// can't run unbounded against a pathologically large bucket set.
    pub fn cleanup_stale_rate_limits(&self) -> usize {
        const STALE_AFTER_MS: u64 = 48 * 3600 * 1000;
        const BATCH_SIZE: usize = 500;
        const MAX_PASSES: usize = 5;

        let now = now_ms();
        let mut purged = 0;
        for _ in 0..MAX_PASSES {
            let n = self.rate_limiter.cleanup(now, STALE_AFTER_MS, BATCH_SIZE);
            purged += n;
            if n < BATCH_SIZE {
                break;
            }
        }
        purged
    }
}
