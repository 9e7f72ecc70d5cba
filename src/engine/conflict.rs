//! Last-writer-wins conflict resolution
//!
//! Applies one sanitized client op to a workspace's in-memory rows and
//! tombstones. Equal clocks resolve in favor of whichever op is applied
//! last (the caller's arrival order), matching the server's idempotent
//! retry semantics: a client re-submitting its own earlier op has the same
//! clock and is simply a no-op against itself.

use serde_json::Map;

use crate::error::Result;
use crate::types::{sanitize_payload, ClientOp, OpKind, ReplicatedRow, TableName, Tombstone};

use super::store::WorkspaceState;

/// Apply one validated op's table-level mutation. Returns the payload that
/// should be recorded in the change log (after sanitization), or `None` if
/// the op lost to a newer value already on file (a no-op).
pub fn apply_op(
    state: &mut WorkspaceState,
    table: TableName,
    op: &ClientOp,
    now: u64,
) -> Result<Option<Map<String, serde_json::Value>>> {
    match op.operation {
        OpKind::Put => apply_put(state, table, op, now),
        OpKind::Delete => apply_delete(state, table, op, now),
    }
}

fn apply_put(
    state: &mut WorkspaceState,
    table: TableName,
    op: &ClientOp,
    now: u64,
) -> Result<Option<Map<String, serde_json::Value>>> {
    let payload = sanitize_payload(op.payload.clone().unwrap_or_default())?;

    let existing_tombstone_clock = state
        .tombstones
        .get(&table)
        .and_then(|t| t.get(&op.pk))
        .map(|t| t.clock);

    let rows = state.rows.entry(table).or_default();

    match rows.get(&op.pk) {
        None => {
            let created_at = json_u64(&payload, "created_at").unwrap_or(now);
            let updated_at = json_u64(&payload, "updated_at").unwrap_or(created_at);
            // A put that arrives after a delete but before that tombstone's
            // clock still loses to the tombstone: the row stays absent.
            if let Some(tomb_clock) = existing_tombstone_clock {
                if op.clock < tomb_clock {
                    return Ok(None);
                }
            }
            rows.insert(
                op.pk.clone(),
                ReplicatedRow {
                    pk: op.pk.clone(),
                    payload: payload.clone(),
                    deleted: false,
                    deleted_at: None,
                    created_at,
                    updated_at,
                    clock: op.clock,
                },
            );
            Ok(Some(payload))
        }
        Some(existing) => {
            if op.clock < existing.clock {
                return Ok(None);
            }
            let row = rows.get_mut(&op.pk).unwrap();
            row.payload = payload.clone();
            row.deleted = false;
            row.deleted_at = None;
            row.updated_at = now;
            row.clock = op.clock;
            Ok(Some(payload))
        }
    }
}

fn apply_delete(
    state: &mut WorkspaceState,
    table: TableName,
    op: &ClientOp,
    now: u64,
) -> Result<Option<Map<String, serde_json::Value>>> {
    let rows = state.rows.entry(table).or_default();
    let mut applied = false;

    if let Some(row) = rows.get_mut(&op.pk) {
        if op.clock >= row.clock && !row.deleted {
            row.deleted = true;
            row.deleted_at = Some(now);
            row.updated_at = now;
            row.clock = op.clock;
            applied = true;
        }
    } else {
        // Deleting a key with no known row is still recorded: it upserts a
        // tombstone so a stale put arriving later cannot resurrect it.
        applied = true;
    }

    let tombstones = state.tombstones.entry(table).or_default();
    let upsert_tombstone = tombstones
        .get(&op.pk)
        .map(|t| op.clock >= t.clock)
        .unwrap_or(true);

    if upsert_tombstone {
        tombstones.insert(
            op.pk.clone(),
            Tombstone {
                table,
                pk: op.pk.clone(),
                deleted_at: now,
                clock: op.clock,
                server_version: 0, // filled in by the caller once allocated
            },
        );
    }

    if applied {
        Ok(Some(Map::new()))
    } else {
        Ok(None)
    }
}

fn json_u64(payload: &Map<String, serde_json::Value>, field: &str) -> Option<u64> {
    payload.get(field).and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpKind;
    use serde_json::json;

    fn op(pk: &str, clock: u64, operation: OpKind, payload: Option<serde_json::Value>) -> ClientOp {
        ClientOp {
            op_id: format!("op-{}-{}", pk, clock),
            table_name: "threads".to_string(),
            operation,
            pk: pk.to_string(),
            payload: payload.map(|p| p.as_object().unwrap().clone()),
            clock,
            hlc: format!("{:013}.000000.dev", clock),
            device_id: "dev".to_string(),
        }
    }

    #[test]
    fn newer_clock_wins_over_older_put() {
        let mut state = WorkspaceState::default();
        apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 100, OpKind::Put, Some(json!({"title": "foo"}))),
            1,
        )
        .unwrap();
        apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 101, OpKind::Put, Some(json!({"title": "bar"}))),
            2,
        )
        .unwrap();

        let row = state.rows[&TableName::Threads].get("t1").unwrap();
        assert_eq!(row.payload.get("title").unwrap(), "bar");
        assert_eq!(row.clock, 101);
    }

    #[test]
    fn older_clock_put_is_a_no_op() {
        let mut state = WorkspaceState::default();
        apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 200, OpKind::Put, Some(json!({"title": "new"}))),
            1,
        )
        .unwrap();
        let result = apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 150, OpKind::Put, Some(json!({"title": "late"}))),
            2,
        )
        .unwrap();

        assert!(result.is_none());
        let row = state.rows[&TableName::Threads].get("t1").unwrap();
        assert_eq!(row.payload.get("title").unwrap(), "new");
    }

    #[test]
    fn delete_then_stale_put_is_ignored_then_fresh_put_restores() {
        let mut state = WorkspaceState::default();
        apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 100, OpKind::Put, Some(json!({"title": "v1"}))),
            1,
        )
        .unwrap();
        apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 200, OpKind::Delete, None),
            2,
        )
        .unwrap();
        assert!(state.rows[&TableName::Threads]["t1"].deleted);

        apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 150, OpKind::Put, Some(json!({"title": "late"}))),
            3,
        )
        .unwrap();
        assert!(state.rows[&TableName::Threads]["t1"].deleted);

        apply_op(
            &mut state,
            TableName::Threads,
            &op("t1", 250, OpKind::Put, Some(json!({"title": "new"}))),
            4,
        )
        .unwrap();
        let row = &state.rows[&TableName::Threads]["t1"];
        assert!(!row.deleted);
        assert_eq!(row.payload.get("title").unwrap(), "new");
        assert_eq!(row.clock, 250);
    }

    #[test]
    fn sanitize_strips_workspace_id_before_storage() {
        let mut state = WorkspaceState::default();
        apply_op(
            &mut state,
            TableName::Threads,
            &op(
                "t1",
                10,
                OpKind::Put,
                Some(json!({"workspace_id": "ws1", "title": "x"})),
            ),
            1,
        )
        .unwrap();
        let row = &state.rows[&TableName::Threads]["t1"];
        assert!(!row.payload.contains_key("workspace_id"));
    }
}
