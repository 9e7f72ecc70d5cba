//! Change log and server version counter
//!
//! The append-only history backing `pull`/`watch`, and the single
//! serialization point per workspace: version allocation.

use crate::types::{ChangeLogEntry, TableName};

use super::store::WorkspaceState;

/// Allocate `n` contiguous versions, returning the first. `n = 0` returns
/// the current counter value without advancing it.
pub fn allocate_versions(state: &mut WorkspaceState, n: u64) -> u64 {
    if n == 0 {
        return state.server_version;
    }
    let first = state.server_version + 1;
    state.server_version += n;
    first
}

pub fn append(state: &mut WorkspaceState, entry: ChangeLogEntry) {
    state.op_index.insert(entry.op_id.clone(), entry.server_version);
    state.change_log.push(entry);
}

/// Scan with the `limit+1` hasMore trick. `tables`, if present, filters the
/// returned window but never changes which row `next_cursor` points to —
/// cursor advancement must stay independent of any table filter so a
/// filtered consumer can't loop over rows it has already seen.
pub fn scan(
    state: &WorkspaceState,
    cursor: u64,
    limit: usize,
    tables: Option<&[TableName]>,
) -> (Vec<ChangeLogEntry>, u64, bool) {
    // change_log is sorted by server_version by construction (append-only).
    let start = state
        .change_log
        .partition_point(|e| e.server_version <= cursor);

    let scanned: Vec<&ChangeLogEntry> = state.change_log[start..]
        .iter()
        .take(limit + 1)
        .collect();

    let has_more = scanned.len() > limit;
    let window = &scanned[..scanned.len().min(limit)];

    let next_cursor = window.last().map(|e| e.server_version).unwrap_or(cursor);

    let changes = window
        .iter()
        .filter(|e| tables.map(|ts| ts.contains(&e.table_name)).unwrap_or(true))
        .map(|e| (*e).clone())
        .collect();

    (changes, next_cursor, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpKind;

    fn entry(v: u64, table: TableName) -> ChangeLogEntry {
        ChangeLogEntry {
            server_version: v,
            table_name: table,
            pk: format!("pk{}", v),
            op: OpKind::Put,
            payload: None,
            clock: v,
            hlc: format!("{:013}.000000.dev", v),
            device_id: "dev".to_string(),
            op_id: format!("op{}", v),
            created_at: v,
        }
    }

    #[test]
    fn allocate_versions_is_contiguous_and_monotonic() {
        let mut state = WorkspaceState::default();
        let first = allocate_versions(&mut state, 3);
        assert_eq!(first, 1);
        assert_eq!(state.server_version, 3);

        let second = allocate_versions(&mut state, 2);
        assert_eq!(second, 4);
        assert_eq!(state.server_version, 5);
    }

    #[test]
    fn allocate_zero_does_not_advance_counter() {
        let mut state = WorkspaceState::default();
        allocate_versions(&mut state, 5);
        let v = allocate_versions(&mut state, 0);
        assert_eq!(v, 5);
        assert_eq!(state.server_version, 5);
    }

    #[test]
    fn scan_respects_cursor_limit_and_has_more() {
        let mut state = WorkspaceState::default();
        for v in 1..=10 {
            append(&mut state, entry(v, TableName::Threads));
        }

        let (changes, next_cursor, has_more) = scan(&state, 0, 3, None);
        assert_eq!(changes.len(), 3);
        assert_eq!(next_cursor, 3);
        assert!(has_more);

        let (changes, next_cursor, has_more) = scan(&state, 8, 3, None);
        assert_eq!(changes.len(), 2);
        assert_eq!(next_cursor, 10);
        assert!(!has_more);
    }

    #[test]
    fn table_filter_advances_cursor_past_filtered_rows() {
        let mut state = WorkspaceState::default();
        let tables = [
            TableName::Threads,
            TableName::Messages,
            TableName::Threads,
            TableName::Messages,
            TableName::Threads,
        ];
        for (i, t) in tables.iter().enumerate() {
            append(&mut state, entry(i as u64 + 1, *t));
        }

        let (changes, next_cursor, has_more) =
            scan(&state, 0, 3, Some(&[TableName::Threads]));
        // window is versions 1..=3 (pre-filter); only 1 and 3 are threads
        assert_eq!(changes.len(), 2);
        assert_eq!(next_cursor, 3);
        assert!(has_more);
    }

    #[test]
    fn scan_with_limit_zero_returns_empty_and_input_cursor_when_no_rows_seen() {
        let state = WorkspaceState::default();
        let (changes, next_cursor, has_more) = scan(&state, 7, 0, None);
        assert!(changes.is_empty());
        assert_eq!(next_cursor, 7);
        assert!(!has_more);
    }
}
