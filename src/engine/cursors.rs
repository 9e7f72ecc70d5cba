//! Device cursor tracking
//!
//! Per-device "last seen" server version. Purely additive bookkeeping used
//! by `pull` to short-circuit redundant work on reconnect and by the
//! garbage collector to bound retention (see `gc`).

use crate::types::{DeviceCursor, DeviceId};

use super::store::WorkspaceState;

/// Upsert a device's cursor. Callers are expected not to regress
/// `last_seen_version`; this function does not enforce it — forward-only
/// movement is a client-side convention, not something the server rejects on.
pub fn update_cursor(
    state: &mut WorkspaceState,
    device_id: DeviceId,
    last_seen_version: u64,
    now: u64,
) {
    state.cursors.insert(
        device_id.clone(),
        DeviceCursor {
            device_id,
            last_seen_version,
            updated_at: now,
        },
    );
}
