//! Hybrid Logical Clock and Op-ID generation
//!
//! Produces monotonic, device-qualified stamps so concurrent edits across
//! devices admit a deterministic total order, and every push operation can
//! be identified for idempotent retry.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Logical counter wraps at this bound within a single millisecond.
const MAX_LOGICAL: u32 = 1 << 20;

/// A hybrid logical clock stamp: wall-clock milliseconds, a logical counter
/// that breaks ties within the same millisecond, and the device that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HlcStamp {
    pub wall_ms: u64,
    pub logical: u32,
    pub device_id: String,
}

impl HlcStamp {
    /// `wall_ms * 2^20 + logical`, used as the per-row LWW comparator.
    pub fn clock(&self) -> u64 {
        (self.wall_ms << 20) | self.logical as u64
    }

    /// Zero-padded lexicographic string form: `"<wall_ms:013>.<logical:06>.<device_id>"`.
    pub fn to_hlc_string(&self) -> String {
        format!("{:013}.{:06}.{}", self.wall_ms, self.logical, self.device_id)
    }
}

/// Per-device hybrid logical clock. Not `Clone`: each device process should
/// own exactly one.
pub struct HybridClock {
    device_id: String,
    state: Mutex<(u64, u32)>,
}

impl HybridClock {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: Mutex::new((0, 0)),
        }
    }

    /// Produce the next stamp, given the current physical wall-clock time.
    pub fn now(&self) -> Result<HlcStamp> {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.tick(wall)
    }

    /// Core HLC advance, parameterized on physical time for testability.
    fn tick(&self, wall: u64) -> Result<HlcStamp> {
        let mut state = self.state.lock().unwrap();
        let (last_wall, last_logical) = *state;

        let w = wall.max(last_wall);
        let l = if w == last_wall { last_logical + 1 } else { 0 };

        if l >= MAX_LOGICAL {
            return Err(SyncError::ClockDrift(format!(
                "logical counter exceeded {} within one millisecond on device '{}'",
                MAX_LOGICAL, self.device_id
            )));
        }

        *state = (w, l);
        Ok(HlcStamp {
            wall_ms: w,
            logical: l,
            device_id: self.device_id.clone(),
        })
    }
}

/// Generate a 128-bit random op-id, hex-encoded.
pub fn new_op_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic_under_tight_loop() {
        let clock = HybridClock::new("device-a");
        let mut prev = clock.now().unwrap().clock();
        for _ in 0..1000 {
            let next = clock.now().unwrap().clock();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn tick_bumps_logical_when_wall_does_not_advance() {
        let clock = HybridClock::new("device-a");
        let a = clock.tick(1_000).unwrap();
        let b = clock.tick(1_000).unwrap();
        assert_eq!(a.wall_ms, b.wall_ms);
        assert_eq!(b.logical, a.logical + 1);
        assert!(b.clock() > a.clock());
    }

    #[test]
    fn tick_resets_logical_when_wall_advances() {
        let clock = HybridClock::new("device-a");
        clock.tick(1_000).unwrap();
        let b = clock.tick(2_000).unwrap();
        assert_eq!(b.wall_ms, 2_000);
        assert_eq!(b.logical, 0);
    }

    #[test]
    fn tick_never_regresses_behind_a_faster_peer() {
        let clock = HybridClock::new("device-a");
        clock.tick(5_000).unwrap();
        // physical clock appears to go backwards; HLC must not regress
        let b = clock.tick(1_000).unwrap();
        assert_eq!(b.wall_ms, 5_000);
        assert_eq!(b.logical, 1);
    }

    #[test]
    fn hlc_string_sorts_lexicographically_with_clock_order() {
        let clock = HybridClock::new("device-a");
        let a = clock.now().unwrap();
        let b = clock.now().unwrap();
        assert!(a.clock() < b.clock());
        assert!(a.to_hlc_string() < b.to_hlc_string());
    }

    #[test]
    fn clock_drift_is_reported_past_the_logical_bound() {
        let clock = HybridClock::new("device-a");
        *clock.state.lock().unwrap() = (1_000, MAX_LOGICAL - 1);
        let err = clock.tick(1_000).unwrap_err();
        assert!(matches!(err, SyncError::ClockDrift(_)));
    }

    #[test]
    fn op_ids_are_32_hex_chars_and_unique() {
        let a = new_op_id();
        let b = new_op_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
