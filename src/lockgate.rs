//! Time-boxed system lock engaged after a register close.
//!
//! Once the register closes, the whole app is blocked until the fixed
//! reopening hour the next day. The lock lives in durable device storage
//! behind the narrow [`LockStore`] interface so the gate can be exercised
//! against an in-memory store. The check is lazy and self-healing: an
//! expired lock is erased the first time anything looks at it, no timer
//! involved. The gate runs before any session check; a valid session does
//! not bypass an active lock.

use chrono::{DateTime, Duration, Local, TimeZone};
use serde_json::Value;
use tracing::{info, warn};

use crate::storage;

/// Hour of day (local) at which a closed register may reopen.
pub const REOPEN_HOUR: u32 = 7;

/// Persisted lock state: when the register closed and when it may reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub closure_time: DateTime<Local>,
    pub next_open_time: DateTime<Local>,
}

/// Durable key/value store holding the lock state.
pub trait LockStore: Send + Sync {
    fn get(&self) -> Option<LockState>;
    fn set(&self, state: &LockState) -> Result<(), String>;
    fn clear(&self) -> Result<(), String>;
}

/// Result of evaluating the gate at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Locked { next_open_time: DateTime<Local> },
}

impl LockStatus {
    /// JSON shape the navigation guard consumes.
    pub fn to_json(&self) -> Value {
        match self {
            LockStatus::Unlocked => serde_json::json!({ "locked": false }),
            LockStatus::Locked { next_open_time } => serde_json::json!({
                "locked": true,
                "nextOpenTime": next_open_time.to_rfc3339(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate logic
// ---------------------------------------------------------------------------

/// Reopening moment for a closure at `now`: next calendar day at
/// [`REOPEN_HOUR`] local time.
pub fn next_open_after(now: DateTime<Local>) -> DateTime<Local> {
    let next_day = (now + Duration::days(1)).date_naive();
    let naive = match next_day.and_hms_opt(REOPEN_HOUR, 0, 0) {
        Some(n) => n,
        None => return now + Duration::days(1),
    };
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt,
        // DST gap at the reopening hour; fall back to 24h after closure
        None => now + Duration::days(1),
    }
}

/// Engage the lock for a closure happening at `now`.
pub fn engage(store: &dyn LockStore, now: DateTime<Local>) -> Result<LockState, String> {
    let state = LockState {
        closure_time: now,
        next_open_time: next_open_after(now),
    };
    store.set(&state)?;
    info!(next_open = %state.next_open_time, "System lock engaged");
    Ok(state)
}

/// Evaluate the gate. Expired locks are erased on the spot.
///
/// Called on every protected-route entry, strictly before the session
/// check. Idempotent: repeated calls at the same instant agree.
pub fn check(store: &dyn LockStore, now: DateTime<Local>) -> LockStatus {
    let state = match store.get() {
        Some(s) => s,
        None => return LockStatus::Unlocked,
    };

    if now < state.next_open_time {
        LockStatus::Locked {
            next_open_time: state.next_open_time,
        }
    } else {
        if let Err(e) = store.clear() {
            warn!("Failed to clear expired system lock: {e}");
        }
        LockStatus::Unlocked
    }
}

// ---------------------------------------------------------------------------
// Keyring-backed store
// ---------------------------------------------------------------------------

/// Production store: lock timestamps in the OS credential store, so the
/// lock survives restarts and is shared by every window on this device
/// (last write wins).
pub struct KeyringLockStore;

impl LockStore for KeyringLockStore {
    fn get(&self) -> Option<LockState> {
        let closure = storage::get_credential(storage::KEY_CASH_CLOSURE_TIME)?;
        let next_open = storage::get_credential(storage::KEY_NEXT_OPEN_TIME)?;

        let closure_time = DateTime::parse_from_rfc3339(&closure)
            .ok()?
            .with_timezone(&Local);
        let next_open_time = DateTime::parse_from_rfc3339(&next_open)
            .ok()?
            .with_timezone(&Local);

        Some(LockState {
            closure_time,
            next_open_time,
        })
    }

    fn set(&self, state: &LockState) -> Result<(), String> {
        storage::set_credential(
            storage::KEY_CASH_CLOSURE_TIME,
            &state.closure_time.to_rfc3339(),
        )?;
        storage::set_credential(
            storage::KEY_NEXT_OPEN_TIME,
            &state.next_open_time.to_rfc3339(),
        )
    }

    fn clear(&self) -> Result<(), String> {
        storage::delete_credential(storage::KEY_CASH_CLOSURE_TIME)?;
        storage::delete_credential(storage::KEY_NEXT_OPEN_TIME)
    }
}

/// In-memory substitute for the keyring store (test helper).
#[cfg(test)]
pub struct MemoryLockStore(pub std::sync::Mutex<Option<LockState>>);

#[cfg(test)]
impl MemoryLockStore {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(None))
    }
}

#[cfg(test)]
impl LockStore for MemoryLockStore {
    fn get(&self) -> Option<LockState> {
        *self.0.lock().expect("lock store mutex")
    }
    fn set(&self, state: &LockState) -> Result<(), String> {
        *self.0.lock().expect("lock store mutex") = Some(*state);
        Ok(())
    }
    fn clear(&self) -> Result<(), String> {
        *self.0.lock().expect("lock store mutex") = None;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn absent_state_means_unlocked() {
        let store = MemoryLockStore::new();
        assert_eq!(check(&store, Local::now()), LockStatus::Unlocked);
    }

    #[test]
    fn engage_locks_until_seven_am_next_day() {
        let store = MemoryLockStore::new();
        let closed_at = local(2026, 3, 10, 20, 45);

        let state = engage(&store, closed_at).expect("engage");
        assert_eq!(state.next_open_time.hour(), REOPEN_HOUR);
        assert_eq!(
            state.next_open_time.date_naive(),
            closed_at.date_naive() + Duration::days(1)
        );

        let status = check(&store, local(2026, 3, 11, 6, 59));
        assert_eq!(
            status,
            LockStatus::Locked {
                next_open_time: state.next_open_time
            }
        );
    }

    #[test]
    fn expired_lock_self_heals_and_stays_unlocked() {
        let store = MemoryLockStore::new();
        engage(&store, local(2026, 3, 10, 20, 45)).expect("engage");

        let after_open = local(2026, 3, 11, 7, 0);
        assert_eq!(check(&store, after_open), LockStatus::Unlocked);
        // State erased by the first check
        assert!(store.get().is_none());
        // Idempotent across repeated checks
        assert_eq!(check(&store, after_open), LockStatus::Unlocked);
    }

    #[test]
    fn lock_status_json_exposes_reopening_time() {
        let store = MemoryLockStore::new();
        let state = engage(&store, local(2026, 3, 10, 23, 0)).expect("engage");

        let json = check(&store, local(2026, 3, 11, 3, 0)).to_json();
        assert_eq!(json["locked"], true);
        assert_eq!(json["nextOpenTime"], state.next_open_time.to_rfc3339());

        assert_eq!(
            check(&store, local(2026, 3, 12, 12, 0)).to_json()["locked"],
            false
        );
    }
}
