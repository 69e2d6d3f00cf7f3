//! Cash-register closing: the irreversible end-of-day transition.
//!
//! The flow is a small state machine: `Reviewing → Saving → Closed`, or back
//! to `Reviewing` with an error the operator can retry. The transition into
//! `Saving` is permitted only when the reconciliation difference is exactly
//! zero (in centavos): no closing may ever be recorded while counted cash
//! disagrees with recorded sales.
//!
//! Saving runs strictly in order: resolve the operator identity, resolve the
//! branch's opening time, count today's sales, insert the immutable closing
//! record, engage the system lock. The insert is the sole durable success
//! criterion; a later lock-write failure is logged and reported but the
//! closing stands (accepted inconsistency window, no compensation).

use chrono::{Local, TimeZone, Utc};
use rusqlite::params;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::auth::{self, AuthState};
use crate::counting::from_cents;
use crate::db::{self, DbState};
use crate::lockgate::{self, LockStore};
use crate::reconciliation;
use uuid::Uuid;

/// Hour of day (local) assumed as the register opening when the branch has
/// no sales yet today.
pub const DEFAULT_OPENING_HOUR: u32 = 7;

/// Delay before the post-close forced sign-out, so the operator sees the
/// success screen first.
pub const LOGOUT_DELAY_SECS: u64 = 2;

/// Reconciliation snapshot reviewed by the operator, as handed off by
/// [`crate::reconciliation::closing_handoff`]. All amounts in centavos.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub system_total_cents: i64,
    pub counted_total_cents: i64,
    pub difference_cents: i64,
    /// Bill/transfer snapshot persisted verbatim on the closing record.
    pub movements: Value,
}

/// Non-reentrancy guard for the close action. The in-flight flag is the
/// sole concurrency control: while a close is saving, further submissions
/// are rejected instead of queued.
#[derive(Debug, Default)]
pub struct ClosingState {
    in_flight: AtomicBool,
}

impl ClosingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `Saving`. Fails when another close is already in flight.
    pub fn try_begin(&self) -> Result<SavingGuard<'_>, String> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err("Ya hay un cierre de caja en curso".into());
        }
        Ok(SavingGuard { state: self })
    }
}

/// Releases the in-flight flag on drop, whatever exit path the close takes.
#[derive(Debug)]
pub struct SavingGuard<'a> {
    state: &'a ClosingState,
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.state.in_flight.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// The close transition
// ---------------------------------------------------------------------------

/// Attempt the `Reviewing → Saving → Closed` transition.
///
/// On any error the machine is back in `Reviewing`: nothing was persisted
/// (the closing insert is transactional) and the operator may fix the count
/// and retry. On success exactly one closing record exists, the system lock
/// is engaged, and the caller schedules the delayed sign-out.
pub fn perform_close(
    db: &DbState,
    auth_state: &AuthState,
    lock_store: &dyn LockStore,
    org_id: &str,
    branch_id: &str,
    request: &CloseRequest,
) -> Result<Value, String> {
    // Gate: rejected client-side before any ledger write.
    if request.difference_cents != 0 {
        return Err(
            "No puedes cerrar caja con diferencia. Verifica el conteo de efectivo".into(),
        );
    }

    // Step 1: an unauthenticated closing must never be persisted.
    let session = auth::current_session(auth_state)
        .ok_or("Debes iniciar sesión para cerrar caja")?;

    let today = reconciliation::today();
    let now = Utc::now();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    // Step 2: opening time = earliest sale today, else the default hour.
    let opening_time = earliest_sale_timestamp(&conn, org_id, branch_id, &today)
        .unwrap_or_else(|| default_opening_time(&today));

    // Step 3: audit metadata.
    let sales_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sales WHERE org_id = ?1 AND branch_id = ?2 AND fecha = ?3",
            params![org_id, branch_id, today],
            |row| row.get(0),
        )
        .map_err(|e| format!("count today's sales: {e}"))?;

    // Step 4: the one durable write that defines success.
    let closing_id = Uuid::new_v4().to_string();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "INSERT INTO cash_register_closings (
                id, org_id, branch_id, user_id, user_name,
                opening_time, closing_time, opening_amount,
                total_entries, total_exits, expected_total,
                counted_amount, difference, sales_count,
                movements_count, movements, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 0, ?8, ?9, ?10, ?11, 0, ?12, ?7)",
            params![
                closing_id,
                org_id,
                branch_id,
                session.user_id,
                session.email,
                opening_time,
                now.to_rfc3339(),
                from_cents(request.system_total_cents),
                from_cents(request.counted_total_cents),
                from_cents(request.difference_cents),
                sales_count,
                request.movements.to_string(),
            ],
        )
        .map_err(|e| format!("insert closing record: {e}"))?;

        db::enqueue_sync(
            &conn,
            "cash_register_closing",
            &closing_id,
            "insert",
            &serde_json::json!({
                "closingId": closing_id,
                "orgId": org_id,
                "branchId": branch_id,
                "countedAmount": from_cents(request.counted_total_cents),
                "expectedTotal": from_cents(request.system_total_cents),
                "salesCount": sales_count,
            }),
        )?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }
    drop(conn);

    // Step 5: engage the lock. Best effort after the insert; the closing
    // record already stands.
    let lock_engaged = match lockgate::engage(lock_store, Local::now()) {
        Ok(state) => Some(state.next_open_time.to_rfc3339()),
        Err(e) => {
            warn!(closing_id = %closing_id, "Closing saved but lock engage failed: {e}");
            None
        }
    };

    info!(
        closing_id = %closing_id,
        sales_count,
        counted = from_cents(request.counted_total_cents),
        "Cash register closed"
    );

    Ok(serde_json::json!({
        "success": true,
        "closingId": closing_id,
        "closingTime": now.to_rfc3339(),
        "openingTime": opening_time,
        "salesCount": sales_count,
        "lockEngaged": lock_engaged.is_some(),
        "nextOpenTime": lock_engaged,
    }))
}

/// Earliest sale timestamp for the branch today, if any.
fn earliest_sale_timestamp(
    conn: &rusqlite::Connection,
    org_id: &str,
    branch_id: &str,
    today: &str,
) -> Option<String> {
    conn.query_row(
        "SELECT MIN(created_at) FROM sales
         WHERE org_id = ?1 AND branch_id = ?2 AND fecha = ?3",
        params![org_id, branch_id, today],
        |row| row.get::<_, Option<String>>(0),
    )
    .ok()
    .flatten()
}

/// Synthesized opening timestamp: today at [`DEFAULT_OPENING_HOUR`] local.
fn default_opening_time(today: &str) -> String {
    let naive = format!("{today}T{DEFAULT_OPENING_HOUR:02}:00:00");
    chrono::NaiveDateTime::parse_from_str(&naive, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .and_then(|n| Local.from_local_datetime(&n).earliest())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or(naive)
}

// ===========================================================================
// Tests
// ===========================================================================
