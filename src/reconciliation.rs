//! Register reconciliation: system total vs physical count.
//!
//! Compares the ledger's recorded sales total for today against the
//! operator's bill/transfer count and produces the signed difference that
//! gates the closing flow. Loading the system total is best effort: a query
//! failure is logged and the last successfully loaded value stays visible,
//! so the count screen keeps working while the ledger is unhappy.

use chrono::Local;
use rusqlite::params;
use serde_json::Value;
use std::sync::Mutex;
use tracing::warn;

use crate::counting::{
    self, from_cents, to_cents, BillCount, CountSheet, TransferCount,
};
use crate::db::DbState;

/// Managed state carrying the last successfully loaded system total.
#[derive(Default)]
pub struct ReconciliationState {
    last_system_total_cents: Mutex<i64>,
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last system total that loaded successfully, in centavos.
    pub fn last_system_total_cents(&self) -> i64 {
        *self
            .last_system_total_cents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self, cents: i64) {
        *self
            .last_system_total_cents
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = cents;
    }
}

/// Everything the closing screen needs, recomputed fresh on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub system_total_cents: i64,
    pub cash_total_cents: i64,
    pub transfers_total_cents: i64,
    pub counted_total_cents: i64,
    pub difference_cents: i64,
}

impl ReconciliationResult {
    /// The close gate: counted cash agrees exactly with recorded sales.
    pub fn is_balanced(&self) -> bool {
        self.difference_cents == 0
    }

    /// JSON shape the register screens render.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "systemTotal": from_cents(self.system_total_cents),
            "cashTotal": from_cents(self.cash_total_cents),
            "transfersTotal": from_cents(self.transfers_total_cents),
            "countedTotal": from_cents(self.counted_total_cents),
            "difference": from_cents(self.difference_cents),
            "balanced": self.is_balanced(),
        })
    }
}

/// Today's date in the ledger's `fecha` format (local calendar day).
pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

// ---------------------------------------------------------------------------
// System total
// ---------------------------------------------------------------------------

/// Sum of `total` over today's sales for the org/branch, in centavos.
///
/// On query failure the error is logged and the last successful total is
/// returned instead; reconciliation stays usable when the refresh fails.
pub fn load_system_total(
    db: &DbState,
    state: &ReconciliationState,
    org_id: &str,
    branch_id: &str,
) -> i64 {
    let loaded: Result<f64, String> = (|| {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT COALESCE(SUM(total), 0) FROM sales
             WHERE org_id = ?1 AND branch_id = ?2 AND fecha >= ?3",
            params![org_id, branch_id, today()],
            |row| row.get(0),
        )
        .map_err(|e| format!("sum today's sales: {e}"))
    })();

    match loaded {
        Ok(total) => {
            let cents = to_cents(total);
            state.store(cents);
            cents
        }
        Err(e) => {
            warn!(branch_id, "System total refresh failed, keeping last value: {e}");
            state.last_system_total_cents()
        }
    }
}

// ---------------------------------------------------------------------------
// Pure computation
// ---------------------------------------------------------------------------

/// Compute the reconciliation result from counts and a system total.
///
/// Deterministic: the four derived totals come only from the arguments.
pub fn compute(
    bills: &BillCount,
    transfers: &TransferCount,
    system_total_cents: i64,
) -> ReconciliationResult {
    let cash_total_cents = counting::cash_total_cents(bills);
    let transfers_total_cents = counting::transfers_total_cents(transfers);
    let counted_total_cents = cash_total_cents + transfers_total_cents;

    ReconciliationResult {
        system_total_cents,
        cash_total_cents,
        transfers_total_cents,
        counted_total_cents,
        difference_cents: counted_total_cents - system_total_cents,
    }
}

// ---------------------------------------------------------------------------
// Handoff to the closing flow
// ---------------------------------------------------------------------------

/// Package the current counts and totals for the closing screen.
///
/// This is a state handoff, not a ledger write: the closing flow receives
/// the exact snapshot the operator reviewed.
pub fn closing_handoff(sheet: &CountSheet, result: &ReconciliationResult) -> Value {
    serde_json::json!({
        "systemTotal": from_cents(result.system_total_cents),
        "countedTotal": from_cents(result.counted_total_cents),
        "difference": from_cents(result.difference_cents),
        "movements": {
            "bills": sheet.bills,
            "transfers": sheet.transfers.iter()
                .map(|(bank, cents)| (bank.clone(), Value::from(from_cents(*cents))))
                .collect::<serde_json::Map<String, Value>>(),
            "totals": {
                "cash": from_cents(result.cash_total_cents),
                "transfers": from_cents(result.transfers_total_cents),
                "total": from_cents(result.counted_total_cents),
            },
        },
    })
}

// ===========================================================================
// Tests
// ===========================================================================
