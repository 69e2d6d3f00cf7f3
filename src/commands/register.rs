//! Register IPC commands: access gate, reconciliation, cash closing.
//!
//! The access check runs the system-lock gate strictly before the session
//! check, so an engaged lock blocks even a valid session. The close command
//! recomputes the reconciliation server-side from the submitted count sheet;
//! the frontend's difference is advisory, the backend's gates.

use chrono::Local;
use serde_json::Value;
use tauri::{Emitter, Manager};

use crate::closing::{self, CloseRequest, ClosingState, LOGOUT_DELAY_SECS};
use crate::counting::{self, to_cents, CountSheet};
use crate::lockgate::{self, KeyringLockStore, LockStatus};
use crate::reconciliation::{self, ReconciliationState};
use crate::{auth, db, storage, value_f64};

/// Parse a `{ bills: { "100": 2 }, transfers: { "BAC": "25.50" } }` payload
/// into a count sheet. Unknown denominations and banks are dropped by the
/// counting rules.
fn parse_count_sheet(payload: &Value) -> CountSheet {
    let mut sheet = CountSheet::default();

    if let Some(bills) = payload.get("bills").and_then(|v| v.as_object()) {
        for (denomination, qty) in bills {
            if let (Ok(denomination), Some(qty)) = (denomination.parse::<i64>(), qty.as_u64()) {
                counting::set_quantity(&mut sheet.bills, denomination, qty.min(u32::MAX as u64) as u32);
            }
        }
    }

    if let Some(transfers) = payload.get("transfers").and_then(|v| v.as_object()) {
        for (bank, amount) in transfers {
            let raw = match amount {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            counting::set_transfer(&mut sheet.transfers, bank, &raw);
        }
    }

    sheet
}

#[tauri::command]
pub async fn register_access_check(
    auth_state: tauri::State<'_, auth::AuthState>,
) -> Result<Value, String> {
    // Lock gate first: an engaged lock overrides a valid session.
    let status = lockgate::check(&KeyringLockStore, Local::now());
    if let LockStatus::Locked { .. } = status {
        let mut json = status.to_json();
        json["allowed"] = Value::from(false);
        json["authenticated"] = Value::from(false);
        return Ok(json);
    }

    let authenticated = auth::current_session(&auth_state).is_some();
    Ok(serde_json::json!({
        "locked": false,
        "allowed": authenticated,
        "authenticated": authenticated,
    }))
}

#[tauri::command]
pub async fn register_get_system_total(
    db: tauri::State<'_, db::DbState>,
    recon_state: tauri::State<'_, ReconciliationState>,
) -> Result<Value, String> {
    let cents = reconciliation::load_system_total(
        &db,
        &recon_state,
        &storage::org_id(),
        &storage::branch_id(),
    );
    Ok(serde_json::json!({ "systemTotal": counting::from_cents(cents) }))
}

#[tauri::command]
pub async fn register_reconcile(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    recon_state: tauri::State<'_, ReconciliationState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let sheet = parse_count_sheet(&payload);

    let system_total_cents = reconciliation::load_system_total(
        &db,
        &recon_state,
        &storage::org_id(),
        &storage::branch_id(),
    );
    let result = reconciliation::compute(&sheet.bills, &sheet.transfers, system_total_cents);
    Ok(result.to_json())
}

#[tauri::command]
pub async fn register_closing_preview(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    recon_state: tauri::State<'_, ReconciliationState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let sheet = parse_count_sheet(&payload);

    let system_total_cents = reconciliation::load_system_total(
        &db,
        &recon_state,
        &storage::org_id(),
        &storage::branch_id(),
    );
    let result = reconciliation::compute(&sheet.bills, &sheet.transfers, system_total_cents);
    Ok(reconciliation::closing_handoff(&sheet, &result))
}

#[tauri::command]
pub async fn register_close_cash(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    auth_state: tauri::State<'_, auth::AuthState>,
    closing_state: tauri::State<'_, ClosingState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    // Holds the in-flight flag until this attempt finishes, success or not.
    let _guard = closing_state.try_begin()?;

    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let sheet = parse_count_sheet(&payload);

    // The submitted system total is the one the operator reviewed; fall back
    // to a fresh ledger read when the frontend omits it.
    let system_total_cents = match value_f64(&payload, &["systemTotal"]) {
        Some(total) => to_cents(total),
        None => {
            let recon_state = app.state::<ReconciliationState>();
            reconciliation::load_system_total(
                &db,
                &recon_state,
                &storage::org_id(),
                &storage::branch_id(),
            )
        }
    };

    let result = reconciliation::compute(&sheet.bills, &sheet.transfers, system_total_cents);
    let handoff = reconciliation::closing_handoff(&sheet, &result);
    let request = CloseRequest {
        system_total_cents: result.system_total_cents,
        counted_total_cents: result.counted_total_cents,
        difference_cents: result.difference_cents,
        movements: handoff["movements"].clone(),
    };

    let response = closing::perform_close(
        &db,
        &auth_state,
        &KeyringLockStore,
        &storage::org_id(),
        &storage::branch_id(),
        &request,
    )?;

    // Forced sign-out after the success screen has been visible.
    let app_for_logout = app.clone();
    tauri::async_runtime::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(LOGOUT_DELAY_SECS)).await;
        let auth_state = app_for_logout.state::<auth::AuthState>();
        auth::sign_out(&auth_state);
        let _ = app_for_logout.emit(
            "auth_state_change",
            serde_json::json!({
                "event": auth::AuthEvent::SignedOut.as_str(),
                "reason": "cash_closure",
            }),
        );
    });

    let _ = app.emit("cash_register_closed", response.clone());
    Ok(response)
}

#[tauri::command]
pub async fn register_factory_reset(
    auth_state: tauri::State<'_, auth::AuthState>,
) -> Result<Value, String> {
    auth::sign_out(&auth_state);
    storage::factory_reset()?;
    Ok(serde_json::json!({ "success": true }))
}
