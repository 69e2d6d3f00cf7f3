use serde_json::Value;
use tauri::Emitter;

use crate::{auth, db, sales, storage};

#[tauri::command]
pub async fn sale_create(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    auth_state: tauri::State<'_, auth::AuthState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let response = sales::create_sale(
        &db,
        &auth_state,
        &storage::org_id(),
        &storage::branch_id(),
        &payload,
    )?;
    let _ = app.emit("sale_created", response.clone());
    Ok(response)
}
