use serde_json::Value;
use tauri::Emitter;

use crate::{auth, db, value_str};

#[tauri::command]
pub async fn auth_setup_operator(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let email = value_str(&payload, &["email"]).ok_or("Missing email")?;
    let name = value_str(&payload, &["name"]).unwrap_or_default();
    let password = value_str(&payload, &["password"]).ok_or("Missing password")?;
    auth::setup_operator(&db, &email, &name, &password)
}

#[tauri::command]
pub async fn auth_sign_in(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    auth_state: tauri::State<'_, auth::AuthState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let email = value_str(&payload, &["email"]).ok_or("Missing email")?;
    let password = value_str(&payload, &["password"]).ok_or("Missing password")?;

    let session = auth::sign_in(&db, &auth_state, &email, &password)?;
    let _ = app.emit(
        "auth_state_change",
        serde_json::json!({ "event": auth::AuthEvent::SignedIn.as_str(), "session": session }),
    );
    Ok(session)
}

#[tauri::command]
pub async fn auth_sign_out(
    auth_state: tauri::State<'_, auth::AuthState>,
    app: tauri::AppHandle,
) -> Result<(), String> {
    auth::sign_out(&auth_state);
    let _ = app.emit(
        "auth_state_change",
        serde_json::json!({ "event": auth::AuthEvent::SignedOut.as_str(), "session": Value::Null }),
    );
    Ok(())
}

#[tauri::command]
pub async fn auth_get_current_session(
    auth_state: tauri::State<'_, auth::AuthState>,
) -> Result<Value, String> {
    Ok(auth::current_session(&auth_state)
        .map(|s| s.to_json())
        .unwrap_or(Value::Null))
}

#[tauri::command]
pub async fn auth_request_password_recovery(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    auth_state: tauri::State<'_, auth::AuthState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let email = value_str(&payload, &["email"]).ok_or("Missing email")?;

    let resp = auth::request_password_recovery(&db, &auth_state, &email)?;
    let _ = app.emit(
        "auth_state_change",
        serde_json::json!({ "event": auth::AuthEvent::PasswordRecovery.as_str() }),
    );
    Ok(resp)
}

#[tauri::command]
pub async fn auth_reset_password(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let token = value_str(&payload, &["token"]).ok_or("Enlace de recuperación inválido o expirado")?;
    let new_password = value_str(&payload, &["password", "newPassword"])
        .ok_or("La contraseña debe tener al menos 6 caracteres")?;
    let confirm = value_str(&payload, &["confirmPassword", "confirm"]).unwrap_or_default();
    auth::reset_password(&db, &token, &new_password, &confirm)
}
