//! Local operator authentication with bcrypt.
//!
//! Provides email/password sign-in for the register operator, lockout
//! tracking persisted in `local_settings` (so restarts don't reset it),
//! password-recovery tokens with expiry, and an auth event stream
//! (`SIGNED_IN`, `SIGNED_OUT`, `PASSWORD_RECOVERY`). Subscriptions are
//! scoped: dropping the [`AuthSubscription`] guard unsubscribes, so a torn
//! down view can never leak its listener.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_MAX_DURATION_HOURS: i64 = 12;
const RECOVERY_TOKEN_MINUTES: i64 = 30;

const SETTINGS_CATEGORY: &str = "auth";
const KEY_PASSWORD_HASH: &str = "password_hash";
const KEY_OPERATOR_EMAIL: &str = "operator_email";
const KEY_OPERATOR_NAME: &str = "operator_name";
const KEY_LOCKOUT_ATTEMPTS: &str = "lockout_attempts";
const KEY_LOCKOUT_LAST_ATTEMPT: &str = "lockout_last_attempt";
const KEY_RECOVERY_TOKEN: &str = "recovery_token";
const KEY_RECOVERY_EXPIRES: &str = "recovery_expires";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Auth state transition, mirrored to every live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    PasswordRecovery,
}

impl AuthEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEvent::SignedIn => "SIGNED_IN",
            AuthEvent::SignedOut => "SIGNED_OUT",
            AuthEvent::PasswordRecovery => "PASSWORD_RECOVERY",
        }
    }
}

/// The signed-in operator's session.
#[derive(Clone)]
pub struct OperatorSession {
    pub session_id: String,
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub login_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OperatorSession {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// JSON shape the frontend expects for the current identity.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "sessionId": self.session_id,
            "userId": self.user_id,
            "email": self.email,
            "name": self.name,
            "loginTime": self.login_time.to_rfc3339(),
            "expiresAt": self.expires_at.to_rfc3339(),
        })
    }
}

type Subscribers = Arc<Mutex<HashMap<u64, mpsc::Sender<AuthEvent>>>>;

/// Tauri managed state for authentication.
pub struct AuthState {
    current: Mutex<Option<OperatorSession>>,
    subscribers: Subscribers,
    next_subscriber_id: AtomicU64,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to auth events. The returned guard unsubscribes on drop,
    /// whatever exit path the owning view takes.
    pub fn subscribe(&self) -> AuthSubscription {
        let (tx, rx) = mpsc::channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        AuthSubscription {
            id,
            registry: Arc::clone(&self.subscribers),
            events: rx,
        }
    }

    fn emit(&self, event: AuthEvent) {
        let mut registry = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        // Drop subscribers whose receiving side is gone
        registry.retain(|_, tx| tx.send(event).is_ok());
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Live auth event subscription. Dropping it removes the listener.
pub struct AuthSubscription {
    id: u64,
    registry: Subscribers,
    pub events: mpsc::Receiver<AuthEvent>,
}

impl Drop for AuthSubscription {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Lockout (persisted across restarts)
// ---------------------------------------------------------------------------

fn lockout_state(conn: &rusqlite::Connection) -> (u32, Option<DateTime<Utc>>) {
    let attempts = db::get_setting(conn, SETTINGS_CATEGORY, KEY_LOCKOUT_ATTEMPTS)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let last = db::get_setting(conn, SETTINGS_CATEGORY, KEY_LOCKOUT_LAST_ATTEMPT)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|d| d.with_timezone(&Utc));
    (attempts, last)
}

fn check_lockout(conn: &rusqlite::Connection) -> Result<(), String> {
    let (attempts, last) = lockout_state(conn);
    if attempts >= MAX_FAILED_ATTEMPTS {
        if let Some(last) = last {
            let elapsed = Utc::now() - last;
            if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
                let remaining = LOCKOUT_MINUTES - elapsed.num_minutes();
                return Err(format!(
                    "Demasiados intentos fallidos. Intenta de nuevo en {remaining} minutos"
                ));
            }
        }
        // Window elapsed, reset the counter
        let _ = db::set_setting(conn, SETTINGS_CATEGORY, KEY_LOCKOUT_ATTEMPTS, "0");
    }
    Ok(())
}

fn record_failed_attempt(conn: &rusqlite::Connection) {
    let (attempts, _) = lockout_state(conn);
    let _ = db::set_setting(
        conn,
        SETTINGS_CATEGORY,
        KEY_LOCKOUT_ATTEMPTS,
        &(attempts + 1).to_string(),
    );
    let _ = db::set_setting(
        conn,
        SETTINGS_CATEGORY,
        KEY_LOCKOUT_LAST_ATTEMPT,
        &Utc::now().to_rfc3339(),
    );
}

fn reset_lockout(conn: &rusqlite::Connection) {
    let _ = db::set_setting(conn, SETTINGS_CATEGORY, KEY_LOCKOUT_ATTEMPTS, "0");
}

// ---------------------------------------------------------------------------
// Operator setup
// ---------------------------------------------------------------------------

/// Store the operator's credentials (first-run setup or admin change).
pub fn setup_operator(
    db: &DbState,
    email: &str,
    name: &str,
    password: &str,
) -> Result<Value, String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err("Correo inválido".into());
    }
    if password.len() < 6 {
        return Err("La contraseña debe tener al menos 6 caracteres".into());
    }

    let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| e.to_string())?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, SETTINGS_CATEGORY, KEY_PASSWORD_HASH, &hash)?;
    db::set_setting(&conn, SETTINGS_CATEGORY, KEY_OPERATOR_EMAIL, &email)?;
    db::set_setting(&conn, SETTINGS_CATEGORY, KEY_OPERATOR_NAME, name.trim())?;

    info!(email = %email, "Operator credentials configured");
    Ok(serde_json::json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// Sign in / sign out
// ---------------------------------------------------------------------------

/// Authenticate the operator and open a session.
pub fn sign_in(
    db: &DbState,
    state: &AuthState,
    email: &str,
    password: &str,
) -> Result<Value, String> {
    let email = email.trim().to_lowercase();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    check_lockout(&conn)?;

    let stored_email = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_OPERATOR_EMAIL)
        .ok_or("No hay un operador configurado en este equipo")?;
    let stored_hash = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_PASSWORD_HASH)
        .ok_or("No hay un operador configurado en este equipo")?;

    let matches = email == stored_email
        && bcrypt::verify(password, &stored_hash).unwrap_or(false);

    if !matches {
        record_failed_attempt(&conn);
        warn!(email = %email, "Failed sign-in attempt");
        return Err("Correo o contraseña incorrectos".into());
    }

    reset_lockout(&conn);
    let name = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_OPERATOR_NAME)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| stored_email.clone());
    drop(conn);

    let now = Utc::now();
    let session = OperatorSession {
        session_id: Uuid::new_v4().to_string(),
        user_id: Uuid::new_v4().to_string(),
        email: stored_email,
        name,
        login_time: now,
        expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
    };
    let json = session.to_json();

    *state.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
    state.emit(AuthEvent::SignedIn);

    info!("Operator signed in");
    Ok(json)
}

/// Close the current session (no-op when nobody is signed in).
pub fn sign_out(state: &AuthState) {
    let had_session = state
        .current
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .is_some();
    if had_session {
        state.emit(AuthEvent::SignedOut);
        info!("Operator signed out");
    }
}

/// The current authenticated session, if any. Expired sessions are cleared
/// lazily and read as absent.
pub fn current_session(state: &AuthState) -> Option<OperatorSession> {
    let mut guard = state.current.lock().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(s) if !s.is_expired() => Some(s.clone()),
        Some(_) => {
            *guard = None;
            None
        }
        None => None,
    }
}

// ---------------------------------------------------------------------------
// Password recovery
// ---------------------------------------------------------------------------

/// Issue a recovery token for the configured operator.
///
/// The token is returned to the shell for delivery; it expires after
/// [`RECOVERY_TOKEN_MINUTES`].
pub fn request_password_recovery(
    db: &DbState,
    state: &AuthState,
    email: &str,
) -> Result<Value, String> {
    let email = email.trim().to_lowercase();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let stored_email = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_OPERATOR_EMAIL)
        .ok_or("No hay un operador configurado en este equipo")?;
    if email != stored_email {
        // Do not reveal whether the address is known
        info!("Recovery requested for unknown address");
        return Ok(serde_json::json!({ "success": true }));
    }

    let token = Uuid::new_v4().to_string();
    let expires = Utc::now() + Duration::minutes(RECOVERY_TOKEN_MINUTES);
    db::set_setting(&conn, SETTINGS_CATEGORY, KEY_RECOVERY_TOKEN, &token)?;
    db::set_setting(
        &conn,
        SETTINGS_CATEGORY,
        KEY_RECOVERY_EXPIRES,
        &expires.to_rfc3339(),
    )?;
    drop(conn);

    state.emit(AuthEvent::PasswordRecovery);
    info!("Password recovery token issued");
    Ok(serde_json::json!({ "success": true, "token": token }))
}

/// Reset the password using a recovery token.
///
/// An absent, mismatched, or expired token reads as an invalid link; the
/// caller shows the dedicated "enlace inválido" screen with a path to
/// request a new one.
pub fn reset_password(
    db: &DbState,
    token: &str,
    new_password: &str,
    confirm_password: &str,
) -> Result<Value, String> {
    if new_password != confirm_password {
        return Err("Las contraseñas no coinciden".into());
    }
    if new_password.len() < 6 {
        return Err("La contraseña debe tener al menos 6 caracteres".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let stored_token = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_RECOVERY_TOKEN);
    let expires = db::get_setting(&conn, SETTINGS_CATEGORY, KEY_RECOVERY_EXPIRES)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|d| d.with_timezone(&Utc));

    let valid = matches!((stored_token.as_deref(), expires), (Some(t), Some(exp))
        if t == token && Utc::now() < exp);
    if !valid {
        return Err("Enlace de recuperación inválido o expirado".into());
    }

    let hash = bcrypt::hash(new_password, bcrypt::DEFAULT_COST).map_err(|e| e.to_string())?;
    db::set_setting(&conn, SETTINGS_CATEGORY, KEY_PASSWORD_HASH, &hash)?;
    db::delete_setting(&conn, SETTINGS_CATEGORY, KEY_RECOVERY_TOKEN)?;
    db::delete_setting(&conn, SETTINGS_CATEGORY, KEY_RECOVERY_EXPIRES)?;
    reset_lockout(&conn);

    info!("Password reset via recovery token");
    Ok(serde_json::json!({ "success": true }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::path::PathBuf;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::run_migrations_for_test(&conn);
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    fn configured_db() -> DbState {
        let db = test_db();
        // Cost 4 keeps the test fast
        let hash = bcrypt::hash("secreto1", 4).expect("hash");
        {
            let conn = db.conn.lock().expect("db lock");
            db::set_setting(&conn, SETTINGS_CATEGORY, KEY_PASSWORD_HASH, &hash).expect("set");
            db::set_setting(&conn, SETTINGS_CATEGORY, KEY_OPERATOR_EMAIL, "caja@tienda.ni")
                .expect("set");
            db::set_setting(&conn, SETTINGS_CATEGORY, KEY_OPERATOR_NAME, "Cajera").expect("set");
        }
        db
    }

    #[test]
    fn sign_in_opens_session_and_emits_event() {
        let db = configured_db();
        let state = AuthState::new();
        let sub = state.subscribe();

        let json = sign_in(&db, &state, "caja@tienda.ni", "secreto1").expect("sign in");
        assert_eq!(json["email"], "caja@tienda.ni");
        assert!(current_session(&state).is_some());
        assert_eq!(sub.events.try_recv(), Ok(AuthEvent::SignedIn));
    }

    #[test]
    fn wrong_password_fails_and_counts_toward_lockout() {
        let db = configured_db();
        let state = AuthState::new();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let err = sign_in(&db, &state, "caja@tienda.ni", "mala").expect_err("must fail");
            assert_eq!(err, "Correo o contraseña incorrectos");
        }

        let err = sign_in(&db, &state, "caja@tienda.ni", "secreto1")
            .expect_err("lockout blocks even the right password");
        assert!(err.contains("Demasiados intentos"), "got: {err}");
    }

    #[test]
    fn lockout_survives_auth_state_restart() {
        let db = configured_db();
        let before = AuthState::new();
        for _ in 0..MAX_FAILED_ATTEMPTS {
            let _ = sign_in(&db, &before, "caja@tienda.ni", "mala");
        }

        let after_restart = AuthState::new();
        let err = sign_in(&db, &after_restart, "caja@tienda.ni", "secreto1")
            .expect_err("lockout persists in local_settings");
        assert!(err.contains("Demasiados intentos"), "got: {err}");
    }

    #[test]
    fn sign_out_clears_session_and_emits_event() {
        let db = configured_db();
        let state = AuthState::new();
        sign_in(&db, &state, "caja@tienda.ni", "secreto1").expect("sign in");

        let sub = state.subscribe();
        sign_out(&state);
        assert!(current_session(&state).is_none());
        assert_eq!(sub.events.try_recv(), Ok(AuthEvent::SignedOut));

        // Idempotent: a second sign-out emits nothing
        sign_out(&state);
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn dropped_subscription_is_unsubscribed() {
        let state = AuthState::new();
        {
            let _sub = state.subscribe();
            assert_eq!(state.subscribers.lock().expect("registry").len(), 1);
        }
        assert_eq!(state.subscribers.lock().expect("registry").len(), 0);
    }

    #[test]
    fn recovery_flow_resets_password_once() {
        let db = configured_db();
        let state = AuthState::new();
        let sub = state.subscribe();

        let resp =
            request_password_recovery(&db, &state, "caja@tienda.ni").expect("request recovery");
        let token = resp["token"].as_str().expect("token issued").to_string();
        assert_eq!(sub.events.try_recv(), Ok(AuthEvent::PasswordRecovery));

        // Mismatched confirmation is a validation error, token stays valid
        let err = reset_password(&db, &token, "nueva123", "otra123").expect_err("mismatch");
        assert_eq!(err, "Las contraseñas no coinciden");

        reset_password(&db, &token, "nueva123", "nueva123").expect("reset");
        sign_in(&db, &state, "caja@tienda.ni", "nueva123").expect("new password works");

        // Token is single-use
        let err = reset_password(&db, &token, "otra456", "otra456").expect_err("spent token");
        assert_eq!(err, "Enlace de recuperación inválido o expirado");
    }

    #[test]
    fn unknown_or_garbage_token_reads_as_invalid_link() {
        let db = configured_db();
        let err =
            reset_password(&db, "token-falso", "nueva123", "nueva123").expect_err("invalid link");
        assert_eq!(err, "Enlace de recuperación inválido o expirado");
    }

    #[test]
    fn recovery_for_unknown_address_does_not_leak_existence() {
        let db = configured_db();
        let state = AuthState::new();
        let resp =
            request_password_recovery(&db, &state, "nadie@otro.ni").expect("silent success");
        assert_eq!(resp["success"], true);
        assert!(resp.get("token").is_none());
    }
}
