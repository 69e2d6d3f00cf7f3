//! Caja POS - Tauri v2 Backend
//!
//! This module registers the IPC command handlers the mobile-first frontend
//! calls via `@tauri-apps/api/core::invoke()`. Command names group by
//! subsystem: `auth_*` for the operator session, `register_*` for
//! reconciliation and cash closing, `sale_*` for the sales flow.

use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod closing;
mod commands;
mod counting;
mod db;
mod lockgate;
mod reconciliation;
mod sales;
mod storage;

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

fn log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.cajapos.app").join("logs")
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() {
    // Initialize structured logging (console + rolling file)
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,caja_pos_lib=debug"));

    let log_dir = log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "caja");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the app — dropping it flushes logs.
    // We leak it intentionally since the app runs until process exit.
    std::mem::forget(_guard);

    info!(
        "Starting Caja POS v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    tauri::Builder::default()
        .setup(|app| {
            use tauri::Manager;

            let app_data_dir = app
                .path()
                .app_data_dir()
                .expect("Failed to get app data dir");

            // Main DB connection for Tauri commands
            let db_state = db::init(&app_data_dir).expect("Failed to initialize database");
            app.manage(db_state);

            if !storage::is_configured() {
                info!("Register identity not configured, using default org/branch");
            }

            app.manage(auth::AuthState::new());
            app.manage(reconciliation::ReconciliationState::new());
            app.manage(closing::ClosingState::new());

            info!("Database, auth, reconciliation, and closing state registered");
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // Auth
            commands::auth::auth_setup_operator,
            commands::auth::auth_sign_in,
            commands::auth::auth_sign_out,
            commands::auth::auth_get_current_session,
            commands::auth::auth_request_password_recovery,
            commands::auth::auth_reset_password,
            // Register
            commands::register::register_access_check,
            commands::register::register_get_system_total,
            commands::register::register_reconcile,
            commands::register::register_closing_preview,
            commands::register::register_close_cash,
            commands::register::register_factory_reset,
            // Sales
            commands::sales::sale_create,
        ])
        .run(tauri::generate_context!())
        .expect("error while running Caja POS");
}
