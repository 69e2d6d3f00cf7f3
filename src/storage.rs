//! Device-scoped durable storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Holds the register's org/branch
//! identity and the system-lock timestamps; everything here survives app
//! restarts and belongs to this device only.

use keyring::Entry;
use tracing::warn;

const SERVICE_NAME: &str = "caja-pos";

// Credential keys
pub const KEY_ORG_ID: &str = "organization_id";
pub const KEY_BRANCH_ID: &str = "branch_id";
pub const KEY_CASH_CLOSURE_TIME: &str = "cash_closure_time";
pub const KEY_NEXT_OPEN_TIME: &str = "next_open_time";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[
    KEY_ORG_ID,
    KEY_BRANCH_ID,
    KEY_CASH_CLOSURE_TIME,
    KEY_NEXT_OPEN_TIME,
];

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// The register is configured once its org and branch identity are stored.
pub fn is_configured() -> bool {
    get_credential(KEY_ORG_ID).is_some() && get_credential(KEY_BRANCH_ID).is_some()
}

/// Organization this register belongs to.
pub fn org_id() -> String {
    get_credential(KEY_ORG_ID).unwrap_or_else(|| "default-org".into())
}

/// Branch this register belongs to.
pub fn branch_id() -> String {
    get_credential(KEY_BRANCH_ID).unwrap_or_else(|| "default-branch".into())
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<(), String> {
    warn!("performing factory reset – deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
