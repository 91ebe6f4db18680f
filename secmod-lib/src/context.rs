//! Process-wide library lifecycle.
//!
//! The library must be initialised once (`init`, `init_read_write` or
//! `init_nodb`) before database-backed operations. Initialisation opens the
//! default certificate database; `shutdown` fires the registered shutdown
//! callback exactly once, drops the default database and clears the TLS
//! session and OCSP response caches. Shutdown callbacks do not survive a
//! shutdown, so a fresh initialisation starts with none registered. The password callback is
//! process-wide and persists across re-initialisation.

use crate::certdb::{CertDb, KeySlot, OpenMode};
use crate::errcode::SEC_ERROR_NOT_INITIALIZED;
use crate::SecmodError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opaque caller data handed back to password callbacks.
pub type PinArg = Arc<dyn Any + Send + Sync>;

/// Asked for the password of `slot`; `retry` is set after a failed attempt.
/// Returning `None` cancels the login.
pub type PasswordCallback =
    Arc<dyn Fn(&KeySlot, bool, Option<&PinArg>) -> Option<String> + Send + Sync>;

/// Invoked once when the library shuts down.
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// Library initialisation parameters.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Database directory; `None` opens an in-memory database.
    pub db_dir: Option<PathBuf>,
    pub mode: OpenMode,
}

impl Default for InitOptions {
    fn default() -> Self {
        InitOptions {
            db_dir: None,
            mode: OpenMode::NoDb,
        }
    }
}

#[derive(Default)]
struct GlobalState {
    db: Option<CertDb>,
    shutdown_callback: Option<ShutdownCallback>,
    password_callback: Option<PasswordCallback>,
}

static STATE: Lazy<Mutex<GlobalState>> = Lazy::new(|| Mutex::new(GlobalState::default()));

/// Initialise with a read-only database in `db_dir`.
pub fn init(db_dir: impl AsRef<Path>) -> Result<CertDb, SecmodError> {
    initialize(&InitOptions {
        db_dir: Some(db_dir.as_ref().to_path_buf()),
        mode: OpenMode::ReadOnly,
    })
}

/// Initialise with a writable database in `db_dir`, creating it if needed.
pub fn init_read_write(db_dir: impl AsRef<Path>) -> Result<CertDb, SecmodError> {
    initialize(&InitOptions {
        db_dir: Some(db_dir.as_ref().to_path_buf()),
        mode: OpenMode::ReadWrite,
    })
}

/// Initialise without a database (empty, in-memory).
pub fn init_nodb() -> Result<CertDb, SecmodError> {
    initialize(&InitOptions::default())
}

pub fn initialize(options: &InitOptions) -> Result<CertDb, SecmodError> {
    let db = match (&options.db_dir, options.mode) {
        (Some(dir), mode) if mode != OpenMode::NoDb => CertDb::open(dir, mode)?,
        _ => CertDb::in_memory()?,
    };
    let mut state = STATE.lock();
    if state.db.is_some() {
        tracing::debug!("re-initialising; replacing default certificate database");
    }
    state.db = Some(db.clone());
    tracing::debug!(dir = ?options.db_dir, mode = ?options.mode, "library initialised");
    Ok(db)
}

pub fn is_initialized() -> bool {
    STATE.lock().db.is_some()
}

/// Shut the library down. Fails with `SEC_ERROR_NOT_INITIALIZED` when not
/// initialised.
pub fn shutdown() -> Result<(), SecmodError> {
    let callback = {
        let mut state = STATE.lock();
        if state.db.take().is_none() {
            return Err(SecmodError::native(SEC_ERROR_NOT_INITIALIZED));
        }
        state.shutdown_callback.take()
    };
    crate::tls::clear_session_cache();
    crate::revocation::clear_ocsp_cache();
    if let Some(callback) = callback {
        tracing::debug!("invoking shutdown callback");
        callback();
    }
    tracing::debug!("library shut down");
    Ok(())
}

/// Register (or clear with `None`) the shutdown callback.
pub fn set_shutdown_callback(callback: Option<ShutdownCallback>) {
    STATE.lock().shutdown_callback = callback;
}

/// Register (or clear with `None`) the process-wide password callback.
pub fn set_password_callback(callback: Option<PasswordCallback>) {
    STATE.lock().password_callback = callback;
}

pub(crate) fn password_callback() -> Option<PasswordCallback> {
    STATE.lock().password_callback.clone()
}

/// The database opened by the last initialisation.
pub fn default_certdb() -> Result<CertDb, SecmodError> {
    STATE
        .lock()
        .db
        .clone()
        .ok_or_else(|| SecmodError::native(SEC_ERROR_NOT_INITIALIZED))
}

/// Library version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Whether this library is at least version `required` (dotted numbers).
pub fn version_check(required: &str) -> bool {
    fn parts(v: &str) -> Option<Vec<u64>> {
        v.trim().split('.').map(|p| p.parse::<u64>().ok()).collect()
    }
    match (parts(version()), parts(required)) {
        (Some(have), Some(mut want)) => {
            want.resize(have.len().max(want.len()), 0);
            let mut have = have;
            have.resize(want.len(), 0);
            have >= want
        }
        _ => false,
    }
}

/// Borrow a `&str` out of a pin argument holding a `String` or `&'static str`.
pub fn pin_arg_str(arg: &PinArg) -> Option<&str> {
    arg.downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| arg.downcast_ref::<&'static str>().copied())
}
