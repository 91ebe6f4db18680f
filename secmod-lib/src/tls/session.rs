//! Process-wide TLS session caches.
//!
//! Servers resume sessions from one shared server cache, which must be
//! configured before any server socket is set up. Clients share one client
//! cache that always exists.

use crate::SecmodError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustls::client::ClientSessionMemoryCache;
use rustls::server::ServerSessionMemoryCache;
use std::sync::Arc;

const CLIENT_CACHE_SIZE: usize = 256;

struct ServerCache {
    max_entries: usize,
    cache: Arc<ServerSessionMemoryCache>,
}

static SERVER_CACHE: Lazy<Mutex<Option<ServerCache>>> = Lazy::new(|| Mutex::new(None));
static CLIENT_CACHE: Lazy<Mutex<Arc<ClientSessionMemoryCache>>> =
    Lazy::new(|| Mutex::new(Arc::new(ClientSessionMemoryCache::new(CLIENT_CACHE_SIZE))));

/// Create (or resize) the server session cache.
pub fn config_server_session_id_cache(max_entries: usize) -> Result<(), SecmodError> {
    if max_entries == 0 {
        return Err(SecmodError::native_detail(
            crate::errcode::SEC_ERROR_INVALID_ARGS,
            "session cache needs at least one entry",
        ));
    }
    *SERVER_CACHE.lock() = Some(ServerCache {
        max_entries,
        cache: ServerSessionMemoryCache::new(max_entries),
    });
    tracing::debug!(max_entries, "server session cache configured");
    Ok(())
}

/// Tear the server session cache down. Fails with `InvalidState` when none
/// is configured.
pub fn shutdown_server_session_id_cache() -> Result<(), SecmodError> {
    match SERVER_CACHE.lock().take() {
        Some(_) => {
            tracing::debug!("server session cache shut down");
            Ok(())
        }
        None => Err(SecmodError::InvalidState(
            "server session cache is not configured".into(),
        )),
    }
}

/// Forget every cached session, client and server.
pub fn clear_session_cache() {
    *CLIENT_CACHE.lock() = Arc::new(ClientSessionMemoryCache::new(CLIENT_CACHE_SIZE));
    if let Some(server) = SERVER_CACHE.lock().as_mut() {
        server.cache = ServerSessionMemoryCache::new(server.max_entries);
    }
}

pub(crate) fn server_cache() -> Option<Arc<ServerSessionMemoryCache>> {
    SERVER_CACHE.lock().as_ref().map(|s| s.cache.clone())
}

pub(crate) fn client_cache() -> Arc<ClientSessionMemoryCache> {
    CLIENT_CACHE.lock().clone()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn server_cache_lifecycle() {
        assert!(config_server_session_id_cache(0).is_err());
        config_server_session_id_cache(4).unwrap();
        assert!(server_cache().is_some());
        clear_session_cache();
        assert!(server_cache().is_some());
        shutdown_server_session_id_cache().unwrap();
        assert!(server_cache().is_none());
        assert!(matches!(
            shutdown_server_session_id_cache(),
            Err(SecmodError::InvalidState(_))
        ));
    }
}
