//! Process-wide OCSP settings and the response cache.
//!
//! Responses are never fetched over the network. The cache holds responses
//! servers stapled during TLS handshakes, keyed by the SHA-256 fingerprint of
//! the certificate they cover. With checking enabled and a failure mode of
//! [`OcspFailureMode::FailureIsVerificationFailure`], a server certificate
//! with no stapled or cached response is rejected.

use crate::cert::Certificate;
use crate::certdb::CertDb;
use crate::context;
use crate::errcode::{SEC_ERROR_INVALID_ARGS, SEC_ERROR_OCSP_NO_DEFAULT_RESPONDER};
use crate::SecmodError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What a failed status lookup means for certificate verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum OcspFailureMode {
    #[default]
    FailureIsVerificationFailure = 0,
    FailureIsNotAVerificationFailure = 1,
}

impl OcspFailureMode {
    pub fn from_raw(value: i32) -> Result<Self, SecmodError> {
        match value {
            0 => Ok(OcspFailureMode::FailureIsVerificationFailure),
            1 => Ok(OcspFailureMode::FailureIsNotAVerificationFailure),
            other => Err(SecmodError::native_detail(
                SEC_ERROR_INVALID_ARGS,
                format!("unknown OCSP failure mode {}", other),
            )),
        }
    }
}

/// Bound on the number of cached responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspCacheSize {
    Disabled,
    Unlimited,
    Limited(u32),
}

impl OcspCacheSize {
    /// `-1` disables the cache, `0` leaves it unbounded, anything larger is
    /// the entry limit.
    pub fn from_raw(value: i32) -> Result<Self, SecmodError> {
        match value {
            -1 => Ok(OcspCacheSize::Disabled),
            0 => Ok(OcspCacheSize::Unlimited),
            n if n > 0 => Ok(OcspCacheSize::Limited(n.unsigned_abs())),
            other => Err(SecmodError::native_detail(
                SEC_ERROR_INVALID_ARGS,
                format!("invalid OCSP cache size {}", other),
            )),
        }
    }
}

/// Responder consulted for every certificate instead of the one named in
/// its AIA extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultResponder {
    pub url: String,
    pub nickname: String,
    /// Certificate expected to sign the responder's answers.
    pub signer: Certificate,
}

/// Snapshot of the current settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspSettings {
    pub checking_enabled: bool,
    pub failure_mode: OcspFailureMode,
    pub timeout: Duration,
    pub cache_size: OcspCacheSize,
    pub min_refresh: Duration,
    pub max_refresh: Duration,
    pub default_responder: Option<DefaultResponder>,
    pub default_responder_enabled: bool,
    pub use_pkix_for_validation: bool,
}

impl Default for OcspSettings {
    fn default() -> Self {
        OcspSettings {
            checking_enabled: false,
            failure_mode: OcspFailureMode::default(),
            timeout: Duration::from_secs(60),
            cache_size: OcspCacheSize::Limited(1000),
            min_refresh: Duration::from_secs(60 * 60),
            max_refresh: Duration::from_secs(24 * 60 * 60),
            default_responder: None,
            default_responder_enabled: false,
            use_pkix_for_validation: false,
        }
    }
}

struct CachedResponse {
    der: Vec<u8>,
    stored: Instant,
}

#[derive(Default)]
struct RevocationState {
    settings: OcspSettings,
    cache: HashMap<String, CachedResponse>,
}

impl RevocationState {
    fn prune(&mut self) {
        let max_age = self.settings.max_refresh;
        self.cache.retain(|_, entry| entry.stored.elapsed() <= max_age);
        let limit = match self.settings.cache_size {
            OcspCacheSize::Disabled => 0,
            OcspCacheSize::Unlimited => return,
            OcspCacheSize::Limited(n) => usize::try_from(n).unwrap_or(usize::MAX),
        };
        while self.cache.len() > limit {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|(_, entry)| entry.stored)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => self.cache.remove(&key),
                None => break,
            };
        }
    }
}

static STATE: Lazy<Mutex<RevocationState>> = Lazy::new(|| Mutex::new(RevocationState::default()));

/// The database a setter applies to: `certdb`, or the default one.
fn resolve_db(certdb: Option<&CertDb>) -> Result<CertDb, SecmodError> {
    match certdb {
        Some(db) => Ok(db.clone()),
        None => context::default_certdb(),
    }
}

pub fn ocsp_settings() -> OcspSettings {
    STATE.lock().settings.clone()
}

/// Configure the response cache. Fresh entries are kept for at least
/// `min_refresh_secs` and dropped after `max_refresh_secs`.
pub fn set_ocsp_cache_settings(
    max_entries: i32,
    min_refresh_secs: u32,
    max_refresh_secs: u32,
) -> Result<(), SecmodError> {
    let size = OcspCacheSize::from_raw(max_entries)?;
    if min_refresh_secs > max_refresh_secs {
        return Err(SecmodError::native_detail(
            SEC_ERROR_INVALID_ARGS,
            format!(
                "minimum refresh {}s exceeds maximum {}s",
                min_refresh_secs, max_refresh_secs
            ),
        ));
    }
    let mut state = STATE.lock();
    state.settings.cache_size = size;
    state.settings.min_refresh = Duration::from_secs(u64::from(min_refresh_secs));
    state.settings.max_refresh = Duration::from_secs(u64::from(max_refresh_secs));
    state.prune();
    tracing::debug!(?size, min_refresh_secs, max_refresh_secs, "OCSP cache configured");
    Ok(())
}

pub fn clear_ocsp_cache() {
    let mut state = STATE.lock();
    let dropped = state.cache.len();
    state.cache.clear();
    tracing::debug!(dropped, "OCSP cache cleared");
}

/// Timeout for a single responder request.
pub fn set_ocsp_timeout(seconds: u32) {
    STATE.lock().settings.timeout = Duration::from_secs(u64::from(seconds));
}

pub fn set_ocsp_failure_mode(mode: OcspFailureMode) {
    STATE.lock().settings.failure_mode = mode;
}

/// Name `url` as the default responder, with answers signed by the
/// certificate stored under `nickname` in `certdb`. Does not enable it.
pub fn set_ocsp_default_responder(
    certdb: &CertDb,
    url: &str,
    nickname: &str,
) -> Result<(), SecmodError> {
    let signer = certdb.find_cert_from_nickname(nickname)?;
    validate_responder_url(url)?;
    let mut state = STATE.lock();
    state.settings.default_responder = Some(DefaultResponder {
        url: url.to_string(),
        nickname: nickname.to_string(),
        signer,
    });
    tracing::debug!(%url, %nickname, "OCSP default responder set");
    Ok(())
}

fn validate_responder_url(url: &str) -> Result<(), SecmodError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    let authority = rest.and_then(|r| r.split('/').next()).unwrap_or_default();
    if authority.is_empty() {
        return Err(SecmodError::native_detail(
            SEC_ERROR_INVALID_ARGS,
            format!("not an http(s) responder URL: {:?}", url),
        ));
    }
    Ok(())
}

/// Route every status check to the default responder. The responder's
/// signer must still be present in the database.
pub fn enable_ocsp_default_responder(certdb: Option<&CertDb>) -> Result<(), SecmodError> {
    let db = resolve_db(certdb)?;
    let mut state = STATE.lock();
    let Some(responder) = &state.settings.default_responder else {
        return Err(SecmodError::native(SEC_ERROR_OCSP_NO_DEFAULT_RESPONDER));
    };
    db.find_cert_from_nickname(&responder.nickname)?;
    state.settings.default_responder_enabled = true;
    Ok(())
}

pub fn disable_ocsp_default_responder(certdb: Option<&CertDb>) -> Result<(), SecmodError> {
    resolve_db(certdb)?;
    STATE.lock().settings.default_responder_enabled = false;
    Ok(())
}

pub fn enable_ocsp_checking(certdb: Option<&CertDb>) -> Result<(), SecmodError> {
    resolve_db(certdb)?;
    STATE.lock().settings.checking_enabled = true;
    tracing::debug!("OCSP checking enabled");
    Ok(())
}

pub fn disable_ocsp_checking(certdb: Option<&CertDb>) -> Result<(), SecmodError> {
    resolve_db(certdb)?;
    STATE.lock().settings.checking_enabled = false;
    tracing::debug!("OCSP checking disabled");
    Ok(())
}

pub fn use_pkix_for_validation() -> bool {
    STATE.lock().settings.use_pkix_for_validation
}

/// Returns the previous value.
pub fn set_use_pkix_for_validation(enabled: bool) -> bool {
    std::mem::replace(&mut STATE.lock().settings.use_pkix_for_validation, enabled)
}

/// Cached response for `cert`, if one is younger than the maximum refresh
/// interval.
pub fn cached_ocsp_response(cert: &Certificate) -> Option<Vec<u8>> {
    let mut state = STATE.lock();
    state.prune();
    state
        .cache
        .get(&cert.sha256_fingerprint())
        .map(|entry| entry.der.clone())
}

/// Store a response a server stapled for `cert`. A response younger than
/// the minimum refresh interval is not replaced.
pub(crate) fn record_stapled_response(cert: &Certificate, der: &[u8]) {
    if der.is_empty() {
        return;
    }
    let mut state = STATE.lock();
    if state.settings.cache_size == OcspCacheSize::Disabled {
        return;
    }
    let min_refresh = state.settings.min_refresh;
    let key = cert.sha256_fingerprint();
    if state
        .cache
        .get(&key)
        .is_some_and(|entry| entry.stored.elapsed() < min_refresh)
    {
        return;
    }
    state.cache.insert(
        key,
        CachedResponse {
            der: der.to_vec(),
            stored: Instant::now(),
        },
    );
    state.prune();
}

/// Whether verification of `cert` may proceed as far as revocation status
/// is concerned.
pub(crate) fn status_acceptable(cert: &Certificate, stapled: &[u8]) -> bool {
    record_stapled_response(cert, stapled);
    let settings = ocsp_settings();
    if !settings.checking_enabled
        || settings.failure_mode == OcspFailureMode::FailureIsNotAVerificationFailure
    {
        return true;
    }
    if !stapled.is_empty() || cached_ocsp_response(cert).is_some() {
        return true;
    }
    tracing::warn!(subject = %cert.subject(), "no OCSP response available for certificate");
    false
}
