#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! OCSP settings and their effect on server certificate verification.

mod common;

use common::*;
use parking_lot::Mutex;
use secmod_lib::revocation::{self, OcspCacheSize, OcspFailureMode};
use secmod_lib::*;
use std::thread;
use std::time::Duration;

/// Settings are process-wide; tests touching them take turns.
static SERIAL: Mutex<()> = parking_lot::const_mutex(());

const TIMEOUT: Duration = Duration::from_secs(10);
const RESPONDER_URL: &str = "http://foo.com:80/ocsp";

/// Put every setting these tests change back to its default.
fn reset() {
    revocation::disable_ocsp_checking(Some(&CertDb::in_memory().unwrap())).unwrap();
    revocation::set_ocsp_failure_mode(OcspFailureMode::FailureIsVerificationFailure);
    revocation::set_ocsp_cache_settings(1000, 3600, 86400).unwrap();
    revocation::clear_ocsp_cache();
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[test]
fn cache_settings() {
    let _guard = SERIAL.lock();
    revocation::set_ocsp_cache_settings(100, 10, 20).unwrap();
    let settings = revocation::ocsp_settings();
    assert_eq!(settings.cache_size, OcspCacheSize::Limited(100));
    assert_eq!(settings.min_refresh, Duration::from_secs(10));
    assert_eq!(settings.max_refresh, Duration::from_secs(20));
    revocation::clear_ocsp_cache();

    revocation::set_ocsp_cache_settings(-1, 0, 0).unwrap();
    assert_eq!(revocation::ocsp_settings().cache_size, OcspCacheSize::Disabled);

    let err = revocation::set_ocsp_cache_settings(-2, 10, 20).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_INVALID_ARGS));
    let err = revocation::set_ocsp_cache_settings(100, 20, 10).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_INVALID_ARGS));
    // Rejected settings leave the previous ones in place.
    assert_eq!(revocation::ocsp_settings().cache_size, OcspCacheSize::Disabled);
    reset();
}

#[test]
fn timeout_and_failure_mode() {
    let _guard = SERIAL.lock();
    revocation::set_ocsp_timeout(10);
    assert_eq!(revocation::ocsp_settings().timeout, Duration::from_secs(10));

    for raw in [0, 1] {
        revocation::set_ocsp_failure_mode(OcspFailureMode::from_raw(raw).unwrap());
        assert_eq!(revocation::ocsp_settings().failure_mode as i32, raw);
    }
    let err = OcspFailureMode::from_raw(-1).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_INVALID_ARGS));
    reset();
}

#[test]
fn default_responder_needs_a_known_signer() {
    let _guard = SERIAL.lock();
    let pki = generate_pki();
    let db = server_db(&pki);

    let err = revocation::set_ocsp_default_responder(&db, RESPONDER_URL, "invalid").unwrap_err();
    assert!(matches!(err, SecmodError::NotFound(_)));
    let err = revocation::set_ocsp_default_responder(&db, "foo.com/ocsp", CA_NICKNAME).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_INVALID_ARGS));

    revocation::set_ocsp_default_responder(&db, RESPONDER_URL, CA_NICKNAME).unwrap();
    let responder = revocation::ocsp_settings().default_responder.unwrap();
    assert_eq!(responder.url, RESPONDER_URL);
    assert_eq!(responder.signer, pki.ca.cert);

    revocation::enable_ocsp_default_responder(Some(&db)).unwrap();
    assert!(revocation::ocsp_settings().default_responder_enabled);
    revocation::disable_ocsp_default_responder(Some(&db)).unwrap();
    assert!(!revocation::ocsp_settings().default_responder_enabled);

    // The signer has to be in whichever database enables it.
    let err = revocation::enable_ocsp_default_responder(Some(&CertDb::in_memory().unwrap()))
        .unwrap_err();
    assert!(matches!(err, SecmodError::NotFound(_)));
}

#[test]
fn default_database_is_used_when_none_is_given() {
    let _guard = SERIAL.lock();
    let pki = generate_pki();
    let db = context::init_nodb().unwrap();
    populate(&db, &pki);

    revocation::set_ocsp_default_responder(&db, RESPONDER_URL, CA_NICKNAME).unwrap();
    revocation::enable_ocsp_default_responder(None).unwrap();
    revocation::disable_ocsp_default_responder(None).unwrap();
    revocation::enable_ocsp_checking(None).unwrap();
    assert!(revocation::ocsp_settings().checking_enabled);
    revocation::disable_ocsp_checking(None).unwrap();
    assert!(!revocation::ocsp_settings().checking_enabled);
    context::shutdown().unwrap();

    let err = revocation::enable_ocsp_checking(None).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_NOT_INITIALIZED));
    reset();
}

#[test]
fn use_pkix_for_validation_returns_the_previous_value() {
    let _guard = SERIAL.lock();
    let value = revocation::use_pkix_for_validation();
    assert_eq!(revocation::set_use_pkix_for_validation(!value), value);
    assert_eq!(revocation::use_pkix_for_validation(), !value);
    assert_eq!(revocation::set_use_pkix_for_validation(value), !value);
    assert_eq!(revocation::use_pkix_for_validation(), value);
}

// ---------------------------------------------------------------------------
// Handshakes
// ---------------------------------------------------------------------------

/// Connect to a one-shot server that completes the handshake and hangs up.
/// Session caches are emptied first so the server certificate is verified
/// every time.
fn handshake(pki: &TestPki) -> Result<(), SecmodError> {
    tls::config_server_session_id_cache(16)?;
    tls::clear_session_cache();
    let mut server = SslSocket::new();
    server.set_certdb(server_db(pki))?;
    server.config_secure_server(&pki.server.cert, &pki.server.key)?;
    server.bind("127.0.0.1:0")?;
    server.listen()?;
    let addr = server.local_addr()?;
    let handle = thread::spawn(move || {
        let mut child = server.accept(Some(TIMEOUT))?;
        let result = child.force_handshake();
        let _ = child.close();
        server.close()?;
        result
    });

    let db = client_db(pki);
    let mut client = SslSocket::new();
    client.set_hostname("localhost")?;
    client.set_certdb(db.clone())?;
    client.set_auth_certificate_callback(tls::auth_certificate_callback(db))?;
    let result = client.connect(addr, Some(TIMEOUT));
    let _ = client.close();
    let _ = handle.join().unwrap();
    result
}

#[test]
fn missing_status_fails_only_in_hard_fail_mode() {
    let _guard = SERIAL.lock();
    let pki = generate_pki();
    let db = CertDb::in_memory().unwrap();

    handshake(&pki).unwrap();

    revocation::enable_ocsp_checking(Some(&db)).unwrap();
    let err = handshake(&pki).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SSL_ERROR_BAD_CERTIFICATE));

    revocation::set_ocsp_failure_mode(OcspFailureMode::FailureIsNotAVerificationFailure);
    handshake(&pki).unwrap();

    revocation::disable_ocsp_checking(Some(&db)).unwrap();
    revocation::set_ocsp_failure_mode(OcspFailureMode::FailureIsVerificationFailure);
    handshake(&pki).unwrap();
    assert!(revocation::cached_ocsp_response(&pki.server.cert).is_none());
    reset();
}
