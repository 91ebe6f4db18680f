#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Certificate handles, verification and the certificate database.

mod common;

use common::*;
use rcgen::{CertificateParams, KeyPair};
use secmod_lib::*;

// ---------------------------------------------------------------------------
// Certificate handle
// ---------------------------------------------------------------------------

#[test]
fn decoded_fields() {
    let pki = generate_pki();
    let server = &pki.server.cert;

    assert_eq!(server.version(), 3);
    assert_eq!(server.subject().common_name(), Some("localhost"));
    assert_eq!(server.subject().org_name(), Some("secmod tests"));
    assert_eq!(server.issuer(), pki.ca.cert.subject());
    assert_eq!(server.san_dns_names(), &["localhost".to_string()]);
    assert!(!server.is_ca());
    assert!(!server.is_self_signed());
    assert!(server.is_signed_by(&pki.ca.cert));
    assert!(!server.is_signed_by(&pki.client.cert));

    assert!(pki.ca.cert.is_ca());
    assert!(pki.ca.cert.is_self_signed());
    assert!(server.check_valid_times().is_ok());
}

#[test]
fn pem_round_trip() {
    let pki = generate_pki();
    let pem = pki.server.cert.to_pem();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    let parsed = Certificate::from_pem(pem.as_bytes()).unwrap();
    assert_eq!(parsed, pki.server.cert);
    assert_eq!(Certificate::from_bytes(pem.as_bytes()).unwrap(), pki.server.cert);
    assert_eq!(Certificate::from_bytes(pki.server.cert.der()).unwrap(), pki.server.cert);

    let bundle = format!("{}{}", pem, pki.ca.cert.to_pem());
    let chain = Certificate::chain_from_pem(bundle.as_bytes()).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1], pki.ca.cert);

    let key_pem = pki.server.key.to_pem();
    let key = PrivateKey::from_pem(key_pem.as_bytes()).unwrap();
    assert_eq!(key.der(), pki.server.key.der());
}

#[test]
fn garbage_is_rejected() {
    assert!(Certificate::from_der(b"not a certificate").is_err());
    assert!(Certificate::from_pem(b"-----BEGIN CERTIFICATE-----\n!!\n-----END CERTIFICATE-----\n").is_err());
    assert!(PrivateKey::from_pkcs8_der(&[0x04, 0x00]).is_err());
}

#[test]
fn usage_flags_follow_extended_key_usage() {
    let pki = generate_pki();
    let server = pki.server.cert.cert_usage_flags();
    assert!(server.contains(CertUsage::SSL_SERVER));
    assert!(!server.contains(CertUsage::SSL_CLIENT));

    let client = pki.client.cert.cert_usage_flags();
    assert!(client.contains(CertUsage::SSL_CLIENT));
    assert!(!client.contains(CertUsage::SSL_SERVER));

    assert!(pki.ca.cert.cert_usage_flags().contains(CertUsage::VERIFY_CA));
}

#[test]
fn hostname_matching() {
    let pki = generate_pki();
    assert!(pki.server.cert.verify_hostname("localhost").unwrap());
    assert!(pki.server.cert.verify_hostname("LOCALHOST").unwrap());
    assert!(!pki.server.cert.verify_hostname("example.com").unwrap());
    assert!(!pki.server.cert.verify_hostname("127.0.0.1").unwrap());

    let key = KeyPair::generate().unwrap();
    let wildcard = CertificateParams::new(vec!["*.example.com".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let wildcard = Certificate::from_der(wildcard.der()).unwrap();
    assert!(wildcard.verify_hostname("www.example.com").unwrap());
    assert!(!wildcard.verify_hostname("example.com").unwrap());
    assert!(!wildcard.verify_hostname("a.b.example.com").unwrap());
}

#[test]
fn fingerprints() {
    let pki = generate_pki();
    let sha256 = pki.server.cert.sha256_fingerprint();
    assert_eq!(sha256.len(), 32 * 3 - 1);
    assert_eq!(pki.server.cert.fingerprint(OidTag::Sha256).unwrap(), sha256);
    assert_eq!(pki.server.cert.fingerprint(OidTag::Sha1).unwrap().len(), 20 * 3 - 1);
}

#[test]
fn signer_in_ca_names() {
    let pki = generate_pki();
    let ca_name = pki.ca.cert.subject().clone();
    assert!(pki.client.cert.has_signer_in_ca_names(&[ca_name]));
    assert!(!pki.client.cert.has_signer_in_ca_names(&[]));
    assert!(!pki
        .client
        .cert
        .has_signer_in_ca_names(&[Dn::parse("CN=Somebody Else").unwrap()]));
}

/// CA named by O, an attribute outside the name registry, and CN.
fn ca_with_private_unit(unit: &str) -> (rcgen::Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::OrganizationName, "secmod tests");
    dn.push(
        rcgen::DnType::CustomDnType(vec![1, 3, 6, 1, 4, 1, 99999, 1]),
        unit,
    );
    dn.push(rcgen::DnType::CommonName, "Shared CA");
    params.distinguished_name = dn;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let cert = params.self_signed(&key).unwrap();
    (cert, key)
}

#[test]
fn signer_match_uses_the_encoded_issuer() {
    let (ca_a, ca_a_key) = ca_with_private_unit("unit a");
    let (ca_b, _) = ca_with_private_unit("unit b");
    let leaf_key = KeyPair::generate().unwrap();
    let leaf = CertificateParams::new(vec!["leaf.example".to_string()])
        .unwrap()
        .signed_by(&leaf_key, &ca_a, &ca_a_key)
        .unwrap();

    let ca_a = Certificate::from_der(ca_a.der()).unwrap();
    let ca_b = Certificate::from_der(ca_b.der()).unwrap();
    let leaf = Certificate::from_der(leaf.der()).unwrap();

    // The decoded names only differ in the attribute that was skipped.
    assert_eq!(ca_a.subject(), ca_b.subject());
    assert!(leaf.has_signer_in_ca_names(&[ca_a.subject().clone()]));
    assert!(!leaf.has_signer_in_ca_names(&[ca_b.subject().clone()]));

    let typed = Dn::parse("CN=Shared CA,O=secmod tests").unwrap();
    assert_eq!(&typed, ca_a.subject());
    assert!(!leaf.has_signer_in_ca_names(&[typed]));
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[test]
fn verify_against_trusted_ca() {
    let pki = generate_pki();
    let db = CertDb::in_memory().unwrap();
    populate(&db, &pki);

    let approved = pki
        .server
        .cert
        .verify_now(&db, true, CertUsage::SSL_SERVER)
        .unwrap();
    assert!(approved.contains(CertUsage::SSL_SERVER));

    let approved = pki
        .client
        .cert
        .verify_now(&db, true, CertUsage::SSL_CLIENT)
        .unwrap();
    assert!(approved.contains(CertUsage::SSL_CLIENT));

    let err = pki
        .client
        .cert
        .verify_now(&db, true, CertUsage::SSL_SERVER)
        .unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_INADEQUATE_CERT_TYPE));
}

#[test]
fn verify_without_anchor_reports_native_code() {
    let pki = generate_pki();

    let empty = CertDb::in_memory().unwrap();
    let err = pki
        .server
        .cert
        .verify_now(&empty, true, CertUsage::SSL_SERVER)
        .unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_UNKNOWN_ISSUER));
    assert!(err.to_string().contains("SEC_ERROR_UNKNOWN_ISSUER"));

    let untrusted = CertDb::in_memory().unwrap();
    untrusted
        .add_cert(&pki.ca.cert, None, CertTrust::default())
        .unwrap();
    let err = pki
        .server
        .cert
        .verify_now(&untrusted, true, CertUsage::SSL_SERVER)
        .unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_UNTRUSTED_ISSUER));
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[test]
fn trust_strings() {
    let trust: CertTrust = "CT,C,C".parse().unwrap();
    assert_eq!(trust, CertTrust::trusted_ca());
    assert_eq!(trust.to_string(), "CT,C,C");
    assert_eq!("u,u,u".parse::<CertTrust>().unwrap(), CertTrust::user());
    assert_eq!(CertTrust::default().to_string(), ",,");
    assert!("CT,C".parse::<CertTrust>().is_err());
    assert!("X,,".parse::<CertTrust>().is_err());
}

#[test]
fn lookups_by_nickname() {
    let pki = generate_pki();
    let db = CertDb::in_memory().unwrap();
    populate(&db, &pki);

    assert_eq!(db.find_cert_from_nickname(SERVER_NICKNAME).unwrap(), pki.server.cert);
    assert!(matches!(
        db.find_cert_from_nickname("nobody"),
        Err(SecmodError::NotFound(_))
    ));
    assert_eq!(db.nickname_of(&pki.ca.cert).as_deref(), Some(CA_NICKNAME));

    let mut users = db.get_cert_nicknames(NicknameKind::User);
    users.sort();
    assert_eq!(users, vec![SERVER_NICKNAME.to_string(), CLIENT_NICKNAME.to_string()]);
    assert_eq!(db.get_cert_nicknames(NicknameKind::Ca), vec![CA_NICKNAME.to_string()]);
    assert_eq!(db.get_cert_nicknames(NicknameKind::All).len(), 3);

    assert_eq!(db.find_issuer(&pki.client.cert).unwrap(), pki.ca.cert);
    assert_eq!(
        db.trusted_ca_subjects(CertUsage::SSL_CLIENT),
        vec![pki.ca.cert.subject().clone()]
    );
    assert!(db.has_key(&pki.client.cert));
    assert!(!db.has_key(&pki.ca.cert));
}

#[test]
fn duplicate_nickname_is_rejected() {
    let pki = generate_pki();
    let db = CertDb::in_memory().unwrap();
    db.add_cert(&pki.server.cert, Some("dup"), CertTrust::default())
        .unwrap();
    let err = db
        .add_cert(&pki.client.cert, Some("dup"), CertTrust::default())
        .unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_DUPLICATE_CERT_NAME));

    // Re-adding the same certificate keeps its nickname.
    let again = db
        .add_cert(&pki.server.cert, Some("other"), CertTrust::default())
        .unwrap();
    assert_eq!(again, "dup");
}

#[test]
fn database_persists_and_protects_keys() {
    let dir = tempfile::tempdir().unwrap();
    let pki = generate_pki();
    {
        let db = create_db(dir.path(), &pki);
        db.save().unwrap();
    }

    let db = CertDb::open(dir.path(), OpenMode::ReadOnly).unwrap();
    assert!(db.is_read_only());
    assert_eq!(db.find_cert_from_nickname(CLIENT_NICKNAME).unwrap(), pki.client.cert);
    assert_eq!(db.trust(&pki.ca.cert), CertTrust::trusted_ca());

    let slot = db.internal_key_slot();
    assert!(slot.needs_login());
    assert!(!slot.is_logged_in());
    let err = slot.login("wrong").unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_BAD_PASSWORD));

    slot.login(DB_PASSWORD).unwrap();
    let key = db.find_key_by_any_cert(&pki.client.cert, None).unwrap();
    assert_eq!(key.der(), pki.client.key.der());
    slot.logout();
    assert!(!slot.is_logged_in());

    let err = db
        .add_cert(&pki.ca.cert, Some("again"), CertTrust::default())
        .unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_READ_ONLY));
}

#[test]
fn database_header_records_the_key_derivation() {
    let dir = tempfile::tempdir().unwrap();
    let pki = generate_pki();
    drop(create_db(dir.path(), &pki));

    let path = dir.path().join("certdb.json");
    let mut file: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(file["kdf"]["algorithm"], "pbkdf2-hmac-sha256");
    let iterations = file["kdf"]["iterations"].as_u64().unwrap();
    assert_eq!(iterations, u64::from(certdb::PBKDF2_ITERATIONS));
    assert!(iterations >= 100_000);
    assert!(!file["salt"].as_str().unwrap().is_empty());

    // The iteration count is part of the key: a tampered header locks the
    // slot even with the right password.
    file["kdf"]["iterations"] = serde_json::json!(1_000);
    std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
    let db = CertDb::open(dir.path(), OpenMode::ReadOnly).unwrap();
    let err = db.internal_key_slot().login(DB_PASSWORD).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_BAD_PASSWORD));

    file["kdf"]["iterations"] = serde_json::json!(0);
    std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
    let db = CertDb::open(dir.path(), OpenMode::ReadOnly).unwrap();
    let err = db.internal_key_slot().login(DB_PASSWORD).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_BAD_DATABASE));
}

#[test]
fn missing_read_only_database_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = CertDb::open(dir.path(), OpenMode::ReadOnly).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_BAD_DATABASE));

    let db = CertDb::open(dir.path(), OpenMode::ReadWrite).unwrap();
    assert!(!db.internal_key_slot().needs_login());
    assert!(dir.path().join("certdb.json").exists());
}
