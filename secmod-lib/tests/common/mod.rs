//! Shared test PKI: a CA, a server certificate for `localhost` and a
//! client certificate, generated with rcgen and stored in a database.

#![allow(dead_code)]

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair,
};
use secmod_lib::*;

pub const DB_PASSWORD: &str = "DB_passwd";
pub const CA_NICKNAME: &str = "test_ca";
pub const SERVER_NICKNAME: &str = "test_server";
pub const CLIENT_NICKNAME: &str = "test_user";
pub const EXPIRED_NICKNAME: &str = "expired_user";

pub struct Identity {
    pub cert: Certificate,
    pub key: PrivateKey,
}

pub struct TestPki {
    pub ca: Identity,
    pub server: Identity,
    pub client: Identity,
    /// Client certificate whose validity ended in 2001.
    pub expired_client: Identity,
}

fn name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "secmod tests");
    dn.push(DnType::CommonName, cn);
    dn
}

fn identity(cert: &rcgen::Certificate, key: &KeyPair) -> Identity {
    Identity {
        cert: Certificate::from_der(cert.der()).unwrap(),
        key: PrivateKey::from_pkcs8_der(&key.serialize_der()).unwrap(),
    }
}

fn leaf(
    cn: &str,
    sans: Vec<String>,
    eku: ExtendedKeyUsagePurpose,
    ca_cert: &rcgen::Certificate,
    ca_key: &KeyPair,
    expired: bool,
) -> Identity {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(sans).unwrap();
    params.distinguished_name = name(cn);
    params.extended_key_usages = vec![eku];
    if expired {
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
    }
    let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
    identity(&cert, &key)
}

/// Generate a CA with one server and one client certificate under it.
pub fn generate_pki() -> TestPki {
    generate_pki_named("secmod Test CA")
}

/// Like [`generate_pki`], with `ca_cn` as the CA's common name.
pub fn generate_pki_named(ca_cn: &str) -> TestPki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.distinguished_name = name(ca_cn);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server = leaf(
        "localhost",
        vec!["localhost".to_string()],
        ExtendedKeyUsagePurpose::ServerAuth,
        &ca_cert,
        &ca_key,
        false,
    );
    let client = leaf(
        CLIENT_NICKNAME,
        Vec::new(),
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca_cert,
        &ca_key,
        false,
    );
    let expired_client = leaf(
        EXPIRED_NICKNAME,
        Vec::new(),
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca_cert,
        &ca_key,
        true,
    );
    TestPki {
        ca: identity(&ca_cert, &ca_key),
        server,
        client,
        expired_client,
    }
}

/// Store the PKI in `db`: the CA trusted for everything, the server and
/// client certificates with their keys. The key slot must be unlocked.
pub fn populate(db: &CertDb, pki: &TestPki) {
    db.add_cert(&pki.ca.cert, Some(CA_NICKNAME), CertTrust::trusted_ca())
        .unwrap();
    db.add_cert(&pki.server.cert, Some(SERVER_NICKNAME), CertTrust::default())
        .unwrap();
    db.add_key(&pki.server.cert, &pki.server.key, None).unwrap();
    db.add_cert(&pki.client.cert, Some(CLIENT_NICKNAME), CertTrust::default())
        .unwrap();
    db.add_key(&pki.client.cert, &pki.client.key, None).unwrap();
}

/// A password-protected database in `dir`, unlocked and populated.
pub fn create_db(dir: &std::path::Path, pki: &TestPki) -> CertDb {
    let db = CertDb::create(dir, Some(DB_PASSWORD)).unwrap();
    db.internal_key_slot().login(DB_PASSWORD).unwrap();
    populate(&db, pki);
    db
}

/// In-memory database holding the trusted CA and the server identity.
pub fn server_db(pki: &TestPki) -> CertDb {
    server_db_trusting(pki, &pki.ca.cert)
}

/// In-memory database holding the server identity of `pki`, with `ca` as
/// its only trusted CA.
pub fn server_db_trusting(pki: &TestPki, ca: &Certificate) -> CertDb {
    let db = CertDb::in_memory().unwrap();
    db.add_cert(ca, Some(CA_NICKNAME), CertTrust::trusted_ca())
        .unwrap();
    db.add_cert(&pki.server.cert, Some(SERVER_NICKNAME), CertTrust::default())
        .unwrap();
    db.add_key(&pki.server.cert, &pki.server.key, None).unwrap();
    db
}

/// In-memory database holding the trusted CA and the client identity.
pub fn client_db(pki: &TestPki) -> CertDb {
    let db = CertDb::in_memory().unwrap();
    db.add_cert(&pki.ca.cert, Some(CA_NICKNAME), CertTrust::trusted_ca())
        .unwrap();
    db.add_cert(&pki.client.cert, Some(CLIENT_NICKNAME), CertTrust::default())
        .unwrap();
    db.add_key(&pki.client.cert, &pki.client.key, None).unwrap();
    db
}
