//! Certificate and private key handles.
//!
//! A [`Certificate`] is decoded once on construction; the derived fields
//! (names, validity, usage extensions, SAN entries) are kept alongside the
//! shared DER so accessors never re-parse. Signature checks re-parse the DER
//! on demand.

use crate::certdb::CertDb;
use crate::errcode::*;
use crate::name::Dn;
use crate::oid::OidTag;
use crate::util;
use crate::SecmodError;
use bitflags::bitflags;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

/// Longest issuer chain `verify_now` will walk.
const MAX_CHAIN_DEPTH: usize = 16;

bitflags! {
    /// Certificate usages, as approved by verification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CertUsage: u32 {
        const SSL_CLIENT = 0x0001;
        const SSL_SERVER = 0x0002;
        const STEP_UP = 0x0004;
        const SSL_CA = 0x0008;
        const EMAIL_SIGNER = 0x0010;
        const EMAIL_RECIPIENT = 0x0020;
        const OBJECT_SIGNER = 0x0040;
        const USER_CERT_IMPORT = 0x0080;
        const VERIFY_CA = 0x0100;
        const PROTECTED_OBJECT_SIGNER = 0x0200;
        const STATUS_RESPONDER = 0x0400;
        const ANY_CA = 0x0800;
    }
}

bitflags! {
    /// X.509 key usage bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyUsage: u16 {
        const DIGITAL_SIGNATURE = 0x0001;
        const NON_REPUDIATION = 0x0002;
        const KEY_ENCIPHERMENT = 0x0004;
        const DATA_ENCIPHERMENT = 0x0008;
        const KEY_AGREEMENT = 0x0010;
        const KEY_CERT_SIGN = 0x0020;
        const CRL_SIGN = 0x0040;
    }
}

bitflags! {
    /// Extended key usage purposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExtKeyUsage: u16 {
        const ANY = 0x0001;
        const SERVER_AUTH = 0x0002;
        const CLIENT_AUTH = 0x0004;
        const CODE_SIGNING = 0x0008;
        const EMAIL_PROTECTION = 0x0010;
        const TIME_STAMPING = 0x0020;
        const OCSP_SIGNING = 0x0040;
    }
}

bitflags! {
    /// Netscape certificate type bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NsCertType: u8 {
        const SSL_CLIENT = 0x80;
        const SSL_SERVER = 0x40;
        const EMAIL = 0x20;
        const OBJECT_SIGNING = 0x10;
        const SSL_CA = 0x04;
        const EMAIL_CA = 0x02;
        const OBJECT_SIGNING_CA = 0x01;
    }
}

struct CertInner {
    der: Vec<u8>,
    version: u32,
    serial: Vec<u8>,
    subject: Dn,
    issuer: Dn,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    is_ca: bool,
    path_len: Option<u32>,
    key_usage: Option<KeyUsage>,
    ext_key_usage: Option<ExtKeyUsage>,
    ns_cert_type: Option<NsCertType>,
    san_dns: Vec<String>,
    san_ips: Vec<IpAddr>,
    san_malformed: bool,
    self_signed: bool,
}

/// Owning handle to a decoded X.509 certificate. Clones share the DER.
#[derive(Clone)]
pub struct Certificate {
    inner: Arc<CertInner>,
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.inner.der == other.inner.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.inner.subject.to_string())
            .field("issuer", &self.inner.issuer.to_string())
            .field("serial", &self.serial_hex())
            .finish()
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.subject)
    }
}

fn parse_x509(der: &[u8]) -> Result<X509Certificate<'_>, SecmodError> {
    X509Certificate::from_der(der)
        .map(|(_, x509)| x509)
        .map_err(|e| SecmodError::DerError(format!("{}", e)))
}

impl Certificate {
    /// Decode a DER certificate. Trailing bytes after the certificate are
    /// dropped.
    pub fn from_der(input: &[u8]) -> Result<Self, SecmodError> {
        if input.is_empty() {
            return Err(SecmodError::ParseError("empty input".into()));
        }
        let (remaining, x509) =
            X509Certificate::from_der(input).map_err(|e| SecmodError::DerError(format!("{}", e)))?;
        let cert_len = input.len() - remaining.len();
        let der = input.get(..cert_len).unwrap_or(input).to_vec();
        Ok(Certificate {
            inner: Arc::new(build_inner(&x509, der)?),
        })
    }

    /// Decode the first certificate in PEM text.
    pub fn from_pem(input: &[u8]) -> Result<Self, SecmodError> {
        let blocks = util::pem_blocks(input)?;
        let (_, der) = blocks
            .iter()
            .find(|(label, _)| {
                matches!(
                    label.as_str(),
                    "CERTIFICATE" | "TRUSTED CERTIFICATE" | "X509 CERTIFICATE"
                )
            })
            .ok_or_else(|| SecmodError::PemError("no CERTIFICATE block".into()))?;
        Certificate::from_der(der)
    }

    /// Decode every certificate in a PEM bundle.
    pub fn chain_from_pem(input: &[u8]) -> Result<Vec<Self>, SecmodError> {
        util::pem_blocks(input)?
            .iter()
            .filter(|(label, _)| label.ends_with("CERTIFICATE"))
            .map(|(_, der)| Certificate::from_der(der))
            .collect()
    }

    /// Decode PEM or DER (auto-detected).
    pub fn from_bytes(input: &[u8]) -> Result<Self, SecmodError> {
        if util::is_pem(input) {
            Certificate::from_pem(input)
        } else {
            Certificate::from_der(input)
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.inner.der
    }

    pub fn to_pem(&self) -> String {
        util::der_to_pem(&self.inner.der, "CERTIFICATE")
    }

    /// X.509 version (1, 2 or 3).
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn subject(&self) -> &Dn {
        &self.inner.subject
    }

    pub fn issuer(&self) -> &Dn {
        &self.inner.issuer
    }

    pub(crate) fn subject_raw(&self) -> &[u8] {
        &self.inner.subject_raw
    }

    pub(crate) fn issuer_raw(&self) -> &[u8] {
        &self.inner.issuer_raw
    }

    pub fn serial_number(&self) -> &[u8] {
        &self.inner.serial
    }

    /// Serial number as colon-separated uppercase hex.
    pub fn serial_hex(&self) -> String {
        util::hex_colon_upper(&self.inner.serial)
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.inner.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.inner.not_after
    }

    pub fn is_ca(&self) -> bool {
        self.inner.is_ca
    }

    pub fn path_len_constraint(&self) -> Option<u32> {
        self.inner.path_len
    }

    pub fn key_usage(&self) -> Option<KeyUsage> {
        self.inner.key_usage
    }

    pub fn ext_key_usage(&self) -> Option<ExtKeyUsage> {
        self.inner.ext_key_usage
    }

    pub fn ns_cert_type(&self) -> Option<NsCertType> {
        self.inner.ns_cert_type
    }

    pub fn san_dns_names(&self) -> &[String] {
        &self.inner.san_dns
    }

    pub fn san_ip_addresses(&self) -> &[IpAddr] {
        &self.inner.san_ips
    }

    /// Subject equals issuer and the certificate verifies under its own key.
    pub fn is_self_signed(&self) -> bool {
        self.inner.self_signed
    }

    /// Fingerprint with the given digest, as colon-separated uppercase hex.
    pub fn fingerprint(&self, algorithm: OidTag) -> Result<String, SecmodError> {
        crate::digest::hash_buf(algorithm, &self.inner.der).map(|d| util::hex_colon_upper(&d))
    }

    pub fn sha256_fingerprint(&self) -> String {
        util::hex_colon_upper(&crate::digest::sha256_digest(&self.inner.der))
    }

    /// Nickname used when none is given: subject CN, else the fingerprint.
    pub(crate) fn default_nickname(&self) -> String {
        self.inner
            .subject
            .common_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.sha256_fingerprint())
    }

    /// Whether `issuer`'s public key verifies this certificate's signature.
    pub fn is_signed_by(&self, issuer: &Certificate) -> bool {
        let (Ok(child), Ok(parent)) = (parse_x509(&self.inner.der), parse_x509(&issuer.inner.der))
        else {
            return false;
        };
        child.verify_signature(Some(parent.public_key())).is_ok()
    }

    /// Whether the certificate is within its validity period at `at`.
    pub fn valid_at(&self, at: OffsetDateTime) -> bool {
        self.inner.not_before <= at && at <= self.inner.not_after
    }

    /// Fails with `SEC_ERROR_EXPIRED_CERTIFICATE` outside the validity period.
    pub fn check_valid_times(&self) -> Result<(), SecmodError> {
        if self.valid_at(OffsetDateTime::now_utc()) {
            Ok(())
        } else {
            Err(SecmodError::native_detail(
                SEC_ERROR_EXPIRED_CERTIFICATE,
                self.inner.subject.to_string(),
            ))
        }
    }

    /// Usages this certificate's own extensions permit, before any trust
    /// decision. Absent extensions do not restrict.
    pub fn cert_usage_flags(&self) -> CertUsage {
        let ku = self.inner.key_usage;
        let eku = self.inner.ext_key_usage;
        let ns = self.inner.ns_cert_type;

        let ku_allows = |bits: KeyUsage| ku.map_or(true, |k| k.intersects(bits));
        let eku_allows = |bits: ExtKeyUsage| {
            eku.map_or(true, |e| e.intersects(bits | ExtKeyUsage::ANY))
        };
        let ns_allows = |bits: NsCertType| ns.map_or(true, |n| n.intersects(bits));

        let mut usages = CertUsage::USER_CERT_IMPORT;
        let signing = KeyUsage::DIGITAL_SIGNATURE;
        let exchange = KeyUsage::KEY_ENCIPHERMENT | KeyUsage::KEY_AGREEMENT;

        if eku_allows(ExtKeyUsage::CLIENT_AUTH)
            && ns_allows(NsCertType::SSL_CLIENT)
            && ku_allows(signing | KeyUsage::KEY_AGREEMENT)
        {
            usages |= CertUsage::SSL_CLIENT;
        }
        if eku_allows(ExtKeyUsage::SERVER_AUTH)
            && ns_allows(NsCertType::SSL_SERVER)
            && ku_allows(signing | exchange)
        {
            usages |= CertUsage::SSL_SERVER | CertUsage::STEP_UP;
        }
        if eku_allows(ExtKeyUsage::EMAIL_PROTECTION) && ns_allows(NsCertType::EMAIL) {
            if ku_allows(signing | KeyUsage::NON_REPUDIATION) {
                usages |= CertUsage::EMAIL_SIGNER;
            }
            if ku_allows(exchange) {
                usages |= CertUsage::EMAIL_RECIPIENT;
            }
        }
        if eku_allows(ExtKeyUsage::CODE_SIGNING)
            && ns_allows(NsCertType::OBJECT_SIGNING)
            && ku_allows(signing)
        {
            usages |= CertUsage::OBJECT_SIGNER | CertUsage::PROTECTED_OBJECT_SIGNER;
        }
        if eku.is_some_and(|e| e.contains(ExtKeyUsage::OCSP_SIGNING)) {
            usages |= CertUsage::STATUS_RESPONDER;
        }
        if self.inner.is_ca && ku_allows(KeyUsage::KEY_CERT_SIGN) {
            usages |= CertUsage::VERIFY_CA | CertUsage::ANY_CA;
            if ns_allows(NsCertType::SSL_CA) {
                usages |= CertUsage::SSL_CA;
            }
        }
        usages
    }

    /// Match `hostname` against the SAN DNS names (CN only when there are
    /// none) or, for IP literals, the SAN IP addresses.
    pub fn verify_hostname(&self, hostname: &str) -> Result<bool, SecmodError> {
        if self.inner.san_malformed {
            return Err(SecmodError::native_detail(
                SEC_ERROR_BAD_DER,
                "malformed subjectAltName extension",
            ));
        }
        Ok(util::verify_hostname_match(
            &self.inner.san_dns,
            &self.inner.san_ips,
            self.inner.subject.common_name(),
            hostname,
        ))
    }

    /// Whether this certificate's issuer is one of `ca_names`.
    ///
    /// Names decoded from DER are matched on their encoding. Names built by
    /// hand are matched on their RDNs, which never matches an issuer that
    /// carried attributes the registry could not represent.
    pub fn has_signer_in_ca_names(&self, ca_names: &[Dn]) -> bool {
        ca_names.iter().any(|name| match name.der() {
            Some(der) => der == self.issuer_raw(),
            None => !self.inner.issuer.dropped_attributes() && *name == self.inner.issuer,
        })
    }

    /// Verify the certificate now against the trust in `certdb`.
    ///
    /// Walks the issuer chain through the database, checking validity
    /// times, CA constraints and (with `check_sig`) signatures, until it
    /// reaches a trust anchor. Returns the approved usages; fails with
    /// `SEC_ERROR_INADEQUATE_CERT_TYPE` when they miss every bit of a
    /// non-empty `intended_usage`.
    pub fn verify_now(
        &self,
        certdb: &CertDb,
        check_sig: bool,
        intended_usage: CertUsage,
    ) -> Result<CertUsage, SecmodError> {
        let now = OffsetDateTime::now_utc();
        let leaf_usages = self.cert_usage_flags();
        let fail = |code: i32, cert: &Certificate| {
            Err(SecmodError::native_detail(code, cert.subject().to_string()))
        };

        if !self.valid_at(now) {
            return fail(SEC_ERROR_EXPIRED_CERTIFICATE, self);
        }

        let leaf_trust = certdb.trust(self);
        let approved = if !leaf_trust.peer_usages().is_empty() {
            leaf_usages & leaf_trust.peer_usages()
        } else if leaf_trust.is_distrusted() {
            return fail(SEC_ERROR_UNTRUSTED_CERT, self);
        } else {
            let anchor_usages = self.walk_to_anchor(certdb, check_sig, now)?;
            leaf_usages & anchor_usages
        };

        if approved.is_empty() {
            return fail(SEC_ERROR_INADEQUATE_CERT_TYPE, self);
        }
        if !intended_usage.is_empty() && !approved.intersects(intended_usage) {
            tracing::debug!(?approved, ?intended_usage, subject = %self.subject(), "usage not approved");
            return fail(SEC_ERROR_INADEQUATE_CERT_TYPE, self);
        }
        Ok(approved)
    }

    /// Follow issuers up to a trust anchor and return the usages the anchor
    /// is trusted for.
    fn walk_to_anchor(
        &self,
        certdb: &CertDb,
        check_sig: bool,
        now: OffsetDateTime,
    ) -> Result<CertUsage, SecmodError> {
        let fail = |code: i32, cert: &Certificate| {
            Err(SecmodError::native_detail(code, cert.subject().to_string()))
        };

        // A trusted self-signed leaf anchors itself.
        let own = certdb.trust(self).anchored_usages();
        if self.is_self_signed() {
            if own.is_empty() {
                return fail(SEC_ERROR_UNTRUSTED_ISSUER, self);
            }
            if check_sig && !self.is_signed_by(self) {
                return fail(SEC_ERROR_BAD_SIGNATURE, self);
            }
            return Ok(own);
        }

        let mut child = self.clone();
        // CA certificates below the current issuer, for pathLenConstraint.
        let mut intermediates: u32 = 0;
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(issuer) = certdb.find_issuer(&child) else {
                return fail(SEC_ERROR_UNKNOWN_ISSUER, &child);
            };
            if !issuer.valid_at(now) {
                return fail(SEC_ERROR_EXPIRED_ISSUER_CERTIFICATE, &issuer);
            }
            if !issuer.is_ca() {
                return fail(SEC_ERROR_CA_CERT_INVALID, &issuer);
            }
            if issuer
                .path_len_constraint()
                .is_some_and(|limit| intermediates > limit)
            {
                return fail(SEC_ERROR_PATH_LEN_CONSTRAINT_INVALID, &issuer);
            }
            if check_sig && !child.is_signed_by(&issuer) {
                return fail(SEC_ERROR_BAD_SIGNATURE, &child);
            }

            let anchored = certdb.trust(&issuer).anchored_usages();
            if !anchored.is_empty() {
                return Ok(anchored);
            }
            if issuer.is_self_signed() {
                return fail(SEC_ERROR_UNTRUSTED_ISSUER, &issuer);
            }
            if issuer.subject_raw() != issuer.issuer_raw() {
                intermediates += 1;
            }
            child = issuer;
        }
        fail(SEC_ERROR_UNKNOWN_ISSUER, &child)
    }
}

fn build_inner(x509: &X509Certificate<'_>, der: Vec<u8>) -> Result<CertInner, SecmodError> {
    let raw_version = x509.version().0;
    if raw_version > 2 {
        return Err(SecmodError::ParseError(format!(
            "unsupported X.509 version {} (expected v1, v2, or v3)",
            raw_version + 1
        )));
    }

    let basic = x509.basic_constraints().ok().flatten().map(|bc| bc.value);

    let key_usage = x509.key_usage().ok().flatten().map(|ku| {
        let ku = ku.value;
        let mut bits = KeyUsage::empty();
        bits.set(KeyUsage::DIGITAL_SIGNATURE, ku.digital_signature());
        bits.set(KeyUsage::NON_REPUDIATION, ku.non_repudiation());
        bits.set(KeyUsage::KEY_ENCIPHERMENT, ku.key_encipherment());
        bits.set(KeyUsage::DATA_ENCIPHERMENT, ku.data_encipherment());
        bits.set(KeyUsage::KEY_AGREEMENT, ku.key_agreement());
        bits.set(KeyUsage::KEY_CERT_SIGN, ku.key_cert_sign());
        bits.set(KeyUsage::CRL_SIGN, ku.crl_sign());
        bits
    });

    let ext_key_usage = x509.extended_key_usage().ok().flatten().map(|eku| {
        let eku = eku.value;
        let mut bits = ExtKeyUsage::empty();
        bits.set(ExtKeyUsage::ANY, eku.any);
        bits.set(ExtKeyUsage::SERVER_AUTH, eku.server_auth);
        bits.set(ExtKeyUsage::CLIENT_AUTH, eku.client_auth);
        bits.set(ExtKeyUsage::CODE_SIGNING, eku.code_signing);
        bits.set(ExtKeyUsage::EMAIL_PROTECTION, eku.email_protection);
        bits.set(ExtKeyUsage::TIME_STAMPING, eku.time_stamping);
        bits.set(ExtKeyUsage::OCSP_SIGNING, eku.ocsp_signing);
        bits
    });

    let mut ns_cert_type = None;
    for ext in x509.extensions() {
        if let ParsedExtension::NSCertType(t) = ext.parsed_extension() {
            let mut bits = NsCertType::empty();
            bits.set(NsCertType::SSL_CLIENT, t.ssl_client());
            bits.set(NsCertType::SSL_SERVER, t.ssl_server());
            bits.set(NsCertType::EMAIL, t.smime());
            bits.set(NsCertType::OBJECT_SIGNING, t.object_signing());
            bits.set(NsCertType::SSL_CA, t.ssl_ca());
            bits.set(NsCertType::EMAIL_CA, t.smime_ca());
            bits.set(NsCertType::OBJECT_SIGNING_CA, t.object_signing_ca());
            ns_cert_type = Some(bits);
        }
    }

    let mut san_dns = Vec::new();
    let mut san_ips = Vec::new();
    let san_malformed = match x509.subject_alternative_name() {
        Ok(Some(san)) => {
            for gn in &san.value.general_names {
                match gn {
                    GeneralName::DNSName(name) => san_dns.push(name.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            san_ips.push(ip);
                        }
                    }
                    _ => {}
                }
            }
            false
        }
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(error = %e, "malformed subjectAltName");
            true
        }
    };

    let self_signed = x509.subject().as_raw() == x509.issuer().as_raw()
        && x509.verify_signature(None).is_ok();

    Ok(CertInner {
        der,
        version: raw_version + 1,
        serial: x509.tbs_certificate.raw_serial().to_vec(),
        subject: Dn::from_x509(x509.subject()),
        issuer: Dn::from_x509(x509.issuer()),
        subject_raw: x509.subject().as_raw().to_vec(),
        issuer_raw: x509.issuer().as_raw().to_vec(),
        not_before: x509.validity().not_before.to_datetime(),
        not_after: x509.validity().not_after.to_datetime(),
        is_ca: basic.is_some_and(|bc| bc.ca),
        path_len: basic.and_then(|bc| bc.path_len_constraint),
        key_usage,
        ext_key_usage,
        ns_cert_type,
        san_dns,
        san_ips,
        san_malformed,
        self_signed,
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Owning handle to a PKCS#8 private key. Zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey {
    der: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("len", &self.der.len())
            .finish()
    }
}

impl PrivateKey {
    /// Wrap PKCS#8 `PrivateKeyInfo` DER.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, SecmodError> {
        // PrivateKeyInfo is a SEQUENCE.
        if der.first() != Some(&0x30) {
            return Err(SecmodError::native_detail(SEC_ERROR_BAD_KEY, "not a PKCS#8 structure"));
        }
        Ok(PrivateKey {
            der: Zeroizing::new(der.to_vec()),
        })
    }

    /// Decode a `PRIVATE KEY` PEM block.
    pub fn from_pem(input: &[u8]) -> Result<Self, SecmodError> {
        let blocks = util::pem_blocks(input)?;
        let (_, der) = blocks
            .iter()
            .find(|(label, _)| label == "PRIVATE KEY")
            .ok_or_else(|| SecmodError::PemError("no PRIVATE KEY block".into()))?;
        PrivateKey::from_pkcs8_der(der)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(util::der_to_pem(&self.der, "PRIVATE KEY"))
    }
}
