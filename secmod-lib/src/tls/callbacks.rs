//! Socket callbacks and the rustls seams that invoke them.
//!
//! The auth-certificate and client-auth-data callbacks live in a
//! [`CallbackSlots`] shared between a socket and the verifier/resolver
//! objects handed to rustls. Callback failures (errors and panics) stop at
//! this boundary: they are logged, stored as the socket's last callback
//! error, and turned into a rejection.

use crate::cert::{CertUsage, Certificate, PrivateKey};
use crate::certdb::{CertDb, NicknameKind};
use crate::context::PinArg;
use crate::name::Dn;
use crate::revocation;
use crate::SecmodError;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::sign::CertifiedKey;
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Name};
use zeroize::Zeroizing;

/// What an auth-certificate callback gets to look at.
pub struct PeerAuth<'a> {
    /// The peer's end-entity certificate.
    pub certificate: &'a Certificate,
    /// Further certificates the peer presented.
    pub presented_chain: &'a [Certificate],
    /// Hostname configured on the local socket, if any.
    pub hostname: Option<&'a str>,
    pub pin_arg: Option<&'a PinArg>,
}

/// Decides whether the peer certificate is acceptable. Arguments after the
/// peer are `check_sig` and `is_server` (true when the local socket is the
/// server validating a client).
pub type AuthCertificateCallback =
    Arc<dyn Fn(&PeerAuth<'_>, bool, bool) -> Result<bool, SecmodError> + Send + Sync>;

/// Picks a client certificate given the CA names the server accepts.
/// `Ok(None)` means no certificate will be offered.
pub type ClientAuthDataCallback = Arc<
    dyn Fn(&[Dn], Option<&PinArg>) -> Result<Option<(Certificate, PrivateKey)>, SecmodError>
        + Send
        + Sync,
>;

/// Invoked once when a handshake completes.
pub type HandshakeCallback = Box<dyn FnMut(&super::SslSocket) + Send>;

/// Callback state shared between a socket and its rustls seams.
#[derive(Default)]
pub(crate) struct CallbackSlots {
    pub(crate) auth_certificate: Mutex<Option<AuthCertificateCallback>>,
    pub(crate) client_auth_data: Mutex<Option<ClientAuthDataCallback>>,
    pub(crate) hostname: Mutex<Option<String>>,
    pub(crate) pin_arg: Mutex<Option<PinArg>>,
    pub(crate) certdb: Mutex<Option<CertDb>>,
    pub(crate) peer_chain: Mutex<Vec<Certificate>>,
    pub(crate) last_error: Mutex<Option<String>>,
}

impl CallbackSlots {
    /// Slots for a socket accepted from `parent`: the auth callback, pin
    /// argument and database carry over.
    pub(crate) fn inherit(parent: &CallbackSlots) -> Self {
        CallbackSlots {
            auth_certificate: Mutex::new(parent.auth_certificate.lock().clone()),
            pin_arg: Mutex::new(parent.pin_arg.lock().clone()),
            certdb: Mutex::new(parent.certdb.lock().clone()),
            ..CallbackSlots::default()
        }
    }

    fn record_failure(&self, what: &str, message: String) {
        tracing::error!(callback = what, error = %message, "callback failed; rejecting");
        *self.last_error.lock() = Some(message);
    }

    /// Run the auth-certificate callback (or the database default) on a
    /// presented chain. Any failure counts as rejection.
    fn authenticate_peer(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        is_server: bool,
    ) -> bool {
        let certificate = match Certificate::from_der(end_entity.as_ref()) {
            Ok(c) => c,
            Err(e) => {
                self.record_failure("auth_certificate", format!("undecodable peer certificate: {}", e));
                return false;
            }
        };
        let presented_chain: Vec<Certificate> = intermediates
            .iter()
            .filter_map(|der| Certificate::from_der(der.as_ref()).ok())
            .collect();
        {
            let mut chain = self.peer_chain.lock();
            chain.clear();
            chain.push(certificate.clone());
            chain.extend(presented_chain.iter().cloned());
        }

        let callback = self.auth_certificate.lock().clone().or_else(|| {
            self.certdb
                .lock()
                .clone()
                .map(auth_certificate_callback)
        });
        let Some(callback) = callback else {
            self.record_failure("auth_certificate", "no callback and no certificate database".into());
            return false;
        };

        let hostname = self.hostname.lock().clone();
        let pin_arg = self.pin_arg.lock().clone();
        let info = PeerAuth {
            certificate: &certificate,
            presented_chain: &presented_chain,
            hostname: hostname.as_deref(),
            pin_arg: pin_arg.as_ref(),
        };
        match catch_unwind(AssertUnwindSafe(|| callback(&info, true, is_server))) {
            Ok(Ok(accepted)) => {
                tracing::debug!(accepted, is_server, subject = %certificate.subject(), "peer certificate checked");
                accepted
            }
            Ok(Err(e)) => {
                self.record_failure("auth_certificate", e.to_string());
                false
            }
            Err(panic) => {
                self.record_failure("auth_certificate", panic_message(panic.as_ref()));
                false
            }
        }
    }

    /// Run the client-auth-data callback for the given CA hints.
    fn select_client_identity(&self, ca_names: &[Dn]) -> Option<(Certificate, PrivateKey)> {
        let callback = self.client_auth_data.lock().clone()?;
        let pin_arg = self.pin_arg.lock().clone();
        match catch_unwind(AssertUnwindSafe(|| callback(ca_names, pin_arg.as_ref()))) {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                self.record_failure("client_auth_data", e.to_string());
                None
            }
            Err(panic) => {
                self.record_failure("client_auth_data", panic_message(panic.as_ref()));
                None
            }
        }
    }

    /// Certificate chain to present for `leaf`: the leaf plus any issuers
    /// found in the database, stopping before a self-signed root.
    pub(crate) fn chain_for(&self, leaf: &Certificate) -> Vec<CertificateDer<'static>> {
        let mut chain = vec![CertificateDer::from(leaf.der().to_vec())];
        if let Some(db) = self.certdb.lock().clone() {
            let mut current = leaf.clone();
            for _ in 0..8 {
                match db.find_issuer(&current) {
                    Some(issuer) if !issuer.is_self_signed() => {
                        chain.push(CertificateDer::from(issuer.der().to_vec()));
                        current = issuer;
                    }
                    _ => break,
                }
            }
        }
        chain
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("callback panicked: {}", s)
    } else {
        "callback panicked".to_string()
    }
}

pub(crate) fn private_key_der(key: &PrivateKey) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.der().to_vec()))
}

/// Parse a CA name hint sent by a server. Hints normally carry the full
/// Name SEQUENCE; bare RDN sequences are wrapped first.
fn dn_from_hint(hint: &[u8]) -> Option<Dn> {
    if let Ok((_, name)) = X509Name::from_der(hint) {
        return Some(Dn::from_x509(&name));
    }
    let mut wrapped = vec![0x30];
    let len = hint.len();
    if len < 0x80 {
        wrapped.push(u8::try_from(len).ok()?);
    } else if len <= 0xFF {
        wrapped.extend_from_slice(&[0x81, u8::try_from(len).ok()?]);
    } else {
        let len = u16::try_from(len).ok()?;
        wrapped.push(0x82);
        wrapped.extend_from_slice(&len.to_be_bytes());
    }
    wrapped.extend_from_slice(hint);
    X509Name::from_der(&wrapped)
        .ok()
        .map(|(_, name)| Dn::from_x509(&name))
}

// ─── rustls seams ───────────────────────────────────────────────────────

/// Client-side verifier: hands the server's chain to the auth callback.
pub(crate) struct CallbackServerVerifier {
    pub(crate) slots: Arc<CallbackSlots>,
    pub(crate) provider: Arc<CryptoProvider>,
}

impl fmt::Debug for CallbackServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackServerVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for CallbackServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if !self.slots.authenticate_peer(end_entity, intermediates, false) {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }
        match Certificate::from_der(end_entity.as_ref()) {
            Ok(cert) if revocation::status_acceptable(&cert, ocsp_response) => {
                Ok(ServerCertVerified::assertion())
            }
            Ok(_) => Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownRevocationStatus,
            )),
            Err(_) => Err(rustls::Error::InvalidCertificate(CertificateError::BadEncoding)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server-side verifier: requests client certificates and hands them to the
/// auth callback.
pub(crate) struct CallbackClientVerifier {
    pub(crate) slots: Arc<CallbackSlots>,
    pub(crate) provider: Arc<CryptoProvider>,
    pub(crate) mandatory: bool,
    pub(crate) hints: Vec<DistinguishedName>,
}

impl fmt::Debug for CallbackClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackClientVerifier")
            .field("mandatory", &self.mandatory)
            .field("hints", &self.hints.len())
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for CallbackClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.slots.authenticate_peer(end_entity, intermediates, true) {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client certificate resolver backed by the client-auth-data callback.
pub(crate) struct CallbackClientResolver {
    pub(crate) slots: Arc<CallbackSlots>,
}

impl fmt::Debug for CallbackClientResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackClientResolver").finish_non_exhaustive()
    }
}

impl ResolvesClientCert for CallbackClientResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let ca_names: Vec<Dn> = root_hint_subjects
            .iter()
            .filter_map(|hint| dn_from_hint(hint))
            .collect();
        let (cert, key) = self.slots.select_client_identity(&ca_names)?;
        let signing_key = match rustls::crypto::ring::sign::any_supported_type(&private_key_der(&key)) {
            Ok(k) => k,
            Err(e) => {
                self.slots
                    .record_failure("client_auth_data", format!("unusable client key: {}", e));
                return None;
            }
        };
        tracing::debug!(subject = %cert.subject(), "offering client certificate");
        Some(Arc::new(CertifiedKey::new(
            self.slots.chain_for(&cert),
            signing_key,
        )))
    }

    fn has_certs(&self) -> bool {
        self.slots.client_auth_data.lock().is_some()
    }
}

// ─── Reference callbacks ────────────────────────────────────────────────

/// Standard peer check against `certdb`.
///
/// The peer certificate must verify for SSL client use when the local side
/// is the server, or SSL server use when it is the client. A client also
/// requires the configured hostname to match; without one the check fails.
pub fn auth_certificate_callback(certdb: CertDb) -> AuthCertificateCallback {
    Arc::new(move |peer: &PeerAuth<'_>, check_sig: bool, is_server: bool| {
        let intended = if is_server {
            CertUsage::SSL_CLIENT
        } else {
            CertUsage::SSL_SERVER
        };
        let approved = peer.certificate.verify_now(&certdb, check_sig, intended)?;
        if !approved.intersects(intended) {
            return Ok(false);
        }
        if is_server {
            return Ok(true);
        }
        match peer.hostname {
            Some(host) => {
                let matched = peer.certificate.verify_hostname(host)?;
                if !matched {
                    tracing::warn!(host, subject = %peer.certificate.subject(), "hostname mismatch");
                }
                Ok(matched)
            }
            None => {
                tracing::warn!("no hostname configured; cannot check server certificate name");
                Ok(false)
            }
        }
    })
}

/// Standard client certificate selection from `certdb`.
///
/// With a `nickname`, that certificate and its key are offered (or
/// nothing, if either is missing). Otherwise the first user certificate
/// that is valid now and whose chain reaches one of the server's accepted
/// CA names is chosen; a server naming no CAs accepts any of them. A `password` unlocks the key slot directly instead
/// of going through the password callback.
pub fn client_auth_data_callback(
    certdb: CertDb,
    nickname: Option<String>,
    password: Option<String>,
) -> ClientAuthDataCallback {
    let password = password.map(Zeroizing::new);
    Arc::new(move |ca_names: &[Dn], pin_arg: Option<&PinArg>| {
        if let Some(password) = &password {
            let slot = certdb.internal_key_slot();
            if !slot.is_logged_in() {
                slot.login(password)?;
            }
        }
        if let Some(nickname) = &nickname {
            let cert = certdb.find_cert_from_nickname(nickname)?;
            let key = certdb.find_key_by_any_cert(&cert, pin_arg)?;
            return Ok(Some((cert, key)));
        }

        for nickname in certdb.get_cert_nicknames(NicknameKind::User) {
            let Ok(cert) = certdb.find_cert_from_nickname(&nickname) else {
                continue;
            };
            if cert.check_valid_times().is_err() {
                tracing::debug!(%nickname, "skipping client certificate outside validity period");
                continue;
            }
            if !ca_names.is_empty() && !signer_accepted(&certdb, &cert, ca_names) {
                tracing::debug!(%nickname, "skipping client certificate not issued by an accepted CA");
                continue;
            }
            match certdb.find_key_by_any_cert(&cert, pin_arg) {
                Ok(key) => return Ok(Some((cert, key))),
                Err(e) => tracing::debug!(%nickname, error = %e, "no usable key for client certificate"),
            }
        }
        Ok(None)
    })
}

/// Whether `cert` or any issuer above it in `certdb` was signed by one of
/// `ca_names`.
fn signer_accepted(certdb: &CertDb, cert: &Certificate, ca_names: &[Dn]) -> bool {
    let mut current = cert.clone();
    for _ in 0..8 {
        if current.has_signer_in_ca_names(ca_names) {
            return true;
        }
        match certdb.find_issuer(&current) {
            Some(issuer) if issuer != current => current = issuer,
            _ => return false,
        }
    }
    false
}
