//! Native error codes.
//!
//! Every failure that originates in the security layer (certificate
//! verification, key database, PKCS#12, transport) carries one of these
//! codes together with its symbolic name and a human-readable description.
//! Numbering follows the NSPR/NSS families:
//!
//! * `PR_*`: transport and I/O (base -6000)
//! * `SEC_*`: certificates, keys, PKCS#12 (base -8192)
//! * `SSL_*`: TLS handshake (base -12288)

use std::fmt;

/// A coded failure reported by the security layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    /// Numeric error code (always negative).
    pub code: i32,
    /// Symbolic name, e.g. `SEC_ERROR_EXPIRED_CERTIFICATE`.
    pub name: &'static str,
    /// Human-readable description of the code.
    pub description: &'static str,
    /// Optional context added by the caller (subject, nickname, address...).
    pub detail: Option<String>,
}

impl NativeError {
    /// Build an error for `code`. Unknown codes keep their number and get a
    /// generic name and description.
    pub fn new(code: i32) -> Self {
        let (name, description) = lookup(code).unwrap_or(("UNKNOWN_ERROR", "Unknown error code"));
        NativeError {
            code,
            name,
            description,
            detail: None,
        }
    }

    /// Attach context to the error.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.name, self.description)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for NativeError {}

// ── Transport / I/O ──────────────────────────────────────────────────────

pub const PR_WOULD_BLOCK_ERROR: i32 = -5998;
pub const PR_IO_ERROR: i32 = -5991;
pub const PR_IO_TIMEOUT_ERROR: i32 = -5990;
pub const PR_INVALID_ARGUMENT_ERROR: i32 = -5987;
pub const PR_ADDRESS_NOT_AVAILABLE_ERROR: i32 = -5986;
pub const PR_IS_CONNECTED_ERROR: i32 = -5984;
pub const PR_ADDRESS_IN_USE_ERROR: i32 = -5982;
pub const PR_CONNECT_REFUSED_ERROR: i32 = -5981;
pub const PR_NETWORK_UNREACHABLE_ERROR: i32 = -5980;
pub const PR_NOT_CONNECTED_ERROR: i32 = -5978;
pub const PR_BUFFER_OVERFLOW_ERROR: i32 = -5962;
pub const PR_CONNECT_RESET_ERROR: i32 = -5961;
pub const PR_FILE_NOT_FOUND_ERROR: i32 = -5950;
pub const PR_END_OF_FILE_ERROR: i32 = -5938;
pub const PR_INVALID_STATE_ERROR: i32 = -5931;

// ── Certificates, keys, PKCS#12 ─────────────────────────────────────────

pub const SEC_ERROR_IO: i32 = -8192;
pub const SEC_ERROR_LIBRARY_FAILURE: i32 = -8191;
pub const SEC_ERROR_BAD_DATA: i32 = -8190;
pub const SEC_ERROR_INPUT_LEN: i32 = -8188;
pub const SEC_ERROR_INVALID_ARGS: i32 = -8187;
pub const SEC_ERROR_INVALID_ALGORITHM: i32 = -8186;
pub const SEC_ERROR_INVALID_AVA: i32 = -8185;
pub const SEC_ERROR_BAD_DER: i32 = -8183;
pub const SEC_ERROR_BAD_SIGNATURE: i32 = -8182;
pub const SEC_ERROR_EXPIRED_CERTIFICATE: i32 = -8181;
pub const SEC_ERROR_UNKNOWN_ISSUER: i32 = -8179;
pub const SEC_ERROR_BAD_KEY: i32 = -8178;
pub const SEC_ERROR_BAD_PASSWORD: i32 = -8177;
pub const SEC_ERROR_BAD_DATABASE: i32 = -8174;
pub const SEC_ERROR_UNTRUSTED_ISSUER: i32 = -8172;
pub const SEC_ERROR_UNTRUSTED_CERT: i32 = -8171;
pub const SEC_ERROR_DUPLICATE_CERT_NAME: i32 = -8169;
pub const SEC_ERROR_NO_KEY: i32 = -8166;
pub const SEC_ERROR_EXPIRED_ISSUER_CERTIFICATE: i32 = -8162;
pub const SEC_ERROR_CA_CERT_INVALID: i32 = -8156;
pub const SEC_ERROR_PATH_LEN_CONSTRAINT_INVALID: i32 = -8155;
pub const SEC_ERROR_INADEQUATE_KEY_USAGE: i32 = -8102;
pub const SEC_ERROR_INADEQUATE_CERT_TYPE: i32 = -8101;
pub const SEC_ERROR_PKCS12_DECODING_PFX: i32 = -8099;
pub const SEC_ERROR_PKCS12_INVALID_MAC: i32 = -8098;
pub const SEC_ERROR_PKCS12_CORRUPT_PFX_STRUCTURE: i32 = -8095;
pub const SEC_ERROR_PKCS12_UNSUPPORTED_PBE_ALGORITHM: i32 = -8094;
pub const SEC_ERROR_PKCS12_PRIVACY_PASSWORD_INCORRECT: i32 = -8092;
pub const SEC_ERROR_PKCS12_CERT_COLLISION: i32 = -8091;
pub const SEC_ERROR_PKCS12_UNABLE_TO_IMPORT_KEY: i32 = -8083;
pub const SEC_ERROR_PKCS12_UNSUPPORTED_BAG_TYPE: i32 = -8080;
pub const SEC_ERROR_PKCS12_UNABLE_TO_EXPORT_KEY: i32 = -8076;
pub const SEC_ERROR_READ_ONLY: i32 = -8070;
pub const SEC_ERROR_OCSP_NOT_ENABLED: i32 = -8061;
pub const SEC_ERROR_OCSP_NO_DEFAULT_RESPONDER: i32 = -8060;
pub const SEC_ERROR_UNRECOGNIZED_OID: i32 = -8049;
pub const SEC_ERROR_TOKEN_NOT_LOGGED_IN: i32 = -8037;
pub const SEC_ERROR_NOT_INITIALIZED: i32 = -8038;

// ── TLS handshake ────────────────────────────────────────────────────────

pub const SSL_ERROR_NO_CYPHER_OVERLAP: i32 = -12286;
pub const SSL_ERROR_NO_CERTIFICATE: i32 = -12285;
pub const SSL_ERROR_BAD_CERTIFICATE: i32 = -12284;
pub const SSL_ERROR_UNSUPPORTED_VERSION: i32 = -12279;
pub const SSL_ERROR_BAD_CERT_DOMAIN: i32 = -12276;
pub const SSL_ERROR_BAD_MAC_READ: i32 = -12273;
pub const SSL_ERROR_BAD_CERT_ALERT: i32 = -12271;
pub const SSL_ERROR_HANDSHAKE_FAILURE_ALERT: i32 = -12227;
pub const SSL_ERROR_HANDSHAKE_NOT_COMPLETED: i32 = -12202;
pub const SSL_ERROR_RX_MALFORMED_HANDSHAKE: i32 = -12259;

const TABLE: &[(i32, &str, &str)] = &[
    (PR_WOULD_BLOCK_ERROR, "PR_WOULD_BLOCK_ERROR", "The operation would have blocked"),
    (PR_IO_ERROR, "PR_IO_ERROR", "I/O function error"),
    (PR_IO_TIMEOUT_ERROR, "PR_IO_TIMEOUT_ERROR", "I/O operation timed out"),
    (PR_INVALID_ARGUMENT_ERROR, "PR_INVALID_ARGUMENT_ERROR", "Invalid function argument"),
    (PR_ADDRESS_NOT_AVAILABLE_ERROR, "PR_ADDRESS_NOT_AVAILABLE_ERROR", "Network address not available (in use?)"),
    (PR_IS_CONNECTED_ERROR, "PR_IS_CONNECTED_ERROR", "Already connected"),
    (PR_ADDRESS_IN_USE_ERROR, "PR_ADDRESS_IN_USE_ERROR", "Local Network address is in use"),
    (PR_CONNECT_REFUSED_ERROR, "PR_CONNECT_REFUSED_ERROR", "Connection refused by peer"),
    (PR_NETWORK_UNREACHABLE_ERROR, "PR_NETWORK_UNREACHABLE_ERROR", "Network address is presently unreachable"),
    (PR_NOT_CONNECTED_ERROR, "PR_NOT_CONNECTED_ERROR", "Network file descriptor is not connected"),
    (PR_BUFFER_OVERFLOW_ERROR, "PR_BUFFER_OVERFLOW_ERROR", "The value requested is too large to be stored in the data buffer provided"),
    (PR_CONNECT_RESET_ERROR, "PR_CONNECT_RESET_ERROR", "TCP connection reset by peer"),
    (PR_FILE_NOT_FOUND_ERROR, "PR_FILE_NOT_FOUND_ERROR", "File not found"),
    (PR_END_OF_FILE_ERROR, "PR_END_OF_FILE_ERROR", "Encountered end of file"),
    (PR_INVALID_STATE_ERROR, "PR_INVALID_STATE_ERROR", "Object state improper for request"),
    (SEC_ERROR_IO, "SEC_ERROR_IO", "An I/O error occurred during security authorization."),
    (SEC_ERROR_LIBRARY_FAILURE, "SEC_ERROR_LIBRARY_FAILURE", "security library failure."),
    (SEC_ERROR_BAD_DATA, "SEC_ERROR_BAD_DATA", "security library: received bad data."),
    (SEC_ERROR_INPUT_LEN, "SEC_ERROR_INPUT_LEN", "security library: input length error."),
    (SEC_ERROR_INVALID_ARGS, "SEC_ERROR_INVALID_ARGS", "security library: invalid arguments."),
    (SEC_ERROR_INVALID_ALGORITHM, "SEC_ERROR_INVALID_ALGORITHM", "security library: invalid algorithm."),
    (SEC_ERROR_INVALID_AVA, "SEC_ERROR_INVALID_AVA", "security library: invalid AVA."),
    (SEC_ERROR_BAD_DER, "SEC_ERROR_BAD_DER", "security library: improperly formatted DER-encoded message."),
    (SEC_ERROR_BAD_SIGNATURE, "SEC_ERROR_BAD_SIGNATURE", "Peer's certificate has an invalid signature."),
    (SEC_ERROR_EXPIRED_CERTIFICATE, "SEC_ERROR_EXPIRED_CERTIFICATE", "Peer's Certificate has expired."),
    (SEC_ERROR_UNKNOWN_ISSUER, "SEC_ERROR_UNKNOWN_ISSUER", "Peer's Certificate issuer is not recognized."),
    (SEC_ERROR_BAD_KEY, "SEC_ERROR_BAD_KEY", "Peer's public key is invalid."),
    (SEC_ERROR_BAD_PASSWORD, "SEC_ERROR_BAD_PASSWORD", "The security password entered is incorrect."),
    (SEC_ERROR_BAD_DATABASE, "SEC_ERROR_BAD_DATABASE", "security library: bad database."),
    (SEC_ERROR_UNTRUSTED_ISSUER, "SEC_ERROR_UNTRUSTED_ISSUER", "Peer's certificate issuer has been marked as not trusted by the user."),
    (SEC_ERROR_UNTRUSTED_CERT, "SEC_ERROR_UNTRUSTED_CERT", "Peer's certificate has been marked as not trusted by the user."),
    (SEC_ERROR_DUPLICATE_CERT_NAME, "SEC_ERROR_DUPLICATE_CERT_NAME", "Certificate nickname already in use."),
    (SEC_ERROR_NO_KEY, "SEC_ERROR_NO_KEY", "The private key for this certificate cannot be found in key database"),
    (SEC_ERROR_EXPIRED_ISSUER_CERTIFICATE, "SEC_ERROR_EXPIRED_ISSUER_CERTIFICATE", "The certificate issuer's certificate has expired."),
    (SEC_ERROR_CA_CERT_INVALID, "SEC_ERROR_CA_CERT_INVALID", "Issuer certificate is invalid."),
    (SEC_ERROR_PATH_LEN_CONSTRAINT_INVALID, "SEC_ERROR_PATH_LEN_CONSTRAINT_INVALID", "Certificate path length constraint is invalid."),
    (SEC_ERROR_INADEQUATE_KEY_USAGE, "SEC_ERROR_INADEQUATE_KEY_USAGE", "Certificate key usage inadequate for attempted operation."),
    (SEC_ERROR_INADEQUATE_CERT_TYPE, "SEC_ERROR_INADEQUATE_CERT_TYPE", "Certificate type not approved for application."),
    (SEC_ERROR_PKCS12_DECODING_PFX, "SEC_ERROR_PKCS12_DECODING_PFX", "Unable to import.  Decoding error.  File not valid."),
    (SEC_ERROR_PKCS12_INVALID_MAC, "SEC_ERROR_PKCS12_INVALID_MAC", "Unable to import.  Invalid MAC.  Incorrect password or corrupt file."),
    (SEC_ERROR_PKCS12_CORRUPT_PFX_STRUCTURE, "SEC_ERROR_PKCS12_CORRUPT_PFX_STRUCTURE", "Unable to import.  File structure is corrupt."),
    (SEC_ERROR_PKCS12_UNSUPPORTED_PBE_ALGORITHM, "SEC_ERROR_PKCS12_UNSUPPORTED_PBE_ALGORITHM", "Unable to import.  Encryption algorithm not supported."),
    (SEC_ERROR_PKCS12_PRIVACY_PASSWORD_INCORRECT, "SEC_ERROR_PKCS12_PRIVACY_PASSWORD_INCORRECT", "Unable to import.  Incorrect privacy password."),
    (SEC_ERROR_PKCS12_CERT_COLLISION, "SEC_ERROR_PKCS12_CERT_COLLISION", "Unable to import.  Same nickname already exists in database."),
    (SEC_ERROR_PKCS12_UNABLE_TO_IMPORT_KEY, "SEC_ERROR_PKCS12_UNABLE_TO_IMPORT_KEY", "Unable to import.  Error attempting to import private key."),
    (SEC_ERROR_PKCS12_UNSUPPORTED_BAG_TYPE, "SEC_ERROR_PKCS12_UNSUPPORTED_BAG_TYPE", "Unable to import.  Unsupported bag type."),
    (SEC_ERROR_PKCS12_UNABLE_TO_EXPORT_KEY, "SEC_ERROR_PKCS12_UNABLE_TO_EXPORT_KEY", "Unable to export.  Private Key could not be located and exported."),
    (SEC_ERROR_READ_ONLY, "SEC_ERROR_READ_ONLY", "The certificate/key database is in read-only mode."),
    (SEC_ERROR_OCSP_NOT_ENABLED, "SEC_ERROR_OCSP_NOT_ENABLED", "Cannot find OCSP responder: OCSP is not enabled."),
    (SEC_ERROR_OCSP_NO_DEFAULT_RESPONDER, "SEC_ERROR_OCSP_NO_DEFAULT_RESPONDER", "OCSP default responder has not been set."),
    (SEC_ERROR_UNRECOGNIZED_OID, "SEC_ERROR_UNRECOGNIZED_OID", "Unrecognized Object Identifier."),
    (SEC_ERROR_TOKEN_NOT_LOGGED_IN, "SEC_ERROR_TOKEN_NOT_LOGGED_IN", "The operation failed because the PKCS#11 token is not logged in."),
    (SEC_ERROR_NOT_INITIALIZED, "SEC_ERROR_NOT_INITIALIZED", "NSS is not initialized."),
    (SSL_ERROR_NO_CYPHER_OVERLAP, "SSL_ERROR_NO_CYPHER_OVERLAP", "Cannot communicate securely with peer: no common encryption algorithm(s)."),
    (SSL_ERROR_NO_CERTIFICATE, "SSL_ERROR_NO_CERTIFICATE", "Unable to find the certificate or key necessary for authentication."),
    (SSL_ERROR_BAD_CERTIFICATE, "SSL_ERROR_BAD_CERTIFICATE", "Unable to communicate securely with peer: peers's certificate was rejected."),
    (SSL_ERROR_UNSUPPORTED_VERSION, "SSL_ERROR_UNSUPPORTED_VERSION", "Peer using unsupported version of security protocol."),
    (SSL_ERROR_BAD_CERT_DOMAIN, "SSL_ERROR_BAD_CERT_DOMAIN", "Unable to communicate securely with peer: requested domain name does not match the server's certificate."),
    (SSL_ERROR_BAD_MAC_READ, "SSL_ERROR_BAD_MAC_READ", "SSL received a record with an incorrect Message Authentication Code."),
    (SSL_ERROR_BAD_CERT_ALERT, "SSL_ERROR_BAD_CERT_ALERT", "SSL peer cannot verify your certificate."),
    (SSL_ERROR_HANDSHAKE_FAILURE_ALERT, "SSL_ERROR_HANDSHAKE_FAILURE_ALERT", "SSL peer was unable to negotiate an acceptable set of security parameters."),
    (SSL_ERROR_HANDSHAKE_NOT_COMPLETED, "SSL_ERROR_HANDSHAKE_NOT_COMPLETED", "Cannot initiate another SSL handshake until current handshake is complete."),
    (SSL_ERROR_RX_MALFORMED_HANDSHAKE, "SSL_ERROR_RX_MALFORMED_HANDSHAKE", "SSL received a malformed Handshake record."),
];

/// Look up the symbolic name and description of an error code.
pub fn lookup(code: i32) -> Option<(&'static str, &'static str)> {
    TABLE
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, desc)| (*name, *desc))
}

/// Symbolic name of an error code, or `None` if it is not in the table.
pub fn error_name(code: i32) -> Option<&'static str> {
    lookup(code).map(|(name, _)| name)
}

/// Map an I/O error from the transport onto the closest `PR_*` code.
pub fn from_io_kind(kind: std::io::ErrorKind) -> i32 {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => PR_IO_TIMEOUT_ERROR,
        ErrorKind::ConnectionRefused => PR_CONNECT_REFUSED_ERROR,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => PR_CONNECT_RESET_ERROR,
        ErrorKind::NotConnected => PR_NOT_CONNECTED_ERROR,
        ErrorKind::AddrInUse => PR_ADDRESS_IN_USE_ERROR,
        ErrorKind::AddrNotAvailable => PR_ADDRESS_NOT_AVAILABLE_ERROR,
        ErrorKind::NotFound => PR_FILE_NOT_FOUND_ERROR,
        ErrorKind::UnexpectedEof => PR_END_OF_FILE_ERROR,
        ErrorKind::InvalidInput => PR_INVALID_ARGUMENT_ERROR,
        _ => PR_IO_ERROR,
    }
}
