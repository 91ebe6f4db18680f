//! secmod-lib: certificate names, crypto contexts, TLS sockets and PKCS#12.
//!
//! Provides a distinguished-name model with OID resolution, streaming digest
//! and cipher contexts, certificate/key handles backed by a small on-disk
//! database, a callback-driven TLS socket, OCSP settings, and a PKCS#12
//! decoder.

pub mod cert;
pub mod certdb;
pub mod cipher;
pub mod context;
pub mod digest;
pub mod errcode;
pub mod name;
pub mod oid;
pub mod pkcs12;
pub mod revocation;
pub mod tls;
mod util;

pub use cert::{CertUsage, Certificate, PrivateKey};
pub use certdb::{CertDb, CertTrust, KeySlot, NicknameKind, OpenMode, TrustFlags};
pub use cipher::{CipherContext, IvParam, Mechanism, Operation, SymKey};
pub use context::{InitOptions, PasswordCallback};
pub use digest::{
    hash_buf, md5_digest, sha1_digest, sha256_digest, sha384_digest, sha512_digest,
    DigestContext,
};
pub use errcode::NativeError;
pub use name::{Ava, Dn, DnSource, Rdn};
pub use oid::{OidTag, OidToken};
pub use pkcs12::{pkcs12_export, AlgorithmId, BagType, Pkcs12Bag, Pkcs12Decoder, Pkcs12Source};
pub use revocation::{OcspCacheSize, OcspFailureMode, OcspSettings};
pub use tls::{SocketState, SslOption, SslSocket, TlsOptions};
pub use util::{data_to_hex, read_hex};

use errcode::*;

/// Errors returned by secmod-lib.
#[derive(Debug, thiserror::Error)]
pub enum SecmodError {
    #[error("Invalid OID token: expected a string or tag, got {0}")]
    InvalidOidToken(String),

    #[error("Unknown OID: {0}")]
    UnknownOid(String),

    #[error("Invalid DN source: expected a string, sequence or nothing, got {0}")]
    InvalidDnSource(String),

    #[error("Invalid distinguished name: {0}")]
    InvalidDn(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Context already finalized")]
    ContextFinalized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Native(#[from] NativeError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(NativeError),

    #[error("Lost connection: {0}")]
    LostConnection(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported PKCS#12 bag type: {0}")]
    UnsupportedBagType(String),

    #[error("Key slot not authenticated")]
    SlotNotAuthenticated,

    #[error("Failed to parse certificate: {0}")]
    ParseError(String),

    #[error("Invalid PEM format: {0}")]
    PemError(String),

    #[error("Invalid DER format: {0}")]
    DerError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SecmodError {
    /// Shorthand for a coded failure without detail.
    pub fn native(code: i32) -> Self {
        SecmodError::Native(NativeError::new(code))
    }

    /// Shorthand for a coded failure with a detail message.
    pub fn native_detail(code: i32, detail: impl Into<String>) -> Self {
        SecmodError::Native(NativeError::new(code).with_detail(detail))
    }

    /// Native error code associated with this error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            SecmodError::InvalidOidToken(_) | SecmodError::InvalidDnSource(_) => {
                Some(SEC_ERROR_INVALID_ARGS)
            }
            SecmodError::UnknownOid(_) => Some(SEC_ERROR_UNRECOGNIZED_OID),
            SecmodError::InvalidDn(_) => Some(SEC_ERROR_INVALID_AVA),
            SecmodError::KeyNotFound(_) => None,
            SecmodError::ContextFinalized => Some(SEC_ERROR_LIBRARY_FAILURE),
            SecmodError::NotFound(_) => Some(SEC_ERROR_BAD_DATABASE),
            SecmodError::Native(e) | SecmodError::ConnectionFailed(e) => Some(e.code),
            SecmodError::LostConnection(_) => Some(PR_END_OF_FILE_ERROR),
            SecmodError::InvalidState(_) => Some(PR_INVALID_STATE_ERROR),
            SecmodError::UnsupportedBagType(_) => Some(SEC_ERROR_PKCS12_UNSUPPORTED_BAG_TYPE),
            SecmodError::SlotNotAuthenticated => Some(SEC_ERROR_TOKEN_NOT_LOGGED_IN),
            SecmodError::ParseError(_) | SecmodError::PemError(_) | SecmodError::DerError(_) => {
                Some(SEC_ERROR_BAD_DER)
            }
            SecmodError::Io(_) | SecmodError::Json(_) => Some(PR_IO_ERROR),
        }
    }
}
