//! Certificate and key database.
//!
//! A database is a directory holding `certdb.json`. Every entry pairs a
//! nickname with a certificate, its trust flags and, for user certificates,
//! the private key wrapped under the database password. Keys are wrapped
//! with AES-256-CBC-PAD under a key derived from the password with
//! PBKDF2-HMAC-SHA256; the KDF parameters and salt live in the file header
//! next to an encrypted check value used to validate a login.
//!
//! A [`CertDb`] handle is cheap to clone; all clones share the same state.

use crate::cert::{CertUsage, Certificate, PrivateKey};
use crate::cipher::{cipher_buf, IvParam, Mechanism, Operation, SymKey};
use crate::context::{self, PinArg};
use crate::errcode::{
    SEC_ERROR_BAD_DATABASE, SEC_ERROR_BAD_PASSWORD, SEC_ERROR_DUPLICATE_CERT_NAME,
    SEC_ERROR_INVALID_ARGS, SEC_ERROR_READ_ONLY,
};
use crate::name::Dn;
use crate::util;
use crate::SecmodError;
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use zeroize::Zeroizing;

const DB_FILE: &str = "certdb.json";
const DB_VERSION: u32 = 2;
const PASSWORD_CHECK: &[u8] = b"secmod password check";
const SALT_LEN: usize = 16;
const WRAP_MECHANISM: Mechanism = Mechanism::AesCbcPad;
const WRAP_KEY_LEN: usize = 32;
/// PBKDF2 rounds for password-protected databases.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const MAX_LOGIN_ATTEMPTS: usize = 3;

// ─── Trust flags ────────────────────────────────────────────────────────

bitflags! {
    /// Trust letters for one usage class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TrustFlags: u8 {
        /// `p`: valid peer.
        const VALID_PEER = 0x01;
        /// `P`: trusted peer.
        const TRUSTED = 0x02;
        /// `c`: valid CA.
        const VALID_CA = 0x04;
        /// `C`: trusted CA for server certificates.
        const TRUSTED_CA = 0x08;
        /// `T`: trusted CA for client certificates.
        const TRUSTED_CLIENT_CA = 0x10;
        /// `u`: user certificate (has a private key).
        const USER = 0x20;
        /// `w`: send warning.
        const SEND_WARN = 0x40;
    }
}

const TRUST_LETTERS: &[(char, TrustFlags)] = &[
    ('p', TrustFlags::VALID_PEER),
    ('P', TrustFlags::TRUSTED),
    ('c', TrustFlags::VALID_CA),
    ('C', TrustFlags::TRUSTED_CA),
    ('T', TrustFlags::TRUSTED_CLIENT_CA),
    ('u', TrustFlags::USER),
    ('w', TrustFlags::SEND_WARN),
];

impl TrustFlags {
    fn parse(s: &str) -> Result<Self, SecmodError> {
        let mut flags = TrustFlags::empty();
        for c in s.chars() {
            let (_, flag) = TRUST_LETTERS.iter().find(|(l, _)| *l == c).ok_or_else(|| {
                SecmodError::native_detail(SEC_ERROR_INVALID_ARGS, format!("bad trust letter {:?}", c))
            })?;
            flags |= *flag;
        }
        Ok(flags)
    }

    pub fn is_trusted_ca(self) -> bool {
        self.intersects(TrustFlags::TRUSTED_CA | TrustFlags::TRUSTED_CLIENT_CA)
    }
}

impl fmt::Display for TrustFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (letter, flag) in TRUST_LETTERS {
            // Trusted letters imply their "valid" counterparts; print only the stronger one.
            let implied = (*flag == TrustFlags::VALID_PEER && self.contains(TrustFlags::TRUSTED))
                || (*flag == TrustFlags::VALID_CA && self.is_trusted_ca());
            if self.contains(*flag) && !implied {
                write!(f, "{}", letter)?;
            }
        }
        Ok(())
    }
}

/// Trust flags per usage class, rendered as `ssl,email,objsign` (`"CT,,"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CertTrust {
    pub ssl: TrustFlags,
    pub email: TrustFlags,
    pub object_signing: TrustFlags,
}

impl CertTrust {
    /// Trust for a CA accepted for every usage (`"CT,C,C"`).
    pub fn trusted_ca() -> Self {
        CertTrust {
            ssl: TrustFlags::TRUSTED_CA | TrustFlags::TRUSTED_CLIENT_CA,
            email: TrustFlags::TRUSTED_CA,
            object_signing: TrustFlags::TRUSTED_CA,
        }
    }

    /// Trust for a certificate with a private key (`"u,u,u"`).
    pub fn user() -> Self {
        CertTrust {
            ssl: TrustFlags::USER,
            email: TrustFlags::USER,
            object_signing: TrustFlags::USER,
        }
    }

    fn all(&self) -> TrustFlags {
        self.ssl | self.email | self.object_signing
    }

    fn merge(&mut self, other: CertTrust) {
        self.ssl |= other.ssl;
        self.email |= other.email;
        self.object_signing |= other.object_signing;
    }

    /// Usages a chain anchored at a certificate with this trust may serve.
    pub(crate) fn anchored_usages(&self) -> CertUsage {
        let mut usages = CertUsage::empty();
        if self.ssl.contains(TrustFlags::TRUSTED_CA) {
            usages |= CertUsage::SSL_SERVER | CertUsage::STEP_UP | CertUsage::SSL_CA;
        }
        if self.ssl.contains(TrustFlags::TRUSTED_CLIENT_CA) {
            usages |= CertUsage::SSL_CLIENT;
        }
        if self.email.contains(TrustFlags::TRUSTED_CA) {
            usages |= CertUsage::EMAIL_SIGNER | CertUsage::EMAIL_RECIPIENT;
        }
        if self.object_signing.contains(TrustFlags::TRUSTED_CA) {
            usages |= CertUsage::OBJECT_SIGNER | CertUsage::PROTECTED_OBJECT_SIGNER;
        }
        if self.all().is_trusted_ca() {
            usages |= CertUsage::USER_CERT_IMPORT
                | CertUsage::VERIFY_CA
                | CertUsage::ANY_CA
                | CertUsage::STATUS_RESPONDER;
        }
        usages
    }

    /// Usages a leaf explicitly trusted as a peer (`P`) may serve.
    pub(crate) fn peer_usages(&self) -> CertUsage {
        let mut usages = CertUsage::empty();
        if self.ssl.contains(TrustFlags::TRUSTED) {
            usages |= CertUsage::SSL_CLIENT | CertUsage::SSL_SERVER;
        }
        if self.email.contains(TrustFlags::TRUSTED) {
            usages |= CertUsage::EMAIL_SIGNER | CertUsage::EMAIL_RECIPIENT;
        }
        if self.object_signing.contains(TrustFlags::TRUSTED) {
            usages |= CertUsage::OBJECT_SIGNER | CertUsage::PROTECTED_OBJECT_SIGNER;
        }
        usages
    }

    /// Marked as a valid but untrusted peer in every class that has flags.
    pub(crate) fn is_distrusted(&self) -> bool {
        [self.ssl, self.email, self.object_signing].iter().any(|f| {
            f.contains(TrustFlags::VALID_PEER) && !f.contains(TrustFlags::TRUSTED)
        }) && self.peer_usages().is_empty()
    }
}

impl FromStr for CertTrust {
    type Err = SecmodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        match parts.as_slice() {
            [ssl, email, objsign] => Ok(CertTrust {
                ssl: TrustFlags::parse(ssl.trim())?,
                email: TrustFlags::parse(email.trim())?,
                object_signing: TrustFlags::parse(objsign.trim())?,
            }),
            _ => Err(SecmodError::native_detail(
                SEC_ERROR_INVALID_ARGS,
                format!("trust string {:?} must have three comma-separated fields", s),
            )),
        }
    }
}

impl fmt::Display for CertTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.ssl, self.email, self.object_signing)
    }
}

impl Serialize for CertTrust {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CertTrust {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── On-disk format ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrappedBlob {
    iv: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DbFileEntry {
    nickname: String,
    certificate: String,
    trust: CertTrust,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<WrappedBlob>,
}

/// How the wrapping key is derived from the database password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
enum Kdf {
    Pbkdf2HmacSha256 { iterations: u32 },
}

impl Kdf {
    fn for_password(password: &str) -> Self {
        // An empty password has nothing to stretch.
        let iterations = if password.is_empty() { 1 } else { PBKDF2_ITERATIONS };
        Kdf::Pbkdf2HmacSha256 { iterations }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DbFile {
    version: u32,
    login_required: bool,
    kdf: Kdf,
    salt: String,
    check: WrappedBlob,
    entries: Vec<DbFileEntry>,
}

// ─── Database ───────────────────────────────────────────────────────────

/// How a database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// In-memory database that is never written to disk.
    NoDb,
}

/// Which nicknames [`CertDb::get_cert_nicknames`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicknameKind {
    All,
    /// Certificates with a private key.
    User,
    /// User certificates usable as TLS servers.
    Server,
    /// CA certificates.
    Ca,
}

struct Entry {
    nickname: String,
    cert: Certificate,
    trust: CertTrust,
    key: Option<WrappedBlob>,
}

struct DbState {
    kdf: Kdf,
    salt: Vec<u8>,
    check: WrappedBlob,
    login_required: bool,
    entries: Vec<Entry>,
}

struct DbInner {
    dir: Option<PathBuf>,
    mode: OpenMode,
    state: RwLock<DbState>,
    master_key: Mutex<Option<SymKey>>,
}

/// Handle to a certificate/key database.
#[derive(Clone)]
pub struct CertDb {
    inner: Arc<DbInner>,
}

impl fmt::Debug for CertDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertDb")
            .field("dir", &self.inner.dir)
            .field("mode", &self.inner.mode)
            .field("entries", &self.inner.state.read().entries.len())
            .finish()
    }
}

fn derive_master_key(kdf: Kdf, salt: &[u8], password: &str) -> Result<SymKey, SecmodError> {
    let mut key = Zeroizing::new([0u8; WRAP_KEY_LEN]);
    match kdf {
        Kdf::Pbkdf2HmacSha256 { iterations: 0 } => {
            return Err(SecmodError::native_detail(
                SEC_ERROR_BAD_DATABASE,
                "PBKDF2 iteration count must be positive",
            ));
        }
        Kdf::Pbkdf2HmacSha256 { iterations } => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, key.as_mut_slice());
        }
    }
    SymKey::import(WRAP_MECHANISM, key.as_slice())
}

fn wrap(key: &SymKey, data: &[u8]) -> Result<WrappedBlob, SecmodError> {
    let iv = IvParam::generate(WRAP_MECHANISM);
    let data = cipher_buf(WRAP_MECHANISM, Operation::Encrypt, key, &iv, data)?;
    Ok(WrappedBlob {
        iv: util::base64_encode(iv.as_bytes()),
        data: util::base64_encode(&data),
    })
}

fn unwrap_blob(key: &SymKey, blob: &WrappedBlob) -> Result<Zeroizing<Vec<u8>>, SecmodError> {
    let iv = IvParam::from_iv(WRAP_MECHANISM, &util::base64_decode(&blob.iv)?)?;
    let data = util::base64_decode(&blob.data)?;
    cipher_buf(WRAP_MECHANISM, Operation::Decrypt, key, &iv, &data).map(Zeroizing::new)
}

fn new_state(password: &str) -> Result<(DbState, SymKey), SecmodError> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let kdf = Kdf::for_password(password);
    let master = derive_master_key(kdf, &salt, password)?;
    let check = wrap(&master, PASSWORD_CHECK)?;
    let state = DbState {
        kdf,
        salt,
        check,
        login_required: !password.is_empty(),
        entries: Vec::new(),
    };
    Ok((state, master))
}

fn read_only_error() -> SecmodError {
    SecmodError::native_detail(SEC_ERROR_READ_ONLY, "database is open read-only")
}

impl CertDb {
    /// Create a fresh read-write database in `dir`, replacing any existing
    /// one. An empty or absent password means no login is required.
    pub fn create(dir: impl AsRef<Path>, password: Option<&str>) -> Result<CertDb, SecmodError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let (state, master) = new_state(password.unwrap_or(""))?;
        let login_required = state.login_required;
        let db = CertDb {
            inner: Arc::new(DbInner {
                dir: Some(dir.to_path_buf()),
                mode: OpenMode::ReadWrite,
                state: RwLock::new(state),
                master_key: Mutex::new((!login_required).then_some(master)),
            }),
        };
        db.save()?;
        tracing::debug!(dir = %dir.display(), login_required, "created certificate database");
        Ok(db)
    }

    /// Open the database in `dir`. A missing database is created (without a
    /// password) in `ReadWrite` mode and is an error in `ReadOnly` mode.
    pub fn open(dir: impl AsRef<Path>, mode: OpenMode) -> Result<CertDb, SecmodError> {
        let dir = dir.as_ref();
        if mode == OpenMode::NoDb {
            return CertDb::in_memory();
        }
        let path = dir.join(DB_FILE);
        if !path.exists() {
            if mode == OpenMode::ReadWrite {
                return CertDb::create(dir, None);
            }
            return Err(SecmodError::native_detail(
                SEC_ERROR_BAD_DATABASE,
                format!("no database at {}", path.display()),
            ));
        }

        let file: DbFile = serde_json::from_slice(&std::fs::read(&path)?)?;
        if file.version != DB_VERSION {
            return Err(SecmodError::native_detail(
                SEC_ERROR_BAD_DATABASE,
                format!("unsupported database version {}", file.version),
            ));
        }
        let mut entries = Vec::with_capacity(file.entries.len());
        for e in file.entries {
            let cert = Certificate::from_der(&util::base64_decode(&e.certificate)?)?;
            entries.push(Entry {
                nickname: e.nickname,
                cert,
                trust: e.trust,
                key: e.key,
            });
        }
        let state = DbState {
            kdf: file.kdf,
            salt: util::base64_decode(&file.salt)?,
            check: file.check,
            login_required: file.login_required,
            entries,
        };
        let master = if state.login_required {
            None
        } else {
            Some(derive_master_key(state.kdf, &state.salt, "")?)
        };
        tracing::debug!(dir = %dir.display(), ?mode, entries = state.entries.len(), "opened certificate database");
        Ok(CertDb {
            inner: Arc::new(DbInner {
                dir: Some(dir.to_path_buf()),
                mode,
                state: RwLock::new(state),
                master_key: Mutex::new(master),
            }),
        })
    }

    /// Empty in-memory database without a password.
    pub fn in_memory() -> Result<CertDb, SecmodError> {
        let (state, master) = new_state("")?;
        Ok(CertDb {
            inner: Arc::new(DbInner {
                dir: None,
                mode: OpenMode::NoDb,
                state: RwLock::new(state),
                master_key: Mutex::new(Some(master)),
            }),
        })
    }

    pub fn mode(&self) -> OpenMode {
        self.inner.mode
    }

    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.mode == OpenMode::ReadOnly
    }

    fn ensure_writable(&self) -> Result<(), SecmodError> {
        if self.is_read_only() {
            return Err(read_only_error());
        }
        Ok(())
    }

    /// Write the database to disk. A no-op for in-memory databases.
    pub fn save(&self) -> Result<(), SecmodError> {
        self.ensure_writable()?;
        let Some(dir) = &self.inner.dir else {
            return Ok(());
        };
        let file = {
            let state = self.inner.state.read();
            DbFile {
                version: DB_VERSION,
                login_required: state.login_required,
                kdf: state.kdf,
                salt: util::base64_encode(&state.salt),
                check: state.check.clone(),
                entries: state
                    .entries
                    .iter()
                    .map(|e| DbFileEntry {
                        nickname: e.nickname.clone(),
                        certificate: util::base64_encode(e.cert.der()),
                        trust: e.trust,
                        key: e.key.clone(),
                    })
                    .collect(),
            }
        };
        let path = dir.join(DB_FILE);
        let tmp = dir.join(format!("{}.tmp", DB_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn persist(&self) -> Result<(), SecmodError> {
        if self.inner.dir.is_some() {
            self.save()?;
        }
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    pub fn find_cert_from_nickname(&self, nickname: &str) -> Result<Certificate, SecmodError> {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .find(|e| e.nickname == nickname)
            .map(|e| e.cert.clone())
            .ok_or_else(|| SecmodError::NotFound(format!("certificate with nickname {:?}", nickname)))
    }

    /// Nickname under which `cert` is stored.
    pub fn nickname_of(&self, cert: &Certificate) -> Option<String> {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .find(|e| e.cert == *cert)
            .map(|e| e.nickname.clone())
    }

    /// Trust flags of `cert`; empty when it is not in the database.
    pub fn trust(&self, cert: &Certificate) -> CertTrust {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .find(|e| e.cert == *cert)
            .map(|e| e.trust)
            .unwrap_or_default()
    }

    /// Every entry as `(nickname, certificate, trust)`.
    pub fn certificates(&self) -> Vec<(String, Certificate, CertTrust)> {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .map(|e| (e.nickname.clone(), e.cert.clone(), e.trust))
            .collect()
    }

    pub fn get_cert_nicknames(&self, kind: NicknameKind) -> Vec<String> {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .filter(|e| {
                let user = e.key.is_some() || e.trust.all().contains(TrustFlags::USER);
                match kind {
                    NicknameKind::All => true,
                    NicknameKind::User => user,
                    NicknameKind::Server => {
                        user && e.cert.cert_usage_flags().contains(CertUsage::SSL_SERVER)
                    }
                    NicknameKind::Ca => e.cert.is_ca() || e.trust.all().is_trusted_ca(),
                }
            })
            .map(|e| e.nickname.clone())
            .collect()
    }

    /// Issuer of `cert` among the stored certificates, preferring a
    /// candidate whose key verifies the signature.
    pub fn find_issuer(&self, cert: &Certificate) -> Option<Certificate> {
        let state = self.inner.state.read();
        let candidates: Vec<&Certificate> = state
            .entries
            .iter()
            .map(|e| &e.cert)
            .filter(|c| c.subject_raw() == cert.issuer_raw() && *c != cert)
            .collect();
        let verified = candidates.iter().copied().find(|c| cert.is_signed_by(c));
        verified.or_else(|| candidates.first().copied()).cloned()
    }

    /// Subjects of CAs trusted to issue certificates for `usage`.
    pub fn trusted_ca_subjects(&self, usage: CertUsage) -> Vec<Dn> {
        self.trusted_cas(usage)
            .iter()
            .map(|c| c.subject().clone())
            .collect()
    }

    pub(crate) fn trusted_cas(&self, usage: CertUsage) -> Vec<Certificate> {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .filter(|e| e.trust.anchored_usages().intersects(usage))
            .map(|e| e.cert.clone())
            .collect()
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Store `cert`. Without a nickname the subject CN (or the fingerprint)
    /// is used. Re-adding a stored certificate merges its trust and returns
    /// the existing nickname.
    pub fn add_cert(
        &self,
        cert: &Certificate,
        nickname: Option<&str>,
        trust: CertTrust,
    ) -> Result<String, SecmodError> {
        self.ensure_writable()?;
        let nickname = {
            let mut state = self.inner.state.write();
            if let Some(existing) = state.entries.iter_mut().find(|e| e.cert == *cert) {
                existing.trust.merge(trust);
                existing.nickname.clone()
            } else {
                let nickname = nickname
                    .map(str::to_string)
                    .unwrap_or_else(|| cert.default_nickname());
                if state
                    .entries
                    .iter()
                    .any(|e| e.nickname == nickname && e.cert.subject_raw() != cert.subject_raw())
                {
                    return Err(SecmodError::native_detail(
                        SEC_ERROR_DUPLICATE_CERT_NAME,
                        nickname,
                    ));
                }
                state.entries.push(Entry {
                    nickname: nickname.clone(),
                    cert: cert.clone(),
                    trust,
                    key: None,
                });
                nickname
            }
        };
        tracing::debug!(%nickname, subject = %cert.subject(), "stored certificate");
        self.persist()?;
        Ok(nickname)
    }

    /// Replace the trust flags of a stored certificate.
    pub fn set_trust(&self, cert: &Certificate, trust: CertTrust) -> Result<(), SecmodError> {
        self.ensure_writable()?;
        {
            let mut state = self.inner.state.write();
            let entry = state
                .entries
                .iter_mut()
                .find(|e| e.cert == *cert)
                .ok_or_else(|| SecmodError::NotFound(format!("certificate {}", cert.subject())))?;
            entry.trust = trust;
        }
        self.persist()
    }

    /// Store `key` as the private key of the stored certificate `cert`,
    /// wrapped under the database password. Logs the key slot in first if
    /// needed.
    pub fn add_key(
        &self,
        cert: &Certificate,
        key: &PrivateKey,
        pin_arg: Option<&PinArg>,
    ) -> Result<(), SecmodError> {
        self.ensure_writable()?;
        self.internal_key_slot().authenticate(pin_arg)?;
        let master = self.master_key()?;
        let blob = wrap(&master, key.der())?;
        {
            let mut state = self.inner.state.write();
            let entry = state
                .entries
                .iter_mut()
                .find(|e| e.cert == *cert)
                .ok_or_else(|| SecmodError::NotFound(format!("certificate {}", cert.subject())))?;
            entry.key = Some(blob);
            entry.trust.merge(CertTrust::user());
        }
        self.persist()
    }

    /// Private key paired with `cert`, logging the key slot in if needed.
    pub fn find_key_by_any_cert(
        &self,
        cert: &Certificate,
        pin_arg: Option<&PinArg>,
    ) -> Result<PrivateKey, SecmodError> {
        let blob = self
            .inner
            .state
            .read()
            .entries
            .iter()
            .find(|e| e.cert == *cert)
            .and_then(|e| e.key.clone())
            .ok_or_else(|| SecmodError::NotFound(format!("private key for {}", cert.subject())))?;
        self.internal_key_slot().authenticate(pin_arg)?;
        let master = self.master_key()?;
        let der = unwrap_blob(&master, &blob)?;
        PrivateKey::from_pkcs8_der(&der)
    }

    pub fn has_key(&self, cert: &Certificate) -> bool {
        self.inner
            .state
            .read()
            .entries
            .iter()
            .any(|e| e.cert == *cert && e.key.is_some())
    }

    fn master_key(&self) -> Result<SymKey, SecmodError> {
        self.inner
            .master_key
            .lock()
            .clone()
            .ok_or(SecmodError::SlotNotAuthenticated)
    }

    /// The token holding this database's private keys.
    pub fn internal_key_slot(&self) -> KeySlot {
        KeySlot {
            db: self.clone(),
        }
    }
}

// ─── Key slot ───────────────────────────────────────────────────────────

/// The key slot of a database; locked until the password is supplied.
#[derive(Clone, Debug)]
pub struct KeySlot {
    db: CertDb,
}

impl KeySlot {
    pub fn token_name(&self) -> &'static str {
        "NSS Certificate DB"
    }

    pub fn needs_login(&self) -> bool {
        self.db.inner.state.read().login_required
    }

    pub fn is_logged_in(&self) -> bool {
        self.db.inner.master_key.lock().is_some()
    }

    /// Log in by asking the registered password callback (up to three
    /// attempts; `retry` is set after the first). Succeeds at once when no
    /// login is needed or the slot is already unlocked.
    pub fn authenticate(&self, pin_arg: Option<&PinArg>) -> Result<(), SecmodError> {
        if self.is_logged_in() {
            return Ok(());
        }
        let callback = context::password_callback().ok_or_else(|| {
            SecmodError::native_detail(SEC_ERROR_BAD_PASSWORD, "no password callback registered")
        })?;
        for attempt in 0..MAX_LOGIN_ATTEMPTS {
            let retry = attempt > 0;
            let Some(password) = callback(self, retry, pin_arg).map(Zeroizing::new) else {
                tracing::debug!("password callback cancelled login");
                break;
            };
            match self.login(&password) {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!(attempt, error = %e, "key slot login failed"),
            }
        }
        Err(SecmodError::native(SEC_ERROR_BAD_PASSWORD))
    }

    /// Log in with a known password.
    pub fn login(&self, password: &str) -> Result<(), SecmodError> {
        let (kdf, salt, check) = {
            let state = self.db.inner.state.read();
            (state.kdf, state.salt.clone(), state.check.clone())
        };
        let key = derive_master_key(kdf, &salt, password)?;
        match unwrap_blob(&key, &check) {
            Ok(plain) if plain.as_slice() == PASSWORD_CHECK => {
                *self.db.inner.master_key.lock() = Some(key);
                tracing::debug!("key slot unlocked");
                Ok(())
            }
            _ => Err(SecmodError::native(SEC_ERROR_BAD_PASSWORD)),
        }
    }

    /// Lock the slot again. No effect when no login is required.
    pub fn logout(&self) {
        if self.needs_login() {
            *self.db.inner.master_key.lock() = None;
        }
    }
}
