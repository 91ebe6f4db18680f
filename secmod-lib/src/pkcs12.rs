//! PKCS#12 container decoding, import and export.
//!
//! [`Pkcs12Decoder`] verifies the container MAC, decrypts the certificate
//! safes and indexes every bag up front. Shrouded private keys stay
//! encrypted until [`Pkcs12Decoder::database_import`].

use crate::cert::{Certificate, PrivateKey};
use crate::certdb::{CertDb, CertTrust, KeySlot};
use crate::context::PinArg;
use crate::errcode::{
    SEC_ERROR_PKCS12_CORRUPT_PFX_STRUCTURE, SEC_ERROR_PKCS12_DECODING_PFX,
    SEC_ERROR_PKCS12_INVALID_MAC, SEC_ERROR_PKCS12_UNABLE_TO_EXPORT_KEY,
    SEC_ERROR_PKCS12_UNABLE_TO_IMPORT_KEY,
};
use crate::oid::OidTag;
use crate::{util, SecmodError};
use p12::{AlgorithmIdentifier, CertBag, EncryptedPrivateKeyInfo, SafeBag, SafeBagKind, PFX};
use serde::Serialize;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const MAX_CHAIN_DEPTH: usize = 8;

/// Where the container bytes come from.
pub enum Pkcs12Source {
    Path(PathBuf),
    Reader(Box<dyn Read + Send>),
    Buffer(Vec<u8>),
}

impl Pkcs12Source {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Pkcs12Source::Reader(Box::new(reader))
    }

    fn into_bytes(self) -> Result<Vec<u8>, SecmodError> {
        match self {
            Pkcs12Source::Path(path) => Ok(std::fs::read(path)?),
            Pkcs12Source::Reader(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                Ok(data)
            }
            Pkcs12Source::Buffer(data) => Ok(data),
        }
    }
}

impl fmt::Debug for Pkcs12Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pkcs12Source::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Pkcs12Source::Reader(_) => f.write_str("Reader(..)"),
            Pkcs12Source::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
        }
    }
}

impl From<&Path> for Pkcs12Source {
    fn from(path: &Path) -> Self {
        Pkcs12Source::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for Pkcs12Source {
    fn from(path: PathBuf) -> Self {
        Pkcs12Source::Path(path)
    }
}

impl From<Vec<u8>> for Pkcs12Source {
    fn from(data: Vec<u8>) -> Self {
        Pkcs12Source::Buffer(data)
    }
}

impl From<&[u8]> for Pkcs12Source {
    fn from(data: &[u8]) -> Self {
        Pkcs12Source::Buffer(data.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BagType {
    CertBag,
    ShroudedKeyBag,
}

impl BagType {
    /// Registry tag of the bag type identifier.
    pub fn oid_tag(self) -> OidTag {
        match self {
            BagType::CertBag => OidTag::Pkcs12V1CertBagId,
            BagType::ShroudedKeyBag => OidTag::Pkcs12V1Pkcs8ShroudedKeyBagId,
        }
    }
}

impl fmt::Display for BagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.oid_tag().description())
    }
}

/// Algorithm shrouding a private key bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlgorithmId {
    pub tag: OidTag,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    pub iterations: u64,
}

impl AlgorithmId {
    fn from_p12(alg: &AlgorithmIdentifier) -> Self {
        let (tag, params) = match alg {
            AlgorithmIdentifier::Sha1 => (OidTag::Sha1, None),
            AlgorithmIdentifier::PbewithSHAAnd40BitRC2CBC(p) => {
                (OidTag::Pkcs12V2PbeWithSha1And40BitRc2Cbc, Some(p))
            }
            AlgorithmIdentifier::PbeWithSHAAnd3KeyTripleDESCBC(p) => {
                (OidTag::Pkcs12V2PbeWithSha1And3KeyTripleDesCbc, Some(p))
            }
            AlgorithmIdentifier::OtherAlg(_) => (OidTag::Unknown, None),
        };
        AlgorithmId {
            tag,
            salt: params.map(|p| p.salt.clone()).unwrap_or_default(),
            iterations: params.map(|p| p.iterations).unwrap_or_default(),
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            OidTag::Unknown => f.write_str("unsupported algorithm")?,
            tag => f.write_str(tag.description())?,
        }
        if self.iterations > 0 {
            write!(f, " ({} iterations)", self.iterations)?;
        }
        Ok(())
    }
}

mod hex_bytes {
    pub fn serialize<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }
}

/// One decoded bag.
#[derive(Debug, Clone, Serialize)]
pub struct Pkcs12Bag {
    bag_type: BagType,
    has_key: bool,
    algorithm: Option<AlgorithmId>,
    friendly_name: Option<String>,
    #[serde(serialize_with = "serialize_key_id")]
    local_key_id: Option<Vec<u8>>,
    #[serde(skip)]
    certificate: Option<Certificate>,
}

fn serialize_key_id<S: serde::Serializer>(id: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match id {
        Some(id) => s.serialize_some(&hex::encode(id)),
        None => s.serialize_none(),
    }
}

impl Pkcs12Bag {
    pub fn bag_type(&self) -> BagType {
        self.bag_type
    }

    /// For certificate bags: whether the container holds the matching key.
    pub fn has_key(&self) -> bool {
        self.has_key
    }

    /// For key bags: the shrouding algorithm.
    pub fn algorithm(&self) -> Option<&AlgorithmId> {
        self.algorithm.as_ref()
    }

    pub fn friendly_name(&self) -> Option<&str> {
        self.friendly_name.as_deref()
    }

    pub fn local_key_id(&self) -> Option<&[u8]> {
        self.local_key_id.as_deref()
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    fn pairs_with(&self, key: &ShroudedKey) -> bool {
        match (&self.local_key_id, &key.local_key_id) {
            (Some(a), Some(b)) => a == b,
            _ => matches!(
                (&self.friendly_name, &key.friendly_name),
                (Some(a), Some(b)) if a == b
            ),
        }
    }
}

impl fmt::Display for Pkcs12Bag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bag_type)?;
        if let Some(name) = &self.friendly_name {
            write!(f, " \"{}\"", name)?;
        }
        if let Some(cert) = &self.certificate {
            write!(f, " subject={}", cert.subject())?;
        }
        if self.has_key {
            f.write_str(" (has key)")?;
        }
        if let Some(alg) = &self.algorithm {
            write!(f, " [{}]", alg)?;
        }
        if let Some(id) = &self.local_key_id {
            write!(f, " id={}", util::data_to_hex(id, ":"))?;
        }
        Ok(())
    }
}

struct ShroudedKey {
    local_key_id: Option<Vec<u8>>,
    friendly_name: Option<String>,
    info: EncryptedPrivateKeyInfo,
}

/// Decoded PKCS#12 container.
pub struct Pkcs12Decoder {
    bags: Vec<Pkcs12Bag>,
    keys: Vec<ShroudedKey>,
    password: Zeroizing<String>,
    slot: KeySlot,
}

impl fmt::Debug for Pkcs12Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs12Decoder")
            .field("bags", &self.bags)
            .finish_non_exhaustive()
    }
}

impl Pkcs12Decoder {
    /// Decode a container. Keys are imported later into `slot`'s database.
    pub fn new(
        source: impl Into<Pkcs12Source>,
        password: &str,
        slot: &KeySlot,
    ) -> Result<Self, SecmodError> {
        let data = Zeroizing::new(source.into().into_bytes()?);
        let pfx = PFX::parse(&data).map_err(|e| {
            SecmodError::native_detail(SEC_ERROR_PKCS12_DECODING_PFX, format!("{:?}", e))
        })?;
        if !pfx.verify_mac(password) {
            return Err(SecmodError::native(SEC_ERROR_PKCS12_INVALID_MAC));
        }
        let safe_bags = pfx.bags(password).map_err(|e| {
            SecmodError::native_detail(SEC_ERROR_PKCS12_CORRUPT_PFX_STRUCTURE, format!("{:?}", e))
        })?;

        let mut bags = Vec::with_capacity(safe_bags.len());
        let mut keys = Vec::new();
        for safe_bag in safe_bags {
            let friendly_name = safe_bag.friendly_name();
            let local_key_id = safe_bag.local_key_id();
            let SafeBag { bag, .. } = safe_bag;
            match bag {
                SafeBagKind::CertBag(CertBag::X509(der)) => bags.push(Pkcs12Bag {
                    bag_type: BagType::CertBag,
                    has_key: false,
                    algorithm: None,
                    friendly_name,
                    local_key_id,
                    certificate: Some(Certificate::from_der(&der)?),
                }),
                SafeBagKind::CertBag(_) => {
                    return Err(SecmodError::UnsupportedBagType(
                        "non-X.509 certificate bag".into(),
                    ));
                }
                SafeBagKind::Pkcs8ShroudedKeyBag(info) => {
                    bags.push(Pkcs12Bag {
                        bag_type: BagType::ShroudedKeyBag,
                        has_key: false,
                        algorithm: Some(AlgorithmId::from_p12(&info.encryption_algorithm)),
                        friendly_name: friendly_name.clone(),
                        local_key_id: local_key_id.clone(),
                        certificate: None,
                    });
                    keys.push(ShroudedKey {
                        local_key_id,
                        friendly_name,
                        info,
                    });
                }
                SafeBagKind::OtherBagKind(other) => {
                    return Err(SecmodError::UnsupportedBagType(format!("{:?}", other.bag_id)));
                }
            }
        }

        for bag in bags.iter_mut().filter(|b| b.bag_type == BagType::CertBag) {
            bag.has_key = keys.iter().any(|k| bag.pairs_with(k));
        }
        tracing::debug!(bags = bags.len(), keys = keys.len(), "decoded PKCS#12 container");

        Ok(Pkcs12Decoder {
            bags,
            keys,
            password: Zeroizing::new(password.to_string()),
            slot: slot.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.bags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Pkcs12Bag> {
        self.bags.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pkcs12Bag> {
        self.bags.iter()
    }

    /// Store every certificate and its unwrapped key in `certdb`. The key
    /// slot must be logged in. Returns the nicknames used.
    pub fn database_import(&self, certdb: &CertDb) -> Result<Vec<String>, SecmodError> {
        if !self.slot.is_logged_in() || !certdb.internal_key_slot().is_logged_in() {
            return Err(SecmodError::SlotNotAuthenticated);
        }

        let mut nicknames = Vec::new();
        for bag in &self.bags {
            let Some(cert) = &bag.certificate else {
                continue;
            };
            let trust = if bag.has_key {
                CertTrust::user()
            } else {
                CertTrust::default()
            };
            let nickname = certdb.add_cert(cert, bag.friendly_name(), trust)?;
            tracing::debug!(%nickname, "imported certificate");
            nicknames.push(nickname);
        }

        let bmp = bmp_password(&self.password);
        for key in &self.keys {
            let owner = self
                .bags
                .iter()
                .find(|b| b.bag_type == BagType::CertBag && b.pairs_with(key))
                .and_then(|b| b.certificate.as_ref());
            let Some(cert) = owner else {
                tracing::warn!(name = ?key.friendly_name, "key bag without a matching certificate; skipped");
                continue;
            };
            let der = key.info.decrypt(&bmp).map(Zeroizing::new).ok_or_else(|| {
                SecmodError::native_detail(
                    SEC_ERROR_PKCS12_UNABLE_TO_IMPORT_KEY,
                    "key bag could not be decrypted",
                )
            })?;
            let private_key = PrivateKey::from_pkcs8_der(&der)?;
            certdb.add_key(cert, &private_key, None)?;
            tracing::debug!(subject = %cert.subject(), "imported private key");
        }
        Ok(nicknames)
    }
}

impl<'a> IntoIterator for &'a Pkcs12Decoder {
    type Item = &'a Pkcs12Bag;
    type IntoIter = std::slice::Iter<'a, Pkcs12Bag>;

    fn into_iter(self) -> Self::IntoIter {
        self.bags.iter()
    }
}

/// Build a container holding `nickname`'s certificate, its private key and
/// the issuer chain found in `certdb`, protected by `password`.
pub fn pkcs12_export(
    certdb: &CertDb,
    nickname: &str,
    password: &str,
    pin_arg: Option<&PinArg>,
) -> Result<Vec<u8>, SecmodError> {
    let cert = certdb.find_cert_from_nickname(nickname)?;
    let key = certdb.find_key_by_any_cert(&cert, pin_arg)?;

    let mut chain = Vec::new();
    let mut current = cert.clone();
    for _ in 0..MAX_CHAIN_DEPTH {
        match certdb.find_issuer(&current) {
            Some(issuer) if issuer != current => {
                chain.push(issuer.clone());
                if issuer.is_self_signed() {
                    break;
                }
                current = issuer;
            }
            _ => break,
        }
    }
    let cas: Vec<&[u8]> = chain.iter().map(Certificate::der).collect();

    let pfx = PFX::new_with_cas(cert.der(), key.der(), &cas, password, nickname).ok_or_else(|| {
        SecmodError::native_detail(SEC_ERROR_PKCS12_UNABLE_TO_EXPORT_KEY, nickname.to_string())
    })?;
    tracing::debug!(%nickname, chain = chain.len(), "exported PKCS#12 container");
    Ok(pfx.to_der())
}

/// Password as a NUL-terminated big-endian BMPString.
fn bmp_password(password: &str) -> Zeroizing<Vec<u8>> {
    let mut out = Vec::with_capacity(password.len() * 2 + 2);
    for unit in password.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out.extend_from_slice(&[0, 0]);
    Zeroizing::new(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn bmp_password_encoding() {
        assert_eq!(bmp_password("ab").as_slice(), &[0, b'a', 0, b'b', 0, 0]);
        assert_eq!(bmp_password("").as_slice(), &[0, 0]);
    }

    #[test]
    fn bag_type_tags() {
        assert_eq!(BagType::CertBag.oid_tag(), OidTag::Pkcs12V1CertBagId);
        assert_eq!(
            BagType::ShroudedKeyBag.oid_tag(),
            OidTag::Pkcs12V1Pkcs8ShroudedKeyBagId
        );
    }

    #[test]
    fn garbage_is_a_decoding_error() {
        let db = CertDb::in_memory().unwrap();
        let err = Pkcs12Decoder::new(vec![0x01, 0x02, 0x03], "pw", &db.internal_key_slot())
            .unwrap_err();
        assert_eq!(err.code(), Some(SEC_ERROR_PKCS12_DECODING_PFX));
    }
}
