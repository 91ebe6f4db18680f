//! Streaming digest contexts and one-shot hash helpers.

use crate::errcode::SEC_ERROR_INVALID_ALGORITHM;
use crate::oid::OidTag;
use crate::SecmodError;
use digest::{Digest, DynDigest};

type Hasher = Box<dyn DynDigest + Send>;

fn new_hasher(tag: OidTag) -> Result<Hasher, SecmodError> {
    let hasher: Hasher = match tag {
        OidTag::Md5 => Box::new(md5::Md5::new()),
        OidTag::Sha1 => Box::new(sha1::Sha1::new()),
        OidTag::Sha256 => Box::new(sha2::Sha256::new()),
        OidTag::Sha384 => Box::new(sha2::Sha384::new()),
        OidTag::Sha512 => Box::new(sha2::Sha512::new()),
        other => {
            return Err(SecmodError::native_detail(
                SEC_ERROR_INVALID_ALGORITHM,
                format!("{} is not a digest algorithm", other.registry_name()),
            ))
        }
    };
    Ok(hasher)
}

/// One hashing session: begun on creation, finalized by [`digest_final`].
///
/// [`digest_final`]: DigestContext::digest_final
pub struct DigestContext {
    tag: OidTag,
    hasher: Option<Hasher>,
}

impl std::fmt::Debug for DigestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestContext")
            .field("tag", &self.tag)
            .field("finalized", &self.hasher.is_none())
            .finish()
    }
}

impl DigestContext {
    /// Create a context for a digest algorithm, ready for `digest_op`.
    pub fn new(tag: OidTag) -> Result<Self, SecmodError> {
        Ok(DigestContext {
            tag,
            hasher: Some(new_hasher(tag)?),
        })
    }

    pub fn algorithm(&self) -> OidTag {
        self.tag
    }

    pub fn is_finalized(&self) -> bool {
        self.hasher.is_none()
    }

    /// Restart the session, discarding any data fed so far.
    pub fn digest_begin(&mut self) -> Result<(), SecmodError> {
        self.live()?.reset();
        Ok(())
    }

    /// Feed data. Chunking never affects the final digest.
    pub fn digest_op(&mut self, data: &[u8]) -> Result<(), SecmodError> {
        self.live()?.update(data);
        Ok(())
    }

    /// Finish the session and return the digest. The context is unusable
    /// afterwards.
    pub fn digest_final(&mut self) -> Result<Vec<u8>, SecmodError> {
        let hasher = self.hasher.take().ok_or(SecmodError::ContextFinalized)?;
        Ok(hasher.finalize().into_vec())
    }

    fn live(&mut self) -> Result<&mut Hasher, SecmodError> {
        self.hasher.as_mut().ok_or(SecmodError::ContextFinalized)
    }
}

/// Hash `data` in one call with the algorithm named by `tag`.
pub fn hash_buf(tag: OidTag, data: &[u8]) -> Result<Vec<u8>, SecmodError> {
    let mut hasher = new_hasher(tag)?;
    hasher.update(data);
    Ok(hasher.finalize().into_vec())
}

pub fn md5_digest(data: &[u8]) -> Vec<u8> {
    md5::Md5::digest(data).to_vec()
}

pub fn sha1_digest(data: &[u8]) -> Vec<u8> {
    sha1::Sha1::digest(data).to_vec()
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    sha2::Sha256::digest(data).to_vec()
}

pub fn sha384_digest(data: &[u8]) -> Vec<u8> {
    sha2::Sha384::digest(data).to_vec()
}

pub fn sha512_digest(data: &[u8]) -> Vec<u8> {
    sha2::Sha512::digest(data).to_vec()
}
