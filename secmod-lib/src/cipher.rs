//! Symmetric cipher contexts.
//!
//! A [`CipherContext`] wraps one CBC session. Input may arrive in chunks of
//! any size: whole blocks are emitted by `cipher_op` as soon as they are
//! available, and `digest_final` flushes the remainder (adding or removing
//! PKCS#7 padding for the `*_PAD` mechanisms). Decrypting contexts in padded
//! mode always hold back the last full block until `digest_final`, since it
//! may carry the padding.

use crate::errcode::{SEC_ERROR_BAD_DATA, SEC_ERROR_BAD_KEY, SEC_ERROR_INPUT_LEN, SEC_ERROR_INVALID_ALGORITHM};
use crate::oid::OidTag;
use crate::SecmodError;
use cbc::cipher::block_padding::{Padding, Pkcs7};
use cbc::cipher::consts::{U16, U8};
use cbc::cipher::generic_array::{ArrayLength, GenericArray};
use cbc::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, Zeroizing};

/// Cipher mechanism: algorithm, chaining mode and padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mechanism {
    DesCbc,
    DesCbcPad,
    Des3Cbc,
    Des3CbcPad,
    AesCbc,
    AesCbcPad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Des,
    Des3,
    Aes,
}

const MECHANISM_NAMES: &[(Mechanism, &str)] = &[
    (Mechanism::DesCbc, "CKM_DES_CBC"),
    (Mechanism::DesCbcPad, "CKM_DES_CBC_PAD"),
    (Mechanism::Des3Cbc, "CKM_DES3_CBC"),
    (Mechanism::Des3CbcPad, "CKM_DES3_CBC_PAD"),
    (Mechanism::AesCbc, "CKM_AES_CBC"),
    (Mechanism::AesCbcPad, "CKM_AES_CBC_PAD"),
];

impl Mechanism {
    fn family(self) -> Family {
        match self {
            Mechanism::DesCbc | Mechanism::DesCbcPad => Family::Des,
            Mechanism::Des3Cbc | Mechanism::Des3CbcPad => Family::Des3,
            Mechanism::AesCbc | Mechanism::AesCbcPad => Family::Aes,
        }
    }

    /// PKCS#11 mechanism name (`CKM_DES_CBC_PAD`).
    pub fn name(self) -> &'static str {
        MECHANISM_NAMES
            .iter()
            .find(|(m, _)| *m == self)
            .map(|(_, n)| *n)
            .unwrap_or("CKM_INVALID_MECHANISM")
    }

    pub fn is_padded(self) -> bool {
        matches!(
            self,
            Mechanism::DesCbcPad | Mechanism::Des3CbcPad | Mechanism::AesCbcPad
        )
    }

    pub fn block_size(self) -> usize {
        match self.family() {
            Family::Des | Family::Des3 => 8,
            Family::Aes => 16,
        }
    }

    /// IV length in bytes (one block for every CBC mechanism).
    pub fn iv_len(self) -> usize {
        self.block_size()
    }

    /// Accepted key lengths in bytes.
    pub fn key_lens(self) -> &'static [usize] {
        match self.family() {
            Family::Des => &[8],
            Family::Des3 => &[24],
            Family::Aes => &[16, 24, 32],
        }
    }

    /// Key length used by [`SymKey::generate`].
    pub fn default_key_len(self) -> usize {
        match self.family() {
            Family::Des => 8,
            Family::Des3 => 24,
            Family::Aes => 32,
        }
    }

    /// Algorithm OID for a key of `key_len` bytes.
    pub fn algorithm(self, key_len: usize) -> OidTag {
        match (self.family(), key_len) {
            (Family::Des, _) => OidTag::DesCbc,
            (Family::Des3, _) => OidTag::DesEde3Cbc,
            (Family::Aes, 16) => OidTag::Aes128Cbc,
            (Family::Aes, 24) => OidTag::Aes192Cbc,
            (Family::Aes, _) => OidTag::Aes256Cbc,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mechanism {
    type Err = SecmodError;

    /// Accepts the PKCS#11 name with or without the `CKM_` prefix, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("CKM_").unwrap_or(&upper);
        MECHANISM_NAMES
            .iter()
            .find(|(_, n)| n.strip_prefix("CKM_") == Some(bare))
            .map(|(m, _)| *m)
            .ok_or_else(|| SecmodError::native_detail(SEC_ERROR_INVALID_ALGORITHM, s.to_string()))
    }
}

/// Encrypt or decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Encrypt,
    Decrypt,
}

// ─── Keys and IVs ───────────────────────────────────────────────────────

/// Symmetric key bound to a mechanism. Zeroized on drop.
#[derive(Clone)]
pub struct SymKey {
    mechanism: Mechanism,
    key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymKey")
            .field("mechanism", &self.mechanism)
            .field("len", &self.key.len())
            .finish()
    }
}

impl SymKey {
    /// Import raw key bytes for `mechanism`.
    pub fn import(mechanism: Mechanism, key: &[u8]) -> Result<Self, SecmodError> {
        if !mechanism.key_lens().contains(&key.len()) {
            return Err(SecmodError::native_detail(
                SEC_ERROR_BAD_KEY,
                format!("{} does not take a {}-byte key", mechanism, key.len()),
            ));
        }
        Ok(SymKey {
            mechanism,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    /// Generate a fresh key from the system CSPRNG.
    pub fn generate(mechanism: Mechanism) -> Self {
        let mut key = Zeroizing::new(vec![0u8; mechanism.default_key_len()]);
        rand::rngs::OsRng.fill_bytes(&mut key);
        SymKey { mechanism, key }
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    pub fn key_data(&self) -> &[u8] {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// Initialization vector for a CBC mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvParam {
    iv: Vec<u8>,
}

impl IvParam {
    pub fn from_iv(mechanism: Mechanism, iv: &[u8]) -> Result<Self, SecmodError> {
        if iv.len() != mechanism.iv_len() {
            return Err(SecmodError::native_detail(
                crate::errcode::SEC_ERROR_INVALID_ARGS,
                format!("{} needs a {}-byte IV, got {}", mechanism, mechanism.iv_len(), iv.len()),
            ));
        }
        Ok(IvParam { iv: iv.to_vec() })
    }

    /// Random IV from the system CSPRNG.
    pub fn generate(mechanism: Mechanism) -> Self {
        let mut iv = vec![0u8; mechanism.iv_len()];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        IvParam { iv }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.iv
    }
}

// ─── Block modes ────────────────────────────────────────────────────────

/// One chained block transform, already keyed and seeded with its IV.
trait BlockMode: Send {
    fn process_block(&mut self, block: &mut [u8]);
}

struct Encrypting<C: BlockEncryptMut + BlockCipher>(cbc::Encryptor<C>);
struct Decrypting<C: BlockDecryptMut + BlockCipher>(cbc::Decryptor<C>);

impl<C> BlockMode for Encrypting<C>
where
    C: BlockEncryptMut + BlockCipher + Send,
{
    fn process_block(&mut self, block: &mut [u8]) {
        self.0.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

impl<C> BlockMode for Decrypting<C>
where
    C: BlockDecryptMut + BlockCipher + Send,
{
    fn process_block(&mut self, block: &mut [u8]) {
        self.0.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn keyed<C>(op: Operation, key: &[u8], iv: &[u8]) -> Result<Box<dyn BlockMode>, SecmodError>
where
    C: BlockEncryptMut + BlockDecryptMut + BlockCipher + KeyInit + Send + 'static,
{
    let bad_key = |_| SecmodError::native_detail(SEC_ERROR_BAD_KEY, "key or IV length rejected");
    Ok(match op {
        Operation::Encrypt => Box::new(Encrypting(
            cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?,
        )),
        Operation::Decrypt => Box::new(Decrypting(
            cbc::Decryptor::<C>::new_from_slices(key, iv).map_err(bad_key)?,
        )),
    })
}

fn block_mode(
    mechanism: Mechanism,
    op: Operation,
    key: &[u8],
    iv: &[u8],
) -> Result<Box<dyn BlockMode>, SecmodError> {
    match (mechanism.family(), key.len()) {
        (Family::Des, _) => keyed::<des::Des>(op, key, iv),
        (Family::Des3, _) => keyed::<des::TdesEde3>(op, key, iv),
        (Family::Aes, 16) => keyed::<aes::Aes128>(op, key, iv),
        (Family::Aes, 24) => keyed::<aes::Aes192>(op, key, iv),
        (Family::Aes, _) => keyed::<aes::Aes256>(op, key, iv),
    }
}

// ─── Context ────────────────────────────────────────────────────────────

/// One encryption or decryption session.
pub struct CipherContext {
    mechanism: Mechanism,
    operation: Operation,
    mode: Option<Box<dyn BlockMode>>,
    pending: Vec<u8>,
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("mechanism", &self.mechanism)
            .field("operation", &self.operation)
            .field("pending", &self.pending.len())
            .field("finalized", &self.mode.is_none())
            .finish()
    }
}

impl Drop for CipherContext {
    fn drop(&mut self) {
        self.pending.zeroize();
    }
}

impl CipherContext {
    pub fn new(
        mechanism: Mechanism,
        operation: Operation,
        key: &SymKey,
        iv: &IvParam,
    ) -> Result<Self, SecmodError> {
        if key.mechanism().family() != mechanism.family() {
            return Err(SecmodError::native_detail(
                SEC_ERROR_BAD_KEY,
                format!("key for {} used with {}", key.mechanism(), mechanism),
            ));
        }
        let iv = IvParam::from_iv(mechanism, iv.as_bytes())?;
        let mode = block_mode(mechanism, operation, key.key_data(), iv.as_bytes())?;
        Ok(CipherContext {
            mechanism,
            operation,
            mode: Some(mode),
            pending: Vec::new(),
        })
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_finalized(&self) -> bool {
        self.mode.is_none()
    }

    /// Feed data; returns zero or more whole blocks of output.
    pub fn cipher_op(&mut self, data: &[u8]) -> Result<Vec<u8>, SecmodError> {
        let bs = self.mechanism.block_size();
        let hold_back = self.holds_back_last_block();
        let mode = self.mode.as_mut().ok_or(SecmodError::ContextFinalized)?;

        self.pending.extend_from_slice(data);
        let mut ready = self.pending.len() / bs * bs;
        if hold_back && ready > 0 && ready == self.pending.len() {
            ready -= bs;
        }

        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        for block in out.chunks_exact_mut(bs) {
            mode.process_block(block);
        }
        Ok(out)
    }

    /// Finish the session and return any remaining output.
    pub fn digest_final(&mut self) -> Result<Vec<u8>, SecmodError> {
        let bs = self.mechanism.block_size();
        let mut mode = self.mode.take().ok_or(SecmodError::ContextFinalized)?;
        let mut tail = std::mem::take(&mut self.pending);

        match (self.operation, self.mechanism.is_padded()) {
            (Operation::Encrypt, true) => {
                let used = tail.len();
                tail.resize(bs, 0);
                pkcs7_pad(&mut tail, used)?;
                mode.process_block(&mut tail);
                Ok(tail)
            }
            (Operation::Decrypt, true) => {
                if tail.len() != bs {
                    tail.zeroize();
                    return Err(input_len_error(bs));
                }
                mode.process_block(&mut tail);
                match pkcs7_unpad(&tail) {
                    Some(len) => {
                        tail.truncate(len);
                        Ok(tail)
                    }
                    None => {
                        tail.zeroize();
                        Err(SecmodError::native_detail(SEC_ERROR_BAD_DATA, "invalid padding"))
                    }
                }
            }
            (_, false) => {
                if tail.is_empty() {
                    Ok(Vec::new())
                } else {
                    tail.zeroize();
                    Err(input_len_error(bs))
                }
            }
        }
    }

    fn holds_back_last_block(&self) -> bool {
        self.operation == Operation::Decrypt && self.mechanism.is_padded()
    }
}

fn input_len_error(bs: usize) -> SecmodError {
    SecmodError::native_detail(
        SEC_ERROR_INPUT_LEN,
        format!("input is not a multiple of the {}-byte block size", bs),
    )
}

fn pad_block<B: ArrayLength<u8>>(block: &mut [u8], used: usize) {
    <Pkcs7 as Padding<B>>::pad(GenericArray::from_mut_slice(block), used);
}

fn unpad_block<B: ArrayLength<u8>>(block: &[u8]) -> Option<usize> {
    <Pkcs7 as Padding<B>>::unpad(GenericArray::from_slice(block))
        .ok()
        .map(<[u8]>::len)
}

/// Fill the tail of one block, whose first `used` bytes are data, with
/// PKCS#7 padding.
fn pkcs7_pad(block: &mut [u8], used: usize) -> Result<(), SecmodError> {
    if used >= block.len() {
        return Err(input_len_error(block.len()));
    }
    match block.len() {
        8 => pad_block::<U8>(block, used),
        16 => pad_block::<U16>(block, used),
        other => return Err(input_len_error(other)),
    }
    Ok(())
}

/// Length of the plaintext in a decrypted final block, or `None` if the
/// PKCS#7 padding is malformed.
fn pkcs7_unpad(block: &[u8]) -> Option<usize> {
    match block.len() {
        8 => unpad_block::<U8>(block),
        16 => unpad_block::<U16>(block),
        _ => None,
    }
}

/// Run a whole buffer through a fresh context.
pub fn cipher_buf(
    mechanism: Mechanism,
    operation: Operation,
    key: &SymKey,
    iv: &IvParam,
    data: &[u8],
) -> Result<Vec<u8>, SecmodError> {
    let mut ctx = CipherContext::new(mechanism, operation, key, iv)?;
    let mut out = ctx.cipher_op(data)?;
    out.extend(ctx.digest_final()?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn padding_validation() {
        assert_eq!(pkcs7_unpad(&[1, 2, 3, 4, 5, 6, 2, 2]), Some(6));
        assert_eq!(pkcs7_unpad(&[8; 8]), Some(0));
        assert_eq!(pkcs7_unpad(&[1, 2, 3, 4, 5, 6, 7, 0]), None);
        assert_eq!(pkcs7_unpad(&[1, 2, 3, 4, 5, 6, 3, 2]), None);
        assert_eq!(pkcs7_unpad(&[9; 8]), None);
        assert_eq!(pkcs7_unpad(&[16; 16]), Some(0));
        assert_eq!(pkcs7_unpad(&[1; 12]), None);
    }

    #[test]
    fn padding_fills_the_block() {
        let mut block = [0xAA, 0xBB, 0xCC, 0, 0, 0, 0, 0];
        pkcs7_pad(&mut block, 3).unwrap();
        assert_eq!(block, [0xAA, 0xBB, 0xCC, 5, 5, 5, 5, 5]);

        let mut empty = [0u8; 16];
        pkcs7_pad(&mut empty, 0).unwrap();
        assert_eq!(empty, [16; 16]);
        assert_eq!(pkcs7_unpad(&empty), Some(0));

        let mut full = [0u8; 8];
        assert!(pkcs7_pad(&mut full, 8).is_err());
    }

    #[test]
    fn mechanism_names_parse() {
        assert_eq!("CKM_DES_CBC_PAD".parse::<Mechanism>().unwrap(), Mechanism::DesCbcPad);
        assert_eq!("aes_cbc".parse::<Mechanism>().unwrap(), Mechanism::AesCbc);
        assert!("CKM_RC4".parse::<Mechanism>().is_err());
    }
}
