#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Streaming digest and cipher contexts.

use secmod_lib::*;

const PLAIN_TEXT: &[u8] = b"Encrypt me!";
const DES_KEY: &str = "e8:a7:7c:e2:05:63:6a:31";
const DES_IV: &str = "e4:bb:3b:d3:c3:71:2e:58";

/// Something larger than a few blocks with no block-aligned length.
fn reference_data() -> Vec<u8> {
    (0..5000u32).map(|i| (i * 31 % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

fn chunked_digest(tag: OidTag, data: &[u8], chunk: usize) -> Vec<u8> {
    let mut ctx = DigestContext::new(tag).unwrap();
    ctx.digest_begin().unwrap();
    for piece in data.chunks(chunk) {
        ctx.digest_op(piece).unwrap();
    }
    ctx.digest_final().unwrap()
}

#[test]
fn known_answers() {
    assert_eq!(data_to_hex(&md5_digest(b"abc"), ""), "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(
        data_to_hex(&sha1_digest(b"abc"), ""),
        "a9993e364706816aba3e25717850c26c9cd0d89d"
    );
    assert_eq!(
        data_to_hex(&sha256_digest(b"abc"), ""),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(
        data_to_hex(&sha512_digest(b""), ""),
        "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
         47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
    );
}

#[test]
fn chunk_size_does_not_change_the_digest() {
    let data = reference_data();
    for tag in [OidTag::Md5, OidTag::Sha1, OidTag::Sha256, OidTag::Sha384, OidTag::Sha512] {
        let one_shot = hash_buf(tag, &data).unwrap();
        for chunk in [1, 128, data.len()] {
            assert_eq!(chunked_digest(tag, &data, chunk), one_shot, "{} chunk {}", tag, chunk);
        }
    }
    assert_eq!(hash_buf(OidTag::Sha256, &data).unwrap(), sha256_digest(&data));
}

#[test]
fn finalized_digest_rejects_further_use() {
    let mut ctx = DigestContext::new(OidTag::Sha1).unwrap();
    ctx.digest_op(b"data").unwrap();
    ctx.digest_final().unwrap();
    assert!(ctx.is_finalized());
    assert!(matches!(ctx.digest_op(b"more"), Err(SecmodError::ContextFinalized)));
    assert!(matches!(ctx.digest_final(), Err(SecmodError::ContextFinalized)));
}

#[test]
fn non_digest_algorithm_is_rejected() {
    let err = DigestContext::new(OidTag::AvaCommonName).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_INVALID_ALGORITHM));
}

// ---------------------------------------------------------------------------
// Ciphers
// ---------------------------------------------------------------------------

fn des_contexts() -> (CipherContext, CipherContext) {
    let mechanism = Mechanism::DesCbcPad;
    let key = SymKey::import(mechanism, &read_hex(DES_KEY).unwrap()).unwrap();
    let iv = IvParam::from_iv(mechanism, &read_hex(DES_IV).unwrap()).unwrap();
    (
        CipherContext::new(mechanism, Operation::Encrypt, &key, &iv).unwrap(),
        CipherContext::new(mechanism, Operation::Decrypt, &key, &iv).unwrap(),
    )
}

#[test]
fn des_cbc_pad_string() {
    let (mut enc, mut dec) = des_contexts();
    let mut cipher_text = enc.cipher_op(PLAIN_TEXT).unwrap();
    cipher_text.extend(enc.digest_final().unwrap());
    assert_eq!(cipher_text.len(), 16);
    assert_ne!(cipher_text, PLAIN_TEXT);

    let mut decoded = dec.cipher_op(&cipher_text).unwrap();
    decoded.extend(dec.digest_final().unwrap());
    assert_eq!(decoded, PLAIN_TEXT);
}

#[test]
fn des_cbc_pad_chunked_stream() {
    let data = reference_data();
    let (mut enc, mut dec) = des_contexts();

    let mut encrypted = Vec::new();
    for chunk in data.chunks(128) {
        encrypted.extend(enc.cipher_op(chunk).unwrap());
    }
    encrypted.extend(enc.digest_final().unwrap());
    assert_ne!(encrypted, data);
    assert_eq!(encrypted.len() % 8, 0);

    let mut decrypted = Vec::new();
    for chunk in encrypted.chunks(128) {
        decrypted.extend(dec.cipher_op(chunk).unwrap());
    }
    decrypted.extend(dec.digest_final().unwrap());
    assert_eq!(decrypted, data);
}

#[test]
fn every_mechanism_round_trips() {
    let data = reference_data();
    for mechanism in [
        Mechanism::DesCbcPad,
        Mechanism::Des3CbcPad,
        Mechanism::AesCbcPad,
    ] {
        let key = SymKey::generate(mechanism);
        let iv = IvParam::generate(mechanism);
        let encrypted =
            cipher::cipher_buf(mechanism, Operation::Encrypt, &key, &iv, &data).unwrap();
        let decrypted =
            cipher::cipher_buf(mechanism, Operation::Decrypt, &key, &iv, &encrypted).unwrap();
        assert_eq!(decrypted, data, "{}", mechanism);
    }
}

#[test]
fn unpadded_mechanisms_need_whole_blocks() {
    let mechanism = Mechanism::AesCbc;
    let key = SymKey::generate(mechanism);
    let iv = IvParam::generate(mechanism);
    let err = cipher::cipher_buf(mechanism, Operation::Encrypt, &key, &iv, b"not sixteen").unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_INPUT_LEN));

    let block = [7u8; 32];
    let encrypted = cipher::cipher_buf(mechanism, Operation::Encrypt, &key, &iv, &block).unwrap();
    assert_eq!(encrypted.len(), 32);
}

#[test]
fn wrong_key_length_and_reuse() {
    let err = SymKey::import(Mechanism::DesCbc, &[1, 2, 3]).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_BAD_KEY));

    let (mut enc, _) = des_contexts();
    enc.digest_final().unwrap();
    assert!(matches!(enc.cipher_op(PLAIN_TEXT), Err(SecmodError::ContextFinalized)));
}

#[test]
fn mechanism_names() {
    assert_eq!(Mechanism::DesCbcPad.name(), "CKM_DES_CBC_PAD");
    assert_eq!("CKM_AES_CBC_PAD".parse::<Mechanism>().unwrap(), Mechanism::AesCbcPad);
    assert_eq!("des3_cbc".parse::<Mechanism>().unwrap(), Mechanism::Des3Cbc);
}

#[test]
fn hex_helpers() {
    assert_eq!(read_hex(DES_KEY).unwrap(), vec![0xe8, 0xa7, 0x7c, 0xe2, 0x05, 0x63, 0x6a, 0x31]);
    assert_eq!(read_hex("0xdeadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    assert!(read_hex("zz").is_err());
    assert_eq!(data_to_hex(&[0xe8, 0xa7], ":"), "e8:a7");
}
