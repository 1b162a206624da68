//! Cryptographic primitives for the appliance protocol.
//!
//! The inner application envelope is AES-128-ECB under a fixed vendor key and
//! sealed with a salted MD5 tag; the outer transport frames are AES-256-CBC
//! under the per-session key with SHA-256 signatures. Appliance messages carry
//! an 8-bit two's-complement checksum. All of it lives here as pure functions
//! over byte slices; nothing in this module holds state.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use md5::{Digest as _, Md5};
use sha2::Sha256;

use crate::error::{constants, LanError, Result};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Fixed vendor key for the inner-envelope AES-128-ECB layer.
pub const APP_KEY: [u8; 16] = [
    0xc5, 0x75, 0x11, 0x5f, 0x1d, 0x7c, 0x43, 0x51, 0x98, 0x87, 0x6a, 0x64, 0x34, 0x11, 0x7a, 0x86,
];

/// Fixed salt appended to the data before the MD5 envelope tag is computed.
pub const TAG_SALT: [u8; 32] = [
    0xa3, 0x24, 0xac, 0x3e, 0x19, 0x8a, 0x10, 0x52, 0x76, 0xbc, 0xec, 0x8a, 0x4e, 0xc9, 0xa7, 0x58,
    0x90, 0x97, 0x41, 0xe1, 0x14, 0x06, 0x7d, 0x70, 0x8b, 0x49, 0x16, 0x56, 0x0c, 0x55, 0x9e, 0x51,
];

/// AES-128-ECB encrypt under the fixed vendor key, padding with PKCS#7.
pub fn encrypt_ecb(plain: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(&APP_KEY.into());

    let pad = BLOCK_SIZE - plain.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(plain.len() + pad);
    out.extend_from_slice(plain);
    out.resize(plain.len() + pad, pad as u8);

    for chunk in out.chunks_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    out
}

/// AES-128-ECB decrypt under the fixed vendor key, stripping strict PKCS#7.
///
/// # Errors
/// `LanError::Framing` if the ciphertext is not block-aligned or empty;
/// `LanError::Integrity` if the padding bytes are inconsistent. The reference
/// firmware tolerates garbage padding; this implementation does not guess.
pub fn decrypt_ecb(ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(LanError::Framing(constants::ERR_BLOCK_ALIGNMENT));
    }

    let cipher = Aes128::new(&APP_KEY.into());
    let mut out = ciphertext.to_vec();
    for chunk in out.chunks_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }

    let pad = *out.last().unwrap_or(&0) as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > out.len() {
        return Err(LanError::Integrity(constants::ERR_PADDING));
    }
    if out[out.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(LanError::Integrity(constants::ERR_PADDING));
    }
    out.truncate(out.len() - pad);
    Ok(out)
}

/// AES-256-CBC encrypt with a zero IV and no padding.
///
/// The protocol guarantees block-aligned plaintexts on this path; anything
/// else is a caller bug surfaced as a framing error rather than silently
/// padded.
pub fn encrypt_cbc(plain: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if plain.len() % BLOCK_SIZE != 0 {
        return Err(LanError::Framing(constants::ERR_BLOCK_ALIGNMENT));
    }

    let cipher = Aes256::new(key.into());
    let mut out = Vec::with_capacity(plain.len());
    let mut chain = [0u8; BLOCK_SIZE];

    for chunk in plain.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        for (i, byte) in chunk.iter().enumerate() {
            block[i] = byte ^ chain[i];
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        chain = block;
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// AES-256-CBC decrypt with a zero IV and no padding.
pub fn decrypt_cbc(ciphertext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(LanError::Framing(constants::ERR_BLOCK_ALIGNMENT));
    }

    let cipher = Aes256::new(key.into());
    let mut out = Vec::with_capacity(ciphertext.len());
    let mut chain = [0u8; BLOCK_SIZE];

    for chunk in ciphertext.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(chunk);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        for (i, byte) in block.iter().enumerate() {
            out.push(byte ^ chain[i]);
        }
        chain.copy_from_slice(chunk);
    }
    Ok(out)
}

/// Salted MD5 envelope tag: `MD5(data ‖ TAG_SALT)`.
pub fn md5_tag(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.update(TAG_SALT);
    hasher.finalize().into()
}

/// SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 8-bit two's-complement checksum: `(~Σ bytes + 1) & 0xFF`.
pub fn sum8(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Byte-wise XOR of two equal-length buffers.
///
/// The protocol only XORs equal-length key material; mismatched lengths are a
/// caller bug.
pub fn buffer_xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}
