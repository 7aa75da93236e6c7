//! Bindings to the symmetric primitives: SHA-256, AES-256-CBC, HMAC-SHA-256,
//! PBKDF2, and the OS CSPRNG.
//!
//! The cipher contexts here are deliberately *streaming*: one context
//! encrypts (or decrypts) every block of a chain in chain order, so the CBC
//! state runs across block boundaries. An AEAD or stream cipher cannot be
//! substituted; the format depends on in-place ciphertext that is
//! indistinguishable from the noise filling free blocks.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::param::{CIPHER_BLOCK, HASH_SIZE, MAC_SIZE};

/// Algorithm names as recorded in (and accepted from) the superblock.
pub const CIPHER_NAME: &str = "AES256";
pub const MODE_NAME: &str = "CBC";
pub const HASH_NAME: &str = "SHA256";
pub const MAC_NAME: &str = "HMAC_SHA256";

/// Cipher key width.
pub const KEY_SIZE: usize = 32;

/// MAC key width (the underlying hash's block size).
pub const MAC_KEY_SIZE: usize = 64;

/// IV width, equal to the cipher block width.
pub const IV_SIZE: usize = CIPHER_BLOCK;

/// Digest the concatenation of `parts`.
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

/// Stretch a digest of `parts` to `len` bytes by hash chaining: the output
/// is `d0 ∥ H(d0) ∥ H(H(d0)) ∥ …` truncated, with `d0 = H(parts)`.
/// Deterministic, so it is usable for placement derivation.
pub fn hash_expand(parts: &[&[u8]], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + HASH_SIZE);
    let mut d = hash(parts);
    out.extend_from_slice(&d);
    while out.len() < len {
        d = hash(&[&d]);
        out.extend_from_slice(&d);
    }
    out.truncate(len);
    out
}

/// PBKDF2-HMAC-SHA-256. Output length is taken from `out`.
pub fn derive_key(secret: &[u8], salt: &[u8], iterations: u64, out: &mut [u8]) {
    let rounds = iterations.min(u32::MAX as u64) as u32;
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, rounds, out);
}

/// Fill `buf` from the OS CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// One uniformly random 64-bit value.
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

/// Streaming CBC encryptor; state carries across `apply` calls.
pub struct ChainEncryptor {
    inner: cbc::Encryptor<Aes256>,
}

impl ChainEncryptor {
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner: cbc::Encryptor::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// Encrypt `buf` in place. `buf` must cut into whole cipher blocks.
    pub fn apply(&mut self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % CIPHER_BLOCK, 0);
        for chunk in buf.chunks_exact_mut(CIPHER_BLOCK) {
            self.inner.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
    }
}

/// Streaming CBC decryptor; state carries across `apply` calls.
pub struct ChainDecryptor {
    inner: cbc::Decryptor<Aes256>,
}

impl ChainDecryptor {
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner: cbc::Decryptor::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// Decrypt `buf` in place. `buf` must cut into whole cipher blocks.
    pub fn apply(&mut self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % CIPHER_BLOCK, 0);
        for chunk in buf.chunks_exact_mut(CIPHER_BLOCK) {
            self.inner.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
    }
}

/// Incremental MAC over the plaintext data fields of a chain.
pub struct MacStream {
    inner: Hmac<Sha256>,
}

impl MacStream {
    pub fn new(key: &[u8]) -> Self {
        Self {
            // HMAC accepts keys of any length.
            inner: Hmac::new_from_slice(key).expect("hmac key"),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; MAC_SIZE] {
        self.inner.finalize().into_bytes().into()
    }

    /// Constant-time comparison against a stored tag.
    pub fn verify(self, tag: &[u8]) -> bool {
        self.inner.verify_slice(tag).is_ok()
    }
}

/// Whether the named algorithm suite is the one this build implements.
pub fn suite_supported(cipher: &str, mode: &str, hash: &str, mac: &str) -> bool {
    cipher == CIPHER_NAME && mode == MODE_NAME && hash == HASH_NAME && mac == MAC_NAME
}
