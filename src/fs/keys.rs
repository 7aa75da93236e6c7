//! Per-file key schedule and deterministic inode placement.
//!
//! The parent directory path is the KDF salt, so a file's cryptographic
//! identity *is* its location: renaming a directory is impossible by
//! construction. The passphrase enters key and IV derivation but never
//! inode placement, so knowing where a file would live proves nothing.

use arrayvec::ArrayVec;

use crate::crypto::{self, ChainDecryptor, ChainEncryptor, MacStream, IV_SIZE, KEY_SIZE, MAC_KEY_SIZE};
use crate::param::{COPIES_MAX, NEXT_SIZE};

/// Key material for one `(dir, name, pass)` identity across all copies.
/// The cipher and MAC keys are shared; only the IV differs per copy.
pub struct FileKeys {
    key: [u8; KEY_SIZE],
    mac_key: [u8; MAC_KEY_SIZE],
    ivs: Vec<[u8; IV_SIZE]>,
}

impl FileKeys {
    pub fn derive(dir: &str, name: &str, pass: &str, copies: u32, iterations: u64) -> Self {
        let master = crypto::hash(&[name.as_bytes(), pass.as_bytes()]);
        let salt = crypto::hash(&[dir.as_bytes()]);

        let mut key = [0u8; KEY_SIZE];
        crypto::derive_key(&master, &salt, iterations, &mut key);
        let mut mac_key = [0u8; MAC_KEY_SIZE];
        crypto::derive_key(&master, &salt, iterations, &mut mac_key);

        let ivs = (0..copies)
            .map(|i| {
                let d = crypto::hash(&[
                    pass.as_bytes(),
                    name.as_bytes(),
                    dir.as_bytes(),
                    &[i as u8],
                ]);
                let mut iv = [0u8; IV_SIZE];
                iv.copy_from_slice(&d[..IV_SIZE]);
                iv
            })
            .collect();

        Self { key, mac_key, ivs }
    }

    /// Fresh encryption context for one copy's stream.
    pub fn encryptor(&self, copy: usize) -> ChainEncryptor {
        ChainEncryptor::new(&self.key, &self.ivs[copy])
    }

    /// Fresh decryption context for one copy's stream.
    pub fn decryptor(&self, copy: usize) -> ChainDecryptor {
        ChainDecryptor::new(&self.key, &self.ivs[copy])
    }

    /// Fresh MAC context; the key does not vary per copy.
    pub fn mac_stream(&self) -> MacStream {
        MacStream::new(&self.mac_key)
    }
}

/// The candidate inode indices of `(dir, name)`: the first `copies`
/// big-endian words of a stretched digest of the path and name. Unreduced;
/// normalized modulo the block count at access time.
pub fn inode_candidates(dir: &str, name: &str, copies: u32) -> ArrayVec<u64, COPIES_MAX> {
    let digest = crypto::hash_expand(
        &[dir.as_bytes(), name.as_bytes()],
        copies as usize * NEXT_SIZE,
    );
    digest
        .chunks_exact(NEXT_SIZE)
        .map(|w| {
            let mut b = [0u8; NEXT_SIZE];
            b.copy_from_slice(w);
            u64::from_be_bytes(b)
        })
        .collect()
}
