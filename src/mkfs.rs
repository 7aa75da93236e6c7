//! Image creation: fill the backing store with CSPRNG output so that free
//! and used blocks are indistinguishable, then stamp the superblock
//! (skipped for paranoid images, which carry no header at all).

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use scopeguard::ScopeGuard;

use crate::crypto;
use crate::error::Result;
use crate::fs::Superblock;
use crate::param::{BLOCK_SIZE, COPIES_DEFAULT, KDF_ITERATIONS};

/// Noise is written in chunks of this many bytes.
const FILL_CHUNK: usize = 1 << 20;

#[derive(Clone)]
pub struct MkfsOptions {
    /// Image size in bytes; anything past the last whole block is unused.
    pub size: u64,
    pub blocksize: u32,
    pub duplication: u32,
    pub kdf_iterations: u64,
    /// Write no superblock; the mount must supply every parameter.
    pub paranoid: bool,
    /// Overwrite an existing file.
    pub force: bool,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            size: 0,
            blocksize: BLOCK_SIZE as u32,
            duplication: COPIES_DEFAULT,
            kdf_iterations: KDF_ITERATIONS,
            paranoid: false,
            force: false,
        }
    }
}

/// What was created, for the caller to report.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub blocks: u64,
    pub blocksize: u32,
    /// Raw payload capacity in bytes, before duplication.
    pub capacity: u64,
    /// Capacity divided by the duplication factor.
    pub usable: u64,
}

/// Create a fresh image at `path`.
pub fn make_image(path: &Path, opts: &MkfsOptions) -> Result<Geometry> {
    let blocks = opts.size / opts.blocksize as u64;
    let sb = Superblock::with_defaults(opts.blocksize, opts.duplication, opts.kdf_iterations, blocks);
    sb.validate(opts.size)?;

    let file = if opts.force {
        OpenOptions::new().write(true).create(true).truncate(true).open(path)?
    } else {
        OpenOptions::new().write(true).create_new(true).open(path)?
    };
    // remove the partial image on any failure below
    let mut file = scopeguard::guard(file, |f| {
        drop(f);
        let _ = std::fs::remove_file(path);
    });

    let mut remaining = opts.size;
    let mut chunk = vec![0u8; FILL_CHUNK.min(opts.size as usize)];
    while remaining > 0 {
        let n = (remaining as usize).min(chunk.len());
        crypto::fill_random(&mut chunk[..n]);
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }

    if !opts.paranoid {
        let mut region = vec![0u8; BLOCK_SIZE];
        crypto::fill_random(&mut region);
        sb.encode(&mut region);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&region)?;
    }
    file.flush()?;
    let _ = ScopeGuard::into_inner(file);

    let capacity = (blocks - 1) * sb.data_size() as u64;
    let geometry = Geometry {
        blocks,
        blocksize: opts.blocksize,
        capacity,
        usable: capacity / opts.duplication as u64,
    };
    log::info!(
        "created {} blocks of {} bytes ({} usable across {} copies)",
        geometry.blocks,
        geometry.blocksize,
        geometry.usable,
        opts.duplication,
    );
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn refuses_undersized_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let opts = MkfsOptions { size: BLOCK_SIZE as u64, ..MkfsOptions::default() };
        let err = make_image(&dir.path().join("img"), &opts);
        assert!(matches!(err, Err(Error::CorruptTag)));
        assert!(!dir.path().join("img").exists());
    }

    #[test]
    fn refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = dir.path().join("img");
        let opts = MkfsOptions { size: 64 * BLOCK_SIZE as u64, ..MkfsOptions::default() };
        make_image(&p, &opts).expect("first");
        assert!(make_image(&p, &opts).is_err());
        make_image(&p, &MkfsOptions { force: true, ..opts }).expect("forced");
    }
}
