//! The mmap-backed image and the single-block codec.
//!
//! Every block is `tag ∥ data ∥ hash ∥ next`; the region after the tag is
//! encrypted as one unit, so the hash and chain pointer are never visible
//! in the clear. Indices are stored unreduced (full 64-bit range) and
//! normalized modulo the block count only here, at access time.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::LayoutVerified;

use crate::crypto::{self, ChainDecryptor, ChainEncryptor};
use crate::error::Result;
use crate::param::{HASH_SIZE, NEXT_SIZE, TAG_SIZE};

type Be16 = U16<BigEndian>;
type Be32 = U32<BigEndian>;
type Be64 = U64<BigEndian>;

pub(crate) fn get_be16(buf: &[u8], off: usize) -> u16 {
    LayoutVerified::<_, Be16>::new_unaligned(&buf[off..off + 2])
        .expect("2-byte window")
        .get()
}

pub(crate) fn get_be32(buf: &[u8], off: usize) -> u32 {
    LayoutVerified::<_, Be32>::new_unaligned(&buf[off..off + 4])
        .expect("4-byte window")
        .get()
}

pub(crate) fn get_be64(buf: &[u8], off: usize) -> u64 {
    LayoutVerified::<_, Be64>::new_unaligned(&buf[off..off + 8])
        .expect("8-byte window")
        .get()
}

pub(crate) fn set_be16(buf: &mut [u8], off: usize, v: u16) {
    LayoutVerified::<_, Be16>::new_unaligned(&mut buf[off..off + 2])
        .expect("2-byte window")
        .set(v);
}

pub(crate) fn set_be32(buf: &mut [u8], off: usize, v: u32) {
    LayoutVerified::<_, Be32>::new_unaligned(&mut buf[off..off + 4])
        .expect("4-byte window")
        .set(v);
}

pub(crate) fn set_be64(buf: &mut [u8], off: usize, v: u64) {
    LayoutVerified::<_, Be64>::new_unaligned(&mut buf[off..off + 8])
        .expect("8-byte window")
        .set(v);
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Take an exclusive advisory lock for the mount's lifetime; the
        /// lock dies with the file descriptor.
        fn lock_exclusive(file: &File) -> Result<()> {
            use std::os::unix::io::AsRawFd;
            // SAFETY: flock on an owned, open descriptor.
            let r = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if r != 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }
    } else {
        fn lock_exclusive(_file: &File) -> Result<()> {
            Ok(())
        }
    }
}

/// The backing store, mapped read-write shared for the mount's lifetime.
pub struct Image {
    _file: File,
    map: MmapMut,
}

impl Image {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        lock_exclusive(&file)?;
        // SAFETY: the exclusive lock above is this process's claim to sole
        // access; the map stays valid while `file` is held.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self { _file: file, map })
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// One decoded block, owned plaintext.
pub struct Block {
    buf: Vec<u8>,
}

impl Block {
    /// A block of fresh CSPRNG output; fields not overwritten before a
    /// write stay noise.
    pub fn noise(blocksize: usize) -> Self {
        let mut buf = vec![0u8; blocksize];
        crypto::fill_random(&mut buf);
        Self { buf }
    }

    fn data_end(&self) -> usize {
        self.buf.len() - HASH_SIZE - NEXT_SIZE
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[TAG_SIZE..self.data_end()]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = self.data_end();
        &mut self.buf[TAG_SIZE..end]
    }

    /// The `next` word: chain pointer of a data block, byte size of an
    /// inode block.
    pub fn next(&self) -> u64 {
        get_be64(&self.buf, self.buf.len() - NEXT_SIZE)
    }

    pub fn set_next(&mut self, v: u64) {
        let off = self.buf.len() - NEXT_SIZE;
        set_be64(&mut self.buf, off, v);
    }
}

/// Outcome of decoding one block under one copy's cipher context.
pub enum BlockRead {
    /// Tag matched (or was not checked), payload hash verified.
    Valid(Block),
    /// The raw tag names some other directory; not decrypted.
    NotOurs,
    /// Decrypted, but the payload hash did not match.
    Corrupt,
    /// Index 0 or beyond the image; never usable.
    Rejected,
}

/// Typed block access over the image.
pub struct BlockDev {
    image: Image,
    blocksize: usize,
    blocks: u64,
}

impl BlockDev {
    pub fn new(image: Image, blocksize: u32) -> Self {
        let blocksize = blocksize as usize;
        let blocks = image.len() / blocksize as u64;
        Self { image, blocksize, blocks }
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn image_len(&self) -> u64 {
        self.image.len()
    }

    pub fn normalize(&self, id: u64) -> u64 {
        id % self.blocks
    }

    /// Byte range of block `id`, or `None` for block 0 and anything that
    /// does not fit the mapping whole.
    fn range(&self, id: u64) -> Option<Range<usize>> {
        let norm = self.normalize(id);
        if norm == 0 {
            return None;
        }
        let start = norm as usize * self.blocksize;
        let end = start + self.blocksize;
        if end as u64 > self.image.len() {
            return None;
        }
        Some(start..end)
    }

    /// The raw (undecrypted) path tag of a block, as the allocator sees it.
    pub fn raw_tag(&self, id: u64) -> Option<&[u8]> {
        let r = self.range(id)?;
        Some(&self.image.map[r.start..r.start + TAG_SIZE])
    }

    /// Decode block `id`: fast-reject on the tag, decrypt the trailing
    /// region, verify the payload hash. `tag` is `None` for files in the
    /// root directory, whose blocks carry noise tags.
    pub fn read(&self, id: u64, tag: Option<&[u8; TAG_SIZE]>, dec: &mut ChainDecryptor) -> BlockRead {
        let r = match self.range(id) {
            Some(r) => r,
            None => return BlockRead::Rejected,
        };
        let raw = &self.image.map[r];
        if let Some(expect) = tag {
            if raw[..TAG_SIZE] != expect[..] {
                return BlockRead::NotOurs;
            }
        }
        let mut block = Block { buf: raw.to_vec() };
        dec.apply(&mut block.buf[TAG_SIZE..]);
        let digest = crypto::hash(&[block.data()]);
        let end = block.data_end();
        if block.buf[end..end + HASH_SIZE] != digest[..] {
            return BlockRead::Corrupt;
        }
        BlockRead::Valid(block)
    }

    /// Encode and store a block: stamp the tag (noise for root files),
    /// stamp the payload hash, encrypt the trailing region in place.
    pub fn write(
        &mut self,
        id: u64,
        mut block: Block,
        tag: Option<&[u8; TAG_SIZE]>,
        enc: &mut ChainEncryptor,
    ) -> Result<()> {
        let r = self.range(id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "block index out of range")
        })?;
        if let Some(t) = tag {
            block.buf[..TAG_SIZE].copy_from_slice(t);
        }
        let digest = crypto::hash(&[block.data()]);
        let end = block.data_end();
        block.buf[end..end + HASH_SIZE].copy_from_slice(&digest);
        enc.apply(&mut block.buf[TAG_SIZE..]);
        self.image.map[r].copy_from_slice(&block.buf);
        Ok(())
    }

    /// Return a block to noise. Out-of-range indices are ignored; block 0
    /// is never touched.
    pub fn scrub(&mut self, id: u64) {
        if let Some(r) = self.range(id) {
            crypto::fill_random(&mut self.image.map[r]);
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.image.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChainDecryptor, ChainEncryptor, IV_SIZE, KEY_SIZE};
    use crate::param::BLOCK_SIZE;
    use std::io::Write;

    fn scratch_dev(blocks: usize) -> (tempfile::TempDir, BlockDev) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("img");
        let mut f = File::create(&path).expect("create");
        let mut noise = vec![0u8; blocks * BLOCK_SIZE];
        crypto::fill_random(&mut noise);
        f.write_all(&noise).expect("fill");
        drop(f);
        let dev = BlockDev::new(Image::open(&path).expect("open"), BLOCK_SIZE as u32);
        (dir, dev)
    }

    #[test]
    fn codec_round_trip() {
        let (_t, mut dev) = scratch_dev(8);
        let key = [9u8; KEY_SIZE];
        let iv = [4u8; IV_SIZE];
        let tag = crypto::hash(&[b"/somewhere"]);

        let mut block = Block::noise(BLOCK_SIZE);
        block.data_mut()[..5].copy_from_slice(b"hello");
        block.set_next(0xDEAD_BEEF_0000_0003);
        let mut enc = ChainEncryptor::new(&key, &iv);
        dev.write(3, block, Some(&tag), &mut enc).expect("write");

        let mut dec = ChainDecryptor::new(&key, &iv);
        match dev.read(3, Some(&tag), &mut dec) {
            BlockRead::Valid(b) => {
                assert_eq!(&b.data()[..5], b"hello");
                assert_eq!(b.next(), 0xDEAD_BEEF_0000_0003);
            }
            _ => panic!("expected a valid block"),
        }

        // wrong directory tag: rejected before any decryption
        let other = crypto::hash(&[b"/elsewhere"]);
        let mut dec = ChainDecryptor::new(&key, &iv);
        assert!(matches!(dev.read(3, Some(&other), &mut dec), BlockRead::NotOurs));

        // wrong key: decrypts to garbage, hash mismatch
        let mut dec = ChainDecryptor::new(&[0u8; KEY_SIZE], &iv);
        assert!(matches!(dev.read(3, Some(&tag), &mut dec), BlockRead::Corrupt));
    }

    #[test]
    fn block_zero_and_bounds_rejected() {
        let (_t, mut dev) = scratch_dev(4);
        let key = [1u8; KEY_SIZE];
        let iv = [1u8; IV_SIZE];
        let mut dec = ChainDecryptor::new(&key, &iv);
        assert!(matches!(dev.read(0, None, &mut dec), BlockRead::Rejected));
        // 8 normalizes to 0 on a 4-block image
        assert!(matches!(dev.read(8, None, &mut dec), BlockRead::Rejected));
        let mut enc = ChainEncryptor::new(&key, &iv);
        assert!(dev.write(4, Block::noise(BLOCK_SIZE), None, &mut enc).is_err());
    }

    #[test]
    fn scrub_rerandomizes() {
        let (_t, mut dev) = scratch_dev(4);
        let before = dev.raw_tag(2).expect("tag").to_vec();
        dev.scrub(2);
        assert_ne!(dev.raw_tag(2).expect("tag"), &before[..]);
    }
}
