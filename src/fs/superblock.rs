//! The superblock: block 0's magic words, TLV configuration records, and
//! the geometry checks run at mount.
//!
//! Block 0 is always laid out with the default block size, whatever size
//! the rest of the image uses; the five magic words sit at fixed offsets so
//! an image can be identified before its geometry is known. Layout:
//!
//! ```text
//! [ tag: 2 magic words + noise | count ∥ TLV records … | hash: 3 magic words + noise | total blocks ]
//!   0                        32 32                2008   2008                   2040   2040     2048
//! ```

use crate::crypto;
use crate::error::{Error, Result};
use crate::fs::block::{get_be16, get_be32, get_be64, set_be16, set_be32, set_be64};
use crate::param::{
    BLOCK_OVERHEAD, BLOCK_SIZE, BLOCK_SIZE_MIN, CIPHER_BLOCK, COPIES_DEFAULT, COPIES_MAX,
    FS_NAME, FS_VERSION, FS_VERSION_2015, HASH_SIZE, HEADER_MAGIC, HEADER_MAGIC_2010,
    HEADER_MAGIC_2015, HEAD_OFFSET, KDF_ITERATIONS, MAC_SIZE, NEXT_SIZE, TAG_MAGIC, TAG_SIZE,
};

/// Offsets within the fixed-layout superblock region.
const COUNT_OFF: usize = TAG_SIZE;
const RECORDS_OFF: usize = COUNT_OFF + 8;
const HASH_OFF: usize = BLOCK_SIZE - HASH_SIZE - NEXT_SIZE;
const NEXT_OFF: usize = BLOCK_SIZE - NEXT_SIZE;

/// TLV record tags.
#[derive(Clone, Copy, PartialEq)]
#[repr(u8)]
enum Tag {
    Stegfs = 0,
    Version = 1,
    Cipher = 2,
    Hash = 3,
    Mode = 4,
    BlockSize = 5,
    HeadOffset = 6,
    Duplication = 7,
    Mac = 8,
    Kdf = 9,
}

/// Everything the engine needs to know about a mounted image.
#[derive(Clone)]
pub struct Superblock {
    /// Format generation string.
    pub version: String,

    /// Algorithm names, as stored.
    pub cipher: String,
    pub mode: String,
    pub hash: String,
    pub mac: String,

    /// Block size in bytes.
    pub blocksize: u32,

    /// Offset of file payload within an inode block's data field.
    pub head_offset: u32,

    /// Duplication factor N.
    pub copies: u32,

    /// PBKDF2 iteration count.
    pub kdf_iterations: u64,

    /// Total block count, including block 0.
    pub blocks: u64,
}

impl Superblock {
    /// The default-suite superblock for a fresh or paranoid file system.
    pub fn with_defaults(blocksize: u32, copies: u32, kdf_iterations: u64, blocks: u64) -> Self {
        Self {
            version: FS_VERSION.to_owned(),
            cipher: crypto::CIPHER_NAME.to_owned(),
            mode: crypto::MODE_NAME.to_owned(),
            hash: crypto::HASH_NAME.to_owned(),
            mac: crypto::MAC_NAME.to_owned(),
            blocksize,
            head_offset: HEAD_OFFSET,
            copies,
            kdf_iterations,
            blocks,
        }
    }

    /// Payload bytes per data block.
    pub fn data_size(&self) -> usize {
        self.blocksize as usize - BLOCK_OVERHEAD
    }

    /// Payload bytes that fit inside an inode block.
    pub fn head_capacity(&self) -> usize {
        self.data_size() - self.head_offset as usize
    }

    /// Data blocks needed per copy for a file of `size` bytes.
    pub fn chain_len(&self, size: u64) -> u64 {
        let head = self.head_capacity() as u64;
        if size <= head {
            0
        } else {
            (size - head + self.data_size() as u64 - 1) / self.data_size() as u64
        }
    }

    /// Sanity checks shared by mount and mkfs.
    pub fn validate(&self, image_size: u64) -> Result<()> {
        let bs = self.blocksize as usize;
        if bs < BLOCK_SIZE_MIN || bs % CIPHER_BLOCK != 0 {
            return Err(Error::InvalidTag("BLOCKSIZE"));
        }
        if self.copies == 0 || self.copies as usize > COPIES_MAX {
            return Err(Error::InvalidTag("DUPLICATION"));
        }
        let reserve = (self.copies as usize + 1) * NEXT_SIZE + MAC_SIZE;
        if (self.head_offset as usize) < reserve || self.head_offset as usize >= self.data_size() {
            return Err(Error::InvalidTag("HEADER_OFFSET"));
        }
        if self.blocks != image_size / self.blocksize as u64 || self.blocks < 2 {
            return Err(Error::CorruptTag);
        }
        Ok(())
    }

    /// Recognize and decode block 0. `region` is the first default-size
    /// block of the image; `image_size` the full image length in bytes.
    pub fn read(region: &[u8], image_size: u64) -> Result<Self> {
        if region.len() < BLOCK_SIZE {
            return Err(Error::NotStegfs);
        }
        let h = [
            get_be64(region, HASH_OFF),
            get_be64(region, HASH_OFF + 8),
            get_be64(region, HASH_OFF + 16),
        ];
        if h == HEADER_MAGIC_2010 {
            return Err(Error::OldStegfs);
        }
        if h[0] != HEADER_MAGIC[0] || h[1] != HEADER_MAGIC[1] {
            return Err(Error::NotStegfs);
        }
        match h[2] {
            HEADER_MAGIC_2015 => return Err(Error::OldStegfs),
            x if x == HEADER_MAGIC[2] => (),
            _ => return Err(Error::NotStegfs),
        }

        let records = decode_records(region)?;
        let text = |t: Tag, what: &'static str| -> Result<Option<String>> {
            match records.iter().find(|(tag, _)| *tag == t as u8) {
                Some((_, v)) => String::from_utf8(v.clone())
                    .map(Some)
                    .map_err(|_| Error::InvalidTag(what)),
                None => Ok(None),
            }
        };

        let product = text(Tag::Stegfs, "STEGFS")?.ok_or(Error::MissingTag("STEGFS"))?;
        if !product.starts_with(FS_NAME) {
            return Err(Error::InvalidTag("STEGFS"));
        }
        let version = text(Tag::Version, "VERSION")?.ok_or(Error::MissingTag("VERSION"))?;
        if version == FS_VERSION_2015 {
            // the prior generation carries no chain MAC; never mountable
            return Err(Error::OldStegfs);
        }
        if version != FS_VERSION {
            return Err(Error::OldStegfs);
        }

        let cipher = text(Tag::Cipher, "CIPHER")?.unwrap_or_else(|| crypto::CIPHER_NAME.to_owned());
        let mode = text(Tag::Mode, "MODE")?.unwrap_or_else(|| crypto::MODE_NAME.to_owned());
        let hash = text(Tag::Hash, "HASH")?.unwrap_or_else(|| crypto::HASH_NAME.to_owned());
        let mac = text(Tag::Mac, "MAC")?.unwrap_or_else(|| crypto::MAC_NAME.to_owned());
        if !crypto::suite_supported(&cipher, &mode, &hash, &mac) {
            return Err(Error::InvalidTag("CIPHER"));
        }

        let word32 = |t: Tag, what: &'static str| -> Result<Option<u32>> {
            match records.iter().find(|(tag, _)| *tag == t as u8) {
                Some((_, v)) if v.len() == 4 => Ok(Some(get_be32(v, 0))),
                Some(_) => Err(Error::InvalidTag(what)),
                None => Ok(None),
            }
        };

        let blocksize =
            word32(Tag::BlockSize, "BLOCKSIZE")?.ok_or(Error::MissingTag("BLOCKSIZE"))?;
        let head_offset =
            word32(Tag::HeadOffset, "HEADER_OFFSET")?.ok_or(Error::MissingTag("HEADER_OFFSET"))?;
        let copies = word32(Tag::Duplication, "DUPLICATION")?.unwrap_or(COPIES_DEFAULT);
        let kdf_iterations = match records.iter().find(|(tag, _)| *tag == Tag::Kdf as u8) {
            Some((_, v)) if v.len() == 8 => get_be64(v, 0),
            Some(_) => return Err(Error::InvalidTag("KDF")),
            None => KDF_ITERATIONS,
        };

        let sb = Self {
            version,
            cipher,
            mode,
            hash,
            mac,
            blocksize,
            head_offset,
            copies,
            kdf_iterations,
            blocks: get_be64(region, NEXT_OFF),
        };
        sb.validate(image_size)?;
        Ok(sb)
    }

    /// Encode into a freshly noise-filled superblock region.
    pub fn encode(&self, region: &mut [u8]) {
        assert!(region.len() >= BLOCK_SIZE);
        set_be64(region, 0, TAG_MAGIC[0]);
        set_be64(region, 8, TAG_MAGIC[1]);
        set_be64(region, HASH_OFF, HEADER_MAGIC[0]);
        set_be64(region, HASH_OFF + 8, HEADER_MAGIC[1]);
        set_be64(region, HASH_OFF + 16, HEADER_MAGIC[2]);
        set_be64(region, NEXT_OFF, self.blocks);

        let mut w32 = [0u8; 4];
        let mut w64 = [0u8; 8];
        set_be32(&mut w32, 0, self.blocksize);
        let blocksize = w32;
        set_be32(&mut w32, 0, self.head_offset);
        let head_offset = w32;
        set_be32(&mut w32, 0, self.copies);
        let copies = w32;
        set_be64(&mut w64, 0, self.kdf_iterations);

        let records: [(Tag, &[u8]); 10] = [
            (Tag::Stegfs, FS_NAME.as_bytes()),
            (Tag::Version, self.version.as_bytes()),
            (Tag::Cipher, self.cipher.as_bytes()),
            (Tag::Hash, self.hash.as_bytes()),
            (Tag::Mode, self.mode.as_bytes()),
            (Tag::BlockSize, &blocksize),
            (Tag::HeadOffset, &head_offset),
            (Tag::Duplication, &copies),
            (Tag::Mac, self.mac.as_bytes()),
            (Tag::Kdf, &w64),
        ];

        set_be64(region, COUNT_OFF, records.len() as u64);
        let mut off = RECORDS_OFF;
        for (tag, value) in records.iter() {
            region[off] = *tag as u8;
            set_be16(region, off + 1, value.len() as u16);
            region[off + 3..off + 3 + value.len()].copy_from_slice(value);
            off += 3 + value.len();
        }
        debug_assert!(off <= HASH_OFF);
    }
}

/// Walk the TLV region into raw `(tag, value)` records.
fn decode_records(region: &[u8]) -> Result<Vec<(u8, Vec<u8>)>> {
    let count = get_be64(region, COUNT_OFF);
    if count > 64 {
        return Err(Error::CorruptTag);
    }
    let mut records = Vec::with_capacity(count as usize);
    let mut off = RECORDS_OFF;
    for _ in 0..count {
        if off + 3 > HASH_OFF {
            return Err(Error::CorruptTag);
        }
        let tag = region[off];
        let len = get_be16(region, off + 1) as usize;
        off += 3;
        if off + len > HASH_OFF {
            return Err(Error::CorruptTag);
        }
        records.push((tag, region[off..off + len].to_vec()));
        off += len;
    }
    Ok(records)
}
