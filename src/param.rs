//! On-disk geometry, format magic, and tunable defaults.

use static_assertions::const_assert;

/// Default block size in bytes. Images may use a larger (16-byte aligned)
/// block size; it is recorded in the superblock.
pub const BLOCK_SIZE: usize = 0x0800;

/// Path-tag field: first bytes of every block, plaintext or noise.
pub const TAG_SIZE: usize = 0x20;

/// Data-hash field width.
pub const HASH_SIZE: usize = 0x20;

/// Chain-pointer ("next") field width.
pub const NEXT_SIZE: usize = 0x08;

/// Bytes of every block that are not payload.
pub const BLOCK_OVERHEAD: usize = TAG_SIZE + HASH_SIZE + NEXT_SIZE;

/// Payload bytes per block at the default block size.
pub const DATA_SIZE: usize = BLOCK_SIZE - BLOCK_OVERHEAD;

/// Default offset of file payload inside an inode block's data field. The
/// bytes ahead of it hold the mtime word, the first-block words of every
/// copy, and the chain MAC.
pub const HEAD_OFFSET: u32 = 0x03B8;

/// Width of the cipher blocks the data region is encrypted in.
pub const CIPHER_BLOCK: usize = 16;

/// MAC tag width stored in every inode block.
pub const MAC_SIZE: usize = 0x20;

/// Default file duplication.
pub const COPIES_DEFAULT: u32 = 8;

/// You can't have more than 64 copies; you just can't.
pub const COPIES_MAX: usize = 64;

/// Default PBKDF2 iteration count.
pub const KDF_ITERATIONS: u64 = 32768;

/// Superblock parsing always uses the default-size layout for block 0, so
/// images cannot use blocks smaller than this.
pub const BLOCK_SIZE_MIN: usize = BLOCK_SIZE;

/// Product name recorded in the superblock.
pub const FS_NAME: &str = "stegfs";

/// Format generation recorded in the superblock.
pub const FS_VERSION: &str = "202X.XX";

/// Prior format generation: recognized at mount, never mountable (its inode
/// blocks carry no MAC).
pub const FS_VERSION_2015: &str = "2015.08";

/// Path-tag words of block 0. Not verified at mount; they only make the
/// start of the image look deliberate to someone who knows the recipe.
pub const TAG_MAGIC: [u64; 2] = [0x7374_6567_6673_2D32, 0x3031_382E_5858_0000];

/// Data-hash words of block 0 identifying the current format generation.
pub const HEADER_MAGIC: [u64; 3] = [
    0x5287_505E_71E0_39DF,
    0xEBCC_B02A_B09B_A26F,
    0x089E_07F0_DA73_3557,
];

/// Third data-hash word of the 2015 generation (first two match current).
pub const HEADER_MAGIC_2015: u64 = 0x8C9B_291A_9E55_C137;

/// Data-hash words of the first (2010) format generation.
pub const HEADER_MAGIC_2010: [u64; 3] = [
    0xA157_AFA6_02CC_9D1B,
    0x33BE_2B29_8B76_F2AC,
    0xC903_284D_7C59_3AF6,
];

/// Separator between file name and passphrase in a path.
pub const PASSWORD_SEPARATOR: char = ':';

/// Name of the diagnostic in-use block listing directory.
pub const BLOC_DIR: &str = "bloc";

// The encrypted region (everything after the path tag) must cut into whole
// cipher blocks, and an inode header must fit the largest copy count.
const_assert!((BLOCK_SIZE - TAG_SIZE) % CIPHER_BLOCK == 0);
const_assert!(HEAD_OFFSET as usize >= (COPIES_MAX + 1) * NEXT_SIZE + MAC_SIZE);
const_assert!((HEAD_OFFSET as usize) < DATA_SIZE);
