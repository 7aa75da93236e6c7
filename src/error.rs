//! Error taxonomy shared by every operation. Benign per-block outcomes
//! ("not ours", "corrupt") are part of the discovery protocol and never
//! surface here; everything else does.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Magic words of block 0 did not identify a stegfs image.
    #[error("not a stegfs file system")]
    NotStegfs,

    /// The image belongs to a prior format generation.
    #[error("file system was created by an unsupported prior version")]
    OldStegfs,

    /// A required superblock tag is absent.
    #[error("superblock is missing the {0} tag")]
    MissingTag(&'static str),

    /// A superblock tag holds a value this implementation cannot use.
    #[error("superblock tag {0} holds an unusable value")]
    InvalidTag(&'static str),

    /// The superblock failed a consistency check against the image.
    #[error("superblock is corrupt")]
    CorruptTag,

    /// No inode copy decrypted; also covers a wrong passphrase, which is
    /// indistinguishable from absence by design.
    #[error("no such file")]
    NotFound,

    /// Every copy's chain decrypted but none matched the stored MAC.
    #[error("data failed integrity verification on every copy")]
    IntegrityFailure,

    /// The allocator gave up, or free capacity is exhausted.
    #[error("no space left on file system")]
    NoSpace,

    /// The file cannot fit even on an empty file system.
    #[error("file larger than file system capacity")]
    TooLarge,

    /// Write through a handle that was not opened for writing.
    #[error("operation not permitted")]
    Denied,

    /// File operation on a directory.
    #[error("is a directory")]
    IsDir,

    /// Directory operation on a file.
    #[error("not a directory")]
    NotDir,

    /// rmdir of a directory that still has children.
    #[error("directory not empty")]
    DirNotEmpty,

    /// Underlying image I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
