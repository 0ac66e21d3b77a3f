#![forbid(unsafe_code)]
//! On-disk format of PFS volumes.
//!
//! Pure encode/decode over byte slices: the boot record and metadata record
//! (superblock), 512-byte inode records, and directory entries with the hash
//! used to bucket them. No I/O happens here.

pub mod dirent;
pub mod inode;
pub mod superblock;

pub use dirent::{
    DIR_ENTRY_HEADER_SIZE, DIR_HASH_SIZE, DOT_OFFSET, DOTDOT_OFFSET, DirEntryHeader,
    UNUSED_CHAIN_SLOT, dir_hash, required_rec_len,
};
pub use inode::DiskInode;
pub use superblock::{
    BLOCK_BATCH_CAPACITY, BootRecord, INODE_BATCH_CAPACITY, SUPERBLOCK_SIZE, Superblock,
};

use pfs_error::PfsError;
use pfs_types::{BlockNumber, ParseError};

/// Map a decode failure in live metadata to an error carrying its block.
///
/// Truncated records and overflowing values mean the block is corrupt; a
/// wrong magic means the device does not hold a PFS volume at all.
#[must_use]
pub fn parse_error_at(block: BlockNumber, err: &ParseError) -> PfsError {
    match err {
        ParseError::InvalidMagic { .. } => PfsError::Format(err.to_string()),
        ParseError::InsufficientData { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => PfsError::corruption(block.0, err.to_string()),
    }
}

/// Map a decode failure while opening a volume.
#[must_use]
pub fn mount_error(err: &ParseError) -> PfsError {
    PfsError::Format(err.to_string())
}
