#![forbid(unsafe_code)]
//! Shared units, geometry constants and little-endian codec helpers for PFS.
//!
//! PFS addresses everything in 512-byte sectors. A block resource is a
//! sector number that is a multiple of [`SECTORS_PER_BLOCK`]; an inode number
//! is the sector holding its 512-byte record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── Geometry ────────────────────────────────────────────────────────────────

pub const SECTOR_SIZE: usize = 512;
pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_SHIFT: u32 = 12;
pub const SECTORS_PER_BLOCK: u64 = 8;

/// Size of one on-disk inode record (one sector).
pub const INODE_RECORD_SIZE: usize = SECTOR_SIZE;
pub const INODES_PER_BLOCK: u64 = (BLOCK_SIZE / INODE_RECORD_SIZE) as u64;

/// Number of 64-bit block pointers held by one indirection block.
pub const PTRS_PER_BLOCK: u64 = (BLOCK_SIZE / 8) as u64;

pub const ADDR_SLOTS: usize = 48;
pub const EXT_SLOTS: usize = 2;
pub const DIRECT_SLOTS: usize = 20;
pub const SINGLE_INDIRECT_SLOTS: usize = 16;
pub const DOUBLE_INDIRECT_SLOTS: usize = 4;
pub const TRIPLE_INDIRECT_SLOTS: usize = 4;
pub const QUAD_INDIRECT_SLOTS: usize = 4;
/// Deepest chain: inode slot plus four indirection blocks.
pub const MAX_CHAIN_DEPTH: usize = 5;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_FILE_BLOCKS: u64 = 0x1_0000_0000;
pub const MAX_FILE_SIZE: u64 = 0x1000_0000_0000;

pub const MIN_INODE_LIMIT: u64 = 1024;
pub const MIN_VOLUME_SECTORS: u64 = 32768;

pub const PFS_MAGIC: [u8; 4] = *b"PFS1";
pub const PFS_MAGIC_NUMBER: u32 = 0x5046_5331;

/// First two bytes of the volume boot record.
pub const BOOT_SIGNATURE: [u8; 2] = [0xEB, 0x02];

// ── Units ───────────────────────────────────────────────────────────────────

/// Device block index in [`BLOCK_SIZE`] units, as seen by a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// On-disk address in 512-byte sectors.
///
/// Block and inode resources are both named by sector number; number 0 is
/// reserved and never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl SectorNumber {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Device block containing this sector.
    #[must_use]
    pub fn block(self) -> BlockNumber {
        BlockNumber(self.0 / SECTORS_PER_BLOCK)
    }

    /// Sector index within its block (0..8).
    #[must_use]
    pub fn slot(self) -> usize {
        (self.0 % SECTORS_PER_BLOCK) as usize
    }

    /// Byte offset of this sector inside its block.
    #[must_use]
    pub fn byte_in_block(self) -> usize {
        self.slot() * SECTOR_SIZE
    }

    #[must_use]
    pub fn is_block_aligned(self) -> bool {
        self.0 % SECTORS_PER_BLOCK == 0
    }
}

impl BlockNumber {
    #[must_use]
    pub fn first_sector(self) -> SectorNumber {
        SectorNumber(self.0 * SECTORS_PER_BLOCK)
    }
}

impl InodeNumber {
    #[must_use]
    pub fn sector(self) -> SectorNumber {
        SectorNumber(self.0)
    }
}

impl From<InodeNumber> for SectorNumber {
    fn from(ino: InodeNumber) -> Self {
        Self(ino.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFIFO: u32 = 0o010_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFSOCK: u32 = 0o140_000;

// ── Parsing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let available = data.len();
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > available {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

/// Round `value` up to the next multiple of `align` (`align` must be non-zero).
#[must_use]
pub fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Seconds since the Unix epoch, saturating to 0 for clocks set before it.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
