#![forbid(unsafe_code)]

use pfs_types::{
    BOOT_SIGNATURE, INODE_RECORD_SIZE, InodeNumber, PFS_MAGIC, PFS_MAGIC_NUMBER, ParseError,
    SECTOR_SIZE, SECTORS_PER_BLOCK, SectorNumber, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, read_le_u64, write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Entries in one block-pool batch (a whole block of u64).
pub const BLOCK_BATCH_CAPACITY: usize = 512;
/// Entries in one inode-pool batch (one inode record of u64).
pub const INODE_BATCH_CAPACITY: usize = INODE_RECORD_SIZE / 8;

pub const SUPERBLOCK_SIZE: usize = SECTOR_SIZE;

// Field offsets follow natural alignment: a 4-byte pad sits after `rev`.
const OFF_REV: usize = 0;
const OFF_INODE_FREE_COUNT: usize = 8;
const OFF_BLOCK_FREE_COUNT: usize = 16;
const OFF_UPDATE_TIME: usize = 24;
const OFF_VOLUME_SECTORS: usize = 32;
const OFF_INODES_USED: usize = 40;
const OFF_INODE_AREA_SIZE: usize = 48;
const OFF_BLOCK_SECTORS_USED: usize = 56;
const OFF_ROOT_INODE: usize = 64;
const OFF_BLOCK_POOL_HEAD: usize = 72;
const OFF_INODE_POOL_HEAD: usize = 80;
const OFF_INODE_LIMIT: usize = 88;
const OFF_MAGIC: usize = 96;

// ── Boot record ─────────────────────────────────────────────────────────────

/// Sector 0 of a volume: a short jump followed by the reserved-sector count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRecord {
    pub reserved_sectors: u16,
}

impl BootRecord {
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let signature = read_fixed::<2>(sector, 0)?;
        if signature != BOOT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u16::from_le_bytes(BOOT_SIGNATURE)),
                actual: u64::from(u16::from_le_bytes(signature)),
            });
        }
        let reserved_sectors = read_le_u16(sector, 2)?;
        if reserved_sectors == 0 {
            return Err(ParseError::InvalidField {
                field: "reserved_sectors",
                reason: "metadata record would overlap the boot record",
            });
        }
        Ok(Self { reserved_sectors })
    }

    /// Patch the first four bytes of `sector`, leaving the rest untouched.
    pub fn write_into(&self, sector: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(sector, 0, &BOOT_SIGNATURE)?;
        write_le_u16(sector, 2, self.reserved_sectors)
    }

    /// Sector holding the metadata record.
    #[must_use]
    pub fn superblock_sector(&self) -> SectorNumber {
        SectorNumber(u64::from(self.reserved_sectors))
    }

    /// The first four boot-record bytes, which the metadata record mirrors.
    #[must_use]
    pub fn revision_word(&self) -> u32 {
        let [lo, hi] = self.reserved_sectors.to_le_bytes();
        u32::from_le_bytes([BOOT_SIGNATURE[0], BOOT_SIGNATURE[1], lo, hi])
    }
}

// ── Metadata record ─────────────────────────────────────────────────────────

/// The persistent volume header binding allocator state and volume identity.
///
/// Counts and addresses are stored as signed 64-bit values on disk; they are
/// never negative on a valid volume and are read here as `u64`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub rev: u32,
    /// Valid entries in the inode pool's cached batch.
    pub inode_free_count: u64,
    /// Valid entries in the block pool's cached batch.
    pub block_free_count: u64,
    pub update_time: i64,
    pub volume_sectors: u64,
    pub inodes_used: u64,
    /// Inode records materialized so far.
    pub inode_area_size: u64,
    /// Sectors covered by allocated blocks (8 per block).
    pub block_sectors_used: u64,
    pub root_inode: InodeNumber,
    pub block_pool_head: SectorNumber,
    pub inode_pool_head: SectorNumber,
    pub inode_limit: u64,
}

impl Superblock {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, SUPERBLOCK_SIZE)?;
        let magic = read_fixed::<4>(bytes, OFF_MAGIC)?;
        if magic != PFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(PFS_MAGIC_NUMBER),
                actual: u64::from(u32::from_be_bytes(magic)),
            });
        }

        let sb = Self {
            rev: read_le_u32(bytes, OFF_REV)?,
            inode_free_count: read_le_u64(bytes, OFF_INODE_FREE_COUNT)?,
            block_free_count: read_le_u64(bytes, OFF_BLOCK_FREE_COUNT)?,
            update_time: i64::from_le_bytes(read_fixed::<8>(bytes, OFF_UPDATE_TIME)?),
            volume_sectors: read_le_u64(bytes, OFF_VOLUME_SECTORS)?,
            inodes_used: read_le_u64(bytes, OFF_INODES_USED)?,
            inode_area_size: read_le_u64(bytes, OFF_INODE_AREA_SIZE)?,
            block_sectors_used: read_le_u64(bytes, OFF_BLOCK_SECTORS_USED)?,
            root_inode: InodeNumber(read_le_u64(bytes, OFF_ROOT_INODE)?),
            block_pool_head: SectorNumber(read_le_u64(bytes, OFF_BLOCK_POOL_HEAD)?),
            inode_pool_head: SectorNumber(read_le_u64(bytes, OFF_INODE_POOL_HEAD)?),
            inode_limit: read_le_u64(bytes, OFF_INODE_LIMIT)?,
        };
        sb.validate()?;
        Ok(sb)
    }

    /// Structural checks that do not need the device.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.inode_free_count > INODE_BATCH_CAPACITY as u64 {
            return Err(ParseError::InvalidField {
                field: "inode_free_count",
                reason: "exceeds inode batch capacity",
            });
        }
        if self.block_free_count > BLOCK_BATCH_CAPACITY as u64 {
            return Err(ParseError::InvalidField {
                field: "block_free_count",
                reason: "exceeds block batch capacity",
            });
        }
        if self.inodes_used > self.inode_limit {
            return Err(ParseError::InvalidField {
                field: "inodes_used",
                reason: "exceeds inode limit",
            });
        }
        if self.root_inode.0 == 0 {
            return Err(ParseError::InvalidField {
                field: "root_inode",
                reason: "must be non-zero",
            });
        }
        if self.block_pool_head.is_none() || !self.block_pool_head.is_block_aligned() {
            return Err(ParseError::InvalidField {
                field: "block_pool_head",
                reason: "must be a non-zero block-aligned sector",
            });
        }
        // A zero head means the last holder record was handed out.
        if self.inode_pool_head.is_none() && self.inode_free_count != 0 {
            return Err(ParseError::InvalidField {
                field: "inode_pool_head",
                reason: "must be non-zero while records are cached",
            });
        }
        Ok(())
    }

    /// Serialize into the first [`SUPERBLOCK_SIZE`] bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(out, 0, &[0_u8; SUPERBLOCK_SIZE])?;
        write_le_u32(out, OFF_REV, self.rev)?;
        write_le_u64(out, OFF_INODE_FREE_COUNT, self.inode_free_count)?;
        write_le_u64(out, OFF_BLOCK_FREE_COUNT, self.block_free_count)?;
        write_bytes(out, OFF_UPDATE_TIME, &self.update_time.to_le_bytes())?;
        write_le_u64(out, OFF_VOLUME_SECTORS, self.volume_sectors)?;
        write_le_u64(out, OFF_INODES_USED, self.inodes_used)?;
        write_le_u64(out, OFF_INODE_AREA_SIZE, self.inode_area_size)?;
        write_le_u64(out, OFF_BLOCK_SECTORS_USED, self.block_sectors_used)?;
        write_le_u64(out, OFF_ROOT_INODE, self.root_inode.0)?;
        write_le_u64(out, OFF_BLOCK_POOL_HEAD, self.block_pool_head.0)?;
        write_le_u64(out, OFF_INODE_POOL_HEAD, self.inode_pool_head.0)?;
        write_le_u64(out, OFF_INODE_LIMIT, self.inode_limit)?;
        write_bytes(out, OFF_MAGIC, &PFS_MAGIC)
    }

    /// Blocks the volume can hand out, excluding everything up to the
    /// metadata record's block and the first block of inode records.
    ///
    /// Inode blocks added later come out of the block pool and are counted
    /// in `block_sectors_used` instead.
    #[must_use]
    pub fn total_blocks(&self, location: SectorNumber) -> u64 {
        let reserved = location.block().0 * SECTORS_PER_BLOCK;
        self.volume_sectors
            .saturating_sub(self.inode_area_size.min(SECTORS_PER_BLOCK))
            .saturating_sub(reserved)
            / SECTORS_PER_BLOCK
    }

    #[must_use]
    pub fn free_blocks(&self, location: SectorNumber) -> u64 {
        self.total_blocks(location)
            .saturating_sub(self.block_sectors_used / SECTORS_PER_BLOCK)
    }

    #[must_use]
    pub fn free_inodes(&self) -> u64 {
        self.inode_limit.saturating_sub(self.inodes_used)
    }
}
