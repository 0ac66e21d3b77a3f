#![forbid(unsafe_code)]

use pfs_types::{
    BLOCK_SIZE, MAX_NAME_LEN, ParseError, ensure_slice, read_le_u16, read_le_u64, write_bytes,
    write_le_u16, write_le_u64,
};

/// Fixed part of a directory entry.
pub const DIR_ENTRY_HEADER_SIZE: usize = 24;
/// Bytes available for an inline name, terminator included.
pub const INLINE_NAME_CAPACITY: usize = 5;
const OFF_INODE: usize = 0;
const OFF_NEXT: usize = 8;
const OFF_REC_LEN: usize = 16;
const OFF_NAME_LEN: usize = 18;
const OFF_INLINE_NAME: usize = 19;

/// Hash buckets in a directory's first block.
pub const DIR_HASH_SIZE: usize = (BLOCK_SIZE - 2 * DIR_ENTRY_HEADER_SIZE) / 8 - 1;
/// Table slot heading the chain of reusable slack entries.
pub const UNUSED_CHAIN_SLOT: usize = DIR_HASH_SIZE;
/// Byte offset of "." in the first block; ".." follows it.
pub const DOT_OFFSET: usize = (DIR_HASH_SIZE + 1) * 8;
pub const DOTDOT_OFFSET: usize = DOT_OFFSET + DIR_ENTRY_HEADER_SIZE;

/// Name hash reduced to a bucket index.
///
/// Bytes are folded in sign-extended; names with high-bit bytes must land in
/// the same buckets as on existing volumes.
#[must_use]
pub fn dir_hash(name: &[u8]) -> usize {
    let mut hash: u32 = 0;
    for &byte in name {
        hash = ((byte as i8) as u32)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash);
    }
    (hash % DIR_HASH_SIZE as u32) as usize
}

/// Record length needed to hold a name of `name_len` bytes.
#[must_use]
pub fn required_rec_len(name_len: usize) -> usize {
    if name_len < INLINE_NAME_CAPACITY {
        DIR_ENTRY_HEADER_SIZE
    } else {
        DIR_ENTRY_HEADER_SIZE + 1 + name_len
    }
}

/// Decoded fixed part of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryHeader {
    /// Zero for a slack entry.
    pub inode: u64,
    /// Absolute directory byte offset of the next entry in this chain.
    pub next: u64,
    pub rec_len: u16,
    pub name_len: u8,
}

impl DirEntryHeader {
    /// Decode the header at `offset` and check that the record fits `block`.
    pub fn parse(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(block, offset, DIR_ENTRY_HEADER_SIZE)?;
        let header = Self {
            inode: read_le_u64(block, offset + OFF_INODE)?,
            next: read_le_u64(block, offset + OFF_NEXT)?,
            rec_len: read_le_u16(block, offset + OFF_REC_LEN)?,
            name_len: block[offset + OFF_NAME_LEN],
        };
        let rec_len = usize::from(header.rec_len);
        if rec_len < DIR_ENTRY_HEADER_SIZE {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "smaller than entry header",
            });
        }
        if offset + rec_len > block.len() {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "record crosses block boundary",
            });
        }
        if header.inode != 0 && required_rec_len(usize::from(header.name_len)) > rec_len {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name does not fit record",
            });
        }
        Ok(header)
    }

    #[must_use]
    pub fn is_slack(&self) -> bool {
        self.inode == 0
    }

    /// Offset of the name bytes relative to the entry start.
    #[must_use]
    pub fn name_offset(&self) -> usize {
        if usize::from(self.name_len) < INLINE_NAME_CAPACITY {
            OFF_INLINE_NAME
        } else {
            DIR_ENTRY_HEADER_SIZE
        }
    }

    /// Name bytes of the entry at `offset`.
    pub fn name<'a>(&self, block: &'a [u8], offset: usize) -> Result<&'a [u8], ParseError> {
        ensure_slice(
            block,
            offset + self.name_offset(),
            usize::from(self.name_len),
        )
    }
}

/// Write a complete entry (header, name and terminator) at `offset`.
pub fn write_entry(
    block: &mut [u8],
    offset: usize,
    inode: u64,
    next: u64,
    rec_len: usize,
    name: &[u8],
) -> Result<(), ParseError> {
    if name.len() > MAX_NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "name_len",
            reason: "longer than 255 bytes",
        });
    }
    if rec_len < required_rec_len(name.len()) {
        return Err(ParseError::InvalidField {
            field: "rec_len",
            reason: "too small for name",
        });
    }
    let rec_len_u16 = u16::try_from(rec_len).map_err(|_| ParseError::IntegerConversion {
        field: "rec_len",
    })?;
    ensure_slice(block, offset, rec_len)?;
    let name_len = u8::try_from(name.len()).map_err(|_| ParseError::IntegerConversion {
        field: "name_len",
    })?;

    write_le_u64(block, offset + OFF_INODE, inode)?;
    write_le_u64(block, offset + OFF_NEXT, next)?;
    write_le_u16(block, offset + OFF_REC_LEN, rec_len_u16)?;
    block[offset + OFF_NAME_LEN] = name_len;
    let name_at = if name.len() < INLINE_NAME_CAPACITY {
        block[offset + OFF_INLINE_NAME..offset + DIR_ENTRY_HEADER_SIZE].fill(0);
        offset + OFF_INLINE_NAME
    } else {
        offset + DIR_ENTRY_HEADER_SIZE
    };
    write_bytes(block, name_at, name)?;
    write_bytes(block, name_at + name.len(), &[0])
}

/// Write a header-only slack entry covering `rec_len` bytes.
pub fn write_slack(
    block: &mut [u8],
    offset: usize,
    next: u64,
    rec_len: usize,
) -> Result<(), ParseError> {
    write_entry(block, offset, 0, next, rec_len, &[])
}

pub fn set_entry_inode(block: &mut [u8], offset: usize, inode: u64) -> Result<(), ParseError> {
    write_le_u64(block, offset + OFF_INODE, inode)
}

pub fn set_entry_next(block: &mut [u8], offset: usize, next: u64) -> Result<(), ParseError> {
    write_le_u64(block, offset + OFF_NEXT, next)
}

/// Byte offset, within an entry, of its chain link field.
#[must_use]
pub const fn next_link_offset() -> usize {
    OFF_NEXT
}
