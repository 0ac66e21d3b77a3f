#![forbid(unsafe_code)]

use pfs_types::{
    ADDR_SLOTS, EXT_SLOTS, INODE_RECORD_SIZE, ParseError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
    ensure_slice, read_fixed, read_le_u32, read_le_u64, write_bytes, write_le_u32, write_le_u64,
};

const OFF_UID: usize = 0;
const OFF_GID: usize = 4;
const OFF_MODE: usize = 8;
const OFF_ESIZ: usize = 12;
const OFF_NLINK: usize = 16;
const OFF_BLOCKS: usize = 24;
const OFF_SIZE: usize = 32;
const OFF_ATIME: usize = 40;
const OFF_MTIME: usize = 48;
const OFF_CTIME: usize = 56;
const OFF_OTIME: usize = 64;
const OFF_EXT: usize = 72;
const OFF_ADDR: usize = OFF_EXT + EXT_SLOTS * 8;

/// One 512-byte inode record as stored in the inode area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub esiz: u32,
    pub nlink: u32,
    /// 4096-byte blocks held, indirection blocks included.
    pub blocks: u64,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub otime: i64,
    pub ext: [u64; EXT_SLOTS],
    pub addr: [u64; ADDR_SLOTS],
}

impl Default for DiskInode {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0,
            esiz: 0,
            nlink: 0,
            blocks: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            otime: 0,
            ext: [0; EXT_SLOTS],
            addr: [0; ADDR_SLOTS],
        }
    }
}

fn read_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

impl DiskInode {
    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(record, 0, INODE_RECORD_SIZE)?;
        let mut ext = [0_u64; EXT_SLOTS];
        for (i, slot) in ext.iter_mut().enumerate() {
            *slot = read_le_u64(record, OFF_EXT + i * 8)?;
        }
        let mut addr = [0_u64; ADDR_SLOTS];
        for (i, slot) in addr.iter_mut().enumerate() {
            *slot = read_le_u64(record, OFF_ADDR + i * 8)?;
        }
        Ok(Self {
            uid: read_le_u32(record, OFF_UID)?,
            gid: read_le_u32(record, OFF_GID)?,
            mode: read_le_u32(record, OFF_MODE)?,
            esiz: read_le_u32(record, OFF_ESIZ)?,
            nlink: read_le_u32(record, OFF_NLINK)?,
            blocks: read_le_u64(record, OFF_BLOCKS)?,
            size: read_le_u64(record, OFF_SIZE)?,
            atime: read_i64(record, OFF_ATIME)?,
            mtime: read_i64(record, OFF_MTIME)?,
            ctime: read_i64(record, OFF_CTIME)?,
            otime: read_i64(record, OFF_OTIME)?,
            ext,
            addr,
        })
    }

    /// Serialize into the first [`INODE_RECORD_SIZE`] bytes of `out`,
    /// zeroing padding.
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(out, 0, &[0_u8; INODE_RECORD_SIZE])?;
        write_le_u32(out, OFF_UID, self.uid)?;
        write_le_u32(out, OFF_GID, self.gid)?;
        write_le_u32(out, OFF_MODE, self.mode)?;
        write_le_u32(out, OFF_ESIZ, self.esiz)?;
        write_le_u32(out, OFF_NLINK, self.nlink)?;
        write_le_u64(out, OFF_BLOCKS, self.blocks)?;
        write_le_u64(out, OFF_SIZE, self.size)?;
        write_bytes(out, OFF_ATIME, &self.atime.to_le_bytes())?;
        write_bytes(out, OFF_MTIME, &self.mtime.to_le_bytes())?;
        write_bytes(out, OFF_CTIME, &self.ctime.to_le_bytes())?;
        write_bytes(out, OFF_OTIME, &self.otime.to_le_bytes())?;
        for (i, value) in self.ext.iter().enumerate() {
            write_le_u64(out, OFF_EXT + i * 8, *value)?;
        }
        for (i, value) in self.addr.iter().enumerate() {
            write_le_u64(out, OFF_ADDR + i * 8, *value)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}
