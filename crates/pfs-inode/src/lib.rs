#![forbid(unsafe_code)]
//! In-memory inode objects.
//!
//! An [`Inode`] wraps the decoded 512-byte record with its number and a dirty
//! flag. The mapper and directory engine mutate it in place and call
//! [`Inode::mark_dirty`]; [`write_inode`] persists the record through the
//! block cache and clears the flag.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::DiskInode;
use pfs_types::{
    ADDR_SLOTS, BLOCK_SIZE, INODE_RECORD_SIZE, InodeNumber, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO,
    S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, SECTOR_SIZE, unix_now,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

// ── Inode object ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    ino: InodeNumber,
    record: DiskInode,
    dirty: bool,
}

impl Inode {
    /// A fresh in-memory inode with all times set to now and no blocks.
    #[must_use]
    pub fn new(ino: InodeNumber, mode: u32, uid: u32, gid: u32) -> Self {
        let now = unix_now();
        Self {
            ino,
            record: DiskInode {
                uid,
                gid,
                mode,
                nlink: 1,
                atime: now,
                mtime: now,
                ctime: now,
                otime: now,
                ..DiskInode::default()
            },
            dirty: true,
        }
    }

    #[must_use]
    pub fn from_record(ino: InodeNumber, record: DiskInode) -> Self {
        Self {
            ino,
            record,
            dirty: false,
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn record(&self) -> &DiskInode {
        &self.record
    }

    #[must_use]
    pub fn mode(&self) -> u32 {
        self.record.mode
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.record.is_dir()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.record.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.record.size = size;
        self.mark_dirty();
    }

    /// 4096-byte blocks held, indirection blocks included.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.record.blocks
    }

    /// Account for one newly linked block and stamp ctime.
    pub fn add_block(&mut self) {
        self.record.blocks += 1;
        self.record.ctime = unix_now();
        self.mark_dirty();
    }

    /// Account for one released block.
    pub fn remove_block(&mut self) -> Result<()> {
        self.record.blocks = self.record.blocks.checked_sub(1).ok_or_else(|| {
            PfsError::corruption(
                self.ino.sector().block().0,
                format!("inode {} releases more blocks than it holds", self.ino),
            )
        })?;
        self.mark_dirty();
        Ok(())
    }

    #[must_use]
    pub fn nlink(&self) -> u32 {
        self.record.nlink
    }

    pub fn set_nlink(&mut self, nlink: u32) {
        self.record.nlink = nlink;
        self.record.ctime = unix_now();
        self.mark_dirty();
    }

    /// Address slot `slot` of the 48-entry array.
    #[must_use]
    pub fn addr(&self, slot: usize) -> u64 {
        self.record.addr.get(slot).copied().unwrap_or(0)
    }

    pub fn set_addr(&mut self, slot: usize, value: u64) -> Result<()> {
        let entry = self.record.addr.get_mut(slot).ok_or_else(|| {
            PfsError::InvalidRange(format!("address slot {slot} >= {ADDR_SLOTS}"))
        })?;
        *entry = value;
        self.mark_dirty();
        Ok(())
    }

    /// Stamp mtime and ctime, as after a content change.
    pub fn touch_modified(&mut self) {
        let now = unix_now();
        self.record.mtime = now;
        self.record.ctime = now;
        self.mark_dirty();
    }

    pub fn touch_changed(&mut self) {
        self.record.ctime = unix_now();
        self.mark_dirty();
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn attr(&self) -> InodeAttr {
        InodeAttr {
            ino: self.ino,
            size: self.record.size,
            blocks: self.record.blocks * (BLOCK_SIZE / SECTOR_SIZE) as u64,
            atime: to_system_time(self.record.atime),
            mtime: to_system_time(self.record.mtime),
            ctime: to_system_time(self.record.ctime),
            crtime: to_system_time(self.record.otime),
            kind: FileType::from_mode(self.record.mode),
            perm: (self.record.mode & 0o7777) as u16,
            nlink: self.record.nlink,
            uid: self.record.uid,
            gid: self.record.gid,
            blksize: BLOCK_SIZE as u32,
        }
    }
}

// ── Record I/O ──────────────────────────────────────────────────────────────

fn check_ino(ino: InodeNumber) -> Result<()> {
    if ino.0 == 0 {
        return Err(PfsError::InvalidRange("inode 0 is reserved".to_owned()));
    }
    Ok(())
}

/// Load the record of `ino`.
pub fn read_inode(dev: &dyn BlockDevice, ino: InodeNumber) -> Result<Inode> {
    check_ino(ino)?;
    let sector = ino.sector();
    let buf = dev.read_block(sector.block())?;
    let start = sector.byte_in_block();
    let record = buf
        .as_slice()
        .get(start..start + INODE_RECORD_SIZE)
        .ok_or_else(|| PfsError::corruption(sector.block().0, "inode record past block end"))?;
    let record = DiskInode::parse(record)
        .map_err(|err| pfs_ondisk::parse_error_at(sector.block(), &err))?;
    trace!(ino = ino.0, mode = record.mode, size = record.size, "read inode");
    Ok(Inode::from_record(ino, record))
}

fn store_record(dev: &dyn BlockDevice, ino: InodeNumber, record: &DiskInode) -> Result<()> {
    check_ino(ino)?;
    let sector = ino.sector();
    let block = sector.block();
    let mut buf = dev.read_block(block)?.into_inner();
    record
        .write_to(&mut buf[sector.byte_in_block()..])
        .map_err(|err| pfs_ondisk::parse_error_at(block, &err))?;
    dev.write_block(block, &buf)
}

/// Persist `inode` and clear its dirty flag.
pub fn write_inode(dev: &dyn BlockDevice, inode: &mut Inode) -> Result<()> {
    store_record(dev, inode.ino, &inode.record)?;
    inode.dirty = false;
    trace!(ino = inode.ino.0, size = inode.record.size, "wrote inode");
    Ok(())
}

/// Write `inode` only if something changed since it was loaded.
pub fn write_inode_if_dirty(dev: &dyn BlockDevice, inode: &mut Inode) -> Result<()> {
    if inode.dirty {
        write_inode(dev, inode)?;
    }
    Ok(())
}

/// Zero the record of `ino`, as when the inode is freed.
pub fn clear_inode(dev: &dyn BlockDevice, ino: InodeNumber) -> Result<()> {
    store_record(dev, ino, &DiskInode::default())
}

// ── Attributes ──────────────────────────────────────────────────────────────

/// File type derived from the mode's type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        // untyped records read as plain files
        Self::try_from_mode(mode).unwrap_or(Self::RegularFile)
    }

    /// `None` unless the type bits name a known file type.
    #[must_use]
    pub fn try_from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFCHR => Some(Self::CharDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            S_IFREG => Some(Self::RegularFile),
            _ => None,
        }
    }
}

/// stat-style view of an inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    /// File size in bytes.
    pub size: u64,
    /// Number of 512-byte sectors held.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: FileType,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

fn to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
