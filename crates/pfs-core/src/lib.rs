#![forbid(unsafe_code)]
//! PFS volumes.
//!
//! [`Volume`] ties the pieces together: a write-back [`BufferCache`] over the
//! device, the per-volume [`Allocator`], and the root directory. Namespace and
//! file operations run one at a time under the volume's operation lock; the
//! allocator lock nests inside it.
//!
//! # Opening a volume
//!
//! ```ignore
//! let volume = Volume::open("/path/to/image.pfs")?;
//! let root = volume.root();
//! for entry in volume.readdir(root, 0)? {
//!     println!("{} {}", entry.ino, entry.name_str());
//! }
//! ```

pub mod format;

pub use format::{FormatOptions, FormatReport, format};
pub use pfs_alloc::{PoolKind, PoolStatus, VolumeStats};
pub use pfs_block::{CacheConfig, CacheStats};
pub use pfs_error::{PfsError, Result};
pub use pfs_inode::{FileType, InodeAttr};
pub use pfs_ondisk::{BootRecord, Superblock};
pub use pfs_types::InodeNumber;

use parking_lot::Mutex;
use pfs_alloc::Allocator;
use pfs_block::{
    BlockDevice, BufferCache, ByteBlockDevice, ByteDevice, FileByteDevice, read_sector,
};
use pfs_dir::FoundEntry;
use pfs_inode::{Inode, clear_inode, read_inode, write_inode, write_inode_if_dirty};
use pfs_types::{BLOCK_SIZE, MAX_FILE_SIZE, S_IFMT, S_IFREG, SECTOR_SIZE, SectorNumber};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const BLOCK: u64 = BLOCK_SIZE as u64;

type CachedDevice = BufferCache<ByteBlockDevice<Arc<dyn ByteDevice>>>;

// ── Options ─────────────────────────────────────────────────────────────────

/// Options controlling how a volume is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub cache: CacheConfig,
}

/// A directory entry returned by [`Volume::readdir`].
///
/// `offset` is the cookie that resumes the listing after this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub offset: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

fn is_dot_name(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

fn display_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// An opened PFS volume.
pub struct Volume {
    dev: CachedDevice,
    alloc: Allocator,
    boot: BootRecord,
    root: InodeNumber,
    ops: Mutex<()>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("boot", &self.boot)
            .field("root", &self.root)
            .field("alloc", &self.alloc)
            .field("cache", &self.dev.stats())
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Open the volume image at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Arc::new(dev), options)
    }

    /// Create an image file at `path`, format it and open it.
    pub fn create_image(
        path: impl AsRef<Path>,
        format_options: &FormatOptions,
        options: &OpenOptions,
    ) -> Result<(Self, FormatReport)> {
        format_options.validate()?;
        let dev = FileByteDevice::create(path.as_ref(), format_options.byte_len())?;
        Self::format_device(Arc::new(dev), format_options, options)
    }

    /// Format `dev` and open the result.
    pub fn format_device(
        dev: Arc<dyn ByteDevice>,
        format_options: &FormatOptions,
        options: &OpenOptions,
    ) -> Result<(Self, FormatReport)> {
        let report = {
            let blocks = ByteBlockDevice::new(Arc::clone(&dev), BLOCK_SIZE as u32)?;
            format(&blocks, format_options)?
        };
        let volume = Self::from_device(dev, options)?;
        Ok((volume, report))
    }

    /// Open a volume on an already-opened device whose sector 0 holds the
    /// boot record.
    pub fn from_device(dev: Arc<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let sector = read_sector(&*dev, SectorNumber(0))?;
        let boot = BootRecord::parse(&sector).map_err(|err| pfs_ondisk::mount_error(&err))?;
        let device_sectors = dev.len_bytes() / SECTOR_SIZE as u64;

        let blocks = ByteBlockDevice::new(dev, BLOCK_SIZE as u32)?;
        let cache = BufferCache::new(blocks, options.cache)?;
        let location = boot.superblock_sector();
        let alloc = Allocator::open(&cache, location)?;
        let sb = alloc.superblock();
        sb.validate().map_err(|err| pfs_ondisk::mount_error(&err))?;
        if sb.rev != boot.revision_word() {
            return Err(PfsError::Format(format!(
                "metadata revision {:#010x} does not mirror the boot record",
                sb.rev
            )));
        }
        if sb.volume_sectors > device_sectors {
            return Err(PfsError::Format(format!(
                "volume spans {} sectors but the device holds {device_sectors}",
                sb.volume_sectors
            )));
        }
        let root = read_inode(&cache, sb.root_inode)?;
        if !root.is_dir() {
            return Err(PfsError::Format(format!(
                "root inode {} is not a directory",
                sb.root_inode
            )));
        }

        info!(
            sectors = sb.volume_sectors,
            root = sb.root_inode.0,
            inodes_used = sb.inodes_used,
            inode_limit = sb.inode_limit,
            "opened volume"
        );
        Ok(Self {
            dev: cache,
            alloc,
            boot,
            root: sb.root_inode,
            ops: Mutex::new(()),
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────

    #[must_use]
    pub fn root(&self) -> InodeNumber {
        self.root
    }

    #[must_use]
    pub fn boot_record(&self) -> BootRecord {
        self.boot
    }

    /// Snapshot of the in-memory metadata record.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.alloc.superblock()
    }

    #[must_use]
    pub fn pool_status(&self, kind: PoolKind) -> PoolStatus {
        self.alloc.pool_status(kind)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.dev.stats()
    }

    /// The cached block device all volume I/O goes through.
    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        &self.dev
    }

    #[must_use]
    pub fn statfs(&self) -> VolumeStats {
        self.alloc.stats()
    }

    /// Write every dirty block back, in the order they were dirtied, then
    /// sync the device.
    pub fn sync(&self) -> Result<()> {
        let _ops = self.ops.lock();
        let dirty = self.dev.stats().dirty;
        self.dev.sync()?;
        debug!(blocks = dirty, "synced volume");
        Ok(())
    }

    // ── Inode helpers ─────────────────────────────────────────────────

    fn load(&self, ino: InodeNumber) -> Result<Inode> {
        let sb = self.alloc.superblock();
        if ino.0 == 0 || ino.0 >= sb.volume_sectors {
            return Err(PfsError::NotFound(format!("inode {ino}")));
        }
        let inode = read_inode(&self.dev, ino)?;
        // Freed records are zeroed; other sectors rarely carry a valid type.
        if inode.nlink() == 0 || FileType::try_from_mode(inode.mode()).is_none() {
            return Err(PfsError::NotFound(format!("inode {ino}")));
        }
        Ok(inode)
    }

    fn load_dir(&self, ino: InodeNumber) -> Result<Inode> {
        let inode = self.load(ino)?;
        if !inode.is_dir() {
            return Err(PfsError::NotDirectory);
        }
        Ok(inode)
    }

    fn load_file(&self, ino: InodeNumber) -> Result<Inode> {
        let inode = self.load(ino)?;
        if inode.is_dir() {
            return Err(PfsError::IsDirectory);
        }
        Ok(inode)
    }

    fn allocate_inode(&self) -> Result<InodeNumber> {
        let sector = self.alloc.allocate(&self.dev, PoolKind::Inode)?;
        Ok(InodeNumber(sector.0))
    }

    /// Release every block of `inode`, zero its record and free its number.
    fn evict(&self, mut inode: Inode) -> Result<()> {
        let ino = inode.ino();
        pfs_bmap::release(&self.dev, &self.alloc, &mut inode, 0)?;
        clear_inode(&self.dev, ino)?;
        self.alloc.free(&self.dev, PoolKind::Inode, ino.sector())?;
        debug!(ino = ino.0, "evicted inode");
        Ok(())
    }

    /// Undo a half-built inode after a failed create or mkdir.
    fn abandon(&self, inode: Inode) {
        let ino = inode.ino();
        if let Err(err) = self.evict(inode) {
            warn!(ino = ino.0, error = %err, "could not roll back new inode");
        }
    }

    /// Persist a directory whose mutation failed part way, if it changed.
    fn settle(&self, dir: &mut Inode) {
        if let Err(err) = write_inode_if_dirty(&self.dev, dir) {
            warn!(dir = dir.ino().0, error = %err, "could not persist directory after failure");
        }
    }

    /// Drop one link; the inode is evicted when none remain.
    fn drop_link(&self, mut inode: Inode) -> Result<()> {
        let remaining = inode.nlink().saturating_sub(1);
        if remaining == 0 {
            return self.evict(inode);
        }
        inode.set_nlink(remaining);
        write_inode(&self.dev, &mut inode)
    }

    fn adjust_nlink(&self, ino: InodeNumber, delta: i64) -> Result<()> {
        let mut inode = self.load(ino)?;
        let nlink = u32::try_from(i64::from(inode.nlink()) + delta)
            .map_err(|_| PfsError::TooManyLinks)?;
        inode.set_nlink(nlink);
        write_inode(&self.dev, &mut inode)
    }

    fn find_entry(&self, dir: &Inode, name: &[u8]) -> Result<FoundEntry> {
        pfs_dir::find(&self.dev, dir, name)?
            .ok_or_else(|| PfsError::NotFound(display_name(name)))
    }

    fn check_absent(&self, dir: &Inode, name: &[u8]) -> Result<()> {
        if is_dot_name(name) || pfs_dir::find(&self.dev, dir, name)?.is_some() {
            return Err(PfsError::Exists);
        }
        Ok(())
    }

    /// Refuse to move directory `moved` into `target` or below it.
    fn check_not_ancestor(&self, moved: InodeNumber, target: InodeNumber) -> Result<()> {
        let mut current = target;
        let mut hops = 0_u64;
        loop {
            if current == moved {
                return Err(PfsError::InvalidRange(
                    "cannot move a directory beneath itself".to_owned(),
                ));
            }
            if current == self.root {
                return Ok(());
            }
            hops += 1;
            if hops > self.alloc.superblock().inode_limit {
                return Err(PfsError::corruption(
                    current.sector().block().0,
                    "directory parent chain does not reach the root",
                ));
            }
            let dir = self.load_dir(current)?;
            current = pfs_dir::parent(&self.dev, &dir)?;
        }
    }

    // ── Namespace ─────────────────────────────────────────────────────

    /// Inode named `name` in directory `parent`.
    pub fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeNumber> {
        let _ops = self.ops.lock();
        let dir = self.load_dir(parent)?;
        pfs_dir::lookup(&self.dev, &dir, name.as_bytes())?
            .ok_or_else(|| PfsError::NotFound(name.to_string_lossy().into_owned()))
    }

    pub fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let _ops = self.ops.lock();
        Ok(self.load(ino)?.attr())
    }

    /// Resolve an absolute path from the root directory.
    pub fn resolve_path(&self, path: &str) -> Result<InodeNumber> {
        if !path.starts_with('/') {
            return Err(PfsError::InvalidRange(format!("path {path:?} must be absolute")));
        }
        let _ops = self.ops.lock();
        let mut current = self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let dir = self.load_dir(current)?;
            current = pfs_dir::lookup(&self.dev, &dir, component.as_bytes())?
                .ok_or_else(|| PfsError::NotFound(component.to_owned()))?;
        }
        Ok(current)
    }

    /// Create an empty regular file.
    pub fn create(&self, parent: InodeNumber, name: &OsStr, mode: u32) -> Result<InodeAttr> {
        let kind = mode & S_IFMT;
        if kind != 0 && kind != S_IFREG {
            return Err(PfsError::InvalidRange(format!(
                "create makes regular files, not mode {mode:#o}"
            )));
        }
        let name = name.as_bytes();
        let _ops = self.ops.lock();
        let mut dir = self.load_dir(parent)?;
        self.check_absent(&dir, name)?;

        let ino = self.allocate_inode()?;
        let mut inode = Inode::new(ino, S_IFREG | (mode & 0o7777), 0, 0);
        if let Err(err) = write_inode(&self.dev, &mut inode) {
            self.abandon(inode);
            return Err(err);
        }
        if let Err(err) = pfs_dir::insert(&self.dev, &self.alloc, &mut dir, name, ino) {
            self.settle(&mut dir);
            self.abandon(inode);
            return Err(err);
        }
        write_inode(&self.dev, &mut dir)?;
        debug!(parent = parent.0, ino = ino.0, name = %display_name(name), "created file");
        Ok(inode.attr())
    }

    /// Create an empty directory.
    pub fn mkdir(&self, parent: InodeNumber, name: &OsStr, mode: u32) -> Result<InodeAttr> {
        let name = name.as_bytes();
        let _ops = self.ops.lock();
        let mut dir = self.load_dir(parent)?;
        if dir.nlink() == u32::MAX {
            return Err(PfsError::TooManyLinks);
        }
        self.check_absent(&dir, name)?;

        let ino = self.allocate_inode()?;
        let mut child = Inode::new(ino, pfs_types::S_IFDIR | (mode & 0o7777), 0, 0);
        child.set_nlink(2);
        let built = pfs_dir::init_directory(&self.dev, &self.alloc, &mut child, parent)
            .and_then(|()| write_inode(&self.dev, &mut child));
        if let Err(err) = built {
            self.abandon(child);
            return Err(err);
        }
        if let Err(err) = pfs_dir::insert(&self.dev, &self.alloc, &mut dir, name, ino) {
            self.settle(&mut dir);
            self.abandon(child);
            return Err(err);
        }
        dir.set_nlink(dir.nlink() + 1);
        write_inode(&self.dev, &mut dir)?;
        debug!(parent = parent.0, ino = ino.0, name = %display_name(name), "created directory");
        Ok(child.attr())
    }

    /// Add another name for a non-directory inode.
    pub fn link(&self, ino: InodeNumber, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let name = name.as_bytes();
        let _ops = self.ops.lock();
        let mut target = self.load(ino)?;
        if target.is_dir() {
            return Err(PfsError::IsDirectory);
        }
        if target.nlink() == u32::MAX {
            return Err(PfsError::TooManyLinks);
        }
        let mut dir = self.load_dir(parent)?;
        self.check_absent(&dir, name)?;
        if let Err(err) = pfs_dir::insert(&self.dev, &self.alloc, &mut dir, name, ino) {
            self.settle(&mut dir);
            return Err(err);
        }
        write_inode(&self.dev, &mut dir)?;
        target.set_nlink(target.nlink() + 1);
        write_inode(&self.dev, &mut target)?;
        Ok(target.attr())
    }

    /// Remove a non-directory name.
    pub fn unlink(&self, parent: InodeNumber, name: &OsStr) -> Result<()> {
        let name = name.as_bytes();
        if is_dot_name(name) {
            return Err(PfsError::IsDirectory);
        }
        let _ops = self.ops.lock();
        let mut dir = self.load_dir(parent)?;
        let found = self.find_entry(&dir, name)?;
        let target = self.load(found.inode)?;
        if target.is_dir() {
            return Err(PfsError::IsDirectory);
        }
        pfs_dir::delete(&self.dev, &self.alloc, &mut dir, &found)?;
        write_inode(&self.dev, &mut dir)?;
        debug!(parent = parent.0, ino = found.inode.0, name = %display_name(name), "unlinked");
        self.drop_link(target)
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, parent: InodeNumber, name: &OsStr) -> Result<()> {
        let name = name.as_bytes();
        match name {
            b"." => return Err(PfsError::InvalidRange("cannot remove \".\"".to_owned())),
            b".." => return Err(PfsError::NotEmpty),
            _ => {}
        }
        let _ops = self.ops.lock();
        let mut dir = self.load_dir(parent)?;
        let found = self.find_entry(&dir, name)?;
        let target = self.load(found.inode)?;
        if !target.is_dir() {
            return Err(PfsError::NotDirectory);
        }
        if !pfs_dir::is_empty(&self.dev, &target)? {
            return Err(PfsError::NotEmpty);
        }
        pfs_dir::delete(&self.dev, &self.alloc, &mut dir, &found)?;
        dir.set_nlink(dir.nlink().saturating_sub(1));
        write_inode(&self.dev, &mut dir)?;
        debug!(
            parent = parent.0,
            ino = found.inode.0,
            name = %display_name(name),
            "removed directory"
        );
        self.evict(target)
    }

    /// Move `old_name` in `old_parent` to `new_name` in `new_parent`,
    /// replacing an existing target.
    pub fn rename(
        &self,
        old_parent: InodeNumber,
        old_name: &OsStr,
        new_parent: InodeNumber,
        new_name: &OsStr,
    ) -> Result<()> {
        let (old_name, new_name) = (old_name.as_bytes(), new_name.as_bytes());
        if is_dot_name(old_name) || is_dot_name(new_name) {
            return Err(PfsError::InvalidRange(
                "cannot rename \".\" or \"..\"".to_owned(),
            ));
        }
        let _ops = self.ops.lock();
        let old_dir = self.load_dir(old_parent)?;
        let mut new_dir = self.load_dir(new_parent)?;
        let source = self.find_entry(&old_dir, old_name)?;
        if old_parent == new_parent && old_name == new_name {
            return Ok(());
        }
        let mut moved = self.load(source.inode)?;
        let crosses = moved.is_dir() && old_parent != new_parent;
        if crosses {
            self.check_not_ancestor(moved.ino(), new_parent)?;
        }

        let replaced = match pfs_dir::find(&self.dev, &new_dir, new_name)? {
            Some(found) if found.inode == moved.ino() => return Ok(()),
            Some(found) => {
                let victim = self.load(found.inode)?;
                match (moved.is_dir(), victim.is_dir()) {
                    (true, false) => return Err(PfsError::NotDirectory),
                    (false, true) => return Err(PfsError::IsDirectory),
                    (true, true) if !pfs_dir::is_empty(&self.dev, &victim)? => {
                        return Err(PfsError::NotEmpty);
                    }
                    _ => {}
                }
                pfs_dir::replace_target(&self.dev, &mut new_dir, &found, moved.ino())?;
                Some(victim)
            }
            None => {
                if crosses && new_dir.nlink() == u32::MAX {
                    return Err(PfsError::TooManyLinks);
                }
                if let Err(err) =
                    pfs_dir::insert(&self.dev, &self.alloc, &mut new_dir, new_name, moved.ino())
                {
                    self.settle(&mut new_dir);
                    return Err(err);
                }
                None
            }
        };
        write_inode(&self.dev, &mut new_dir)?;

        // Insertion may have moved the link that pointed at the source.
        let mut old_dir = self.load_dir(old_parent)?;
        let source = self.find_entry(&old_dir, old_name)?;
        pfs_dir::delete(&self.dev, &self.alloc, &mut old_dir, &source)?;
        write_inode(&self.dev, &mut old_dir)?;

        let mut new_parent_delta = 0_i64;
        if crosses {
            pfs_dir::set_parent(&self.dev, &mut moved, new_parent)?;
            self.adjust_nlink(old_parent, -1)?;
            new_parent_delta += 1;
        }
        moved.touch_changed();
        write_inode(&self.dev, &mut moved)?;

        if let Some(victim) = replaced {
            if victim.is_dir() {
                new_parent_delta -= 1;
                self.evict(victim)?;
            } else {
                self.drop_link(victim)?;
            }
        }
        if new_parent_delta != 0 {
            self.adjust_nlink(new_parent, new_parent_delta)?;
        }
        debug!(
            from = old_parent.0,
            to = new_parent.0,
            ino = moved.ino().0,
            "renamed"
        );
        Ok(())
    }

    /// Live entries of directory `ino` from `cookie` on; pass 0 to start.
    pub fn readdir(&self, ino: InodeNumber, cookie: u64) -> Result<Vec<DirEntry>> {
        let _ops = self.ops.lock();
        let dir = self.load_dir(ino)?;
        pfs_dir::read_entries(&self.dev, &dir, cookie)?
            .into_iter()
            .map(|record| {
                let kind = if record.inode == dir.ino() {
                    FileType::Directory
                } else {
                    FileType::from_mode(read_inode(&self.dev, record.inode)?.mode())
                };
                Ok(DirEntry {
                    ino: record.inode,
                    offset: record.next_cookie,
                    kind,
                    name: record.name,
                })
            })
            .collect()
    }

    // ── File data ─────────────────────────────────────────────────────

    /// Read up to `len` bytes at `offset`. Holes read as zeros; reads stop
    /// at end of file.
    pub fn read(&self, ino: InodeNumber, offset: u64, len: u32) -> Result<Vec<u8>> {
        let _ops = self.ops.lock();
        let inode = self.load_file(ino)?;
        let size = inode.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = size.min(offset.saturating_add(u64::from(len)));
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let within = (pos % BLOCK) as usize;
            let take = (BLOCK_SIZE - within).min((end - pos) as usize);
            match pfs_bmap::lookup(&self.dev, &inode, pos / BLOCK)? {
                Some(block) => {
                    let buf = self.dev.read_block(block.block())?;
                    out.extend_from_slice(&buf.as_slice()[within..within + take]);
                }
                None => out.resize(out.len() + take, 0),
            }
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, growing the file as needed.
    ///
    /// If a block cannot be mapped part way, blocks past the old end of file
    /// are released again and the file keeps its old size.
    pub fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(PfsError::FileTooLarge)?;
        let _ops = self.ops.lock();
        let mut inode = self.load_file(ino)?;
        if data.is_empty() {
            return Ok(0);
        }
        let old_size = inode.size();
        if let Err(err) = self.write_blocks(&mut inode, offset, data) {
            let kept = old_size.div_ceil(BLOCK);
            if let Err(undo) = pfs_bmap::release(&self.dev, &self.alloc, &mut inode, kept) {
                warn!(ino = ino.0, error = %undo, "could not release blocks after failed write");
            }
            if let Err(undo) = write_inode(&self.dev, &mut inode) {
                warn!(ino = ino.0, error = %undo, "could not persist inode after failed write");
            }
            return Err(err);
        }
        if end > old_size {
            inode.set_size(end);
        }
        inode.touch_modified();
        write_inode(&self.dev, &mut inode)?;
        Ok(data.len())
    }

    fn write_blocks(&self, inode: &mut Inode, offset: u64, data: &[u8]) -> Result<()> {
        let mut written = 0_usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let within = (pos % BLOCK) as usize;
            let take = (BLOCK_SIZE - within).min(data.len() - written);
            let mapping = pfs_bmap::resolve(&self.dev, &self.alloc, inode, pos / BLOCK, true)?
                .ok_or_else(|| {
                    PfsError::corruption(
                        inode.ino().sector().block().0,
                        "create mode returned a hole",
                    )
                })?;
            let mut buf = if mapping.fresh || take == BLOCK_SIZE {
                vec![0_u8; BLOCK_SIZE]
            } else {
                self.dev.read_block(mapping.block.block())?.into_inner()
            };
            buf[within..within + take].copy_from_slice(&data[written..written + take]);
            self.dev.write_block(mapping.block.block(), &buf)?;
            written += take;
        }
        Ok(())
    }

    /// Set the file size. Shrinking zeroes the rest of the new last block
    /// and frees the blocks past it; growing leaves a hole.
    pub fn truncate(&self, ino: InodeNumber, size: u64) -> Result<InodeAttr> {
        if size > MAX_FILE_SIZE {
            return Err(PfsError::FileTooLarge);
        }
        let _ops = self.ops.lock();
        let mut inode = self.load_file(ino)?;
        if size < inode.size() {
            let within = (size % BLOCK) as usize;
            if within != 0 {
                if let Some(block) = pfs_bmap::lookup(&self.dev, &inode, size / BLOCK)? {
                    let mut buf = self.dev.read_block(block.block())?.into_inner();
                    buf[within..].fill(0);
                    self.dev.write_block(block.block(), &buf)?;
                }
            }
            pfs_bmap::truncate_blocks(&self.dev, &self.alloc, &mut inode, size)?;
        } else {
            inode.set_size(size);
        }
        inode.touch_modified();
        write_inode(&self.dev, &mut inode)?;
        Ok(inode.attr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::MemoryByteDevice;

    fn volume() -> Volume {
        let options = FormatOptions::default();
        let dev: Arc<dyn ByteDevice> =
            Arc::new(MemoryByteDevice::new(options.byte_len() as usize));
        Volume::format_device(dev, &options, &OpenOptions::default())
            .expect("format")
            .0
    }

    fn name(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn fresh_volume_has_an_empty_root() {
        let vol = volume();
        assert_eq!(vol.root(), InodeNumber(8));
        let attr = vol.getattr(vol.root()).expect("getattr");
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.perm, 0o777);
        assert_eq!(attr.size, 4096);

        let entries = vol.readdir(vol.root(), 0).expect("readdir");
        let names: Vec<_> = entries.iter().map(DirEntry::name_str).collect();
        assert_eq!(names, [".", ".."]);
        assert!(entries.iter().all(|e| e.ino == vol.root()));
        assert_eq!(vol.lookup(vol.root(), name("..")).expect("dotdot"), vol.root());
    }

    #[test]
    fn create_write_read_unlink() {
        let vol = volume();
        let root = vol.root();
        let attr = vol.create(root, name("hello.txt"), 0o644).expect("create");
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.nlink, 1);

        assert_eq!(vol.write(attr.ino, 0, b"hello world").expect("write"), 11);
        assert_eq!(vol.read(attr.ino, 0, 100).expect("read"), b"hello world");
        assert_eq!(vol.read(attr.ino, 6, 3).expect("read"), b"wor");
        assert!(vol.read(attr.ino, 11, 10).expect("read").is_empty());
        assert_eq!(vol.lookup(root, name("hello.txt")).expect("lookup"), attr.ino);

        let free_inodes = vol.statfs().free_inodes;
        vol.unlink(root, name("hello.txt")).expect("unlink");
        assert!(matches!(
            vol.lookup(root, name("hello.txt")),
            Err(PfsError::NotFound(_))
        ));
        assert!(matches!(vol.getattr(attr.ino), Err(PfsError::NotFound(_))));
        assert_eq!(vol.statfs().free_inodes, free_inodes + 1);
    }

    #[test]
    fn holes_read_as_zeros() {
        let vol = volume();
        let ino = vol.create(vol.root(), name("sparse"), 0o600).expect("create").ino;
        vol.write(ino, 3 * 4096 + 10, b"tail").expect("write");
        let attr = vol.getattr(ino).expect("getattr");
        assert_eq!(attr.size, 3 * 4096 + 14);
        assert_eq!(attr.blocks, 8);

        let data = vol.read(ino, 0, 20_000).expect("read");
        assert_eq!(data.len(), 3 * 4096 + 14);
        assert!(data[..3 * 4096 + 10].iter().all(|b| *b == 0));
        assert_eq!(&data[3 * 4096 + 10..], b"tail");
    }

    #[test]
    fn truncate_zeroes_the_partial_tail() {
        let vol = volume();
        let ino = vol.create(vol.root(), name("t"), 0o600).expect("create").ino;
        vol.write(ino, 0, &vec![0xAB; 3 * 4096]).expect("write");
        let attr = vol.truncate(ino, 100).expect("shrink");
        assert_eq!(attr.size, 100);
        assert_eq!(attr.blocks, 8);

        vol.truncate(ino, 4096).expect("grow");
        let data = vol.read(ino, 0, 4096).expect("read");
        assert!(data[..100].iter().all(|b| *b == 0xAB));
        assert!(data[100..].iter().all(|b| *b == 0));
    }

    #[test]
    fn oversized_writes_are_rejected() {
        let vol = volume();
        let ino = vol.create(vol.root(), name("big"), 0o600).expect("create").ino;
        assert!(matches!(
            vol.write(ino, MAX_FILE_SIZE, b"x"),
            Err(PfsError::FileTooLarge)
        ));
        assert!(matches!(
            vol.truncate(ino, MAX_FILE_SIZE + 1),
            Err(PfsError::FileTooLarge)
        ));
        assert_eq!(vol.getattr(ino).expect("getattr").size, 0);
    }

    #[test]
    fn mkdir_and_rmdir_track_link_counts() {
        let vol = volume();
        let root = vol.root();
        let sub = vol.mkdir(root, name("sub"), 0o755).expect("mkdir");
        assert_eq!(sub.nlink, 2);
        assert_eq!(vol.getattr(root).expect("root").nlink, 3);
        assert_eq!(vol.lookup(sub.ino, name("..")).expect("dotdot"), root);

        vol.create(sub.ino, name("f"), 0o644).expect("create");
        assert!(matches!(vol.rmdir(root, name("sub")), Err(PfsError::NotEmpty)));
        assert!(matches!(vol.unlink(root, name("sub")), Err(PfsError::IsDirectory)));
        vol.unlink(sub.ino, name("f")).expect("unlink");

        vol.rmdir(root, name("sub")).expect("rmdir");
        assert_eq!(vol.getattr(root).expect("root").nlink, 2);
        assert!(matches!(vol.getattr(sub.ino), Err(PfsError::NotFound(_))));
    }

    #[test]
    fn hard_links_share_an_inode() {
        let vol = volume();
        let root = vol.root();
        let file = vol.create(root, name("a"), 0o644).expect("create");
        vol.write(file.ino, 0, b"shared").expect("write");
        let linked = vol.link(file.ino, root, name("b")).expect("link");
        assert_eq!(linked.nlink, 2);

        vol.unlink(root, name("a")).expect("unlink");
        assert_eq!(vol.getattr(file.ino).expect("getattr").nlink, 1);
        assert_eq!(vol.read(file.ino, 0, 10).expect("read"), b"shared");

        let dir = vol.mkdir(root, name("d"), 0o755).expect("mkdir");
        assert!(matches!(
            vol.link(dir.ino, root, name("d2")),
            Err(PfsError::IsDirectory)
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let vol = volume();
        let root = vol.root();
        vol.create(root, name("x"), 0o644).expect("create");
        assert!(matches!(vol.create(root, name("x"), 0o644), Err(PfsError::Exists)));
        assert!(matches!(vol.mkdir(root, name("x"), 0o755), Err(PfsError::Exists)));
        assert!(matches!(vol.mkdir(root, name(".."), 0o755), Err(PfsError::Exists)));
        assert!(matches!(
            vol.create(root, name(&"n".repeat(256)), 0o644),
            Err(PfsError::NameTooLong)
        ));
    }

    #[test]
    fn rename_within_and_across_directories() {
        let vol = volume();
        let root = vol.root();
        let file = vol.create(root, name("old"), 0o644).expect("create");
        vol.rename(root, name("old"), root, name("new")).expect("rename");
        assert_eq!(vol.lookup(root, name("new")).expect("lookup"), file.ino);
        assert!(vol.lookup(root, name("old")).is_err());

        let a = vol.mkdir(root, name("a"), 0o755).expect("a");
        let b = vol.mkdir(root, name("b"), 0o755).expect("b");
        let moved = vol.mkdir(a.ino, name("m"), 0o755).expect("m");
        assert_eq!(vol.getattr(a.ino).expect("a").nlink, 3);

        vol.rename(a.ino, name("m"), b.ino, name("m")).expect("move dir");
        assert_eq!(vol.getattr(a.ino).expect("a").nlink, 2);
        assert_eq!(vol.getattr(b.ino).expect("b").nlink, 3);
        assert_eq!(vol.lookup(moved.ino, name("..")).expect("dotdot"), b.ino);

        assert!(matches!(
            vol.rename(root, name("b"), moved.ino, name("loop")),
            Err(PfsError::InvalidRange(_))
        ));
    }

    #[test]
    fn rename_over_an_existing_file_drops_it() {
        let vol = volume();
        let root = vol.root();
        let src = vol.create(root, name("src"), 0o644).expect("src");
        let dst = vol.create(root, name("dst"), 0o644).expect("dst");
        vol.write(dst.ino, 0, &[1; 5000]).expect("write");
        let used = vol.superblock().block_sectors_used;

        vol.rename(root, name("src"), root, name("dst")).expect("rename");
        assert_eq!(vol.lookup(root, name("dst")).expect("lookup"), src.ino);
        assert!(matches!(vol.getattr(dst.ino), Err(PfsError::NotFound(_))));
        assert_eq!(vol.superblock().block_sectors_used, used - 16);

        let dir = vol.mkdir(root, name("dir"), 0o755).expect("mkdir");
        assert!(matches!(
            vol.rename(root, name("dst"), root, name("dir")),
            Err(PfsError::IsDirectory)
        ));
        assert!(matches!(
            vol.rename(root, name("dir"), root, name("dst")),
            Err(PfsError::NotDirectory)
        ));
        assert_eq!(vol.getattr(dir.ino).expect("dir").nlink, 2);
    }

    #[test]
    fn rename_over_an_empty_directory() {
        let vol = volume();
        let root = vol.root();
        let a = vol.mkdir(root, name("a"), 0o755).expect("a");
        let b = vol.mkdir(root, name("b"), 0o755).expect("b");
        assert_eq!(vol.getattr(root).expect("root").nlink, 4);

        vol.rename(root, name("a"), root, name("b")).expect("rename");
        assert_eq!(vol.lookup(root, name("b")).expect("lookup"), a.ino);
        assert!(matches!(vol.getattr(b.ino), Err(PfsError::NotFound(_))));
        assert_eq!(vol.getattr(root).expect("root").nlink, 3);
    }

    #[test]
    fn readdir_reports_kinds_and_resumes() {
        let vol = volume();
        let root = vol.root();
        vol.create(root, name("file"), 0o644).expect("file");
        vol.mkdir(root, name("dir"), 0o755).expect("dir");

        let entries = vol.readdir(root, 0).expect("readdir");
        let kinds: Vec<_> = entries.iter().map(|e| (e.name_str(), e.kind)).collect();
        assert_eq!(
            kinds,
            [
                (".".to_owned(), FileType::Directory),
                ("..".to_owned(), FileType::Directory),
                ("file".to_owned(), FileType::RegularFile),
                ("dir".to_owned(), FileType::Directory),
            ]
        );
        let rest = vol.readdir(root, entries[2].offset).expect("resume");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name_str(), "dir");
    }

    #[test]
    fn resolve_path_walks_components() {
        let vol = volume();
        let a = vol.mkdir(vol.root(), name("a"), 0o755).expect("a");
        let f = vol.create(a.ino, name("f"), 0o644).expect("f");
        assert_eq!(vol.resolve_path("/").expect("root"), vol.root());
        assert_eq!(vol.resolve_path("/a/f").expect("f"), f.ino);
        assert_eq!(vol.resolve_path("/a/./f").expect("dot"), f.ino);
        assert!(matches!(vol.resolve_path("/a/f/g"), Err(PfsError::NotDirectory)));
        assert!(matches!(vol.resolve_path("/nope"), Err(PfsError::NotFound(_))));
        assert!(matches!(vol.resolve_path("a"), Err(PfsError::InvalidRange(_))));
    }

    #[test]
    fn statfs_reflects_usage() {
        let vol = volume();
        let fresh = vol.statfs();
        assert_eq!(fresh.block_size, 4096);
        assert_eq!(fresh.total_inodes, 1024);
        assert_eq!(fresh.name_max, 255);

        // The first entry also gives the root directory its first entry block.
        let ino = vol.create(vol.root(), name("f"), 0o644).expect("create").ino;
        let before = vol.statfs();
        assert_eq!(before.free_blocks, fresh.free_blocks - 1);
        assert_eq!(before.free_inodes, fresh.free_inodes - 1);

        vol.write(ino, 0, &[7; 8192]).expect("write");
        assert_eq!(vol.statfs().free_blocks, before.free_blocks - 2);
    }

    #[test]
    fn sectors_that_hold_no_inode_are_not_found() {
        let vol = volume();
        let ino = vol.create(vol.root(), name("data"), 0o644).expect("create").ino;
        vol.write(ino, 0, &[0xFF; 4096]).expect("write");
        let inode = read_inode(vol.device(), ino).expect("inode");
        let data = pfs_bmap::lookup(vol.device(), &inode, 0)
            .expect("lookup")
            .expect("mapped");

        for sector in [data.0, data.0 + 3] {
            assert!(matches!(
                vol.getattr(InodeNumber(sector)),
                Err(PfsError::NotFound(_))
            ));
        }
        // A freed record reads back as zeros.
        vol.unlink(vol.root(), name("data")).expect("unlink");
        assert!(matches!(vol.getattr(ino), Err(PfsError::NotFound(_))));
        assert!(matches!(
            vol.read(InodeNumber(data.0), 0, 16),
            Err(PfsError::NotFound(_))
        ));
    }

    #[test]
    fn non_volumes_are_refused() {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemoryByteDevice::new(32768 * 512));
        assert!(matches!(
            Volume::from_device(dev, &OpenOptions::default()),
            Err(PfsError::Format(_))
        ));
    }
}
