#![forbid(unsafe_code)]
//! Hashed directories.
//!
//! The first block of a directory holds a 505-bucket hash table, the head of
//! the chain of reusable slack entries, and the fixed "." and ".." entries.
//! Every other entry lives in later blocks and is reached by following chain
//! links, which are absolute byte positions inside the directory.
//!
//! Entry lifecycle: inserted into its bucket chain; on delete either the
//! directory shrinks (last record) or the entry turns into slack on the
//! unused chain; slack is reused by the next insert it is large enough for.
//!
//! Chain mutation is not locked here. Callers serialize operations on one
//! directory; only block allocation goes through the volume lock.

use pfs_alloc::Allocator;
use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_inode::Inode;
use pfs_ondisk::dirent::{next_link_offset, set_entry_inode, write_entry, write_slack};
use pfs_ondisk::{
    DIR_ENTRY_HEADER_SIZE, DIR_HASH_SIZE, DOT_OFFSET, DOTDOT_OFFSET, DirEntryHeader,
    UNUSED_CHAIN_SLOT, dir_hash, required_rec_len,
};
use pfs_types::{
    BLOCK_SHIFT, BLOCK_SIZE, InodeNumber, MAX_NAME_LEN, SectorNumber, read_le_u64, write_le_u64,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

const BLOCK: u64 = BLOCK_SIZE as u64;

// ── Positions ───────────────────────────────────────────────────────────────

/// Absolute byte offset inside a directory's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirectoryPosition(pub u64);

impl DirectoryPosition {
    #[must_use]
    pub fn logical_block(self) -> u64 {
        self.0 >> BLOCK_SHIFT
    }

    #[must_use]
    pub fn offset_in_block(self) -> usize {
        (self.0 % BLOCK) as usize
    }
}

/// Physical block and intra-block offset backing `position`.
pub fn resolve(
    dev: &dyn BlockDevice,
    dir: &Inode,
    position: DirectoryPosition,
) -> Result<(SectorNumber, usize)> {
    let block = pfs_bmap::lookup(dev, dir, position.logical_block())?.ok_or_else(|| {
        PfsError::corruption(
            dir.ino().sector().block().0,
            format!(
                "directory {} has a hole at byte {}",
                dir.ino(),
                position.0
            ),
        )
    })?;
    Ok((block, position.offset_in_block()))
}

/// Where a chain link is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSite {
    /// Hash table slot in the first block.
    Table(usize),
    /// `next` field of the entry at this position.
    Entry(DirectoryPosition),
}

impl LinkSite {
    fn field(self) -> DirectoryPosition {
        match self {
            Self::Table(slot) => DirectoryPosition(slot as u64 * 8),
            Self::Entry(entry) => DirectoryPosition(entry.0 + next_link_offset() as u64),
        }
    }
}

/// Single-block window used while walking chains, so hops inside the same
/// block do not go back through the mapper.
struct BlockWindow<'a> {
    dev: &'a dyn BlockDevice,
    dir: &'a Inode,
    current: Option<(u64, SectorNumber, Vec<u8>)>,
}

impl<'a> BlockWindow<'a> {
    fn new(dev: &'a dyn BlockDevice, dir: &'a Inode) -> Self {
        Self {
            dev,
            dir,
            current: None,
        }
    }

    /// Block content containing `position`, plus its physical address.
    fn load(&mut self, position: DirectoryPosition) -> Result<(SectorNumber, &[u8])> {
        let logical = position.logical_block();
        let hit = matches!(&self.current, Some((held, _, _)) if *held == logical);
        if !hit {
            let (block, _) = resolve(self.dev, self.dir, position)?;
            let buf = self.dev.read_block(block.block())?.into_inner();
            self.current = Some((logical, block, buf));
        } else {
            trace!(dir = self.dir.ino().0, logical, "chain hop stays in block");
        }
        match &self.current {
            Some((_, block, buf)) => Ok((*block, buf.as_slice())),
            None => Err(PfsError::corruption(
                self.dir.ino().sector().block().0,
                "directory block window empty after load",
            )),
        }
    }

    fn header(&mut self, position: DirectoryPosition) -> Result<(DirEntryHeader, Vec<u8>)> {
        let (block, buf) = self.load(position)?;
        let offset = position.offset_in_block();
        let header = DirEntryHeader::parse(buf, offset)
            .map_err(|err| pfs_ondisk::parse_error_at(block.block(), &err))?;
        let name = if header.is_slack() {
            Vec::new()
        } else {
            header
                .name(buf, offset)
                .map_err(|err| pfs_ondisk::parse_error_at(block.block(), &err))?
                .to_vec()
        };
        Ok((header, name))
    }

    fn read_u64(&mut self, position: DirectoryPosition) -> Result<u64> {
        let (block, buf) = self.load(position)?;
        read_le_u64(buf, position.offset_in_block())
            .map_err(|err| pfs_ondisk::parse_error_at(block.block(), &err))
    }
}

fn read_u64_at(dev: &dyn BlockDevice, dir: &Inode, position: DirectoryPosition) -> Result<u64> {
    BlockWindow::new(dev, dir).read_u64(position)
}

/// Read-modify-write of the block holding `position`.
fn modify_block<F>(
    dev: &dyn BlockDevice,
    dir: &Inode,
    position: DirectoryPosition,
    edit: F,
) -> Result<()>
where
    F: FnOnce(&mut [u8], usize) -> std::result::Result<(), pfs_types::ParseError>,
{
    let (block, offset) = resolve(dev, dir, position)?;
    let mut buf = dev.read_block(block.block())?.into_inner();
    edit(buf.as_mut_slice(), offset)
        .map_err(|err| pfs_ondisk::parse_error_at(block.block(), &err))?;
    dev.write_block(block.block(), &buf)
}

fn write_u64_at(
    dev: &dyn BlockDevice,
    dir: &Inode,
    position: DirectoryPosition,
    value: u64,
) -> Result<()> {
    modify_block(dev, dir, position, |buf, offset| write_le_u64(buf, offset, value))
}

fn read_link(dev: &dyn BlockDevice, dir: &Inode, site: LinkSite) -> Result<u64> {
    read_u64_at(dev, dir, site.field())
}

fn write_link(dev: &dyn BlockDevice, dir: &Inode, site: LinkSite, target: u64) -> Result<()> {
    write_u64_at(dev, dir, site.field(), target)
}

/// A chain link must name an entry header inside the entry area.
fn checked_target(dir: &Inode, target: u64) -> Result<DirectoryPosition> {
    if target < BLOCK || target + DIR_ENTRY_HEADER_SIZE as u64 > dir.size() {
        return Err(PfsError::corruption(
            dir.ino().sector().block().0,
            format!(
                "directory {} link to byte {target} outside entries (size {})",
                dir.ino(),
                dir.size()
            ),
        ));
    }
    Ok(DirectoryPosition(target))
}

fn hop_limit(dir: &Inode) -> u64 {
    dir.size() / DIR_ENTRY_HEADER_SIZE as u64 + 1
}

// ── Names ───────────────────────────────────────────────────────────────────

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(PfsError::InvalidRange(
            "directory entry name cannot be empty".to_owned(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PfsError::NameTooLong);
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(PfsError::InvalidRange(format!(
            "directory entry name {:?} contains '/' or NUL",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

fn is_dot_name(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// A live entry located by [`find`], with the link that points at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundEntry {
    pub position: DirectoryPosition,
    pub inode: InodeNumber,
    pub rec_len: u16,
    pub link: LinkSite,
}

/// Locate `name` in its bucket chain. "." and ".." are not hashed and
/// never found here.
pub fn find(dev: &dyn BlockDevice, dir: &Inode, name: &[u8]) -> Result<Option<FoundEntry>> {
    validate_name(name)?;
    let mut window = BlockWindow::new(dev, dir);
    let mut link = LinkSite::Table(dir_hash(name));
    let mut next = window.read_u64(link.field())?;
    let mut hops = 0_u64;

    while next != 0 {
        hops += 1;
        if hops > hop_limit(dir) {
            return Err(PfsError::corruption(
                dir.ino().sector().block().0,
                format!("directory {} hash chain does not terminate", dir.ino()),
            ));
        }
        let position = checked_target(dir, next)?;
        let (header, entry_name) = window.header(position)?;
        trace!(dir = dir.ino().0, position = position.0, "chain hop");
        if !header.is_slack() && entry_name == name {
            return Ok(Some(FoundEntry {
                position,
                inode: InodeNumber(header.inode),
                rec_len: header.rec_len,
                link,
            }));
        }
        link = LinkSite::Entry(position);
        next = header.next;
    }
    Ok(None)
}

/// Inode number `name` refers to in `dir`, if any.
pub fn lookup(dev: &dyn BlockDevice, dir: &Inode, name: &[u8]) -> Result<Option<InodeNumber>> {
    match name {
        b"." => Ok(Some(dir.ino())),
        b".." => parent(dev, dir).map(Some),
        _ => Ok(find(dev, dir, name)?.map(|found| found.inode)),
    }
}

/// Target of the fixed ".." entry.
pub fn parent(dev: &dyn BlockDevice, dir: &Inode) -> Result<InodeNumber> {
    read_u64_at(dev, dir, DirectoryPosition(DOTDOT_OFFSET as u64)).map(InodeNumber)
}

/// True when no name besides "." and ".." is linked.
pub fn is_empty(dev: &dyn BlockDevice, dir: &Inode) -> Result<bool> {
    let (block, _) = resolve(dev, dir, DirectoryPosition(0))?;
    let buf = dev.read_block(block.block())?;
    Ok(buf.as_slice()[..DIR_HASH_SIZE * 8].iter().all(|b| *b == 0))
}

// ── Creation ────────────────────────────────────────────────────────────────

/// Fill `block` as a directory's first block: an empty table plus "." and
/// "..".
pub fn write_first_block(
    dev: &dyn BlockDevice,
    block: SectorNumber,
    own: InodeNumber,
    parent: InodeNumber,
) -> Result<()> {
    let mut buf = vec![0_u8; BLOCK_SIZE];
    write_entry(&mut buf, DOT_OFFSET, own.0, 0, DIR_ENTRY_HEADER_SIZE, b".")
        .and_then(|()| {
            write_entry(&mut buf, DOTDOT_OFFSET, parent.0, 0, DIR_ENTRY_HEADER_SIZE, b"..")
        })
        .map_err(|err| pfs_ondisk::parse_error_at(block.block(), &err))?;
    dev.write_block(block.block(), &buf)
}

/// Allocate and fill the first block of an empty directory.
pub fn init_directory(
    dev: &dyn BlockDevice,
    alloc: &Allocator,
    dir: &mut Inode,
    parent: InodeNumber,
) -> Result<()> {
    if dir.size() != 0 {
        return Err(PfsError::Exists);
    }
    let mapping = pfs_bmap::resolve(dev, alloc, dir, 0, true)?.ok_or_else(|| {
        PfsError::corruption(dir.ino().sector().block().0, "create mode returned a hole")
    })?;
    write_first_block(dev, mapping.block, dir.ino(), parent)?;
    dir.set_size(BLOCK);
    dir.touch_modified();
    debug!(dir = dir.ino().0, parent = parent.0, block = mapping.block.0, "initialized directory");
    Ok(())
}

/// Point ".." at `parent`.
pub fn set_parent(dev: &dyn BlockDevice, dir: &mut Inode, parent: InodeNumber) -> Result<()> {
    write_u64_at(dev, dir, DirectoryPosition(DOTDOT_OFFSET as u64), parent.0)?;
    dir.touch_modified();
    Ok(())
}

/// Retarget an existing entry without touching its chain.
pub fn replace_target(
    dev: &dyn BlockDevice,
    dir: &mut Inode,
    found: &FoundEntry,
    inode: InodeNumber,
) -> Result<()> {
    modify_block(dev, dir, found.position, |buf, offset| {
        set_entry_inode(buf, offset, inode.0)
    })?;
    dir.touch_modified();
    Ok(())
}

/// Link `name` to `inode` in `dir`. Returns the new entry's position.
pub fn insert(
    dev: &dyn BlockDevice,
    alloc: &Allocator,
    dir: &mut Inode,
    name: &[u8],
    inode: InodeNumber,
) -> Result<DirectoryPosition> {
    validate_name(name)?;
    if is_dot_name(name) {
        return Err(PfsError::Exists);
    }
    if inode.0 == 0 {
        return Err(PfsError::InvalidRange(
            "directory entry cannot target inode 0".to_owned(),
        ));
    }
    if find(dev, dir, name)?.is_some() {
        return Err(PfsError::Exists);
    }

    let need = required_rec_len(name.len());
    let bucket = LinkSite::Table(dir_hash(name));
    let position = match take_slack(dev, dir, need)? {
        Some((position, rec_len)) => {
            let head = read_link(dev, dir, bucket)?;
            modify_block(dev, dir, position, |buf, offset| {
                write_entry(buf, offset, inode.0, head, rec_len, name)
            })?;
            trace!(dir = dir.ino().0, position = position.0, "reused slack entry");
            position
        }
        None => append(dev, alloc, dir, name, inode, need, bucket)?,
    };
    write_link(dev, dir, bucket, position.0)?;
    dir.touch_modified();
    Ok(position)
}

/// Unlink the first slack entry of at least `need` bytes from the unused
/// chain. Returns its position and record length.
fn take_slack(
    dev: &dyn BlockDevice,
    dir: &Inode,
    need: usize,
) -> Result<Option<(DirectoryPosition, usize)>> {
    let mut window = BlockWindow::new(dev, dir);
    let mut link = LinkSite::Table(UNUSED_CHAIN_SLOT);
    let mut next = window.read_u64(link.field())?;
    let mut hops = 0_u64;
    while next != 0 {
        hops += 1;
        if hops > hop_limit(dir) {
            return Err(PfsError::corruption(
                dir.ino().sector().block().0,
                format!("directory {} unused chain does not terminate", dir.ino()),
            ));
        }
        let position = checked_target(dir, next)?;
        let (header, _) = window.header(position)?;
        if usize::from(header.rec_len) >= need {
            write_link(dev, dir, link, header.next)?;
            return Ok(Some((position, usize::from(header.rec_len))));
        }
        link = LinkSite::Entry(position);
        next = header.next;
    }
    Ok(None)
}

/// Record length for an entry placed with `room` bytes left in its block.
fn fitted_rec_len(need: usize, room: usize) -> usize {
    if room - need < DIR_ENTRY_HEADER_SIZE {
        room
    } else {
        need
    }
}

fn append(
    dev: &dyn BlockDevice,
    alloc: &Allocator,
    dir: &mut Inode,
    name: &[u8],
    inode: InodeNumber,
    need: usize,
    bucket: LinkSite,
) -> Result<DirectoryPosition> {
    let head = read_link(dev, dir, bucket)?;
    let size = dir.size();
    let used = (size % BLOCK) as usize;
    if used != 0 {
        let room = BLOCK_SIZE - used;
        let position = DirectoryPosition(size);
        if room >= need {
            let rec_len = fitted_rec_len(need, room);
            modify_block(dev, dir, position, |buf, offset| {
                write_entry(buf, offset, inode.0, head, rec_len, name)
            })?;
            dir.set_size(size + rec_len as u64);
            return Ok(position);
        }
        if room < DIR_ENTRY_HEADER_SIZE {
            return Err(PfsError::corruption(
                dir.ino().sector().block().0,
                format!("directory {} tail of {room} bytes holds no header", dir.ino()),
            ));
        }
        let unused = LinkSite::Table(UNUSED_CHAIN_SLOT);
        let unused_head = read_link(dev, dir, unused)?;
        modify_block(dev, dir, position, |buf, offset| {
            write_slack(buf, offset, unused_head, room)
        })?;
        write_link(dev, dir, unused, position.0)?;
        dir.set_size(size + room as u64);
        trace!(dir = dir.ino().0, position = position.0, room, "tail became slack");
    }

    let position = DirectoryPosition(dir.size());
    let mapping = pfs_bmap::resolve(dev, alloc, dir, position.logical_block(), true)?
        .ok_or_else(|| {
            PfsError::corruption(dir.ino().sector().block().0, "create mode returned a hole")
        })?;
    let rec_len = fitted_rec_len(need, BLOCK_SIZE);
    let mut buf = vec![0_u8; BLOCK_SIZE];
    write_entry(&mut buf, 0, inode.0, head, rec_len, name)
        .map_err(|err| pfs_ondisk::parse_error_at(mapping.block.block(), &err))?;
    dev.write_block(mapping.block.block(), &buf)?;
    dir.set_size(position.0 + rec_len as u64);
    debug!(
        dir = dir.ino().0,
        block = mapping.block.0,
        size = dir.size(),
        "directory grew by one block"
    );
    Ok(position)
}

// ── Deletion ────────────────────────────────────────────────────────────────

/// Unlink the entry described by `found`.
///
/// The last record in the directory is cut off by shrinking the directory;
/// any other record becomes slack on the unused chain.
pub fn delete(
    dev: &dyn BlockDevice,
    alloc: &Allocator,
    dir: &mut Inode,
    found: &FoundEntry,
) -> Result<()> {
    let (header, _) = BlockWindow::new(dev, dir).header(found.position)?;
    if read_link(dev, dir, found.link)? != found.position.0 || header.is_slack() {
        return Err(PfsError::InvalidRange(format!(
            "stale directory entry at byte {}",
            found.position.0
        )));
    }
    write_link(dev, dir, found.link, header.next)?;

    let end = found.position.0 + u64::from(header.rec_len);
    if end == dir.size() {
        pfs_bmap::truncate_blocks(dev, alloc, dir, found.position.0)?;
        trace!(dir = dir.ino().0, size = dir.size(), "directory shrank");
    } else {
        let unused = LinkSite::Table(UNUSED_CHAIN_SLOT);
        let unused_head = read_link(dev, dir, unused)?;
        let rec_len = usize::from(header.rec_len);
        modify_block(dev, dir, found.position, |buf, offset| {
            write_slack(buf, offset, unused_head, rec_len)
        })?;
        write_link(dev, dir, unused, found.position.0)?;
    }
    dir.touch_modified();
    Ok(())
}

// ── Listing ─────────────────────────────────────────────────────────────────

/// One live entry as listed by [`read_entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    pub position: DirectoryPosition,
    /// Cookie that resumes the listing after this entry.
    pub next_cookie: u64,
    pub inode: InodeNumber,
    pub name: Vec<u8>,
}

/// Live entries at or after `cookie`, in position order. "." and ".."
/// come first; slack is skipped.
pub fn read_entries(dev: &dyn BlockDevice, dir: &Inode, cookie: u64) -> Result<Vec<DirRecord>> {
    let mut out = Vec::new();
    let mut window = BlockWindow::new(dev, dir);
    for (offset, name) in [(DOT_OFFSET, &b"."[..]), (DOTDOT_OFFSET, &b".."[..])] {
        let position = DirectoryPosition(offset as u64);
        if position.0 >= cookie {
            let inode = window.read_u64(position)?;
            out.push(DirRecord {
                position,
                next_cookie: position.0 + DIR_ENTRY_HEADER_SIZE as u64,
                inode: InodeNumber(inode),
                name: name.to_vec(),
            });
        }
    }

    let mut position = DirectoryPosition(BLOCK);
    while position.0 < dir.size() {
        let (header, name) = window.header(position)?;
        let end = position.0 + u64::from(header.rec_len);
        if end > dir.size() {
            return Err(PfsError::corruption(
                dir.ino().sector().block().0,
                format!(
                    "directory {} record at {} overruns size {}",
                    dir.ino(),
                    position.0,
                    dir.size()
                ),
            ));
        }
        if !header.is_slack() && position.0 >= cookie {
            out.push(DirRecord {
                position,
                next_cookie: end,
                inode: InodeNumber(header.inode),
                name,
            });
        }
        position = DirectoryPosition(end);
    }
    Ok(out)
}
