#![forbid(unsafe_code)]
//! Indirect block mapping: logical file block to physical block.
//!
//! Each inode carries 48 address slots: 20 direct, 16 single-, 4 double-,
//! 4 triple- and 4 quadruple-indirect. An indirection block holds 512
//! little-endian pointers. A zero pointer means nothing is mapped below it.
//!
//! [`resolve`] walks (and in create mode grows) the chain for one logical
//! block while holding the volume allocation lock; [`release`] frees every
//! block at or beyond a logical index.

use pfs_alloc::{AllocGuard, Allocator, PoolKind};
use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_inode::Inode;
use pfs_types::{
    ADDR_SLOTS, BLOCK_SIZE, DIRECT_SLOTS, DOUBLE_INDIRECT_SLOTS, MAX_CHAIN_DEPTH,
    MAX_FILE_BLOCKS, PTRS_PER_BLOCK, SECTORS_PER_BLOCK, SINGLE_INDIRECT_SLOTS, SectorNumber,
    TRIPLE_INDIRECT_SLOTS, read_le_u64, write_le_u64,
};
use tracing::{debug, trace, warn};

const FIRST_SINGLE: usize = DIRECT_SLOTS;
const FIRST_DOUBLE: usize = FIRST_SINGLE + SINGLE_INDIRECT_SLOTS;
const FIRST_TRIPLE: usize = FIRST_DOUBLE + DOUBLE_INDIRECT_SLOTS;
const FIRST_QUAD: usize = FIRST_TRIPLE + TRIPLE_INDIRECT_SLOTS;

// ── Paths ───────────────────────────────────────────────────────────────────

/// Per-level slot offsets from the inode's address array down to a data
/// block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPath {
    offsets: [u64; MAX_CHAIN_DEPTH],
    len: usize,
}

impl BlockPath {
    /// Offset 0 indexes the address array; later offsets index indirection
    /// blocks.
    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets[..self.len]
    }

    /// Address array slot the chain starts in.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.offsets[0] as usize
    }

    /// Number of pointers followed, address slot included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.len
    }
}

/// Chain depth of address slot `slot`: 1 for direct slots, 2 for
/// single-indirect and so on up to 5.
#[must_use]
pub fn slot_depth(slot: usize) -> usize {
    if slot < FIRST_SINGLE {
        1
    } else if slot < FIRST_DOUBLE {
        2
    } else {
        (slot - FIRST_DOUBLE) / 4 + 3
    }
}

/// Split `logical` into per-level offsets.
///
/// Indices at or beyond 2^32 are rejected with `InvalidRange`.
pub fn path_for(logical: u64) -> Result<BlockPath> {
    if logical >= MAX_FILE_BLOCKS {
        return Err(PfsError::InvalidRange(format!(
            "logical block {logical} >= {MAX_FILE_BLOCKS}"
        )));
    }
    let ptrs = PTRS_PER_BLOCK;
    let mut rest = logical;
    let mut first_slot = 0_u64;
    let levels = [
        (DIRECT_SLOTS, 0_u32),
        (SINGLE_INDIRECT_SLOTS, 1),
        (DOUBLE_INDIRECT_SLOTS, 2),
        (TRIPLE_INDIRECT_SLOTS, 3),
        (ADDR_SLOTS - FIRST_QUAD, 4),
    ];
    for (slots, indirections) in levels {
        let per_slot = ptrs.pow(indirections);
        let capacity = slots as u64 * per_slot;
        if rest < capacity {
            let mut offsets = [0_u64; MAX_CHAIN_DEPTH];
            offsets[0] = first_slot + rest / per_slot;
            let mut within = rest % per_slot;
            for level in 1..=indirections as usize {
                let span = ptrs.pow(indirections - level as u32);
                offsets[level] = within / span;
                within %= span;
            }
            return Ok(BlockPath {
                offsets,
                len: indirections as usize + 1,
            });
        }
        rest -= capacity;
        first_slot += slots as u64;
    }
    // Quadruple indirection alone spans 2^38 blocks.
    Err(PfsError::InvalidRange(format!(
        "logical block {logical} beyond addressable range"
    )))
}

// ── Pointer blocks ──────────────────────────────────────────────────────────

fn checked_pointer(value: u64, holder: SectorNumber) -> Result<u64> {
    if value % SECTORS_PER_BLOCK != 0 {
        return Err(PfsError::corruption(
            holder.block().0,
            format!("block pointer {value} is not block aligned"),
        ));
    }
    Ok(value)
}

fn read_pointer(dev: &dyn BlockDevice, holder: SectorNumber, index: u64) -> Result<u64> {
    let block = holder.block();
    let buf = dev.read_block(block)?;
    let value = read_le_u64(buf.as_slice(), index as usize * 8)
        .map_err(|err| pfs_ondisk::parse_error_at(block, &err))?;
    checked_pointer(value, holder)
}

fn write_pointer(dev: &dyn BlockDevice, holder: SectorNumber, index: u64, value: u64) -> Result<()> {
    let block = holder.block();
    let mut buf = dev.read_block(block)?.into_inner();
    write_le_u64(&mut buf, index as usize * 8, value)
        .map_err(|err| pfs_ondisk::parse_error_at(block, &err))?;
    dev.write_block(block, &buf)
}

// ── Resolve ─────────────────────────────────────────────────────────────────

/// Physical block backing a logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub block: SectorNumber,
    /// The data block was allocated by this call; its content is stale.
    pub fresh: bool,
}

/// Map `logical` without allocating. `Ok(None)` for a hole.
pub fn lookup(dev: &dyn BlockDevice, inode: &Inode, logical: u64) -> Result<Option<SectorNumber>> {
    let path = path_for(logical)?;
    let mut current = checked_pointer(inode.addr(path.slot()), inode.ino().sector())?;
    for &offset in &path.offsets()[1..] {
        if current == 0 {
            break;
        }
        trace!(holder = current, offset, "follow indirection");
        current = read_pointer(dev, SectorNumber(current), offset)?;
    }
    Ok((current != 0).then_some(SectorNumber(current)))
}

/// Map `logical`, allocating missing chain blocks when `create` is set.
///
/// New indirection blocks are zeroed before they are linked; a new data
/// block is returned with `fresh` set and its content untouched. Every
/// allocation is counted in the inode's block count. Levels allocated before
/// a failure stay linked.
pub fn resolve(
    dev: &dyn BlockDevice,
    alloc: &Allocator,
    inode: &mut Inode,
    logical: u64,
    create: bool,
) -> Result<Option<Mapping>> {
    let path = path_for(logical)?;
    let offsets = path.offsets();
    let mut guard: Option<AllocGuard<'_>> = None;
    let mut holder: Option<SectorNumber> = None;
    let mut fresh = false;

    for (level, &offset) in offsets.iter().enumerate() {
        let is_data = level + 1 == offsets.len();
        let mut value = match holder {
            None => checked_pointer(inode.addr(path.slot()), inode.ino().sector())?,
            Some(parent) => read_pointer(dev, parent, offset)?,
        };
        if value == 0 {
            if !create {
                trace!(ino = inode.ino().0, logical, level, "hole");
                return Ok(None);
            }
            let guard = guard.get_or_insert_with(|| alloc.lock());
            let fresh_block = if is_data {
                guard.allocate(dev, PoolKind::Block)?
            } else {
                guard.allocate_zeroed(dev)?
            };
            let linked = match holder {
                None => inode.set_addr(path.slot(), fresh_block.0),
                Some(parent) => write_pointer(dev, parent, offset, fresh_block.0),
            };
            if let Err(err) = linked {
                if let Err(undo) = guard.free(dev, PoolKind::Block, fresh_block) {
                    warn!(block = fresh_block.0, error = %undo, "could not return unlinked block");
                }
                return Err(err);
            }
            inode.add_block();
            debug!(
                ino = inode.ino().0,
                logical,
                level,
                block = fresh_block.0,
                "mapped new block"
            );
            value = fresh_block.0;
            fresh = is_data;
        }
        holder = Some(SectorNumber(value));
    }

    Ok(holder.map(|block| Mapping { block, fresh }))
}

// ── Release ─────────────────────────────────────────────────────────────────

/// How much of a subtree a release covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseScope<'a> {
    /// Only children at or after these per-level offsets; the node stays.
    FromOffset(&'a [u64]),
    /// The node and everything below it.
    WholeSubtree,
}

impl ReleaseScope<'_> {
    /// A boundary at offset zero on every level covers the whole subtree.
    fn normalized(self) -> Self {
        match self {
            Self::FromOffset(offsets) if offsets.iter().all(|o| *o == 0) => Self::WholeSubtree,
            other => other,
        }
    }
}

struct Releaser<'a> {
    dev: &'a dyn BlockDevice,
    guard: AllocGuard<'a>,
    inode: &'a mut Inode,
}

impl Releaser<'_> {
    /// Release below `node`, which sits `levels` indirections above data.
    /// Returns true when `node` itself was freed.
    fn release(&mut self, node: u64, levels: usize, scope: ReleaseScope<'_>) -> Result<bool> {
        let holder = SectorNumber(node);
        let scope = scope.normalized();
        if levels > 0 {
            let (start, rest) = match scope {
                ReleaseScope::FromOffset(offsets) => (
                    offsets.first().copied().unwrap_or(0) as usize,
                    offsets.get(1..).unwrap_or(&[]),
                ),
                ReleaseScope::WholeSubtree => (0, &[][..]),
            };
            let mut buf = self.dev.read_block(holder.block())?.into_inner();
            let mut changed = false;
            for index in start..PTRS_PER_BLOCK as usize {
                let child = read_le_u64(&buf, index * 8)
                    .map_err(|err| pfs_ondisk::parse_error_at(holder.block(), &err))?;
                if child == 0 {
                    continue;
                }
                let child = checked_pointer(child, holder)?;
                let child_scope = match scope {
                    ReleaseScope::FromOffset(_) if index == start => ReleaseScope::FromOffset(rest),
                    _ => ReleaseScope::WholeSubtree,
                };
                if self.release(child, levels - 1, child_scope)? {
                    write_le_u64(&mut buf, index * 8, 0)
                        .map_err(|err| pfs_ondisk::parse_error_at(holder.block(), &err))?;
                    changed = true;
                }
            }
            if let ReleaseScope::FromOffset(_) = scope {
                if changed {
                    self.dev.write_block(holder.block(), &buf)?;
                }
                return Ok(false);
            }
        }

        self.dev.discard(holder.block());
        self.guard.free(self.dev, PoolKind::Block, holder)?;
        self.inode.remove_block()?;
        trace!(ino = self.inode.ino().0, block = node, "released block");
        Ok(true)
    }
}

/// Free every block mapping logical index `from` or beyond, plus the
/// indirection blocks left empty by that.
pub fn release(
    dev: &dyn BlockDevice,
    alloc: &Allocator,
    inode: &mut Inode,
    from: u64,
) -> Result<()> {
    if from >= MAX_FILE_BLOCKS {
        return Ok(());
    }
    let path = path_for(from)?;
    let first_slot = path.slot();
    let before = inode.blocks();
    let guard = alloc.lock();
    let mut releaser = Releaser { dev, guard, inode };

    for slot in first_slot..ADDR_SLOTS {
        let root = checked_pointer(releaser.inode.addr(slot), releaser.inode.ino().sector())?;
        if root == 0 {
            continue;
        }
        let scope = if slot == first_slot {
            ReleaseScope::FromOffset(&path.offsets()[1..])
        } else {
            ReleaseScope::WholeSubtree
        };
        if releaser.release(root, slot_depth(slot) - 1, scope)? {
            releaser.inode.set_addr(slot, 0)?;
        }
    }

    let freed = before - releaser.inode.blocks();
    if freed > 0 {
        releaser.inode.touch_changed();
        debug!(ino = releaser.inode.ino().0, from, freed, "released blocks");
    }
    Ok(())
}

/// Set the inode size and free the blocks wholly beyond it.
pub fn truncate_blocks(
    dev: &dyn BlockDevice,
    alloc: &Allocator,
    inode: &mut Inode,
    new_size: u64,
) -> Result<()> {
    inode.set_size(new_size);
    release(dev, alloc, inode, new_size.div_ceil(BLOCK_SIZE as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::{ByteBlockDevice, MemoryByteDevice};
    use pfs_types::{InodeNumber, S_IFREG};
    use proptest::prelude::*;

    const SECTORS: u64 = 8 * 4096;

    fn volume() -> (ByteBlockDevice<MemoryByteDevice>, Allocator) {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(SECTORS as usize * 512), 4096)
            .expect("device");
        let (alloc, _) =
            pfs_alloc::initialize(&dev, SectorNumber(1), SECTORS, 1024).expect("initialize");
        (dev, alloc)
    }

    fn file() -> Inode {
        Inode::new(InodeNumber(9), S_IFREG | 0o644, 0, 0)
    }

    #[test]
    fn path_boundaries() {
        let cases: [(u64, &[u64]); 9] = [
            (0, &[0]),
            (19, &[19]),
            (20, &[20, 0]),
            (20 + 511, &[20, 511]),
            (20 + 512, &[21, 0]),
            (20 + 16 * 512, &[36, 0, 0]),
            (20 + 16 * 512 + 512 * 512 + 513, &[37, 1, 1]),
            (20 + 16 * 512 + 4 * 512 * 512, &[40, 0, 0, 0]),
            (20 + 16 * 512 + 4 * 512 * 512 + 4 * 512 * 512 * 512, &[44, 0, 0, 0, 0]),
        ];
        for (logical, expected) in cases {
            let path = path_for(logical).expect("in range");
            assert_eq!(path.offsets(), expected, "logical {logical}");
            assert_eq!(path.depth(), slot_depth(path.slot()));
        }
        assert_eq!(path_for(MAX_FILE_BLOCKS - 1).expect("last").slot(), 44);
        assert!(matches!(
            path_for(MAX_FILE_BLOCKS),
            Err(PfsError::InvalidRange(_))
        ));
    }

    #[test]
    fn slot_depths() {
        assert_eq!(slot_depth(0), 1);
        assert_eq!(slot_depth(19), 1);
        assert_eq!(slot_depth(20), 2);
        assert_eq!(slot_depth(35), 2);
        assert_eq!(slot_depth(36), 3);
        assert_eq!(slot_depth(39), 3);
        assert_eq!(slot_depth(40), 4);
        assert_eq!(slot_depth(44), 5);
        assert_eq!(slot_depth(47), 5);
    }

    #[test]
    fn direct_block_allocates_once() {
        let (dev, alloc) = volume();
        let mut inode = file();
        assert_eq!(lookup(&dev, &inode, 3).expect("lookup"), None);

        let first = resolve(&dev, &alloc, &mut inode, 3, true)
            .expect("resolve")
            .expect("mapped");
        assert!(first.fresh);
        assert_eq!(inode.blocks(), 1);
        assert_eq!(inode.addr(3), first.block.0);

        let again = resolve(&dev, &alloc, &mut inode, 3, true)
            .expect("resolve")
            .expect("mapped");
        assert_eq!(again.block, first.block);
        assert!(!again.fresh);
        assert_eq!(inode.blocks(), 1);
        assert_eq!(lookup(&dev, &inode, 3).expect("lookup"), Some(first.block));
    }

    #[test]
    fn double_indirect_chain_counts_every_level() {
        let (dev, alloc) = volume();
        let mut inode = file();
        let logical = 20 + 16 * 512 + 700;
        let mapping = resolve(&dev, &alloc, &mut inode, logical, true)
            .expect("resolve")
            .expect("mapped");
        assert_eq!(inode.blocks(), 3);
        assert_eq!(lookup(&dev, &inode, logical).expect("lookup"), Some(mapping.block));

        // The sibling shares both indirection blocks.
        resolve(&dev, &alloc, &mut inode, logical + 1, true).expect("sibling");
        assert_eq!(inode.blocks(), 4);
        assert_eq!(lookup(&dev, &inode, logical + 512).expect("lookup"), None);
        assert_eq!(alloc.superblock().block_sectors_used, 8 + 4 * 8);
    }

    #[test]
    fn read_mode_never_allocates() {
        let (dev, alloc) = volume();
        let mut inode = file();
        let before = alloc.superblock();
        assert_eq!(resolve(&dev, &alloc, &mut inode, 5000, false).expect("resolve"), None);
        assert_eq!(alloc.superblock().block_sectors_used, before.block_sectors_used);
        assert_eq!(inode.blocks(), 0);
    }

    #[test]
    fn out_of_range_is_rejected_before_mutation() {
        let (dev, alloc) = volume();
        let mut inode = file();
        assert!(matches!(
            resolve(&dev, &alloc, &mut inode, MAX_FILE_BLOCKS, true),
            Err(PfsError::InvalidRange(_))
        ));
        assert_eq!(inode.blocks(), 0);
    }

    #[test]
    fn whole_release_returns_every_block() {
        let (dev, alloc) = volume();
        let mut inode = file();
        let logicals = [0, 7, 19, 20, 600, 20 + 16 * 512 + 3, 20 + 16 * 512 + 512 * 512];
        for logical in logicals {
            resolve(&dev, &alloc, &mut inode, logical, true).expect("resolve");
        }
        let used = alloc.superblock().block_sectors_used;
        assert_eq!(used, 8 + inode.blocks() * 8);

        release(&dev, &alloc, &mut inode, 0).expect("release");
        assert_eq!(inode.blocks(), 0);
        assert_eq!(alloc.superblock().block_sectors_used, 8);
        for logical in logicals {
            assert_eq!(lookup(&dev, &inode, logical).expect("lookup"), None);
        }
        assert!((0..ADDR_SLOTS).all(|slot| inode.addr(slot) == 0));
    }

    #[test]
    fn partial_release_keeps_blocks_before_the_boundary() {
        let (dev, alloc) = volume();
        let mut inode = file();
        for logical in 0..40 {
            resolve(&dev, &alloc, &mut inode, logical, true).expect("resolve");
        }
        // 40 data blocks plus one single-indirect block.
        assert_eq!(inode.blocks(), 41);

        truncate_blocks(&dev, &alloc, &mut inode, 25 * 4096 + 1).expect("truncate");
        assert_eq!(inode.size(), 25 * 4096 + 1);
        // Blocks 0..=25 survive, the indirection block still holds 20..=25.
        assert_eq!(inode.blocks(), 27);
        assert!(lookup(&dev, &inode, 25).expect("lookup").is_some());
        assert_eq!(lookup(&dev, &inode, 26).expect("lookup"), None);

        truncate_blocks(&dev, &alloc, &mut inode, 20 * 4096).expect("truncate");
        // Boundary at offset 0 of the indirection block frees it too.
        assert_eq!(inode.blocks(), 20);
        assert_eq!(inode.addr(20), 0);
    }

    #[test]
    fn released_block_is_reused_first() {
        let (dev, alloc) = volume();
        let mut inode = file();
        let mapping = resolve(&dev, &alloc, &mut inode, 0, true)
            .expect("resolve")
            .expect("mapped");
        release(&dev, &alloc, &mut inode, 0).expect("release");
        let again = resolve(&dev, &alloc, &mut inode, 0, true)
            .expect("resolve")
            .expect("mapped");
        assert_eq!(again.block, mapping.block);
        assert!(again.fresh);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn path_offsets_stay_within_bounds(logical in 0..MAX_FILE_BLOCKS) {
            let path = path_for(logical).expect("in range");
            prop_assert!(path.slot() < ADDR_SLOTS);
            prop_assert_eq!(path.depth(), slot_depth(path.slot()));
            for &offset in &path.offsets()[1..] {
                prop_assert!(offset < PTRS_PER_BLOCK);
            }
        }

        #[test]
        fn consecutive_indices_have_increasing_paths(logical in 0..MAX_FILE_BLOCKS - 1) {
            let a = path_for(logical).expect("a");
            let b = path_for(logical + 1).expect("b");
            prop_assert!(
                (a.slot(), a.offsets()) < (b.slot(), b.offsets()),
                "{:?} !< {:?}", a, b
            );
        }
    }
}
