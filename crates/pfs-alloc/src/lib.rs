#![forbid(unsafe_code)]
//! Block and inode-record allocation.
//!
//! Both resource classes use the same free list (see [`pool`]), shaped by a
//! [`PoolConfig`]: blocks keep 512-entry batches in whole blocks, inode
//! records keep 64-entry batches in single records. Pool heads and cached
//! counts live in the metadata record, which only this crate mutates.
//!
//! ## Locking
//!
//! [`Allocator`] is the per-volume context. Every pool mutation happens under
//! its mutex; callers that must link a fresh block into their own structures
//! before anyone else allocates take an [`AllocGuard`] with
//! [`Allocator::lock`] and hold it across both steps.
//!
//! ## Reserved numbers
//!
//! Resource number 0 terminates batches and chains, so it is never handed
//! out and `free(0)` is rejected.

pub mod pool;

pub use pool::{
    BlockChainLayout, PoolConfig, PoolKind, clear_payload, read_batch, write_batch,
    write_block_chain,
};

use parking_lot::{Mutex, MutexGuard};
use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{BootRecord, SUPERBLOCK_SIZE, Superblock};
use pfs_types::{
    BLOCK_SIZE, INODES_PER_BLOCK, InodeNumber, MAX_NAME_LEN, SECTORS_PER_BLOCK, SectorNumber,
    round_up, unix_now,
};
use pool::FreePool;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Metadata record I/O ─────────────────────────────────────────────────────

/// Read and validate the metadata record stored at `location`.
pub fn read_superblock(dev: &dyn BlockDevice, location: SectorNumber) -> Result<Superblock> {
    let buf = dev.read_block(location.block())?;
    let start = location.byte_in_block();
    let bytes = buf
        .as_slice()
        .get(start..start + SUPERBLOCK_SIZE)
        .ok_or_else(|| {
            PfsError::corruption(location.block().0, "metadata record crosses block end")
        })?;
    Superblock::parse(bytes).map_err(|err| pfs_ondisk::mount_error(&err))
}

/// Write `sb` into its sector, preserving the rest of the block.
pub fn write_superblock(
    dev: &dyn BlockDevice,
    location: SectorNumber,
    sb: &Superblock,
) -> Result<()> {
    let block = location.block();
    let mut buf = dev.read_block(block)?.into_inner();
    let start = location.byte_in_block();
    sb.write_to(&mut buf[start..])
        .map_err(|err| pfs_ondisk::parse_error_at(block, &err))?;
    dev.write_block(block, &buf)
}

// ── Initial layout ──────────────────────────────────────────────────────────

/// Resources a fresh allocator state reserves for the root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialLayout {
    pub root_inode: InodeNumber,
    /// First block of the root directory, already counted as in use.
    pub root_block: SectorNumber,
    pub block_chain: BlockChainLayout,
}

/// Lay out both pools and the metadata record for a volume of
/// `sector_count` sectors whose metadata record sits at `location`.
///
/// The block after the metadata record becomes the inode area: its first
/// record is the root inode, the second heads the inode pool with the other
/// six. The next block is reserved for the root directory and the block
/// free list starts right after it. Record and directory contents are left
/// to the caller.
pub fn initialize(
    dev: &dyn BlockDevice,
    location: SectorNumber,
    sector_count: u64,
    inode_limit: u64,
) -> Result<(Allocator, InitialLayout)> {
    let reserved_sectors = u16::try_from(location.0)
        .ok()
        .filter(|r| *r > 0)
        .ok_or_else(|| {
            PfsError::InvalidGeometry(format!(
                "metadata record sector {location} must be in 1..=65535"
            ))
        })?;
    if inode_limit < INODES_PER_BLOCK {
        return Err(PfsError::InvalidGeometry(format!(
            "inode limit {inode_limit} is below one block of records"
        )));
    }
    let root = round_up(location.0 + 1, SECTORS_PER_BLOCK);
    let root_block = SectorNumber(root + SECTORS_PER_BLOCK);
    let chain_head = SectorNumber(root + 2 * SECTORS_PER_BLOCK);
    if chain_head.0 >= sector_count {
        return Err(PfsError::InvalidGeometry(format!(
            "volume of {sector_count} sectors has no room after sector {location}"
        )));
    }

    let inode_head = SectorNumber(root + 1);
    let batch: Vec<u64> = (root + 2..root + INODES_PER_BLOCK).collect();
    write_batch(dev, PoolConfig::INODE, inode_head, &batch)?;
    clear_payload(dev, PoolConfig::INODE, SectorNumber(root + 2))?;
    let block_chain = write_block_chain(dev, chain_head, sector_count)?;

    let sb = Superblock {
        rev: BootRecord { reserved_sectors }.revision_word(),
        inode_free_count: batch.len() as u64,
        block_free_count: block_chain.head_count as u64,
        update_time: unix_now(),
        volume_sectors: sector_count,
        inodes_used: 1,
        inode_area_size: INODES_PER_BLOCK,
        block_sectors_used: SECTORS_PER_BLOCK,
        root_inode: InodeNumber(root),
        block_pool_head: block_chain.head,
        inode_pool_head: inode_head,
        inode_limit,
    };
    write_superblock(dev, location, &sb)?;
    debug!(
        root,
        chain_batches = block_chain.batches,
        listed_blocks = block_chain.listed_blocks,
        "initialized free pools"
    );

    let layout = InitialLayout {
        root_inode: InodeNumber(root),
        root_block,
        block_chain,
    };
    Ok((Allocator::new(sb, location)?, layout))
}

// ── Statistics ──────────────────────────────────────────────────────────────

/// statfs-style counters derived from the metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub name_max: u32,
}

/// Head and cached count of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub head: SectorNumber,
    pub cached: usize,
}

// ── Allocator ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct AllocState {
    sb: Superblock,
    blocks: FreePool,
    inodes: FreePool,
}

impl AllocState {
    fn pool_mut(&mut self, kind: PoolKind) -> &mut FreePool {
        match kind {
            PoolKind::Block => &mut self.blocks,
            PoolKind::Inode => &mut self.inodes,
        }
    }

    fn pool(&self, kind: PoolKind) -> &FreePool {
        match kind {
            PoolKind::Block => &self.blocks,
            PoolKind::Inode => &self.inodes,
        }
    }

    fn used_mut(&mut self, kind: PoolKind) -> &mut u64 {
        match kind {
            PoolKind::Block => &mut self.sb.block_sectors_used,
            PoolKind::Inode => &mut self.sb.inodes_used,
        }
    }
}

/// Per-volume allocation context.
#[derive(Debug)]
pub struct Allocator {
    location: SectorNumber,
    state: Mutex<AllocState>,
}

fn cached_count(value: u64, field: &str, location: SectorNumber) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        PfsError::corruption(
            location.block().0,
            format!("{field}={value} does not fit usize"),
        )
    })
}

impl Allocator {
    /// Load the metadata record at `location` and take ownership of its pools.
    pub fn open(dev: &dyn BlockDevice, location: SectorNumber) -> Result<Self> {
        let sb = read_superblock(dev, location)?;
        Self::new(sb, location)
    }

    pub fn new(sb: Superblock, location: SectorNumber) -> Result<Self> {
        let blocks = FreePool::new(
            PoolConfig::BLOCK,
            sb.block_pool_head,
            cached_count(sb.block_free_count, "block_free_count", location)?,
        );
        let inodes = FreePool::new(
            PoolConfig::INODE,
            sb.inode_pool_head,
            cached_count(sb.inode_free_count, "inode_free_count", location)?,
        );
        Ok(Self {
            location,
            state: Mutex::new(AllocState { sb, blocks, inodes }),
        })
    }

    /// Sector of the metadata record.
    #[must_use]
    pub fn location(&self) -> SectorNumber {
        self.location
    }

    /// Take the volume allocation lock.
    pub fn lock(&self) -> AllocGuard<'_> {
        AllocGuard {
            location: self.location,
            state: self.state.lock(),
        }
    }

    pub fn allocate(&self, dev: &dyn BlockDevice, kind: PoolKind) -> Result<SectorNumber> {
        self.lock().allocate(dev, kind)
    }

    /// Allocate a block and fill it with zeros.
    pub fn allocate_zeroed(&self, dev: &dyn BlockDevice) -> Result<SectorNumber> {
        self.lock().allocate_zeroed(dev)
    }

    pub fn free(&self, dev: &dyn BlockDevice, kind: PoolKind, resource: SectorNumber) -> Result<()> {
        self.lock().free(dev, kind, resource)
    }

    /// Snapshot of the in-memory metadata record.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.lock().superblock()
    }

    #[must_use]
    pub fn pool_status(&self, kind: PoolKind) -> PoolStatus {
        let guard = self.state.lock();
        let pool = guard.pool(kind);
        PoolStatus {
            head: pool.head,
            cached: pool.count,
        }
    }

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        let sb = self.superblock();
        VolumeStats {
            block_size: BLOCK_SIZE as u32,
            total_blocks: sb.total_blocks(self.location),
            free_blocks: sb.free_blocks(self.location),
            total_inodes: sb.inode_limit,
            free_inodes: sb.free_inodes(),
            name_max: MAX_NAME_LEN as u32,
        }
    }
}

/// Holder of the volume allocation lock.
pub struct AllocGuard<'a> {
    location: SectorNumber,
    state: MutexGuard<'a, AllocState>,
}

impl AllocGuard<'_> {
    /// Hand out one resource, or `NoSpace` when the pool is exhausted.
    pub fn allocate(&mut self, dev: &dyn BlockDevice, kind: PoolKind) -> Result<SectorNumber> {
        if kind == PoolKind::Inode && self.state.sb.inodes_used >= self.state.sb.inode_limit {
            warn!(
                used = self.state.sb.inodes_used,
                limit = self.state.sb.inode_limit,
                "inode limit reached"
            );
            return Err(PfsError::NoSpace);
        }

        let resource = match self.state.pool_mut(kind).take(dev)? {
            Some(resource) => resource,
            None if kind == PoolKind::Inode => self.take_grown_inode(dev)?,
            None => {
                warn!("block pool exhausted");
                return Err(PfsError::NoSpace);
            }
        };
        if resource.0 >= self.state.sb.volume_sectors {
            return Err(PfsError::corruption(
                self.state.pool(kind).head.block().0,
                format!(
                    "free pool handed out sector {resource} beyond volume end {}",
                    self.state.sb.volume_sectors
                ),
            ));
        }

        *self.state.used_mut(kind) += kind.config().usage_step;
        self.persist(dev)?;
        Ok(resource)
    }

    /// Allocate a block and fill it with zeros.
    pub fn allocate_zeroed(&mut self, dev: &dyn BlockDevice) -> Result<SectorNumber> {
        let resource = self.allocate(dev, PoolKind::Block)?;
        dev.write_block(resource.block(), &[0_u8; BLOCK_SIZE])?;
        Ok(resource)
    }

    /// Return `resource` to its pool.
    pub fn free(
        &mut self,
        dev: &dyn BlockDevice,
        kind: PoolKind,
        resource: SectorNumber,
    ) -> Result<()> {
        self.check_returnable(kind, resource)?;
        let step = kind.config().usage_step;
        let used = *self.state.used_mut(kind);
        if used < step {
            return Err(PfsError::corruption(
                self.location.block().0,
                format!("freeing {resource} with in-use counter {used}"),
            ));
        }

        self.state.pool_mut(kind).give(dev, resource)?;
        *self.state.used_mut(kind) = used - step;
        self.persist(dev)
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.state.sb.clone()
    }

    fn check_returnable(&self, kind: PoolKind, resource: SectorNumber) -> Result<()> {
        let reason = if resource.is_none() {
            Some("resource 0 is reserved")
        } else if resource.0 >= self.state.sb.volume_sectors {
            Some("beyond volume end")
        } else if kind == PoolKind::Block && !resource.is_block_aligned() {
            Some("block resource is not block aligned")
        } else if resource.block() <= self.location.block() {
            Some("inside the reserved area")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                warn!(?kind, resource = resource.0, reason, "rejected free");
                Err(PfsError::InvalidRange(format!(
                    "cannot free {kind:?} resource {resource}: {reason}"
                )))
            }
            None => Ok(()),
        }
    }

    /// Refill an empty inode cache by growing the area. Once the area has
    /// reached the limit, the record holding the empty batch is the last one
    /// left to hand out.
    fn take_grown_inode(&mut self, dev: &dyn BlockDevice) -> Result<SectorNumber> {
        let area = self.state.sb.inode_area_size;
        if area + INODES_PER_BLOCK > self.state.sb.inode_limit {
            return self.state.inodes.take_holder().ok_or_else(|| {
                warn!(
                    area,
                    limit = self.state.sb.inode_limit,
                    "inode area cannot grow"
                );
                PfsError::NoSpace
            });
        }
        self.grow_inode_area(dev)?;
        self.state.inodes.take(dev)?.ok_or_else(|| {
            PfsError::corruption(
                self.location.block().0,
                "inode pool empty right after growth",
            )
        })
    }

    /// Materialize one more block of inode records as the inode pool's batch.
    fn grow_inode_area(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        let area = self.state.sb.inode_area_size;
        if self.state.inodes.head.is_none() {
            return Err(PfsError::corruption(
                self.location.block().0,
                "inode pool has no head to hold a new batch",
            ));
        }

        let block = self.allocate(dev, PoolKind::Block)?;
        let entries: Vec<u64> = (0..INODES_PER_BLOCK).map(|i| block.0 + i).collect();
        // The first record becomes the next batch holder, so it must read
        // as an empty batch.
        let seeded = clear_payload(dev, PoolConfig::INODE, block)
            .and_then(|()| self.state.inodes.refill(dev, &entries));
        if let Err(err) = seeded {
            if let Err(undo) = self.free(dev, PoolKind::Block, block) {
                warn!(block = block.0, error = %undo, "could not return block after failed inode growth");
            }
            return Err(err);
        }

        self.state.sb.inode_area_size = area + INODES_PER_BLOCK;
        debug!(
            block = block.0,
            area = self.state.sb.inode_area_size,
            "grew inode area"
        );
        Ok(())
    }

    /// Copy pool state into the metadata record and mark its block dirty.
    fn persist(&mut self, dev: &dyn BlockDevice) -> Result<()> {
        let state = &mut *self.state;
        state.sb.block_free_count = state.blocks.count as u64;
        state.sb.block_pool_head = state.blocks.head;
        state.sb.inode_free_count = state.inodes.count as u64;
        state.sb.inode_pool_head = state.inodes.head;
        state.sb.update_time = unix_now();
        write_superblock(dev, self.location, &state.sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::{BlockBuf, ByteBlockDevice, MemoryByteDevice};
    use pfs_types::BlockNumber;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const BLOCKS: u64 = 64;
    const LOCATION: SectorNumber = SectorNumber(1);
    /// Data blocks listed by the fixture's single batch plus its holder.
    const BLOCK_POOL_SIZE: usize = 61;

    struct MemBlockDevice {
        blocks: StdMutex<HashMap<u64, Vec<u8>>>,
        fail_writes: AtomicBool,
    }

    impl MemBlockDevice {
        fn new() -> Self {
            Self {
                blocks: StdMutex::new(HashMap::new()),
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
            let blocks = self.blocks.lock().unwrap();
            Ok(BlockBuf::new(
                blocks
                    .get(&block.0)
                    .cloned()
                    .unwrap_or_else(|| vec![0_u8; BLOCK_SIZE]),
            ))
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PfsError::Io(std::io::Error::other("injected write failure")));
            }
            self.blocks.lock().unwrap().insert(block.0, data.to_vec());
            Ok(())
        }

        fn block_size(&self) -> u32 {
            4096
        }

        fn block_count(&self) -> u64 {
            BLOCKS
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    /// 64-block volume: metadata record in block 0, inode area in block 1
    /// (root at 8, pool head 9 holding 10..=15), block free list from 16.
    fn fixture(inode_limit: u64) -> (MemBlockDevice, Allocator) {
        let dev = MemBlockDevice::new();
        write_batch(&dev, PoolConfig::INODE, SectorNumber(9), &[10, 11, 12, 13, 14, 15])
            .expect("inode batch");
        let chain = write_block_chain(&dev, SectorNumber(16), BLOCKS * 8).expect("chain");
        assert_eq!(chain.head_count, BLOCK_POOL_SIZE);

        let sb = Superblock {
            rev: BootRecord {
                reserved_sectors: 1,
            }
            .revision_word(),
            inode_free_count: 6,
            block_free_count: chain.head_count as u64,
            update_time: 0,
            volume_sectors: BLOCKS * 8,
            inodes_used: 1,
            inode_area_size: 8,
            block_sectors_used: 0,
            root_inode: InodeNumber(8),
            block_pool_head: chain.head,
            inode_pool_head: SectorNumber(9),
            inode_limit,
        };
        write_superblock(&dev, LOCATION, &sb).expect("superblock");
        let alloc = Allocator::open(&dev, LOCATION).expect("open");
        (dev, alloc)
    }

    fn drain(dev: &MemBlockDevice, alloc: &Allocator, kind: PoolKind) -> Vec<SectorNumber> {
        let mut out = Vec::new();
        loop {
            match alloc.allocate(dev, kind) {
                Ok(resource) => out.push(resource),
                Err(PfsError::NoSpace) => return out,
                Err(err) => panic!("unexpected allocation error: {err}"),
            }
        }
    }

    #[test]
    fn block_pool_hands_out_distinct_blocks_until_exhausted() {
        let (dev, alloc) = fixture(64);
        let blocks = drain(&dev, &alloc, PoolKind::Block);
        assert_eq!(blocks.len(), BLOCK_POOL_SIZE);

        let unique: HashSet<_> = blocks.iter().copied().collect();
        assert_eq!(unique.len(), blocks.len());
        assert!(blocks.iter().all(|b| b.is_block_aligned() && !b.is_none()));
        // A partial batch pops from its top slot; the holder goes last.
        assert_eq!(blocks[0], SectorNumber(504));
        assert_eq!(*blocks.last().unwrap(), SectorNumber(16));

        let sb = alloc.superblock();
        assert_eq!(sb.block_sectors_used, 8 * BLOCK_POOL_SIZE as u64);
        assert_eq!(sb.block_free_count, 0);
        assert!(matches!(
            alloc.allocate(&dev, PoolKind::Block),
            Err(PfsError::NoSpace)
        ));
    }

    #[test]
    fn free_then_allocate_round_trips() {
        let (dev, alloc) = fixture(64);
        let first = alloc.allocate(&dev, PoolKind::Block).expect("alloc");
        let before = alloc.superblock();
        alloc.free(&dev, PoolKind::Block, first).expect("free");
        assert_eq!(
            alloc.superblock().block_sectors_used,
            before.block_sectors_used - 8
        );
        assert_eq!(alloc.allocate(&dev, PoolKind::Block).expect("again"), first);
    }

    #[test]
    fn freeing_into_an_empty_cache_clears_the_payload() {
        let (dev, alloc) = fixture(64);
        let blocks = drain(&dev, &alloc, PoolKind::Block);
        let victim = blocks[3];
        dev.write_block(victim.block(), &[0xAB; BLOCK_SIZE])
            .expect("dirty the block");

        alloc.free(&dev, PoolKind::Block, victim).expect("free");
        assert!(
            dev.read_block(victim.block())
                .expect("read")
                .as_slice()
                .iter()
                .all(|b| *b == 0)
        );
        // The freed block becomes the link, so the empty terminator batch is
        // handed out and the victim takes over as holder.
        assert_eq!(alloc.allocate(&dev, PoolKind::Block).expect("reuse"), SectorNumber(24));
        assert_eq!(
            alloc.pool_status(PoolKind::Block),
            PoolStatus {
                head: victim,
                cached: 0
            }
        );
        assert!(matches!(
            alloc.allocate(&dev, PoolKind::Block),
            Err(PfsError::NoSpace)
        ));
    }

    #[test]
    fn inode_pool_grows_one_block_at_a_time() {
        let (dev, alloc) = fixture(64);
        let first: Vec<_> = (0..6)
            .map(|_| alloc.allocate(&dev, PoolKind::Inode).expect("inode"))
            .collect();
        assert_eq!(
            first,
            [15, 14, 13, 12, 11, 9].map(SectorNumber).to_vec()
        );
        assert_eq!(alloc.superblock().inode_area_size, 8);

        let grown = alloc.allocate(&dev, PoolKind::Inode).expect("grown inode");
        let sb = alloc.superblock();
        assert_eq!(sb.inode_area_size, 16);
        assert_eq!(sb.block_sectors_used, 8);
        assert_eq!(sb.inodes_used, 8);
        assert_eq!(grown, SectorNumber(504 + 7));
        assert_eq!(alloc.pool_status(PoolKind::Inode).cached, 7);
    }

    #[test]
    fn inode_limit_bounds_the_inode_area() {
        let (dev, alloc) = fixture(16);
        let inodes = drain(&dev, &alloc, PoolKind::Inode);
        // Every record but the root's, the last holder included.
        assert_eq!(inodes.len(), 15);
        assert_eq!(*inodes.last().unwrap(), SectorNumber(504));
        let sb = alloc.superblock();
        assert_eq!(sb.inode_area_size, 16);
        assert_eq!(sb.inodes_used, sb.inode_limit);
        assert_eq!(alloc.stats().free_inodes, 0);
        assert_eq!(
            alloc.pool_status(PoolKind::Inode),
            PoolStatus {
                head: SectorNumber(0),
                cached: 0
            }
        );

        // A freed record re-seeds the headless pool and is the next handed out.
        alloc.free(&dev, PoolKind::Inode, inodes[3]).expect("free");
        assert_eq!(alloc.pool_status(PoolKind::Inode).head, inodes[3]);
        assert_eq!(alloc.allocate(&dev, PoolKind::Inode).expect("reuse"), inodes[3]);
        assert!(matches!(
            alloc.allocate(&dev, PoolKind::Inode),
            Err(PfsError::NoSpace)
        ));

        // A headless pool survives a reopen.
        let reopened = Allocator::open(&dev, LOCATION).expect("reopen");
        assert_eq!(reopened.superblock().inodes_used, 16);
    }

    #[test]
    fn full_inode_batch_spills_into_a_new_head() {
        let (dev, alloc) = fixture(256);
        let inodes: Vec<_> = (0..70)
            .map(|_| alloc.allocate(&dev, PoolKind::Inode).expect("inode"))
            .collect();
        let outstanding = alloc.superblock().inodes_used;
        for ino in &inodes {
            alloc.free(&dev, PoolKind::Inode, *ino).expect("free");
        }
        assert_eq!(alloc.superblock().inodes_used, outstanding - 70);

        // 64 frees fill the batch; the 65th starts a new one.
        assert_eq!(
            alloc.pool_status(PoolKind::Inode),
            PoolStatus {
                head: inodes[64],
                cached: 6
            }
        );

        let again: HashSet<_> = (0..70)
            .map(|_| alloc.allocate(&dev, PoolKind::Inode).expect("reuse"))
            .collect();
        assert_eq!(again.len(), 70);
        assert_eq!(alloc.superblock().inodes_used, outstanding);
        let freed: HashSet<_> = inodes.iter().copied().collect();
        // Only the record that took over as holder is swapped out.
        assert_eq!(again.difference(&freed).count(), 1);
    }

    #[test]
    fn reserved_and_misaligned_frees_are_rejected() {
        let (dev, alloc) = fixture(64);
        let before = alloc.superblock();
        for (kind, resource) in [
            (PoolKind::Block, SectorNumber(0)),
            (PoolKind::Block, SectorNumber(33)),
            (PoolKind::Block, SectorNumber(BLOCKS * 8)),
            (PoolKind::Inode, SectorNumber(0)),
            (PoolKind::Inode, SectorNumber(LOCATION.0)),
        ] {
            let err = alloc.free(&dev, kind, resource).unwrap_err();
            assert!(matches!(err, PfsError::InvalidRange(_)), "{kind:?} {resource}");
        }
        assert_eq!(alloc.superblock(), before);
    }

    #[test]
    fn metadata_record_is_persisted_on_every_mutation() {
        let (dev, alloc) = fixture(64);
        alloc.allocate(&dev, PoolKind::Block).expect("block");
        alloc.allocate(&dev, PoolKind::Inode).expect("inode");
        assert_eq!(read_superblock(&dev, LOCATION).expect("read"), alloc.superblock());

        let reopened = Allocator::open(&dev, LOCATION).expect("reopen");
        assert_eq!(
            reopened.pool_status(PoolKind::Block),
            alloc.pool_status(PoolKind::Block)
        );
    }

    #[test]
    fn failed_free_leaves_pool_untouched() {
        let (dev, alloc) = fixture(64);
        let block = alloc.allocate(&dev, PoolKind::Block).expect("alloc");
        let before = alloc.superblock();
        let status = alloc.pool_status(PoolKind::Block);

        dev.fail_writes.store(true, Ordering::SeqCst);
        let err = alloc.free(&dev, PoolKind::Block, block).unwrap_err();
        assert!(matches!(err, PfsError::Io(_)));
        assert_eq!(alloc.pool_status(PoolKind::Block), status);
        assert_eq!(alloc.superblock().block_sectors_used, before.block_sectors_used);

        dev.fail_writes.store(false, Ordering::SeqCst);
        alloc.free(&dev, PoolKind::Block, block).expect("free after recovery");
    }

    #[test]
    fn allocate_zeroed_clears_stale_content() {
        let (dev, alloc) = fixture(64);
        dev.write_block(BlockNumber(63), &[0x5A; BLOCK_SIZE]).expect("stale");
        let block = alloc.allocate_zeroed(&dev).expect("alloc");
        assert_eq!(block, SectorNumber(504));
        assert!(
            dev.read_block(block.block())
                .expect("read")
                .as_slice()
                .iter()
                .all(|b| *b == 0)
        );
    }

    #[test]
    fn stats_follow_allocations() {
        let (dev, alloc) = fixture(64);
        let before = alloc.stats();
        assert_eq!(before.total_blocks, (BLOCKS * 8 - 8) / 8);
        alloc.allocate(&dev, PoolKind::Block).expect("alloc");
        alloc.allocate(&dev, PoolKind::Inode).expect("alloc");
        let after = alloc.stats();
        assert_eq!(after.free_blocks, before.free_blocks - 1);
        assert_eq!(after.free_inodes, before.free_inodes - 1);
        assert_eq!(after.name_max, 255);
    }

    #[test]
    fn initialize_reserves_root_resources() {
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(256 * BLOCK_SIZE), 4096)
            .expect("device");
        let (alloc, layout) = initialize(&dev, SectorNumber(1), 256 * 8, 64).expect("init");
        assert_eq!(layout.root_inode, InodeNumber(8));
        assert_eq!(layout.root_block, SectorNumber(16));
        assert_eq!(layout.block_chain.head, SectorNumber(24));

        let sb = read_superblock(&dev, SectorNumber(1)).expect("superblock");
        assert_eq!(sb, alloc.superblock());
        assert_eq!(sb.inodes_used, 1);
        assert_eq!(sb.block_sectors_used, 8);
        assert_eq!(sb.inode_free_count, 6);
        assert_eq!(sb.rev.to_le_bytes(), [0xEB, 0x02, 0x01, 0x00]);

        let inodes = drain_any(&dev, &alloc, PoolKind::Inode, 6);
        assert_eq!(inodes, [15, 14, 13, 12, 11, 9].map(SectorNumber).to_vec());
        let blocks = drain_any(&dev, &alloc, PoolKind::Block, usize::MAX);
        assert!(!blocks.contains(&layout.root_block));
        assert!(blocks.iter().all(|b| b.0 >= layout.block_chain.head.0));
    }

    #[test]
    fn initialize_rejects_impossible_geometry() {
        let dev = MemBlockDevice::new();
        assert!(matches!(
            initialize(&dev, SectorNumber(0), 512, 64),
            Err(PfsError::InvalidGeometry(_))
        ));
        assert!(matches!(
            initialize(&dev, SectorNumber(70_000), 512, 64),
            Err(PfsError::InvalidGeometry(_))
        ));
        assert!(matches!(
            initialize(&dev, SectorNumber(1), 24, 64),
            Err(PfsError::InvalidGeometry(_))
        ));
    }

    /// Allocate up to `limit` resources, stopping early at exhaustion.
    fn drain_any(
        dev: &dyn BlockDevice,
        alloc: &Allocator,
        kind: PoolKind,
        limit: usize,
    ) -> Vec<SectorNumber> {
        let mut out = Vec::new();
        while out.len() < limit {
            match alloc.allocate(dev, kind) {
                Ok(resource) => out.push(resource),
                Err(PfsError::NoSpace) => break,
                Err(err) => panic!("unexpected allocation error: {err}"),
            }
        }
        out
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn block_pool_conserves_resources(ops in proptest::collection::vec(any::<bool>(), 1..150)) {
            let (dev, alloc) = fixture(64);
            let mut held: Vec<SectorNumber> = Vec::new();
            for allocate in ops {
                if allocate || held.is_empty() {
                    match alloc.allocate(&dev, PoolKind::Block) {
                        Ok(block) => {
                            prop_assert!(!held.contains(&block));
                            held.push(block);
                        }
                        Err(PfsError::NoSpace) => {}
                        Err(err) => panic!("allocation failed: {err}"),
                    }
                } else if let Some(block) = held.pop() {
                    alloc.free(&dev, PoolKind::Block, block).expect("free");
                }
            }
            prop_assert_eq!(
                alloc.superblock().block_sectors_used,
                8 * held.len() as u64
            );

            let rest = drain(&dev, &alloc, PoolKind::Block);
            prop_assert_eq!(held.len() + rest.len(), BLOCK_POOL_SIZE);
            let all: HashSet<_> = held.iter().chain(rest.iter()).copied().collect();
            prop_assert_eq!(all.len(), BLOCK_POOL_SIZE);
        }
    }
}
