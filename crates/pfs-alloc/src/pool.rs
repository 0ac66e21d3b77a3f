#![forbid(unsafe_code)]
//! Generic cache-plus-chained-batches free list.
//!
//! A pool keeps up to `batch_capacity` free resource numbers in the payload
//! of its head resource. Entry 0 of every batch links to the next batch; the
//! remaining entries form a stack. When only the link is left, the head is
//! handed out and the linked resource's payload becomes the new batch. An
//! inode pool that can no longer grow finally hands out the head itself.

use pfs_block::BlockDevice;
use pfs_error::{PfsError, Result};
use pfs_ondisk::{BLOCK_BATCH_CAPACITY, INODE_BATCH_CAPACITY};
use pfs_types::{BLOCK_SIZE, INODE_RECORD_SIZE, SectorNumber, read_le_u64, write_le_u64};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// The two resource classes a volume hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Block,
    Inode,
}

impl PoolKind {
    #[must_use]
    pub fn config(self) -> PoolConfig {
        match self {
            Self::Block => PoolConfig::BLOCK,
            Self::Inode => PoolConfig::INODE,
        }
    }
}

/// Shape of one pool's batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Payload bytes of one resource; a batch lives in this payload.
    pub record_size: usize,
    /// Entries per batch, link included.
    pub batch_capacity: usize,
    /// Amount added to the in-use counter per allocated resource.
    pub usage_step: u64,
}

impl PoolConfig {
    pub const BLOCK: Self = Self {
        record_size: BLOCK_SIZE,
        batch_capacity: BLOCK_BATCH_CAPACITY,
        usage_step: 8,
    };

    pub const INODE: Self = Self {
        record_size: INODE_RECORD_SIZE,
        batch_capacity: INODE_BATCH_CAPACITY,
        usage_step: 1,
    };

    /// Whether a resource's payload spans its whole device block.
    #[must_use]
    pub fn owns_block(&self) -> bool {
        self.record_size == BLOCK_SIZE
    }

    fn payload_range(&self, resource: SectorNumber) -> (usize, usize) {
        let start = if self.owns_block() {
            0
        } else {
            resource.byte_in_block()
        };
        (start, start + self.record_size)
    }
}

/// Read the batch stored in `holder`'s payload.
pub fn read_batch(
    dev: &dyn BlockDevice,
    config: PoolConfig,
    holder: SectorNumber,
) -> Result<Vec<u64>> {
    let block = holder.block();
    let buf = dev.read_block(block)?;
    let (start, _) = config.payload_range(holder);
    (0..config.batch_capacity)
        .map(|i| {
            read_le_u64(buf.as_slice(), start + i * 8)
                .map_err(|err| pfs_ondisk::parse_error_at(block, &err))
        })
        .collect()
}

/// Overwrite `holder`'s payload with `entries`, zero-padded to capacity.
pub fn write_batch(
    dev: &dyn BlockDevice,
    config: PoolConfig,
    holder: SectorNumber,
    entries: &[u64],
) -> Result<()> {
    if entries.len() > config.batch_capacity {
        return Err(PfsError::InvalidRange(format!(
            "batch of {} entries exceeds capacity {}",
            entries.len(),
            config.batch_capacity
        )));
    }
    let block = holder.block();
    let mut buf = if config.owns_block() {
        vec![0_u8; BLOCK_SIZE]
    } else {
        dev.read_block(block)?.into_inner()
    };
    let (start, end) = config.payload_range(holder);
    buf[start..end].fill(0);
    for (i, entry) in entries.iter().enumerate() {
        write_le_u64(&mut buf, start + i * 8, *entry)
            .map_err(|err| pfs_ondisk::parse_error_at(block, &err))?;
    }
    dev.write_block(block, &buf)
}

/// Zero the payload of `resource`.
pub fn clear_payload(
    dev: &dyn BlockDevice,
    config: PoolConfig,
    resource: SectorNumber,
) -> Result<()> {
    write_batch(dev, config, resource, &[])
}

/// In-memory view of one pool: the persisted head and cached count.
///
/// The batch itself is never held here; it is read from and written to the
/// head's payload through the block cache on every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FreePool {
    pub(crate) config: PoolConfig,
    pub(crate) head: SectorNumber,
    pub(crate) count: usize,
}

impl FreePool {
    pub(crate) fn new(config: PoolConfig, head: SectorNumber, count: usize) -> Self {
        Self {
            config,
            head,
            count,
        }
    }

    /// Pop one resource. `Ok(None)` when the cache is empty.
    pub(crate) fn take(&mut self, dev: &dyn BlockDevice) -> Result<Option<SectorNumber>> {
        match self.count {
            0 => Ok(None),
            1 => {
                let batch = read_batch(dev, self.config, self.head)?;
                let link = SectorNumber(batch[0]);
                if link.is_none() {
                    return Err(PfsError::corruption(
                        self.head.block().0,
                        "free pool link is zero with one cached entry",
                    ));
                }
                let next = read_batch(dev, self.config, link)?;
                let taken = self.head;
                if self.config.owns_block() {
                    dev.discard(taken.block());
                }
                self.head = link;
                self.count = next.iter().take_while(|entry| **entry != 0).count();
                debug!(
                    record_size = self.config.record_size,
                    taken = taken.0,
                    head = link.0,
                    count = self.count,
                    "free pool reloaded next batch"
                );
                Ok(Some(taken))
            }
            count => {
                let batch = read_batch(dev, self.config, self.head)?;
                let entry = batch[count - 1];
                if entry == 0 {
                    return Err(PfsError::corruption(
                        self.head.block().0,
                        format!("free pool entry {} is zero", count - 1),
                    ));
                }
                self.count = count - 1;
                trace!(resource = entry, count = self.count, "free pool pop");
                Ok(Some(SectorNumber(entry)))
            }
        }
    }

    /// Hand out the record holding an empty batch, leaving the pool with no
    /// head. `None` when the cache is not empty or the head is already gone.
    pub(crate) fn take_holder(&mut self) -> Option<SectorNumber> {
        if self.count != 0 || self.head.is_none() {
            return None;
        }
        let holder = self.head;
        self.head = SectorNumber(0);
        debug!(
            record_size = self.config.record_size,
            holder = holder.0,
            "free pool handed out its last holder"
        );
        Some(holder)
    }

    /// Push `resource` back. Mutates nothing unless every write succeeded.
    pub(crate) fn give(&mut self, dev: &dyn BlockDevice, resource: SectorNumber) -> Result<()> {
        if self.count == 0 {
            clear_payload(dev, self.config, resource)?;
            if self.head.is_none() {
                // The freed resource becomes the holder of an empty batch.
                self.head = resource;
                trace!(resource = resource.0, "free pool re-seeded its head");
                return Ok(());
            }
        }
        if self.count == self.config.batch_capacity {
            write_batch(dev, self.config, resource, &[self.head.0])?;
            debug!(
                record_size = self.config.record_size,
                head = resource.0,
                previous = self.head.0,
                "free pool started a new batch"
            );
            self.head = resource;
            self.count = 1;
            return Ok(());
        }
        let mut batch = read_batch(dev, self.config, self.head)?;
        batch[self.count] = resource.0;
        write_batch(dev, self.config, self.head, &batch)?;
        self.count += 1;
        trace!(resource = resource.0, count = self.count, "free pool push");
        Ok(())
    }

    /// Replace an empty cache with a freshly materialized batch.
    pub(crate) fn refill(&mut self, dev: &dyn BlockDevice, entries: &[u64]) -> Result<()> {
        write_batch(dev, self.config, self.head, entries)?;
        self.count = entries.len();
        Ok(())
    }
}

// ── Free-list layout ────────────────────────────────────────────────────────

/// Result of laying out a fresh block free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChainLayout {
    pub head: SectorNumber,
    /// Valid entries in the head batch, link included.
    pub head_count: usize,
    /// Batch blocks written, the terminating empty batch excluded.
    pub batches: u64,
    /// Data blocks listed across all batches.
    pub listed_blocks: u64,
}

/// Write a chain of block batches starting at `head`, listing every whole
/// block between the end of the chain and `end_sector`.
///
/// Batch blocks are consecutive; each links to the next, and an all-zero
/// batch closes the chain. A full batch lists its blocks from the top slot
/// down, so pops hand out low addresses first.
pub fn write_block_chain(
    dev: &dyn BlockDevice,
    head: SectorNumber,
    end_sector: u64,
) -> Result<BlockChainLayout> {
    if !head.is_block_aligned() || head.is_none() {
        return Err(PfsError::InvalidRange(format!(
            "block chain head {head} is not a block-aligned resource"
        )));
    }
    let config = PoolConfig::BLOCK;
    let step = config.usage_step;
    let per_batch = (config.batch_capacity - 1) as u64;
    let batches = end_sector.div_ceil(BLOCK_SIZE as u64);
    let terminator = head.0 + batches * step;
    if terminator + step > end_sector {
        return Err(PfsError::InvalidGeometry(format!(
            "free list of {batches} batches does not fit below sector {end_sector}"
        )));
    }

    let mut next_free = terminator + step;
    let mut listed_blocks = 0_u64;
    let mut head_count = 0_usize;
    for i in 0..batches {
        let at = SectorNumber(head.0 + i * step);
        let mut entries = vec![0_u64; config.batch_capacity];
        entries[0] = at.0 + step;
        if next_free + per_batch * step <= end_sector {
            for slot in (1..config.batch_capacity).rev() {
                entries[slot] = next_free;
                next_free += step;
            }
        } else {
            for slot in entries.iter_mut().skip(1) {
                if next_free + step > end_sector {
                    break;
                }
                *slot = next_free;
                next_free += step;
            }
        }
        let valid = entries.iter().take_while(|entry| **entry != 0).count();
        listed_blocks += (valid - 1) as u64;
        if i == 0 {
            head_count = valid;
        }
        write_batch(dev, config, at, &entries)?;
    }
    clear_payload(dev, config, SectorNumber(terminator))?;
    debug!(
        head = head.0,
        batches, listed_blocks, "laid out block free list"
    );
    Ok(BlockChainLayout {
        head,
        head_count,
        batches,
        listed_blocks,
    })
}
