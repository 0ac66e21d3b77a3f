#![forbid(unsafe_code)]
//! Block I/O layer with a write-back buffer cache.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed and an
//! in-memory byte device, the `ByteBlockDevice` adapter, and `BufferCache`,
//! which serves the three calls the filesystem core relies on: read a block,
//! mark a block dirty (`write_block`), and forget a block (`discard`).

use parking_lot::Mutex;
use pfs_error::{PfsError, Result};
use pfs_types::{BlockNumber, SECTOR_SIZE, SectorNumber};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
/// Dropping the buffer is the "release reference" operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: u64, len: usize, limit: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| PfsError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| PfsError::Format(format!("{op} range overflows u64")))?;
    if end > limit {
        return Err(PfsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={limit}"
        )));
    }
    Ok(())
}

/// File-backed byte device using positioned reads and writes.
///
/// Uses `std::os::unix::fs::FileExt`, so concurrent users do not share a
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PfsError::PermissionDenied);
        }
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Heap-backed byte device for tests and scratch images.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        checked_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "read")?;
        let start =
            usize::try_from(offset).map_err(|_| PfsError::Format("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        checked_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0), "write")?;
        let start =
            usize::try_from(offset).map_err(|_| PfsError::Format("offset overflow".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: ByteDevice + ?Sized> ByteDevice for Arc<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Read one 512-byte sector.
pub fn read_sector(dev: &dyn ByteDevice, sector: SectorNumber) -> Result<[u8; SECTOR_SIZE]> {
    let mut buf = [0_u8; SECTOR_SIZE];
    let offset = sector
        .0
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or_else(|| PfsError::Format("sector offset overflow".to_owned()))?;
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

// ── Block devices ───────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    ///
    /// On a caching device this only marks the block dirty.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Drop any cached copy of `block` without writing it back.
    ///
    /// Used when the block's content is about to be superseded wholesale.
    /// Uncached devices have nothing to drop.
    fn discard(&self, _block: BlockNumber) {}

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn discard(&self, block: BlockNumber) {
        (**self).discard(block);
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Wrap `inner` as a block device. A trailing partial block is ignored.
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(PfsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(PfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| PfsError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                PfsError::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| PfsError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(PfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.block_offset(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of clean blocks kept resident. Dirty blocks are never
    /// evicted; they leave the cache only through `flush` or `discard`.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub dirty: usize,
    pub resident: usize,
}

#[derive(Debug)]
struct Slot {
    bytes: Vec<u8>,
    /// Sequence number of the most recent write; `None` when clean.
    dirty_seq: Option<u64>,
    /// Stamp of the most recent clean touch. Queue entries carrying an
    /// older stamp are stale.
    touched: u64,
}

/// Queue entries allowed per clean block before stale ones are dropped.
const STALE_QUEUE_FACTOR: usize = 2;

#[derive(Debug, Default)]
struct CacheState {
    slots: HashMap<BlockNumber, Slot>,
    /// Clean-touch stamps, oldest first. A block may appear more than once;
    /// only the entry matching its slot's stamp counts.
    clean_lru: VecDeque<(u64, BlockNumber)>,
    clean: usize,
    next_seq: u64,
    next_touch: u64,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn stamp(&mut self) -> u64 {
        self.next_touch += 1;
        self.next_touch
    }

    fn is_live(&self, stamp: u64, block: BlockNumber) -> bool {
        self.slots
            .get(&block)
            .is_some_and(|slot| slot.dirty_seq.is_none() && slot.touched == stamp)
    }

    fn insert_clean(&mut self, block: BlockNumber, bytes: Vec<u8>) {
        let touched = self.stamp();
        let previous = self.slots.insert(
            block,
            Slot {
                bytes,
                dirty_seq: None,
                touched,
            },
        );
        if !previous.is_some_and(|slot| slot.dirty_seq.is_none()) {
            self.clean += 1;
        }
        self.push_touch(touched, block);
    }

    fn insert_dirty(&mut self, block: BlockNumber, bytes: Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let previous = self.slots.insert(
            block,
            Slot {
                bytes,
                dirty_seq: Some(seq),
                touched: 0,
            },
        );
        if previous.is_some_and(|slot| slot.dirty_seq.is_none()) {
            self.clean -= 1;
        }
    }

    /// Move a clean block to the most-recently-used end.
    fn touch_clean(&mut self, block: BlockNumber) {
        let touched = self.stamp();
        match self.slots.get_mut(&block) {
            Some(slot) if slot.dirty_seq.is_none() => slot.touched = touched,
            _ => return,
        }
        self.push_touch(touched, block);
    }

    /// Mark `block` clean if it was last dirtied by write `seq`.
    fn mark_clean(&mut self, block: BlockNumber, seq: u64) {
        let touched = self.stamp();
        match self.slots.get_mut(&block) {
            Some(slot) if slot.dirty_seq == Some(seq) => {
                slot.dirty_seq = None;
                slot.touched = touched;
            }
            _ => return,
        }
        self.clean += 1;
        self.push_touch(touched, block);
    }

    fn remove(&mut self, block: BlockNumber) -> bool {
        match self.slots.remove(&block) {
            Some(slot) => {
                if slot.dirty_seq.is_none() {
                    self.clean -= 1;
                }
                true
            }
            None => false,
        }
    }

    fn push_touch(&mut self, stamp: u64, block: BlockNumber) {
        self.clean_lru.push_back((stamp, block));
        if self.clean_lru.len() > STALE_QUEUE_FACTOR * self.clean + 16 {
            let slots = &self.slots;
            self.clean_lru.retain(|(stamp, block)| {
                slots
                    .get(block)
                    .is_some_and(|slot| slot.dirty_seq.is_none() && slot.touched == *stamp)
            });
        }
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.clean > capacity {
            let Some((stamp, victim)) = self.clean_lru.pop_front() else {
                break;
            };
            if self.is_live(stamp, victim) {
                self.remove(victim);
            }
        }
    }

    fn dirty_in_order(&self) -> Vec<(u64, BlockNumber)> {
        let mut dirty: Vec<(u64, BlockNumber)> = self
            .slots
            .iter()
            .filter_map(|(block, slot)| slot.dirty_seq.map(|seq| (seq, *block)))
            .collect();
        dirty.sort_unstable();
        dirty
    }
}

/// Write-back block cache.
///
/// Reads are served from resident copies; `write_block` replaces the
/// resident copy and marks it dirty; `flush` writes dirty blocks back in the
/// order they were last dirtied, so a header updated after its data blocks
/// reaches the device after them.
#[derive(Debug)]
pub struct BufferCache<D: BlockDevice> {
    inner: D,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(inner: D, config: CacheConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(PfsError::Format(
                "BufferCache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            config,
            state: Mutex::new(CacheState::default()),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        CacheStats {
            hits: guard.hits,
            misses: guard.misses,
            dirty: guard
                .slots
                .values()
                .filter(|slot| slot.dirty_seq.is_some())
                .count(),
            resident: guard.slots.len(),
        }
    }

    #[must_use]
    pub fn is_dirty(&self, block: BlockNumber) -> bool {
        self.state
            .lock()
            .slots
            .get(&block)
            .is_some_and(|slot| slot.dirty_seq.is_some())
    }

    /// Write every dirty block back to the inner device.
    ///
    /// A block whose write fails stays dirty and the error is returned.
    pub fn flush(&self) -> Result<()> {
        let dirty = self.state.lock().dirty_in_order();
        if dirty.is_empty() {
            return Ok(());
        }
        debug!(count = dirty.len(), "flushing dirty blocks");
        for (seq, block) in dirty {
            let bytes = {
                let guard = self.state.lock();
                match guard.slots.get(&block) {
                    Some(slot) if slot.dirty_seq == Some(seq) => slot.bytes.clone(),
                    _ => continue,
                }
            };
            self.inner.write_block(block, &bytes)?;
            // A concurrent writer may have re-dirtied the block meanwhile.
            self.state.lock().mark_clean(block, seq);
        }
        let mut guard = self.state.lock();
        let capacity = self.config.capacity;
        guard.evict_to(capacity);
        drop(guard);
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for BufferCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.slots.get(&block).map(|slot| slot.bytes.clone()) {
                guard.hits += 1;
                guard.touch_clean(block);
                drop(guard);
                trace!(block = block.0, "cache hit");
                return Ok(BlockBuf::new(bytes));
            }
            guard.misses += 1;
        }

        let buf = self.inner.read_block(block)?;

        let mut guard = self.state.lock();
        if !guard.slots.contains_key(&block) {
            guard.insert_clean(block, buf.as_slice().to_vec());
            let capacity = self.config.capacity;
            guard.evict_to(capacity);
        }
        drop(guard);
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.inner.block_size())
            .map_err(|_| PfsError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(PfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.inner.block_count() {
            return Err(PfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0,
                self.inner.block_count()
            )));
        }
        self.state.lock().insert_dirty(block, data.to_vec());
        Ok(())
    }

    fn discard(&self, block: BlockNumber) {
        if self.state.lock().remove(block) {
            trace!(block = block.0, "discarded cached block");
        }
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.flush()?;
        self.inner.sync()
    }
}
