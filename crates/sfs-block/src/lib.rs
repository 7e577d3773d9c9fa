#![forbid(unsafe_code)]
//! Block I/O layer with a write-back cache.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed
//! device using fixed-offset I/O, and [`BlockCache`], which holds every
//! touched block in memory and defers device writes until flush.
//!
//! All access is single-threaded; the mutable-reference discipline of
//! [`BlockCache`] replaces locking.

use sfs_error::{FsError, Result};
use sfs_types::{BlockNumber, SUPERBLOCK_RECORD_SIZE};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
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

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, so no shared seek position is
/// involved.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Create (or truncate) an image of exactly `len` bytes, zero-filled.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self { file, len })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| FsError::Format("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| FsError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(FsError::OutOfRange(format!(
                "read out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| FsError::Format("write length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| FsError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(FsError::OutOfRange(format!(
                "write out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u32;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing a [`ByteDevice`] as a [`BlockDevice`] with a fixed
/// block geometry.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u32,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(FsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = u32::try_from(len / block_size_u64)
            .map_err(|_| FsError::Format("block count does not fit u32".to_owned()))?;
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
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(FsError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = u64::from(block.0) * u64::from(self.block_size);
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_size as usize;
        if data.len() != expected {
            return Err(FsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(FsError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = u64::from(block.0) * u64::from(self.block_size);
        self.inner.write_all_at(offset, data)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Read the superblock record region (25 bytes at offset 0).
///
/// Images are self-describing: this runs before the block geometry is
/// known, so it goes through the byte device directly.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; SUPERBLOCK_RECORD_SIZE]> {
    let mut buf = [0_u8; SUPERBLOCK_RECORD_SIZE];
    dev.read_exact_at(0, &mut buf)?;
    Ok(buf)
}

/// In-memory block device backed by a zero-filled buffer.
///
/// Used by tests and anywhere a throwaway volume is handy. Interior
/// mutability keeps the [`BlockDevice`] methods on `&self`; access is
/// single-threaded.
#[derive(Debug)]
pub struct MemBlockDevice {
    bytes: std::cell::RefCell<Vec<u8>>,
    block_size: u32,
    block_count: u32,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, block_count: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FsError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let len = u64::from(block_size) * u64::from(block_count);
        let len = usize::try_from(len)
            .map_err(|_| FsError::Format("volume does not fit memory".to_owned()))?;
        Ok(Self {
            bytes: std::cell::RefCell::new(vec![0_u8; len]),
            block_size,
            block_count,
        })
    }

    fn range(&self, block: BlockNumber) -> Result<std::ops::Range<usize>> {
        if block.0 >= self.block_count {
            return Err(FsError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let start = block.0 as usize * self.block_size as usize;
        Ok(start..start + self.block_size as usize)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let range = self.range(block)?;
        Ok(BlockBuf::new(self.bytes.borrow()[range].to_vec()))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(FsError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let range = self.range(block)?;
        self.bytes.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct CacheEntry {
    bytes: Vec<u8>,
    dirty: bool,
}

/// Write-back block cache.
///
/// Every block touched since mount stays resident; nothing is evicted.
/// Reads hit the cache first and fault in from the device on miss.
/// Writes only mark entries dirty; the device sees them at [`flush`].
///
/// [`flush`]: BlockCache::flush
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    dev: D,
    entries: HashMap<BlockNumber, CacheEntry>,
}

impl<D: BlockDevice> BlockCache<D> {
    #[must_use]
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.dev.block_count()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }

    fn fault_in(&mut self, block: BlockNumber) -> Result<()> {
        if !self.entries.contains_key(&block) {
            let buf = self.dev.read_block(block)?;
            self.entries.insert(
                block,
                CacheEntry {
                    bytes: buf.into_inner(),
                    dirty: false,
                },
            );
        }
        Ok(())
    }

    /// Borrow a block's contents, faulting it in from the device if needed.
    pub fn get(&mut self, block: BlockNumber) -> Result<&[u8]> {
        self.fault_in(block)?;
        Ok(&self.entries[&block].bytes)
    }

    /// Mutably borrow a block's contents and mark it dirty.
    pub fn get_mut(&mut self, block: BlockNumber) -> Result<&mut Vec<u8>> {
        self.fault_in(block)?;
        let entry = self
            .entries
            .get_mut(&block)
            .ok_or_else(|| FsError::Format(format!("cache entry vanished for block {block}")))?;
        entry.dirty = true;
        Ok(&mut entry.bytes)
    }

    /// Install a full block image without reading the device first.
    ///
    /// Used for freshly allocated blocks, which have no meaningful prior
    /// contents.
    pub fn put(&mut self, block: BlockNumber, bytes: Vec<u8>) -> Result<()> {
        let expected = self.dev.block_size() as usize;
        if bytes.len() != expected {
            return Err(FsError::Format(format!(
                "cache put size mismatch: got={} expected={expected}",
                bytes.len()
            )));
        }
        if block.0 >= self.dev.block_count() {
            return Err(FsError::OutOfRange(format!(
                "block out of range: block={} block_count={}",
                block.0,
                self.dev.block_count()
            )));
        }
        self.entries.insert(block, CacheEntry { bytes, dirty: true });
        Ok(())
    }

    /// Drop a cached block without writing it back.
    ///
    /// Used when a block is freed: its contents must never reach the
    /// device after the bitmap releases it.
    pub fn discard(&mut self, block: BlockNumber) {
        let _ = self.entries.remove(&block);
    }

    /// Write every dirty block to the device in ascending block order,
    /// then sync the device. Entries stay resident, now clean.
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<BlockNumber> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(b, _)| *b)
            .collect();
        dirty.sort_unstable();

        tracing::debug!(dirty_blocks = dirty.len(), "flushing block cache");
        for block in dirty {
            if let Some(entry) = self.entries.get_mut(&block) {
                self.dev.write_block(block, &entry.bytes)?;
                entry.dirty = false;
            }
        }
        self.dev.sync()?;
        Ok(())
    }
}
