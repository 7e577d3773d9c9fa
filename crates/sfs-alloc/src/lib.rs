#![forbid(unsafe_code)]
//! Allocation state: the block bitmap and the inode table.
//!
//! Both structures live in memory for the lifetime of a mount and are
//! written back through the block cache on flush. The bitmap packs one
//! bit per block, MSB-first within each byte; the inode table keeps one
//! record per table block.

use sfs_block::{BlockCache, BlockDevice};
use sfs_error::{FsError, Result};
use sfs_ondisk::{Inode, InodeKind, Superblock};
use sfs_types::{BlockNumber, InodeNumber, INODE_RECORD_SIZE};

// ── bitmap byte helpers (MSB-first) ────────────────────────────────────────

#[inline]
fn bit_position(index: u32) -> (usize, u8) {
    ((index / 8) as usize, 0x80 >> (index % 8))
}

#[must_use]
pub fn bitmap_get(bitmap: &[u8], index: u32) -> bool {
    let (byte, mask) = bit_position(index);
    byte < bitmap.len() && (bitmap[byte] & mask) != 0
}

pub fn bitmap_set(bitmap: &mut [u8], index: u32) {
    let (byte, mask) = bit_position(index);
    if byte < bitmap.len() {
        bitmap[byte] |= mask;
    }
}

pub fn bitmap_clear(bitmap: &mut [u8], index: u32) {
    let (byte, mask) = bit_position(index);
    if byte < bitmap.len() {
        bitmap[byte] &= !mask;
    }
}

/// In-memory block bitmap with first-fit allocation.
#[derive(Debug, Clone)]
pub struct BlockBitmap {
    bits: Vec<u8>,
    block_count: u32,
    first_data_block: u32,
}

impl BlockBitmap {
    /// Bitmap for a fresh volume: metadata blocks (superblock, bitmap
    /// region, inode table) marked allocated, everything else free.
    #[must_use]
    pub fn new_for_volume(sb: &Superblock) -> Self {
        let bytes = (u64::from(sb.block_count).div_ceil(8)) as usize;
        let mut map = Self {
            bits: vec![0_u8; bytes],
            block_count: sb.block_count,
            first_data_block: sb.first_data_block(),
        };
        for block in 0..sb.first_data_block() {
            bitmap_set(&mut map.bits, block);
        }
        map
    }

    /// Load the bitmap region from a mounted volume.
    pub fn load_from<D: BlockDevice>(
        cache: &mut BlockCache<D>,
        sb: &Superblock,
    ) -> Result<Self> {
        let needed = (u64::from(sb.block_count).div_ceil(8)) as usize;
        let block_size = sb.block_size.get() as usize;
        let region_len = sb.bitmap_blocks() as usize * block_size;
        if region_len < needed {
            return Err(FsError::Format(format!(
                "bitmap region too small: {region_len} bytes for {needed} needed"
            )));
        }

        let mut bits = Vec::with_capacity(needed);
        for i in 0..sb.bitmap_blocks() {
            let block = cache.get(BlockNumber(sb.bitmap_address + i))?;
            let take = block.len().min(needed - bits.len());
            bits.extend_from_slice(&block[..take]);
            if bits.len() == needed {
                break;
            }
        }

        Ok(Self {
            bits,
            block_count: sb.block_count,
            first_data_block: sb.first_data_block(),
        })
    }

    /// Write the bitmap back into its region through the cache.
    pub fn flush_to<D: BlockDevice>(
        &self,
        cache: &mut BlockCache<D>,
        sb: &Superblock,
    ) -> Result<()> {
        let block_size = sb.block_size.get() as usize;
        for i in 0..sb.bitmap_blocks() {
            let start = i as usize * block_size;
            if start >= self.bits.len() {
                break;
            }
            let end = (start + block_size).min(self.bits.len());
            let block = cache.get_mut(BlockNumber(sb.bitmap_address + i))?;
            block[..end - start].copy_from_slice(&self.bits[start..end]);
        }
        Ok(())
    }

    /// Allocate the lowest-numbered free block.
    pub fn allocate(&mut self) -> Result<BlockNumber> {
        for block in self.first_data_block..self.block_count {
            if !bitmap_get(&self.bits, block) {
                bitmap_set(&mut self.bits, block);
                tracing::trace!(block, "allocated block");
                return Ok(BlockNumber(block));
            }
        }
        Err(FsError::NoSpace)
    }

    /// Release a previously allocated data block.
    pub fn free(&mut self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.block_count {
            return Err(FsError::OutOfRange(format!(
                "block {block} beyond block count {}",
                self.block_count
            )));
        }
        if block.0 < self.first_data_block {
            return Err(FsError::InvalidArgument(format!(
                "block {block} is a metadata block"
            )));
        }
        if !bitmap_get(&self.bits, block.0) {
            return Err(FsError::InvalidArgument(format!(
                "block {block} is already free"
            )));
        }
        bitmap_clear(&mut self.bits, block.0);
        tracing::trace!(block = block.0, "freed block");
        Ok(())
    }

    pub fn is_allocated(&self, block: BlockNumber) -> Result<bool> {
        if block.0 >= self.block_count {
            return Err(FsError::OutOfRange(format!(
                "block {block} beyond block count {}",
                self.block_count
            )));
        }
        Ok(bitmap_get(&self.bits, block.0))
    }

    #[must_use]
    pub fn count_free(&self) -> u32 {
        (self.first_data_block..self.block_count)
            .filter(|b| !bitmap_get(&self.bits, *b))
            .count() as u32
    }

    /// Render the map as text: `1`/`0` per block, `|` every 8, newline
    /// every 64.
    #[must_use]
    pub fn render_map(&self) -> String {
        render_grid(self.block_count as usize, |i| {
            if bitmap_get(&self.bits, i as u32) {
                '1'
            } else {
                '0'
            }
        })
    }
}

/// In-memory inode table, one record per table block.
#[derive(Debug, Clone)]
pub struct InodeTable {
    inodes: Vec<Inode>,
}

impl InodeTable {
    /// Table for a fresh volume: every record free except the root
    /// directory at inode 0.
    #[must_use]
    pub fn new_for_volume(sb: &Superblock, now: u32) -> Self {
        let mut inodes: Vec<Inode> = (0..sb.inode_count)
            .map(|n| Inode::free(InodeNumber(n)))
            .collect();
        if let Some(root) = inodes.first_mut() {
            *root = Inode::fresh(InodeNumber::ROOT, InodeKind::Directory, now);
        }
        Self { inodes }
    }

    /// Load the table region from a mounted volume.
    pub fn load_from<D: BlockDevice>(
        cache: &mut BlockCache<D>,
        sb: &Superblock,
    ) -> Result<Self> {
        let mut inodes = Vec::with_capacity(usize::from(sb.inode_count));
        for n in 0..sb.inode_count {
            let block = cache.get(Inode::table_block(sb, InodeNumber(n)))?;
            let ino = Inode::parse(block)
                .map_err(|e| FsError::Format(format!("inode {n}: {e}")))?;
            inodes.push(ino);
        }
        Ok(Self { inodes })
    }

    /// Write every record back into its table block through the cache.
    pub fn flush_to<D: BlockDevice>(
        &self,
        cache: &mut BlockCache<D>,
        sb: &Superblock,
    ) -> Result<()> {
        for ino in &self.inodes {
            let block = cache.get_mut(Inode::table_block(sb, ino.number))?;
            ino.serialize_into(block)
                .map_err(|e| FsError::Format(format!("inode {}: {e}", ino.number)))?;
            // One record per block; the tail stays zero.
            block[INODE_RECORD_SIZE..].fill(0);
        }
        Ok(())
    }

    /// Allocate the lowest-numbered free inode, fully reinitialized.
    pub fn allocate(&mut self, kind: InodeKind, now: u32) -> Result<InodeNumber> {
        if kind == InodeKind::Free {
            return Err(FsError::InvalidArgument(
                "cannot allocate a free inode".to_owned(),
            ));
        }
        for ino in &mut self.inodes {
            if ino.kind == InodeKind::Free {
                let number = ino.number;
                *ino = Inode::fresh(number, kind, now);
                tracing::trace!(inode = number.0, ?kind, "allocated inode");
                return Ok(number);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Release an inode, resetting its record to the free state.
    ///
    /// Block reclamation is the caller's job; this only flips the table
    /// entry.
    pub fn free(&mut self, number: InodeNumber) -> Result<()> {
        let ino = self.get_mut(number)?;
        if ino.kind == InodeKind::Free {
            return Err(FsError::InvalidArgument(format!(
                "inode {number} is already free"
            )));
        }
        *ino = Inode::free(number);
        tracing::trace!(inode = number.0, "freed inode");
        Ok(())
    }

    pub fn get(&self, number: InodeNumber) -> Result<&Inode> {
        self.inodes.get(usize::from(number.0)).ok_or_else(|| {
            FsError::OutOfRange(format!(
                "inode {number} beyond inode count {}",
                self.inodes.len()
            ))
        })
    }

    pub fn get_mut(&mut self, number: InodeNumber) -> Result<&mut Inode> {
        let count = self.inodes.len();
        self.inodes.get_mut(usize::from(number.0)).ok_or_else(|| {
            FsError::OutOfRange(format!("inode {number} beyond inode count {count}"))
        })
    }

    #[must_use]
    pub fn count_free(&self) -> usize {
        self.inodes
            .iter()
            .filter(|i| i.kind == InodeKind::Free)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Render the table as text: one kind tag per inode, `|` every 8,
    /// newline every 64.
    #[must_use]
    pub fn render_map(&self) -> String {
        render_grid(self.inodes.len(), |i| self.inodes[i].kind.tag() as char)
    }
}

fn render_grid(count: usize, cell: impl Fn(usize) -> char) -> String {
    let mut out = String::with_capacity(count + count / 8 + count / 64 + 1);
    for i in 0..count {
        out.push(cell(i));
        if (i + 1) % 8 == 0 {
            out.push('|');
        }
        if (i + 1) % 64 == 0 {
            out.push('\n');
        }
    }
    out
}
