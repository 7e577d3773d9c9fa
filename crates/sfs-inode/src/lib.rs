#![forbid(unsafe_code)]
//! Byte-level file I/O over inode records.
//!
//! An inode addresses its data through a pointer tree: at level 0 the 26
//! record slots point straight at data blocks; at level N each slot
//! points at a pointer block whose entries each cover `ppb^N` logical
//! blocks (ppb = pointers per block). Capacity at level N is
//! `26 * ppb^N` blocks. The tree deepens on demand when a write lands
//! past the current capacity.
//!
//! [`InodeIo`] borrows the block cache and the bitmap for the duration
//! of one operation; the inode record itself is passed in by the caller,
//! which owns the table.

use sfs_alloc::BlockBitmap;
use sfs_block::{BlockCache, BlockDevice};
use sfs_error::{FsError, Result};
use sfs_ondisk::{parse_ptr_block, serialize_ptr_block, Inode};
use sfs_types::{
    u64_to_u32, unix_now, BlockNumber, BlockSize, BLOCK_PTR_UNALLOCATED, NUM_BLOCK_PTRS,
};

/// Logical-block capacity of an inode at `level`.
#[must_use]
pub fn capacity_blocks(level: u8, ptrs_per_block: u32) -> u64 {
    u64::from(ptrs_per_block)
        .saturating_pow(u32::from(level))
        .saturating_mul(NUM_BLOCK_PTRS as u64)
}

/// Scoped I/O context over one volume's cache and bitmap.
pub struct InodeIo<'a, D: BlockDevice> {
    cache: &'a mut BlockCache<D>,
    bitmap: &'a mut BlockBitmap,
    block_size: BlockSize,
}

impl<'a, D: BlockDevice> InodeIo<'a, D> {
    pub fn new(
        cache: &'a mut BlockCache<D>,
        bitmap: &'a mut BlockBitmap,
        block_size: BlockSize,
    ) -> Self {
        Self {
            cache,
            bitmap,
            block_size,
        }
    }

    fn ppb(&self) -> u64 {
        u64::from(self.block_size.ptrs_per_block())
    }

    fn load_ptrs(&mut self, block: BlockNumber) -> Result<Vec<u32>> {
        let bytes = self.cache.get(block)?;
        parse_ptr_block(bytes, self.block_size)
            .map_err(|e| FsError::Format(format!("pointer block {block}: {e}")))
    }

    fn store_ptrs(&mut self, block: BlockNumber, ptrs: &[u32]) -> Result<()> {
        let bytes = self.cache.get_mut(block)?;
        serialize_ptr_block(ptrs, bytes)
            .map_err(|e| FsError::Format(format!("pointer block {block}: {e}")))
    }

    fn alloc_zeroed(&mut self) -> Result<BlockNumber> {
        let block = self.bitmap.allocate()?;
        self.cache
            .put(block, vec![0_u8; self.block_size.get() as usize])?;
        Ok(block)
    }

    /// Find the disk block backing logical block `logical`, without
    /// allocating. `None` means a hole (reads as zeros).
    pub fn lookup_block(&mut self, ino: &Inode, logical: u64) -> Result<Option<BlockNumber>> {
        let ppb = self.ppb();
        if logical >= capacity_blocks(ino.level, self.block_size.ptrs_per_block()) {
            return Ok(None);
        }

        let mut level = ino.level;
        let mut logical = logical;
        let mut ptrs: Vec<u32> = ino.block_ptrs.to_vec();
        loop {
            let fanout = ppb.saturating_pow(u32::from(level));
            let slot = (logical / fanout) as usize;
            let ptr = *ptrs.get(slot).ok_or_else(|| {
                FsError::OutOfRange(format!("pointer slot {slot} beyond array"))
            })?;
            if ptr == BLOCK_PTR_UNALLOCATED {
                return Ok(None);
            }
            if level == 0 {
                return Ok(Some(BlockNumber(ptr)));
            }
            logical %= fanout;
            level -= 1;
            ptrs = self.load_ptrs(BlockNumber(ptr))?;
        }
    }

    /// Find or allocate the disk block backing logical block `logical`,
    /// deepening the pointer tree first if `logical` is past capacity.
    fn resolve_or_alloc(&mut self, ino: &mut Inode, logical: u64) -> Result<BlockNumber> {
        while logical >= capacity_blocks(ino.level, self.block_size.ptrs_per_block()) {
            self.grow_level(ino)?;
        }

        let mut root: Vec<u32> = ino.block_ptrs.to_vec();
        let outcome = self.alloc_in(&mut root, ino.level, logical);
        // Copy the array back even on failure: a deeper allocation may
        // have linked fresh blocks into it before erroring, and every
        // allocated block must stay reachable from the record.
        for (slot, ptr) in ino.block_ptrs.iter_mut().zip(root.iter()) {
            *slot = *ptr;
        }
        Ok(outcome?.0)
    }

    fn alloc_in(&mut self, ptrs: &mut [u32], level: u8, logical: u64) -> Result<(BlockNumber, bool)> {
        if level == 0 {
            let slot = logical as usize;
            if slot >= ptrs.len() {
                return Err(FsError::OutOfRange(format!(
                    "logical block {logical} beyond level-0 capacity"
                )));
            }
            if ptrs[slot] == BLOCK_PTR_UNALLOCATED {
                let block = self.alloc_zeroed()?;
                ptrs[slot] = block.0;
                return Ok((block, true));
            }
            return Ok((BlockNumber(ptrs[slot]), false));
        }

        let fanout = self.ppb().saturating_pow(u32::from(level));
        let slot = (logical / fanout) as usize;
        let rem = logical % fanout;
        if slot >= ptrs.len() {
            return Err(FsError::OutOfRange(format!(
                "logical block {logical} beyond level-{level} capacity"
            )));
        }

        let mut changed_here = false;
        if ptrs[slot] == BLOCK_PTR_UNALLOCATED {
            // Fresh pointer block, all slots unallocated.
            let block = self.alloc_zeroed()?;
            ptrs[slot] = block.0;
            changed_here = true;
        }
        let child = BlockNumber(ptrs[slot]);

        let mut child_ptrs = self.load_ptrs(child)?;
        let outcome = self.alloc_in(&mut child_ptrs, level - 1, rem);
        let store_child = match &outcome {
            Ok((_, changed)) => *changed,
            // A failure deeper down may still have linked fresh blocks
            // into the child array; persist it so they stay reachable.
            Err(_) => true,
        };
        if store_child {
            self.store_ptrs(child, &child_ptrs)?;
        }
        let (block, _) = outcome?;
        Ok((block, changed_here))
    }

    /// Deepen the tree by one level: hoist the record's pointer array
    /// into a fresh pointer block and point slot 0 at it.
    fn grow_level(&mut self, ino: &mut Inode) -> Result<()> {
        let hoisted = self.alloc_zeroed()?;
        let mut ptrs = vec![0_u32; self.block_size.ptrs_per_block() as usize];
        ptrs[..NUM_BLOCK_PTRS].copy_from_slice(&ino.block_ptrs);
        self.store_ptrs(hoisted, &ptrs)?;

        ino.block_ptrs = [BLOCK_PTR_UNALLOCATED; NUM_BLOCK_PTRS];
        ino.block_ptrs[0] = hoisted.0;
        ino.level += 1;
        tracing::debug!(
            inode = ino.number.0,
            level = ino.level,
            "grew inode pointer tree"
        );
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at `offset`, clamped to the
    /// file length. Holes read as zeros. Never allocates.
    pub fn read_at(&mut self, ino: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = u64::from(ino.length);
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }
        let bs = u64::from(self.block_size.get());
        let end = (offset + buf.len() as u64).min(len);

        let mut pos = offset;
        while pos < end {
            let logical = pos / bs;
            let block_start = logical * bs;
            let in_block = (pos - block_start) as usize;
            let take = ((block_start + bs).min(end) - pos) as usize;
            let dst = &mut buf[(pos - offset) as usize..][..take];

            match self.lookup_block(ino, logical)? {
                Some(block) => {
                    let bytes = self.cache.get(block)?;
                    dst.copy_from_slice(&bytes[in_block..in_block + take]);
                }
                None => dst.fill(0),
            }
            pos += take as u64;
        }
        Ok((end - offset) as usize)
    }

    /// Write `buf` at `offset`, allocating blocks (and pointer levels)
    /// as needed. Extends the file length and stamps the mtime.
    pub fn write_at(&mut self, ino: &mut Inode, offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| FsError::OutOfRange("write range overflows u64".to_owned()))?;
        let new_length = u64_to_u32(end.max(u64::from(ino.length)), "length")
            .map_err(|_| FsError::OutOfRange("file length exceeds 32-bit limit".to_owned()))?;

        if let Err(error) = self.write_extent(ino, offset, end, buf) {
            // The length was never extended, so anything linked past it
            // came from this write; release it. Blocks filled in within
            // the old length stay linked and owned.
            self.release_past_length(ino)?;
            return Err(error);
        }

        ino.length = new_length;
        ino.mdate = unix_now();
        Ok(buf.len())
    }

    fn write_extent(&mut self, ino: &mut Inode, offset: u64, end: u64, buf: &[u8]) -> Result<()> {
        let bs = u64::from(self.block_size.get());
        let mut pos = offset;
        while pos < end {
            let logical = pos / bs;
            let block_start = logical * bs;
            let in_block = (pos - block_start) as usize;
            let take = ((block_start + bs).min(end) - pos) as usize;
            let src = &buf[(pos - offset) as usize..][..take];

            let block = self.resolve_or_alloc(ino, logical)?;
            let bytes = self.cache.get_mut(block)?;
            bytes[in_block..in_block + take].copy_from_slice(src);
            pos += take as u64;
        }
        Ok(())
    }

    /// Free every block linked past the file's current length,
    /// including pointer blocks left empty. The tree stays at its
    /// current level.
    fn release_past_length(&mut self, ino: &mut Inode) -> Result<()> {
        let keep = self.block_size.blocks_for_bytes(u64::from(ino.length));
        let mut root: Vec<u32> = ino.block_ptrs.to_vec();
        let outcome = self.reclaim(&mut root, ino.level, keep);
        // The array reflects exactly what was freed, even if the walk
        // stopped early; copy it back before surfacing any error.
        for (slot, ptr) in ino.block_ptrs.iter_mut().zip(root.iter()) {
            *slot = *ptr;
        }
        outcome.map(|_| ())
    }

    /// Set the file length. Shrinking reclaims every block wholly past
    /// the new length, including pointer blocks left empty; growing is
    /// lazy (the gap reads as zeros until written).
    pub fn truncate(&mut self, ino: &mut Inode, new_length: u32) -> Result<()> {
        if new_length < ino.length {
            let keep = self.block_size.blocks_for_bytes(u64::from(new_length));
            let mut root: Vec<u32> = ino.block_ptrs.to_vec();
            self.reclaim(&mut root, ino.level, keep)?;
            for (slot, ptr) in ino.block_ptrs.iter_mut().zip(root.iter()) {
                *slot = *ptr;
            }

            // Zero the tail of the last kept block so stale bytes never
            // resurface when the file grows again.
            let bs = u64::from(self.block_size.get());
            let tail = u64::from(new_length) % bs;
            if tail != 0 {
                let logical = u64::from(new_length) / bs;
                if let Some(block) = self.lookup_block(ino, logical)? {
                    let bytes = self.cache.get_mut(block)?;
                    bytes[tail as usize..].fill(0);
                }
            }
        }
        ino.length = new_length;
        ino.mdate = unix_now();
        Ok(())
    }

    /// Release every data and pointer block the inode owns.
    pub fn free_all_blocks(&mut self, ino: &mut Inode) -> Result<()> {
        self.truncate(ino, 0)?;
        // Level stays historical on shrink; reset for a clean record.
        ino.level = 0;
        Ok(())
    }

    /// Drop every subtree slot covering logical blocks `>= keep`.
    /// Returns whether any slot is still allocated afterwards.
    fn reclaim(&mut self, ptrs: &mut [u32], level: u8, keep: u64) -> Result<bool> {
        let fanout = self.ppb().saturating_pow(u32::from(level));
        let mut any_left = false;
        for (i, slot) in ptrs.iter_mut().enumerate() {
            if *slot == BLOCK_PTR_UNALLOCATED {
                continue;
            }
            let covers_from = i as u64 * fanout;
            if covers_from >= keep {
                self.free_subtree(BlockNumber(*slot), level)?;
                *slot = BLOCK_PTR_UNALLOCATED;
            } else if level > 0 && covers_from + fanout > keep {
                // Subtree straddles the boundary: recurse into it.
                let child = BlockNumber(*slot);
                let mut child_ptrs = self.load_ptrs(child)?;
                let child_left = self.reclaim(&mut child_ptrs, level - 1, keep - covers_from)?;
                if child_left {
                    self.store_ptrs(child, &child_ptrs)?;
                    any_left = true;
                } else {
                    self.bitmap.free(child)?;
                    self.cache.discard(child);
                    *slot = BLOCK_PTR_UNALLOCATED;
                }
            } else {
                any_left = true;
            }
        }
        Ok(any_left)
    }

    /// Free a whole subtree rooted at `block` (a data block at level 0,
    /// a pointer block otherwise).
    fn free_subtree(&mut self, block: BlockNumber, level: u8) -> Result<()> {
        if level > 0 {
            let ptrs = self.load_ptrs(block)?;
            for ptr in ptrs {
                if ptr != BLOCK_PTR_UNALLOCATED {
                    self.free_subtree(BlockNumber(ptr), level - 1)?;
                }
            }
        }
        self.bitmap.free(block)?;
        self.cache.discard(block);
        Ok(())
    }
}
