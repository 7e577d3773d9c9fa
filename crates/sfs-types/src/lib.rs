#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

/// Superblock record occupies the first bytes of block 0.
pub const SUPERBLOCK_RECORD_SIZE: usize = 25;
pub const SUPERBLOCK_MAGIC: u32 = 0x7001_54ED;

/// Inode record size: 22-byte fixed header plus 26 pointer slots.
pub const INODE_RECORD_SIZE: usize = 22 + NUM_BLOCK_PTRS * 4;
pub const INODE_MAGIC: u32 = 5000;

/// Direct pointer slots per inode, sized so one record fits one block.
pub const NUM_BLOCK_PTRS: usize = 26;

/// The root directory always lives at inode 0.
pub const ROOT_DIR_INODE: u16 = 0;

/// The block bitmap always starts right after the superblock.
pub const BITMAP_ADDRESS: u32 = 1;

/// Pointer-slot sentinel meaning "no block attached". Block 0 holds the
/// superblock, so 0 can never be a valid data pointer.
pub const BLOCK_PTR_UNALLOCATED: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u16);

impl InodeNumber {
    pub const ROOT: Self = Self(ROOT_DIR_INODE);
}

/// Validated block size: a power of two in 128..=32768. The lower bound
/// keeps an inode record inside one block; the upper bound keeps the
/// value inside the superblock's 16-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [128, 32768].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(128..=32768).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 128..=32768",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of 4-byte block pointers that fit in one block.
    #[must_use]
    pub fn ptrs_per_block(self) -> u32 {
        self.0 / 4
    }

    /// Convert a byte offset to a logical block index (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> u64 {
        byte_offset / u64::from(self.0)
    }

    /// Number of blocks needed to hold `bytes` bytes.
    #[must_use]
    pub fn blocks_for_bytes(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    let end = offset.checked_add(2).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 2,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let end = offset.checked_add(4).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Current wall-clock time as unix seconds, saturating to `u32`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // saturates past 2106, acceptable for a teaching fs
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
