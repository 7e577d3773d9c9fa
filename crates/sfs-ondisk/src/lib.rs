#![forbid(unsafe_code)]
//! On-disk format parsing and serialization for SlateFS volumes.
//!
//! Pure format crate — no I/O, no side effects. Translates byte regions
//! into typed superblock and inode records and back. All multi-byte
//! fields are little-endian.
//!
//! Layout of a volume:
//!
//! | Region | Blocks | Contents |
//! |--------|--------|----------|
//! | Superblock | `0` | 25-byte record, rest of block zero |
//! | Block bitmap | `1 ..` | one bit per block, MSB-first |
//! | Inode table | `inode_table_address ..` | one 126-byte record per block |
//! | Data | remainder | file, directory, and pointer blocks |

use serde::{Deserialize, Serialize};
use sfs_types::{
    BlockNumber, InodeNumber, ParseError, BITMAP_ADDRESS, BLOCK_PTR_UNALLOCATED, BlockSize,
    INODE_MAGIC, INODE_RECORD_SIZE, NUM_BLOCK_PTRS, ROOT_DIR_INODE, SUPERBLOCK_MAGIC,
    SUPERBLOCK_RECORD_SIZE, ensure_slice, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};

/// Superblock flags byte for a cleanly written volume.
pub const SUPERBLOCK_FLAGS: u8 = b'X';

/// Permission bits stamped on freshly allocated inodes.
pub const DEFAULT_PERMS: u16 = 777;

/// What an inode record describes.
///
/// The tag byte doubles as the free-list marker: a record tagged
/// [`InodeKind::Free`] is available for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    Free,
    File,
    Directory,
    Symlink,
}

impl InodeKind {
    /// On-disk tag byte.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Free => b'O',
            Self::File => b'f',
            Self::Directory => b'd',
            Self::Symlink => b's',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ParseError> {
        match tag {
            b'O' => Ok(Self::Free),
            b'f' => Ok(Self::File),
            b'd' => Ok(Self::Directory),
            b's' => Ok(Self::Symlink),
            _ => Err(ParseError::InvalidField {
                field: "kind",
                reason: "unknown inode kind tag",
            }),
        }
    }

    /// One-character rendering for listings and the inode map.
    #[must_use]
    pub fn symbol(self) -> char {
        match self {
            Self::Free => '_',
            Self::File => 'f',
            Self::Directory => 'd',
            Self::Symlink => 's',
        }
    }
}

/// Superblock record: volume geometry and region addresses.
///
/// Occupies the first [`SUPERBLOCK_RECORD_SIZE`] bytes of block 0. The
/// record is self-describing — it is parsed before the block geometry
/// is known, so every field the mount path needs lives in these bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: BlockSize,
    pub block_count: u32,
    pub inode_count: u16,
    /// First block of the block bitmap. Always 1.
    pub bitmap_address: u32,
    /// First block of the inode table.
    pub inode_table_address: u32,
    /// Inode number of the root directory. Always 0.
    pub root_dir_inode: u32,
    pub flags: u8,
}

impl Superblock {
    /// Lay out a fresh volume: bitmap right after the superblock, inode
    /// table right after the bitmap, one inode record per block.
    ///
    /// Fails if the metadata regions do not leave room inside
    /// `block_count`.
    pub fn new(
        block_size: BlockSize,
        block_count: u32,
        inode_count: u16,
    ) -> Result<Self, ParseError> {
        if block_count == 0 {
            return Err(ParseError::InvalidField {
                field: "block_count",
                reason: "must be nonzero",
            });
        }
        let bitmap_blocks = bitmap_blocks_for(block_size, block_count);
        let inode_table_address = u64::from(BITMAP_ADDRESS) + bitmap_blocks;
        let end = inode_table_address + u64::from(inode_count);
        if end > u64::from(block_count) {
            return Err(ParseError::InvalidField {
                field: "inode_count",
                reason: "metadata regions exceed block count",
            });
        }
        let inode_table_address = u32::try_from(inode_table_address)
            .map_err(|_| ParseError::IntegerConversion {
                field: "inode_table_address",
            })?;
        Ok(Self {
            block_size,
            block_count,
            inode_count,
            bitmap_address: BITMAP_ADDRESS,
            inode_table_address,
            root_dir_inode: u32::from(ROOT_DIR_INODE),
            flags: SUPERBLOCK_FLAGS,
        })
    }

    /// Parse a superblock record from the first bytes of block 0.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_RECORD_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u32(region, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }

        let block_size = BlockSize::new(u32::from(read_le_u16(region, 4)?))?;
        let block_count = read_le_u32(region, 6)?;
        let inode_count = read_le_u16(region, 10)?;
        let bitmap_address = read_le_u32(region, 12)?;
        let inode_table_address = read_le_u32(region, 16)?;
        let root_dir_inode = read_le_u32(region, 20)?;
        let flags = ensure_slice(region, 24, 1)?[0];

        if bitmap_address != BITMAP_ADDRESS {
            return Err(ParseError::InvalidField {
                field: "bitmap_address",
                reason: "bitmap must start at block 1",
            });
        }
        let table_end = u64::from(inode_table_address) + u64::from(inode_count);
        if table_end > u64::from(block_count) {
            return Err(ParseError::InvalidField {
                field: "inode_table_address",
                reason: "inode table exceeds block count",
            });
        }

        Ok(Self {
            block_size,
            block_count,
            inode_count,
            bitmap_address,
            inode_table_address,
            root_dir_inode,
            flags,
        })
    }

    /// Serialize the record into the head of `buf` (typically block 0).
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if buf.len() < SUPERBLOCK_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_RECORD_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        write_le_u32(buf, 0, SUPERBLOCK_MAGIC)?;
        let block_size = u16::try_from(self.block_size.get())
            .map_err(|_| ParseError::IntegerConversion { field: "block_size" })?;
        write_le_u16(buf, 4, block_size)?;
        write_le_u32(buf, 6, self.block_count)?;
        write_le_u16(buf, 10, self.inode_count)?;
        write_le_u32(buf, 12, self.bitmap_address)?;
        write_le_u32(buf, 16, self.inode_table_address)?;
        write_le_u32(buf, 20, self.root_dir_inode)?;
        buf[24] = self.flags;
        Ok(())
    }

    /// Number of blocks the bitmap region occupies.
    #[must_use]
    pub fn bitmap_blocks(&self) -> u32 {
        self.inode_table_address - self.bitmap_address
    }

    /// First data block after the metadata regions.
    #[must_use]
    pub fn first_data_block(&self) -> u32 {
        self.inode_table_address + u32::from(self.inode_count)
    }
}

/// Blocks needed to hold one bit per block, MSB-first packed.
#[must_use]
pub fn bitmap_blocks_for(block_size: BlockSize, block_count: u32) -> u64 {
    let bitmap_bytes = u64::from(block_count).div_ceil(8);
    bitmap_bytes.div_ceil(u64::from(block_size.get()))
}

/// Inode record: one per block in the inode table.
///
/// 22-byte fixed header followed by [`NUM_BLOCK_PTRS`] pointer slots. A
/// pointer slot of 0 means "no block attached here" — block 0 holds the
/// superblock and can never be file data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub number: InodeNumber,
    pub cdate: u32,
    pub mdate: u32,
    pub kind: InodeKind,
    pub perms: u16,
    pub level: u8,
    pub length: u32,
    pub block_ptrs: [u32; NUM_BLOCK_PTRS],
}

impl Inode {
    /// A free record, as written when a volume is created or an inode is
    /// released.
    #[must_use]
    pub fn free(number: InodeNumber) -> Self {
        Self {
            number,
            cdate: 0,
            mdate: 0,
            kind: InodeKind::Free,
            perms: DEFAULT_PERMS,
            level: 0,
            length: 0,
            block_ptrs: [BLOCK_PTR_UNALLOCATED; NUM_BLOCK_PTRS],
        }
    }

    /// A fresh live record of the given kind, fully reinitialized.
    #[must_use]
    pub fn fresh(number: InodeNumber, kind: InodeKind, now: u32) -> Self {
        Self {
            number,
            cdate: now,
            mdate: now,
            kind,
            perms: DEFAULT_PERMS,
            level: 0,
            length: 0,
            block_ptrs: [BLOCK_PTR_UNALLOCATED; NUM_BLOCK_PTRS],
        }
    }

    /// Parse an inode record from the head of its table block.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let number = InodeNumber(read_le_u16(region, 0)?);
        let cdate = read_le_u32(region, 2)?;
        let mdate = read_le_u32(region, 6)?;
        let kind = InodeKind::from_tag(ensure_slice(region, 10, 1)?[0])?;
        let perms = read_le_u16(region, 11)?;
        let level = ensure_slice(region, 13, 1)?[0];
        let length = read_le_u32(region, 14)?;

        let magic = read_le_u32(region, 18)?;
        if magic != INODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: INODE_MAGIC,
                actual: magic,
            });
        }

        let mut block_ptrs = [BLOCK_PTR_UNALLOCATED; NUM_BLOCK_PTRS];
        for (i, slot) in block_ptrs.iter_mut().enumerate() {
            *slot = read_le_u32(region, 22 + i * 4)?;
        }

        Ok(Self {
            number,
            cdate,
            mdate,
            kind,
            perms,
            level,
            length,
            block_ptrs,
        })
    }

    /// Serialize the record into the head of its table block.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        if buf.len() < INODE_RECORD_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_RECORD_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        write_le_u16(buf, 0, self.number.0)?;
        write_le_u32(buf, 2, self.cdate)?;
        write_le_u32(buf, 6, self.mdate)?;
        buf[10] = self.kind.tag();
        write_le_u16(buf, 11, self.perms)?;
        buf[13] = self.level;
        write_le_u32(buf, 14, self.length)?;
        write_le_u32(buf, 18, INODE_MAGIC)?;
        for (i, slot) in self.block_ptrs.iter().enumerate() {
            write_le_u32(buf, 22 + i * 4, *slot)?;
        }
        Ok(())
    }

    /// Block number of this inode's table block within a volume.
    #[must_use]
    pub fn table_block(sb: &Superblock, number: InodeNumber) -> BlockNumber {
        BlockNumber(sb.inode_table_address + u32::from(number.0))
    }
}

/// Decode a pointer block into `block_size / 4` pointer slots.
pub fn parse_ptr_block(block: &[u8], block_size: BlockSize) -> Result<Vec<u32>, ParseError> {
    let count = block_size.ptrs_per_block() as usize;
    if block.len() < count * 4 {
        return Err(ParseError::InsufficientData {
            needed: count * 4,
            offset: 0,
            actual: block.len(),
        });
    }
    let mut ptrs = Vec::with_capacity(count);
    for i in 0..count {
        ptrs.push(read_le_u32(block, i * 4)?);
    }
    Ok(ptrs)
}

/// Encode pointer slots into a full pointer block.
pub fn serialize_ptr_block(ptrs: &[u32], buf: &mut [u8]) -> Result<(), ParseError> {
    if buf.len() < ptrs.len() * 4 {
        return Err(ParseError::InsufficientData {
            needed: ptrs.len() * 4,
            offset: 0,
            actual: buf.len(),
        });
    }
    for (i, ptr) in ptrs.iter().enumerate() {
        write_le_u32(buf, i * 4, *ptr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(n: u32) -> BlockSize {
        BlockSize::new(n).expect("block size")
    }

    #[test]
    fn superblock_layout_for_2048x2048() {
        // 2048 blocks of 2048 bytes: bitmap needs 256 bytes, one block.
        let sb = Superblock::new(bs(2048), 2048, 100).expect("superblock");
        assert_eq!(sb.bitmap_address, 1);
        assert_eq!(sb.inode_table_address, 2);
        assert_eq!(sb.bitmap_blocks(), 1);
        assert_eq!(sb.first_data_block(), 102);
        assert_eq!(sb.root_dir_inode, 0);
        assert_eq!(sb.flags, SUPERBLOCK_FLAGS);
    }

    #[test]
    fn superblock_layout_multi_block_bitmap() {
        // 65536 blocks of 128 bytes: bitmap needs 8192 bytes = 64 blocks.
        let sb = Superblock::new(bs(128), 65536, 10).expect("superblock");
        assert_eq!(sb.inode_table_address, 65);
    }

    #[test]
    fn superblock_rejects_layout_that_does_not_fit() {
        assert!(Superblock::new(bs(2048), 50, 100).is_err());
        assert!(Superblock::new(bs(2048), 0, 0).is_err());
    }

    #[test]
    fn superblock_byte_offsets_are_exact() {
        let sb = Superblock::new(bs(2048), 2048, 100).expect("superblock");
        let mut buf = vec![0_u8; SUPERBLOCK_RECORD_SIZE];
        sb.serialize_into(&mut buf).expect("serialize");

        assert_eq!(&buf[0..4], &[0xED, 0x54, 0x01, 0x70]); // magic LE
        assert_eq!(&buf[4..6], &[0x00, 0x08]); // block_size 2048
        assert_eq!(&buf[6..10], &[0x00, 0x08, 0x00, 0x00]); // block_count 2048
        assert_eq!(&buf[10..12], &[100, 0]); // inode_count
        assert_eq!(&buf[12..16], &[1, 0, 0, 0]); // bitmap_address
        assert_eq!(&buf[16..20], &[2, 0, 0, 0]); // inode_table_address
        assert_eq!(&buf[20..24], &[0, 0, 0, 0]); // root_dir_inode
        assert_eq!(buf[24], b'X');

        let parsed = Superblock::parse(&buf).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let sb = Superblock::new(bs(2048), 2048, 100).expect("superblock");
        let mut buf = vec![0_u8; SUPERBLOCK_RECORD_SIZE];
        sb.serialize_into(&mut buf).expect("serialize");
        buf[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn inode_record_byte_offsets_are_exact() {
        let mut ino = Inode::fresh(InodeNumber(7), InodeKind::File, 1_700_000_000);
        ino.level = 2;
        ino.length = 0x0102_0304;
        ino.block_ptrs[0] = 42;
        ino.block_ptrs[25] = 0xDEAD_BEEF;

        let mut buf = vec![0_u8; INODE_RECORD_SIZE];
        ino.serialize_into(&mut buf).expect("serialize");

        assert_eq!(&buf[0..2], &[7, 0]); // number
        assert_eq!(buf[10], b'f'); // kind tag
        assert_eq!(&buf[11..13], &777_u16.to_le_bytes()); // perms
        assert_eq!(buf[13], 2); // level
        assert_eq!(&buf[14..18], &[0x04, 0x03, 0x02, 0x01]); // length LE
        assert_eq!(&buf[18..22], &5000_u32.to_le_bytes()); // magic
        assert_eq!(&buf[22..26], &[42, 0, 0, 0]); // first pointer slot
        assert_eq!(&buf[122..126], &0xDEAD_BEEF_u32.to_le_bytes()); // last slot

        let parsed = Inode::parse(&buf).expect("parse");
        assert_eq!(parsed, ino);
    }

    #[test]
    fn inode_rejects_bad_magic_and_kind() {
        let ino = Inode::free(InodeNumber(1));
        let mut buf = vec![0_u8; INODE_RECORD_SIZE];
        ino.serialize_into(&mut buf).expect("serialize");

        let mut bad_magic = buf.clone();
        bad_magic[18] ^= 0xFF;
        assert!(matches!(
            Inode::parse(&bad_magic),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut bad_kind = buf;
        bad_kind[10] = b'?';
        assert!(Inode::parse(&bad_kind).is_err());
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            InodeKind::Free,
            InodeKind::File,
            InodeKind::Directory,
            InodeKind::Symlink,
        ] {
            assert_eq!(InodeKind::from_tag(kind.tag()), Ok(kind));
        }
        assert!(InodeKind::from_tag(b'z').is_err());
    }

    #[test]
    fn ptr_block_round_trips() {
        let block_size = bs(128);
        let count = block_size.ptrs_per_block() as usize;
        assert_eq!(count, 32);

        let mut ptrs = vec![0_u32; count];
        ptrs[0] = 5;
        ptrs[31] = 900;
        let mut buf = vec![0_u8; 128];
        serialize_ptr_block(&ptrs, &mut buf).expect("serialize");
        assert_eq!(parse_ptr_block(&buf, block_size).expect("parse"), ptrs);

        assert!(parse_ptr_block(&buf[..100], block_size).is_err());
    }

    #[test]
    fn table_block_addresses_follow_inode_number() {
        let sb = Superblock::new(bs(2048), 2048, 100).expect("superblock");
        assert_eq!(Inode::table_block(&sb, InodeNumber(0)), BlockNumber(2));
        assert_eq!(Inode::table_block(&sb, InodeNumber(99)), BlockNumber(101));
    }
}
