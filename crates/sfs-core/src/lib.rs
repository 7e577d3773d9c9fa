#![forbid(unsafe_code)]
//! The filesystem façade: volume creation, mount/unmount, path
//! resolution, file handles, and directory operations.
//!
//! [`Filesystem`] is the one type consumers interact with. It owns the
//! block cache, the allocation bitmap, and the inode table for a mounted
//! image, and stays entirely in memory between [`Filesystem::sync`]
//! calls — nothing reaches the device until a flush.

use serde::Serialize;
use sfs_alloc::{BlockBitmap, InodeTable};
use sfs_block::{
    read_superblock_region, BlockCache, BlockDevice, ByteBlockDevice, FileByteDevice,
};
use sfs_dir::{decode_entries, encode_entries, initial_entries, validate_name};
use sfs_error::{FsError, Result};
use sfs_inode::InodeIo;
use sfs_types::{unix_now, BlockNumber, BlockSize, InodeNumber};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use sfs_ondisk::{Inode, InodeKind, Superblock};

/// Volume geometry used when the caller does not specify one.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;
pub const DEFAULT_BLOCK_COUNT: u32 = 1024;
pub const DEFAULT_INODE_COUNT: u16 = 256;

type Device = ByteBlockDevice<FileByteDevice>;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Cursor at 0; the file must exist.
    Read,
    /// Truncate to zero length, cursor at 0; created if absent.
    Write,
    /// Cursor at end of file; created if absent.
    Append,
}

/// Seek origin, mirroring `std::io::SeekFrom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// An open file: an inode number plus a byte cursor.
///
/// Handles hold no borrow of the filesystem; every I/O call goes back
/// through [`Filesystem`], which validates the inode each time.
#[derive(Debug, Clone)]
pub struct FileHandle {
    ino: InodeNumber,
    cursor: u64,
}

impl FileHandle {
    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// One directory listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeNumber,
    pub kind: InodeKind,
    pub length: u32,
}

/// Read and parse a volume's superblock without mounting it.
pub fn probe(path: impl AsRef<Path>) -> Result<Superblock> {
    let dev = FileByteDevice::open(path.as_ref())?;
    let region = read_superblock_region(&dev)?;
    Superblock::parse(&region).map_err(|e| FsError::Format(e.to_string()))
}

/// A mounted SlateFS volume.
#[derive(Debug)]
pub struct Filesystem {
    path: PathBuf,
    sb: Superblock,
    cache: BlockCache<Device>,
    bitmap: BlockBitmap,
    inodes: InodeTable,
    cwd: InodeNumber,
}

impl Filesystem {
    /// Create a fresh volume image at `path` and write it out.
    ///
    /// The image is not left mounted; call [`Filesystem::mount`] to use
    /// it.
    pub fn create(
        path: impl AsRef<Path>,
        block_count: u32,
        block_size: u32,
        inode_count: u16,
    ) -> Result<()> {
        let block_size = BlockSize::new(block_size)
            .map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        let sb = Superblock::new(block_size, block_count, inode_count)
            .map_err(|e| FsError::Size(e.to_string()))?;

        let len = u64::from(block_count) * u64::from(block_size.get());
        let file = FileByteDevice::create(path.as_ref(), len)?;
        let dev = ByteBlockDevice::new(file, block_size.get())?;
        let now = unix_now();

        let mut fs = Self {
            path: path.as_ref().to_path_buf(),
            sb,
            cache: BlockCache::new(dev),
            bitmap: BlockBitmap::new_for_volume(&sb),
            inodes: InodeTable::new_for_volume(&sb, now),
            cwd: InodeNumber::ROOT,
        };
        // Root directory starts with its self entry only.
        fs.write_dir_entries(InodeNumber::ROOT, &initial_entries(InodeNumber::ROOT, None))?;
        fs.sync()?;

        tracing::info!(
            path = %fs.path.display(),
            block_count,
            block_size = block_size.get(),
            inode_count,
            "created volume"
        );
        Ok(())
    }

    /// Mount an existing volume image.
    ///
    /// Images are self-describing: the superblock record is read from
    /// byte offset 0 before the block geometry is known.
    pub fn mount(path: impl AsRef<Path>) -> Result<Self> {
        let file = FileByteDevice::open(path.as_ref())?;
        let region = read_superblock_region(&file)?;
        let sb = Superblock::parse(&region).map_err(|e| FsError::Format(e.to_string()))?;

        let dev = ByteBlockDevice::new(file, sb.block_size.get())?;
        if dev.block_count() != sb.block_count {
            return Err(FsError::Format(format!(
                "image has {} blocks but superblock says {}",
                dev.block_count(),
                sb.block_count
            )));
        }

        let mut cache = BlockCache::new(dev);
        let bitmap = BlockBitmap::load_from(&mut cache, &sb)?;
        let inodes = InodeTable::load_from(&mut cache, &sb)?;

        tracing::info!(
            path = %path.as_ref().display(),
            block_count = sb.block_count,
            block_size = sb.block_size.get(),
            inode_count = sb.inode_count,
            "mounted volume"
        );
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            sb,
            cache,
            bitmap,
            inodes,
            cwd: InodeNumber::ROOT,
        })
    }

    /// Write all in-memory state to the device: superblock, bitmap,
    /// inode table, then every dirty cached block. The mount stays
    /// usable afterwards.
    pub fn sync(&mut self) -> Result<()> {
        let block = self.cache.get_mut(BlockNumber(0))?;
        block.fill(0);
        self.sb
            .serialize_into(block)
            .map_err(|e| FsError::Format(e.to_string()))?;
        self.bitmap.flush_to(&mut self.cache, &self.sb)?;
        self.inodes.flush_to(&mut self.cache, &self.sb)?;
        self.cache.flush()?;
        tracing::debug!(path = %self.path.display(), "synced volume");
        Ok(())
    }

    /// Flush everything and give up the mount.
    pub fn unmount(mut self) -> Result<()> {
        self.sync()?;
        tracing::info!(path = %self.path.display(), "unmounted volume");
        Ok(())
    }

    // ── accessors ──────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn image_path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn current_dir(&self) -> InodeNumber {
        self.cwd
    }

    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.bitmap.count_free()
    }

    #[must_use]
    pub fn free_inodes(&self) -> usize {
        self.inodes.count_free()
    }

    #[must_use]
    pub fn render_block_map(&self) -> String {
        self.bitmap.render_map()
    }

    #[must_use]
    pub fn render_inode_map(&self) -> String {
        self.inodes.render_map()
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<&Inode> {
        self.inodes.get(ino)
    }

    // ── raw allocation (shell plumbing) ────────────────────────────────

    pub fn alloc_block(&mut self) -> Result<BlockNumber> {
        self.bitmap.allocate()
    }

    pub fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        self.bitmap.free(block)?;
        self.cache.discard(block);
        Ok(())
    }

    pub fn alloc_inode(&mut self, kind: InodeKind) -> Result<InodeNumber> {
        self.inodes.allocate(kind, unix_now())
    }

    /// Reset an inode record to free. Does not reclaim its blocks and
    /// does not touch directories that reference it.
    pub fn free_inode(&mut self, ino: InodeNumber) -> Result<()> {
        self.inodes.free(ino)
    }

    // ── inode data plumbing ────────────────────────────────────────────

    fn io(&mut self) -> (InodeIo<'_, Device>, &mut InodeTable) {
        let Self {
            cache,
            bitmap,
            inodes,
            sb,
            ..
        } = self;
        (InodeIo::new(cache, bitmap, sb.block_size), inodes)
    }

    fn read_inode_data(&mut self, ino: InodeNumber) -> Result<Vec<u8>> {
        let (mut io, inodes) = self.io();
        let record = inodes.get(ino)?.clone();
        let mut buf = vec![0_u8; record.length as usize];
        io.read_at(&record, 0, &mut buf)?;
        Ok(buf)
    }

    fn read_dir_entries(&mut self, ino: InodeNumber) -> Result<BTreeMap<String, InodeNumber>> {
        let payload = self.read_inode_data(ino)?;
        decode_entries(&payload)
    }

    /// Replace a directory's payload: truncate to zero, then write the
    /// fresh linearization so stale records can never trail the new one.
    fn write_dir_entries(
        &mut self,
        ino: InodeNumber,
        entries: &BTreeMap<String, InodeNumber>,
    ) -> Result<()> {
        let payload = encode_entries(entries);
        let (mut io, inodes) = self.io();
        let mut record = inodes.get(ino)?.clone();
        let mut outcome = io.truncate(&mut record, 0);
        if outcome.is_ok() {
            outcome = io.write_at(&mut record, 0, &payload).map(|_| ());
        }
        // Store the record back even on failure so it keeps ownership
        // of whatever blocks remain linked.
        *inodes.get_mut(ino)? = record;
        outcome
    }

    // ── path resolution ────────────────────────────────────────────────

    /// Walk `path` to an inode. A leading `/` starts at the root,
    /// anything else at the current directory; empty components are
    /// skipped, so `a//b/` equals `a/b`. Returns the inode and the
    /// directory it was found in (None when no component was walked).
    pub fn resolve_path(&mut self, path: &str) -> Result<(InodeNumber, Option<InodeNumber>)> {
        let mut current = if path.starts_with('/') {
            InodeNumber::ROOT
        } else {
            self.cwd
        };
        let mut parent = None;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            if self.inodes.get(current)?.kind != InodeKind::Directory {
                return Err(FsError::NotDirectory);
            }
            let entries = self.read_dir_entries(current)?;
            let next = entries
                .get(component)
                .copied()
                .ok_or_else(|| FsError::NotFound(component.to_owned()))?;
            parent = Some(current);
            current = next;
        }
        Ok((current, parent))
    }

    fn resolve_dir(&mut self, path: &str) -> Result<InodeNumber> {
        let (ino, _) = self.resolve_path(path)?;
        if self.inodes.get(ino)?.kind != InodeKind::Directory {
            return Err(FsError::NotDirectory);
        }
        Ok(ino)
    }

    // ── directory operations ───────────────────────────────────────────

    /// Create a file at `path`. The parent directory must exist.
    pub fn make_file(&mut self, path: &str) -> Result<InodeNumber> {
        self.make_node(path, InodeKind::File)
    }

    /// Create a directory at `path`, initialized with `.` and `..`.
    pub fn make_dir(&mut self, path: &str) -> Result<InodeNumber> {
        self.make_node(path, InodeKind::Directory)
    }

    fn make_node(&mut self, path: &str, kind: InodeKind) -> Result<InodeNumber> {
        let (parent_path, name) = split_path(path);
        validate_name(name)?;
        let dir = self.resolve_dir(parent_path)?;

        let mut entries = self.read_dir_entries(dir)?;
        if entries.contains_key(name) {
            return Err(FsError::Exists(name.to_owned()));
        }

        let new = self.inodes.allocate(kind, unix_now())?;
        entries.insert(name.to_owned(), new);
        self.write_dir_entries(dir, &entries)?;
        if kind == InodeKind::Directory {
            self.write_dir_entries(new, &initial_entries(new, Some(dir)))?;
        }
        tracing::debug!(path, inode = new.0, ?kind, "created node");
        Ok(new)
    }

    /// Change the current directory.
    pub fn change_dir(&mut self, path: &str) -> Result<()> {
        self.cwd = self.resolve_dir(path)?;
        Ok(())
    }

    /// List a directory (the current one when `path` is `None`).
    pub fn list_dir(&mut self, path: Option<&str>) -> Result<Vec<DirEntry>> {
        let dir = self.resolve_dir(path.unwrap_or(""))?;
        let entries = self.read_dir_entries(dir)?;
        let mut rows = Vec::with_capacity(entries.len());
        for (name, ino) in entries {
            let record = self.inodes.get(ino)?;
            rows.push(DirEntry {
                name,
                inode: ino,
                kind: record.kind,
                length: record.length,
            });
        }
        Ok(rows)
    }

    // ── file operations ────────────────────────────────────────────────

    /// Open a file. `Write` and `Append` create it if it is absent (the
    /// parent directory must exist); `Read` requires it.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        let ino = match self.resolve_path(path) {
            Ok((ino, _)) => ino,
            Err(FsError::NotFound(_)) if mode != OpenMode::Read => self.make_file(path)?,
            Err(e) => return Err(e),
        };

        let record = self.inodes.get(ino)?;
        match record.kind {
            InodeKind::File => {}
            InodeKind::Directory => return Err(FsError::IsDirectory),
            _ => {
                return Err(FsError::Format(format!(
                    "directory entry {path:?} points at inode {ino} of kind {:?}",
                    record.kind
                )))
            }
        }

        let cursor = match mode {
            OpenMode::Read => 0,
            OpenMode::Write => {
                let (mut io, inodes) = self.io();
                let mut record = inodes.get(ino)?.clone();
                let outcome = io.truncate(&mut record, 0);
                *inodes.get_mut(ino)? = record;
                outcome?;
                0
            }
            OpenMode::Append => u64::from(self.inodes.get(ino)?.length),
        };
        Ok(FileHandle { ino, cursor })
    }

    /// Read from the handle's cursor, advancing it. Returns the byte
    /// count actually read (0 at end of file).
    pub fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        let (mut io, inodes) = self.io();
        let record = inodes.get(handle.ino)?.clone();
        let n = io.read_at(&record, handle.cursor, buf)?;
        handle.cursor += n as u64;
        Ok(n)
    }

    /// Write at the handle's cursor, advancing it.
    pub fn write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        let (mut io, inodes) = self.io();
        let mut record = inodes.get(handle.ino)?.clone();
        let outcome = io.write_at(&mut record, handle.cursor, buf);
        // Store the record back even on failure: it may have grown a
        // pointer level, and any block it still links must stay owned.
        *inodes.get_mut(handle.ino)? = record;
        let n = outcome?;
        handle.cursor += n as u64;
        Ok(n)
    }

    /// Move the handle's cursor. The cursor may be placed past the end
    /// of file; a later write there leaves a hole.
    pub fn seek(&mut self, handle: &mut FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => i64::try_from(handle.cursor)
                .map_err(|_| FsError::OutOfRange("cursor exceeds i64".to_owned()))?,
            Whence::End => i64::from(self.inodes.get(handle.ino)?.length),
        };
        let target = base
            .checked_add(offset)
            .ok_or_else(|| FsError::OutOfRange("seek target overflows".to_owned()))?;
        if target < 0 {
            return Err(FsError::InvalidArgument(format!(
                "seek before start of file: {target}"
            )));
        }
        handle.cursor = target as u64;
        Ok(handle.cursor)
    }

    /// Set the file's length: shrinking reclaims blocks, growing is
    /// lazy.
    pub fn truncate(&mut self, handle: &FileHandle, length: u32) -> Result<()> {
        let (mut io, inodes) = self.io();
        let mut record = inodes.get(handle.ino)?.clone();
        let outcome = io.truncate(&mut record, length);
        // On a mid-reclaim failure the record reflects what was freed.
        *inodes.get_mut(handle.ino)? = record;
        outcome
    }

    /// Read an entire file (shell `cat`).
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let handle = self.open(path, OpenMode::Read)?;
        self.read_inode_data(handle.ino)
    }

    /// Overwrite a file with `data`, optionally at an offset (shell
    /// `write`). Creates the file if needed; existing content is
    /// truncated first.
    pub fn write_file(&mut self, path: &str, data: &[u8], offset: Option<u64>) -> Result<()> {
        let mut handle = self.open(path, OpenMode::Write)?;
        if let Some(offset) = offset {
            let offset = i64::try_from(offset)
                .map_err(|_| FsError::OutOfRange("offset exceeds i64".to_owned()))?;
            self.seek(&mut handle, offset, Whence::Start)?;
        }
        self.write(&mut handle, data)?;
        Ok(())
    }
}

/// Split a path into its parent and final component. The parent is ""
/// (current directory) for bare names and "/" for top-level names.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}
