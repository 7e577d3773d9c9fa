//! End-to-end tests against real image files: create, mount, write,
//! remount, and verify what actually landed on disk.

use sfs_core::{probe, Filesystem, OpenMode, Whence};
use sfs_error::FsError;
use sfs_ondisk::InodeKind;
use sfs_types::{BlockNumber, InodeNumber};
use std::path::PathBuf;

fn image(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[test]
fn create_and_mount_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "roundtrip.img");

    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let fs = Filesystem::mount(&path).expect("mount");
    let sb = fs.superblock();
    assert_eq!(sb.block_count, 2048);
    assert_eq!(sb.block_size.get(), 2048);
    assert_eq!(sb.inode_count, 100);
    assert_eq!(sb.bitmap_address, 1);
    assert_eq!(sb.inode_table_address, 2);
    assert_eq!(sb.root_dir_inode, 0);

    // Root is a directory containing only its self entry.
    let root = fs.inode(InodeNumber::ROOT).expect("root");
    assert_eq!(root.kind, InodeKind::Directory);
    fs.unmount().expect("unmount");
}

#[test]
fn probe_reads_geometry_without_mounting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "probe.img");
    Filesystem::create(&path, 512, 1024, 32).expect("create");

    let sb = probe(&path).expect("probe");
    assert_eq!(sb.block_count, 512);
    assert_eq!(sb.block_size.get(), 1024);
    assert_eq!(sb.inode_count, 32);
}

#[test]
fn create_rejects_undersized_volume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "tiny.img");
    // 100 inodes need 100 table blocks; 50 blocks cannot hold them.
    assert!(matches!(
        Filesystem::create(&path, 50, 2048, 100),
        Err(FsError::Size(_))
    ));
}

#[test]
fn mount_rejects_garbage_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "garbage.img");
    std::fs::write(&path, vec![0xA5_u8; 4096]).expect("write");
    assert!(matches!(
        Filesystem::mount(&path),
        Err(FsError::Format(_))
    ));
}

#[test]
fn allocation_state_persists_across_remount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "persist.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let (block, inode) = {
        let mut fs = Filesystem::mount(&path).expect("mount");
        let block = fs.alloc_block().expect("alloc block");
        let inode = fs.alloc_inode(InodeKind::File).expect("alloc inode");
        fs.unmount().expect("unmount");
        (block, inode)
    };

    let mut fs = Filesystem::mount(&path).expect("remount");
    // Still allocated: freeing succeeds exactly once.
    fs.free_block(block).expect("free block");
    assert!(matches!(
        fs.free_block(block),
        Err(FsError::InvalidArgument(_))
    ));
    assert_eq!(fs.inode(inode).expect("inode").kind, InodeKind::File);
    fs.free_inode(inode).expect("free inode");
    assert!(matches!(
        fs.free_inode(inode),
        Err(FsError::InvalidArgument(_))
    ));
}

#[test]
fn unaligned_write_survives_remount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "cat.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let message = b"A cat is Here";
    {
        let mut fs = Filesystem::mount(&path).expect("mount");
        fs.make_file("story").expect("touch");
        let mut handle = fs.open("story", OpenMode::Append).expect("open");
        fs.seek(&mut handle, 27124, Whence::Start).expect("seek");
        fs.write(&mut handle, message).expect("write");
        fs.truncate(&handle, 27624).expect("truncate");
        fs.unmount().expect("unmount");
    }

    let mut fs = Filesystem::mount(&path).expect("remount");
    let mut handle = fs.open("story", OpenMode::Read).expect("open");
    assert_eq!(fs.inode(handle.inode()).expect("inode").length, 27624);

    fs.seek(&mut handle, 27124, Whence::Start).expect("seek");
    let mut buf = vec![0_u8; message.len()];
    assert_eq!(fs.read(&mut handle, &mut buf).expect("read"), buf.len());
    assert_eq!(&buf, message);

    // The leading gap is a hole and reads as zeros.
    fs.seek(&mut handle, 1000, Whence::Start).expect("seek");
    let mut gap = vec![0xFF_u8; 64];
    fs.read(&mut handle, &mut gap).expect("read gap");
    assert_eq!(gap, vec![0_u8; 64]);
}

#[test]
fn sparse_reads_do_not_allocate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "sparse.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    fs.write_file("holey", b"end", Some(50_000)).expect("write");
    let free_before = fs.free_blocks();

    let mut handle = fs.open("holey", OpenMode::Read).expect("open");
    let mut buf = vec![0xFF_u8; 4096];
    fs.read(&mut handle, &mut buf).expect("read");
    assert_eq!(buf, vec![0_u8; 4096]);
    assert_eq!(fs.free_blocks(), free_before);
}

#[test]
fn directories_round_trip_through_remount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "dirs.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    {
        let mut fs = Filesystem::mount(&path).expect("mount");
        fs.make_dir("docs").expect("mkdir");
        fs.make_file("docs/readme").expect("touch");
        fs.make_dir("docs/drafts").expect("mkdir nested");
        fs.write_file("docs/readme", b"hello", None).expect("write");
        fs.unmount().expect("unmount");
    }

    let mut fs = Filesystem::mount(&path).expect("remount");
    let rows = fs.list_dir(Some("docs")).expect("ls");
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "drafts", "readme"]);

    let readme = rows.iter().find(|r| r.name == "readme").expect("readme");
    assert_eq!(readme.kind, InodeKind::File);
    assert_eq!(readme.length, 5);

    // `.` and `..` wire up correctly.
    fs.change_dir("docs/drafts").expect("cd");
    let (up, _) = fs.resolve_path("..").expect("resolve ..");
    let (docs, _) = fs.resolve_path("/docs").expect("resolve /docs");
    assert_eq!(up, docs);

    assert_eq!(fs.read_file("../readme").expect("cat"), b"hello");
}

#[test]
fn path_resolution_edge_cases() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "paths.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    fs.make_dir("a").expect("mkdir a");
    fs.make_dir("a/b").expect("mkdir a/b");
    fs.make_file("a/b/f").expect("touch");

    // Duplicate and trailing slashes are skipped.
    let (one, _) = fs.resolve_path("a//b/").expect("slashes");
    let (two, _) = fs.resolve_path("/a/b").expect("absolute");
    assert_eq!(one, two);

    // A file mid-path is NotDirectory; a missing component is NotFound.
    assert!(matches!(
        fs.resolve_path("a/b/f/deeper"),
        Err(FsError::NotDirectory)
    ));
    assert!(matches!(
        fs.resolve_path("a/missing/f"),
        Err(FsError::NotFound(_))
    ));

    // cd into a file fails; opening a directory fails.
    assert!(matches!(fs.change_dir("a/b/f"), Err(FsError::NotDirectory)));
    assert!(matches!(
        fs.open("a/b", OpenMode::Read),
        Err(FsError::IsDirectory)
    ));
}

#[test]
fn duplicate_names_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "dups.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    fs.make_file("x").expect("touch");
    assert!(matches!(fs.make_file("x"), Err(FsError::Exists(_))));
    assert!(matches!(fs.make_dir("x"), Err(FsError::Exists(_))));
    assert!(matches!(
        fs.make_file("bad|name"),
        Err(FsError::InvalidArgument(_))
    ));
}

#[test]
fn open_modes_behave_distinctly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "modes.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");

    // Read requires an existing file; Write creates one.
    assert!(matches!(
        fs.open("log", OpenMode::Read),
        Err(FsError::NotFound(_))
    ));
    let mut handle = fs.open("log", OpenMode::Write).expect("create via write");
    fs.write(&mut handle, b"first").expect("write");

    // Append continues at the end.
    let mut handle = fs.open("log", OpenMode::Append).expect("append");
    assert_eq!(handle.cursor(), 5);
    fs.write(&mut handle, b" second").expect("append write");
    assert_eq!(fs.read_file("log").expect("cat"), b"first second");

    // Write truncates existing content.
    let mut handle = fs.open("log", OpenMode::Write).expect("rewrite");
    fs.write(&mut handle, b"new").expect("write");
    assert_eq!(fs.read_file("log").expect("cat"), b"new");
}

#[test]
fn seek_whence_and_bounds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "seek.img");
    Filesystem::create(&path, 2048, 2048, 100).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    fs.write_file("f", b"0123456789", None).expect("write");

    let mut handle = fs.open("f", OpenMode::Read).expect("open");
    assert_eq!(fs.seek(&mut handle, -3, Whence::End).expect("end"), 7);
    let mut buf = [0_u8; 3];
    fs.read(&mut handle, &mut buf).expect("read");
    assert_eq!(&buf, b"789");

    assert_eq!(fs.seek(&mut handle, -5, Whence::Current).expect("cur"), 5);
    assert!(matches!(
        fs.seek(&mut handle, -100, Whence::Start),
        Err(FsError::InvalidArgument(_))
    ));
}

#[test]
fn exhaustion_is_deterministic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "full.img");
    // 130 blocks, 128 bytes each, 100 inodes: bitmap 1 block, data
    // starts at block 102, and the root payload takes one block,
    // leaving 27 free.
    Filesystem::create(&path, 130, 128, 100).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    let mut allocated = Vec::new();
    loop {
        match fs.alloc_block() {
            Ok(b) => allocated.push(b),
            Err(FsError::NoSpace) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(allocated.len(), 27);
    assert_eq!(fs.free_blocks(), 0);

    // Free one, and exactly one more allocation succeeds.
    fs.free_block(allocated[3]).expect("free");
    assert_eq!(fs.alloc_block().expect("realloc"), allocated[3]);
    assert!(matches!(fs.alloc_block(), Err(FsError::NoSpace)));
}

#[test]
fn failed_write_does_not_leak_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "noleak.img");
    // Same geometry as above: 27 free data blocks.
    Filesystem::create(&path, 130, 128, 100).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    let free_before = fs.free_blocks();

    // 128 KiB cannot fit; the write must fail without consuming the
    // blocks it allocated along the way.
    let huge = vec![3_u8; 128 * 1024];
    assert!(matches!(
        fs.write_file("big", &huge, None),
        Err(FsError::NoSpace)
    ));
    assert_eq!(fs.free_blocks(), free_before);

    // The file exists (created by the open) but holds nothing.
    assert_eq!(fs.read_file("big").expect("read"), Vec::<u8>::new());

    // The space is still usable.
    fs.write_file("note", b"still room", None).expect("write");
    assert_eq!(fs.read_file("note").expect("read"), b"still room");
    fs.unmount().expect("unmount");
}

#[test]
fn inode_exhaustion_and_recovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "inofull.img");
    Filesystem::create(&path, 512, 1024, 4).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    // Root holds inode 0; three left.
    fs.make_file("a").expect("a");
    fs.make_file("b").expect("b");
    fs.make_file("c").expect("c");
    assert!(matches!(fs.make_file("d"), Err(FsError::NoSpace)));

    let (b, _) = fs.resolve_path("b").expect("resolve");
    fs.free_inode(b).expect("free");
    fs.make_file("d").expect("retry");
}

#[test]
fn maps_render_after_mutations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "maps.img");
    Filesystem::create(&path, 512, 1024, 16).expect("create");

    let mut fs = Filesystem::mount(&path).expect("mount");
    fs.make_file("f").expect("touch");

    let block_map = fs.render_block_map();
    assert!(block_map.starts_with("11111111|"));
    assert!(block_map.contains('0'));

    // Root dir + new file: "df" then free slots.
    let inode_map = fs.render_inode_map();
    assert!(inode_map.starts_with("dfOOOOOO|"));
}

#[test]
fn big_write_exercises_indirect_blocks_across_remount() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = image(&dir, "big.img");
    Filesystem::create(&path, 2048, 512, 32).expect("create");

    // 26 direct blocks of 512 bytes cap at 13312; write well past that.
    let payload: Vec<u8> = (0..100_000_u32).map(|i| (i % 239) as u8).collect();
    {
        let mut fs = Filesystem::mount(&path).expect("mount");
        fs.write_file("big", &payload, None).expect("write");
        fs.unmount().expect("unmount");
    }

    let mut fs = Filesystem::mount(&path).expect("remount");
    assert_eq!(fs.read_file("big").expect("read"), payload);

    // Shrink reclaims the indirect tree's blocks.
    let free_before = fs.free_blocks();
    let handle = fs.open("big", OpenMode::Read).expect("open");
    fs.truncate(&handle, 100).expect("truncate");
    assert!(fs.free_blocks() > free_before);
    assert_eq!(fs.read_file("big").expect("read"), payload[..100].to_vec());
}
