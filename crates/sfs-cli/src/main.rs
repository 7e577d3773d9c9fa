#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sfs_core::{
    probe, Filesystem, DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE, DEFAULT_INODE_COUNT,
};
use sfs_error::FsError;
use sfs_ondisk::InodeKind;
use sfs_types::{BlockNumber, InodeNumber};
use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    block_count: u32,
    inode_count: u16,
    bitmap_address: u32,
    inode_table_address: u32,
    root_dir_inode: u32,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        return repl();
    };

    match command.as_str() {
        "shell" => repl(),
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sfs-cli\n");
    println!("USAGE:");
    println!("  sfs-cli [shell]                    interactive shell (default)");
    println!("  sfs-cli inspect <image> [--json]   print a volume's geometry");
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let sb = probe(path)
        .with_context(|| format!("failed to read superblock from {}", path.display()))?;

    let output = InspectOutput {
        block_size: sb.block_size.get(),
        block_count: sb.block_count,
        inode_count: sb.inode_count,
        bitmap_address: sb.bitmap_address,
        inode_table_address: sb.inode_table_address,
        root_dir_inode: sb.root_dir_inode,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("SlateFS volume {}", path.display());
        println!("block_size: {}", output.block_size);
        println!("block_count: {}", output.block_count);
        println!("inode_count: {}", output.inode_count);
        println!("bitmap_address: {}", output.bitmap_address);
        println!("inode_table_address: {}", output.inode_table_address);
        println!("root_dir_inode: {}", output.root_dir_inode);
    }

    Ok(())
}

fn repl() -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut fs: Option<Filesystem> = None;
    let mut line = String::new();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        if matches!(words[0], "exit" | "quit") {
            break;
        }
        if let Err(error) = dispatch(&mut fs, &words) {
            eprintln!("error: {error:#}");
        }
    }

    if fs.is_some() {
        eprintln!("warning: volume still mounted; unsaved changes were not flushed");
    }
    println!("bye!");
    Ok(())
}

fn mounted(fs: &mut Option<Filesystem>) -> Result<&mut Filesystem> {
    fs.as_mut().ok_or_else(|| FsError::NotMounted.into())
}

fn dispatch(fs: &mut Option<Filesystem>, words: &[&str]) -> Result<()> {
    match words[0] {
        "newfs" => {
            if !(2..=5).contains(&words.len()) {
                bail!("usage: newfs <filename> [block_count] [block_size] [inode_count]");
            }
            let block_count = match words.get(2) {
                Some(w) => w.parse().context("block_count must be a number")?,
                None => DEFAULT_BLOCK_COUNT,
            };
            let block_size = match words.get(3) {
                Some(w) => w.parse().context("block_size must be a number")?,
                None => DEFAULT_BLOCK_SIZE,
            };
            let inode_count = match words.get(4) {
                Some(w) => w.parse().context("inode_count must be a number")?,
                None => DEFAULT_INODE_COUNT,
            };
            Filesystem::create(words[1], block_count, block_size, inode_count)?;
            println!("created {}", words[1]);
        }
        "mount" => {
            if words.len() != 2 {
                bail!("usage: mount <filename>");
            }
            if fs.is_some() {
                bail!("a volume is already mounted; unmount it first");
            }
            *fs = Some(Filesystem::mount(words[1])?);
            println!("mounted {}", words[1]);
        }
        "unmount" => {
            if words.len() != 1 {
                bail!("usage: unmount");
            }
            let Some(mounted) = fs.take() else {
                bail!(FsError::NotMounted);
            };
            let path = mounted.image_path().display().to_string();
            mounted.unmount()?;
            println!("saved {path}");
        }
        "sync" => {
            if words.len() != 1 {
                bail!("usage: sync");
            }
            mounted(fs)?.sync()?;
        }
        "ls" | "dir" => {
            if words.len() > 2 {
                bail!("usage: ls [path]");
            }
            let rows = mounted(fs)?.list_dir(words.get(1).copied())?;
            for row in rows {
                println!(
                    "{} {:>5} {:>10} {}",
                    row.kind.symbol(),
                    row.inode,
                    row.length,
                    row.name
                );
            }
        }
        "cat" => {
            if words.len() != 2 {
                bail!("usage: cat <filename>");
            }
            let data = mounted(fs)?.read_file(words[1])?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        "write" => {
            if !(3..=4).contains(&words.len()) {
                bail!("usage: write <filename> <message> [offset]");
            }
            let offset = match words.get(3) {
                Some(w) => Some(w.parse().context("offset must be a number")?),
                None => None,
            };
            mounted(fs)?.write_file(words[1], words[2].as_bytes(), offset)?;
        }
        "mkdir" => {
            if words.len() != 2 {
                bail!("usage: mkdir <path>");
            }
            mounted(fs)?.make_dir(words[1])?;
        }
        "touch" => {
            if words.len() != 2 {
                bail!("usage: touch <filename>");
            }
            mounted(fs)?.make_file(words[1])?;
        }
        "cd" => {
            if words.len() != 2 {
                bail!("usage: cd <path>");
            }
            mounted(fs)?.change_dir(words[1])?;
        }
        "blockmap" => {
            if words.len() != 1 {
                bail!("usage: blockmap");
            }
            println!("{}", mounted(fs)?.render_block_map());
        }
        "alloc_block" => {
            if words.len() != 1 {
                bail!("usage: alloc_block");
            }
            let block = mounted(fs)?.alloc_block()?;
            println!("allocated block {block}");
        }
        "free_block" => {
            if words.len() != 2 {
                bail!("usage: free_block <n>");
            }
            let n = words[1].parse().context("block number must be a number")?;
            mounted(fs)?.free_block(BlockNumber(n))?;
        }
        "inode_map" => {
            if words.len() != 1 {
                bail!("usage: inode_map");
            }
            println!("{}", mounted(fs)?.render_inode_map());
        }
        "alloc_inode" => {
            if words.len() != 2 {
                bail!("usage: alloc_inode <f|d|s>");
            }
            let kind = parse_kind(words[1])?;
            let ino = mounted(fs)?.alloc_inode(kind)?;
            println!("allocated inode {ino}");
        }
        "free_inode" => {
            if words.len() != 2 {
                bail!("usage: free_inode <n>");
            }
            let n = words[1].parse().context("inode number must be a number")?;
            mounted(fs)?.free_inode(InodeNumber(n))?;
        }
        "echo" => {
            println!("{}", words[1..].join(" "));
        }
        "help" => {
            println!("commands: newfs mount unmount sync ls cat write mkdir touch cd");
            println!("          blockmap alloc_block free_block inode_map alloc_inode");
            println!("          free_inode echo help exit quit");
        }
        other => {
            bail!("unknown command {other}");
        }
    }
    Ok(())
}

fn parse_kind(word: &str) -> Result<InodeKind> {
    match word {
        "f" => Ok(InodeKind::File),
        "d" => Ok(InodeKind::Directory),
        "s" => Ok(InodeKind::Symlink),
        other => bail!("unknown inode kind {other:?} (expected f, d, or s)"),
    }
}
