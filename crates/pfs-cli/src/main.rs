#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use pfs::{
    DirEntry, FileType, FormatOptions, FormatReport, InodeAttr, OpenOptions, PoolKind, PoolStatus,
    Superblock, Volume, VolumeStats,
};
use serde::Serialize;
use std::env;
use std::path::Path;

#[derive(Debug, Serialize)]
struct InspectOutput {
    reserved_sectors: u16,
    superblock: Superblock,
    block_pool: PoolStatus,
    inode_pool: PoolStatus,
    stats: VolumeStats,
}

#[derive(Debug, Serialize)]
struct MkfsOutput {
    options: FormatOptions,
    report: FormatReport,
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
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();
    let json = rest.iter().any(|arg| arg == "--json");
    let positional = positional_args(&rest);

    match command.as_str() {
        "mkfs" => {
            let Some(image) = positional.first() else {
                bail!("mkfs requires an image path");
            };
            let defaults = FormatOptions::default();
            let options = FormatOptions {
                reserved_sectors: match flag_value(&rest, "--reserved")? {
                    Some(value) => u16::try_from(value)
                        .with_context(|| format!("--reserved {value} does not fit 16 bits"))?,
                    None => defaults.reserved_sectors,
                },
                sector_count: flag_value(&rest, "--sectors")?.unwrap_or(defaults.sector_count),
                inode_limit: flag_value(&rest, "--inodes")?.unwrap_or(defaults.inode_limit),
            };
            mkfs(Path::new(image), &options, json)
        }
        "inspect" => {
            let Some(image) = positional.first() else {
                bail!("inspect requires an image path");
            };
            inspect(Path::new(image), json)
        }
        "ls" => {
            let Some(image) = positional.first() else {
                bail!("ls requires an image path");
            };
            let path = positional.get(1).map_or("/", String::as_str);
            list(Path::new(image), path, json)
        }
        "stat" => {
            let (Some(image), Some(path)) = (positional.first(), positional.get(1)) else {
                bail!("stat requires <image> <path>");
            };
            stat(Path::new(image), path, json)
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
    println!("pfs\n");
    println!("USAGE:");
    println!("  pfs mkfs <image> [--sectors N] [--inodes N] [--reserved N] [--json]");
    println!("  pfs inspect <image> [--json]");
    println!("  pfs ls <image> [path] [--json]");
    println!("  pfs stat <image> <path> [--json]");
}

/// Arguments that are neither flags nor flag values.
fn positional_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => {}
            "--sectors" | "--inodes" | "--reserved" => {
                iter.next();
            }
            _ => out.push(arg.clone()),
        }
    }
    out
}

fn flag_value(args: &[String], flag: &str) -> Result<Option<u64>> {
    let Some(pos) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    let Some(raw) = args.get(pos + 1) else {
        bail!("{flag} requires a value");
    };
    let value = raw
        .parse::<u64>()
        .with_context(|| format!("{flag} expects a number, got {raw:?}"))?;
    Ok(Some(value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn open_volume(image: &Path) -> Result<Volume> {
    Volume::open(image).with_context(|| format!("failed to open PFS image {}", image.display()))
}

fn mkfs(image: &Path, options: &FormatOptions, json: bool) -> Result<()> {
    if image.exists() {
        bail!("{} already exists; refusing to overwrite", image.display());
    }
    let (volume, report) = Volume::create_image(image, options, &OpenOptions::default())
        .with_context(|| format!("failed to format {}", image.display()))?;
    let stats = volume.statfs();

    if json {
        return print_json(&MkfsOutput {
            options: *options,
            report,
        });
    }
    println!("formatted {}", image.display());
    println!("sectors: {}", options.sector_count);
    println!("inode_limit: {}", options.inode_limit);
    println!("superblock_sector: {}", report.superblock_sector);
    println!("root_inode: {}", report.root_inode);
    println!("free_blocks: {}", stats.free_blocks);
    Ok(())
}

fn inspect(image: &Path, json: bool) -> Result<()> {
    let volume = open_volume(image)?;
    let output = InspectOutput {
        reserved_sectors: volume.boot_record().reserved_sectors,
        superblock: volume.superblock(),
        block_pool: volume.pool_status(PoolKind::Block),
        inode_pool: volume.pool_status(PoolKind::Inode),
        stats: volume.statfs(),
    };

    if json {
        return print_json(&output);
    }
    let sb = &output.superblock;
    println!("PFS Inspector");
    println!("reserved_sectors: {}", output.reserved_sectors);
    println!("volume_sectors: {}", sb.volume_sectors);
    println!("root_inode: {}", sb.root_inode);
    println!("inodes_used: {} / {}", sb.inodes_used, sb.inode_limit);
    println!("inode_area_sectors: {}", sb.inode_area_size);
    println!("block_sectors_used: {}", sb.block_sectors_used);
    println!(
        "block_pool: head={} cached={}",
        output.block_pool.head, output.block_pool.cached
    );
    println!(
        "inode_pool: head={} cached={}",
        output.inode_pool.head, output.inode_pool.cached
    );
    println!(
        "blocks: total={} free={}",
        output.stats.total_blocks, output.stats.free_blocks
    );
    Ok(())
}

fn kind_label(kind: FileType) -> &'static str {
    match kind {
        FileType::Directory => "dir",
        FileType::RegularFile => "file",
        FileType::Symlink => "symlink",
        FileType::BlockDevice => "blockdev",
        FileType::CharDevice => "chardev",
        FileType::Fifo => "fifo",
        FileType::Socket => "socket",
    }
}

fn list(image: &Path, path: &str, json: bool) -> Result<()> {
    let volume = open_volume(image)?;
    let ino = volume
        .resolve_path(path)
        .with_context(|| format!("cannot resolve {path}"))?;
    let entries: Vec<DirEntry> = volume
        .readdir(ino, 0)
        .with_context(|| format!("cannot list {path}"))?;

    if json {
        return print_json(&entries);
    }
    for entry in &entries {
        println!(
            "{:>8} {:<5} {}",
            entry.ino,
            kind_label(entry.kind),
            entry.name_str()
        );
    }
    Ok(())
}

fn stat(image: &Path, path: &str, json: bool) -> Result<()> {
    let volume = open_volume(image)?;
    let ino = volume
        .resolve_path(path)
        .with_context(|| format!("cannot resolve {path}"))?;
    let attr: InodeAttr = volume.getattr(ino)?;

    if json {
        return print_json(&attr);
    }
    println!("path: {path}");
    println!("inode: {}", attr.ino);
    println!("kind: {}", kind_label(attr.kind));
    println!("size: {}", attr.size);
    println!("sectors: {}", attr.blocks);
    println!("perm: {:o}", attr.perm);
    println!("nlink: {}", attr.nlink);
    println!("uid: {} gid: {}", attr.uid, attr.gid);
    Ok(())
}
