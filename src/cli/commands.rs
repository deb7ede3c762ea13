//! Subcommand implementations.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use xxhash_rust::xxh64::Xxh64;

use crate::blockdev::FileDevice;
use crate::cli::args::{Cli, Command, ImageArgs};
use crate::config::{Config, PAGE_SIZE};
use crate::page::{Page, PageFrame};
use crate::sb::{Geometry, Inode, Superblock};
use crate::vle::Resolver;
use crate::zip::read_pages;

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Map { image, offsets } => run_map(&image, &offsets),
        Command::Cat { image, output, checksum, batch, cache, workers, stats } => {
            let config = image.config().with_cache_strategy(cache.into()).with_workers(workers);
            let (sb, inode) = open_image(&image, config)?;
            let res = run_cat(&sb, &inode, output.as_deref(), checksum, batch as usize);
            if stats {
                eprintln!("{}", sb.stats.snapshot());
            }
            res
        }
    }
}

fn open_image(args: &ImageArgs, config: Config) -> Result<(Arc<Superblock>, Inode)> {
    let device = FileDevice::open(&args.image)
        .with_context(|| format!("cannot open image {}", args.image.display()))?;
    let geometry = Geometry::new(args.meta_blkaddr, args.cluster_bits)
        .with_context(|| format!("unsupported cluster size 2^{}", args.cluster_bits))?;
    let sb = Superblock::new(Arc::new(device), geometry, config).context("cannot set up decompression engine")?;
    let inode = sb
        .read_inode(args.nid)
        .with_context(|| format!("cannot load inode {}", args.nid))?;
    info!(nid = inode.nid, size = inode.size, "opened inode");
    Ok((sb, inode))
}

fn run_map(args: &ImageArgs, offsets: &[u64]) -> Result<()> {
    let (sb, inode) = open_image(args, args.config())?;
    let mut resolver = Resolver::new(&sb, &inode);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{:>12} {:>10} {:>12} {:>8}  kind", "logical", "length", "physical", "plen")?;

    let mut show = |offset: u64| -> Result<Option<u64>> {
        let map = resolver
            .resolve(offset)
            .with_context(|| format!("cannot resolve offset {offset}"))?;
        if !map.is_mapped() {
            return Ok(None);
        }
        let kind = if map.is_zipped() { "lz4" } else { "plain" };
        writeln!(out, "{:>12} {:>10} {:>12} {:>8}  {}", map.m_la, map.m_llen, map.m_pa, map.m_plen, kind)?;
        Ok(Some(map.end()))
    };

    if offsets.is_empty() {
        let mut offset = 0;
        while let Some(next) = show(offset)? {
            offset = next;
        }
    } else {
        for &offset in offsets {
            if show(offset)?.is_none() {
                bail!("offset {offset} is beyond the end of inode {}", inode.nid);
            }
        }
    }
    Ok(())
}

fn run_cat(sb: &Arc<Superblock>, inode: &Inode, output: Option<&Path>, checksum: bool, batch: usize) -> Result<()> {
    let mut hasher = Xxh64::new(0);
    let mut sink: Box<dyn Write> = match output {
        Some(path) if !checksum => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        )),
        _ => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut remaining = inode.size;
    let nr_pages = inode.nr_pages();
    let mut index = 0;
    while index < nr_pages {
        let count = (nr_pages - index).min(batch as u64);
        let pages = (index..index + count)
            .map(|i| PageFrame::new_file_page(inode.nid, i))
            .collect::<crate::error::Result<Vec<Page>>>()
            .context("cannot allocate file pages")?;
        let outcome = read_pages(sb, inode, &pages);
        if outcome.failed > 0 {
            bail!("{} of {} pages starting at index {} failed to read", outcome.failed, count, index);
        }
        for page in &pages {
            let take = remaining.min(PAGE_SIZE as u64) as usize;
            let data = page.read();
            if checksum {
                hasher.update(&data[..take]);
            } else {
                sink.write_all(&data[..take])?;
            }
            remaining -= take as u64;
        }
        index += count;
    }

    if checksum {
        writeln!(sink, "{:016x}", hasher.digest())?;
    }
    sink.flush()?;
    Ok(())
}
