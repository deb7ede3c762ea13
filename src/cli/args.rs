//! Argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{CacheStrategy, Config};

#[derive(Debug, Parser)]
#[command(name = "zvle", version, about = "Inspect and read files of VLE-compressed images")]
pub struct Cli {
    /// Debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Errors only.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the extents of a compressed file.
    Map {
        #[command(flatten)]
        image: ImageArgs,

        /// Resolve only these logical byte offsets.
        #[arg(long = "offset", value_name = "BYTES")]
        offsets: Vec<u64>,
    },
    /// Decompress a file to stdout or `--output`.
    Cat {
        #[command(flatten)]
        image: ImageArgs,

        /// Write here instead of stdout.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print the XXH64 of the contents instead of the contents.
        #[arg(long)]
        checksum: bool,

        /// Pages per read request.
        #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u64).range(1..=4096))]
        batch: u64,

        /// Managed-cache strategy for compressed pages.
        #[arg(long, value_enum, default_value_t = CacheArg::Readahead)]
        cache: CacheArg,

        /// Background decompression threads (0 = automatic).
        #[arg(long, default_value_t = 0)]
        workers: usize,

        /// Print pipeline counters to stderr when done.
        #[arg(long)]
        stats: bool,
    },
}

/// Where to find the file inside the image.
#[derive(Debug, Args)]
pub struct ImageArgs {
    /// Path to the image.
    pub image: PathBuf,

    /// Inode number of the file.
    #[arg(long)]
    pub nid: u64,

    /// Block address of the inode table.
    #[arg(long, default_value_t = 0)]
    pub meta_blkaddr: u64,

    /// log2 of the logical cluster size.
    #[arg(long, default_value_t = 12)]
    pub cluster_bits: u32,

    /// Read cluster type 3 as the compatibility extension.
    #[arg(long)]
    pub huawei_compat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheArg {
    Disabled,
    Readahead,
    Readaround,
}

impl From<CacheArg> for CacheStrategy {
    fn from(arg: CacheArg) -> Self {
        match arg {
            CacheArg::Disabled => CacheStrategy::Disabled,
            CacheArg::Readahead => CacheStrategy::Readahead,
            CacheArg::Readaround => CacheStrategy::Readaround,
        }
    }
}

impl ImageArgs {
    /// Engine configuration: environment defaults with these flags applied.
    pub fn config(&self) -> Config {
        Config::from_env().with_huawei_compat(self.huawei_compat)
    }
}
