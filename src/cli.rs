mod help_text;

use crate::compression::CompressionFormat;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Maintain and verify trees of Manifest files
#[derive(Parser, Debug)]
#[command(name = "manitree", version, about, long_about = help_text::ROOT_LONG_ABOUT)]
pub struct Cli {
    /// Change to directory before operating
    #[arg(short = 'C', value_name = "DIRECTORY", global = true)]
    pub directory: Option<PathBuf>,

    /// Increase verbosity (-v for info, -vv for debug). Takes precedence over RUST_LOG.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level filter, e.g. "debug" or "manitree=trace". Takes precedence over RUST_LOG.
    #[arg(long, value_name = "LEVEL", global = true, conflicts_with = "verbose")]
    pub log_level: Option<String>,

    /// Configuration file (default: manitree.toml in the tree root)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Verify a tree against its Manifests
    #[command(long_about = help_text::VERIFY_LONG_ABOUT)]
    Verify {
        /// Paths to verify
        #[arg(value_name = "PATH", default_value = ".")]
        paths: Vec<PathBuf>,

        /// Report all differences instead of stopping at the first
        #[arg(short, long)]
        keep_going: bool,

        /// Fail unless the top-level Manifest carries a valid OpenPGP signature
        #[arg(long)]
        require_signed_manifest: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Update Manifests to match the tree
    #[command(long_about = help_text::UPDATE_LONG_ABOUT)]
    Update {
        /// Paths to update
        #[arg(value_name = "PATH", default_value = ".")]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        update: UpdateArgs,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Create a new Manifest tree
    #[command(long_about = help_text::CREATE_LONG_ABOUT)]
    Create {
        /// Root of the new tree
        #[arg(value_name = "PATH", default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        update: UpdateArgs,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Do not verify the OpenPGP signature of the top-level Manifest
    #[arg(long)]
    pub no_openpgp_verify: bool,

    /// Allow crossing filesystem boundaries
    #[arg(long)]
    pub allow_xdev: bool,

    /// Skip checksums of files not modified since the recorded timestamp
    #[arg(long)]
    pub incremental: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct UpdateArgs {
    /// Hashes for new and updated entries, space separated
    #[arg(long, value_name = "HASHES")]
    pub hashes: Option<String>,

    /// Repository layout profile (default, ebuild, old-ebuild)
    #[arg(long, value_name = "NAME")]
    pub profile: Option<String>,

    /// Record the current time in the top-level Manifest
    #[arg(long)]
    pub timestamp: bool,

    /// Compress nested Manifests at or above this size in bytes
    #[arg(long, value_name = "BYTES")]
    pub compress_watermark: Option<u64>,

    /// Compression format for nested Manifests
    #[arg(long, value_name = "FORMAT", value_parser = parse_compression_format)]
    pub compress_format: Option<CompressionFormat>,

    /// Clear-sign the top-level Manifest (default: keep it signed if it was)
    #[arg(long)]
    pub sign: bool,

    /// Write the top-level Manifest unsigned
    #[arg(long, conflicts_with = "sign")]
    pub no_sign: bool,

    /// OpenPGP key to sign with
    #[arg(long, value_name = "KEY")]
    pub openpgp_id: Option<String>,

    /// Rewrite all loaded Manifests, even unchanged ones
    #[arg(long)]
    pub force_rewrite: bool,

    /// Sort entries when writing Manifests
    #[arg(long)]
    pub sort: bool,
}

fn parse_compression_format(value: &str) -> Result<CompressionFormat, String> {
    CompressionFormat::from_name(value).ok_or_else(|| {
        format!("unknown compression format '{value}' (expected gz, bz2, lzma or xz)")
    })
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
