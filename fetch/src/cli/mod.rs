use std::path::PathBuf;

use clap::Parser;

/// Downloads one torrent from a magnet link or a .torrent file.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Destination directory [default: ~/Downloads]
    #[arg(long, env = "TDSFETCH_DIR")]
    pub dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, env = "TDSFETCH_DEBUG")]
    pub debug: bool,

    /// Magnet link to download
    #[arg(long)]
    pub magnet: Option<String>,

    /// Torrent file, used when the magnet link is absent or rejected
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Download ceiling in Mbit/s; zero or negative means unlimited
    #[arg(
        long = "download_bandwidth_limit",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    pub download_bandwidth_limit: f64,

    /// Upload ceiling in Mbit/s; zero or negative means unlimited
    #[arg(
        long = "upload_bandwidth_limit",
        default_value_t = 0.0,
        allow_negative_numbers = true
    )]
    pub upload_bandwidth_limit: f64,
}
