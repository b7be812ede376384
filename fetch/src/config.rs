//! The immutable run configuration, resolved once from the command line.

use std::path::PathBuf;

use thiserror::Error;

use crate::cli::Args;

/// Appended to the home directory when `--dir` is not given.
pub const DEFAULT_SUBDIR: &str = "Downloads";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the home directory; pass --dir")]
    NoHomeDir,
}

/// How the peer listener picks its port. Always ephemeral so concurrent
/// runs never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenPort {
    #[default]
    Ephemeral,
}

impl ListenPort {
    pub fn port(self) -> u16 {
        match self {
            ListenPort::Ephemeral => 0,
        }
    }
}

/// Where the torrent comes from. The magnet link is tried first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorrentSource {
    pub magnet: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    pub data_dir: PathBuf,
    pub debug: bool,
    pub listen_port: ListenPort,
    /// Ceiling in Mbit/s; `None` when the flag was left at zero.
    pub download_limit: Option<f64>,
    pub upload_limit: Option<f64>,
    pub source: TorrentSource,
}

impl RunConfiguration {
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        Self::resolve_with_home(args, dirs::home_dir)
    }

    fn resolve_with_home(
        args: Args,
        home_dir: impl FnOnce() -> Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let data_dir = match args.dir.filter(|dir| !dir.as_os_str().is_empty()) {
            Some(dir) => dir,
            None => home_dir().ok_or(ConfigError::NoHomeDir)?.join(DEFAULT_SUBDIR),
        };
        let ceiling = |mbps: f64| (mbps != 0.0).then_some(mbps);

        Ok(Self {
            data_dir,
            debug: args.debug,
            listen_port: ListenPort::Ephemeral,
            download_limit: ceiling(args.download_bandwidth_limit),
            upload_limit: ceiling(args.upload_bandwidth_limit),
            source: TorrentSource {
                magnet: args.magnet.filter(|m| !m.trim().is_empty()),
                file: args.file.filter(|f| !f.as_os_str().is_empty()),
            },
        })
    }
}
