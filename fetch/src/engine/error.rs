use std::io;
use std::path::PathBuf;

use fetch_core::CoreError;
use thiserror::Error;

use super::swarm::storage::StorageError;

/// Failures reported by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The data directory could not be created or used.
    #[error("failed to prepare data directory {}", path.display())]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The peer listener could not be bound.
    #[error("failed to bind peer listener on port {port}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
    /// No magnet link was supplied or it could not be parsed.
    #[error("magnet link rejected")]
    Magnet(#[source] CoreError),
    /// The descriptor file could not be read or parsed.
    #[error("torrent file {} rejected", path.display())]
    TorrentFile {
        path: PathBuf,
        #[source]
        source: CoreError,
    },
    /// Metadata received from a peer did not parse.
    #[error("received metadata is invalid")]
    Metadata(#[source] CoreError),
    /// The same info hash was added twice.
    #[error("torrent {info_hash} is already part of this session")]
    Duplicate { info_hash: String },
    /// Piece storage failed.
    #[error("piece storage failed")]
    Storage(#[from] StorageError),
    /// The client was closed before the operation could run.
    #[error("engine client is closed")]
    Closed,
}
