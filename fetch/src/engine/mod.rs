//! The contract between the orchestrator and a download engine.
//!
//! The orchestrator only ever talks to an engine through these traits: build
//! a client, add one torrent, wait for its metadata, start the transfer,
//! sample byte counts, wait for completion and close. `swarm` is the
//! production implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fetch_core::RateLimiterSpec;

pub mod error;
#[cfg(test)]
pub(crate) mod scripted;
pub mod swarm;

pub use error::EngineError;

/// Everything an engine needs to build a client.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where payload files are written.
    pub data_dir: PathBuf,
    /// Enables wire-level tracing inside the engine.
    pub debug: bool,
    /// Peer listener port; 0 lets the OS pick a free one.
    pub listen_port: u16,
    pub download_limit: RateLimiterSpec,
    pub upload_limit: RateLimiterSpec,
}

/// Builds engine clients.
#[async_trait]
pub trait Engine: Send + Sync {
    type Client: EngineClient;

    /// Allocates the client's resources (listener, data directory).
    async fn new_client(&self, config: EngineConfig) -> Result<Self::Client, EngineError>;
}

/// A running engine instance. All methods take `&self` so the client can be
/// shared with the background completion waiter.
#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    type Handle: TransferHandle;

    async fn add_magnet(&self, uri: &str) -> Result<Self::Handle, EngineError>;

    async fn add_torrent_file(&self, path: &Path) -> Result<Self::Handle, EngineError>;

    /// Resolves `true` once every transfer has completed, `false` if a
    /// transfer failed or the client was closed first.
    async fn wait_all(&self) -> bool;

    /// Releases every resource held by the client. Idempotent.
    async fn close(&self);
}

/// One torrent inside a client.
#[async_trait]
pub trait TransferHandle: Send + Sync + 'static {
    /// Resolves once the piece layout and total size are known. Cancel safe.
    async fn metadata_ready(&self);

    /// Marks every piece as wanted and starts requesting them.
    fn download_all(&self);

    /// Verified bytes written so far. Never decreases.
    fn bytes_completed(&self) -> Result<u64, EngineError>;

    /// Bytes still to be downloaded; zero while metadata is unknown.
    fn bytes_missing(&self) -> Result<u64, EngineError>;
}
