//! Session bootstrap: one engine client, one transfer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fetch_core::RateLimiterSpec;
use tracing::debug;

use crate::config::RunConfiguration;
use crate::engine::{Engine, EngineClient, EngineConfig};
use crate::error::{BootstrapError, SourceFailure};

/// Which source the transfer was added from.
#[derive(Debug)]
pub enum ResolvedSource {
    Magnet,
    /// The file was used because the magnet link was absent or rejected.
    File { magnet_failure: SourceFailure },
}

/// Owns the engine client and its single transfer until closed.
pub struct Session<C: EngineClient> {
    client: Arc<C>,
    handle: C::Handle,
    source: ResolvedSource,
    closed: AtomicBool,
}

impl<C: EngineClient> Session<C> {
    fn new(client: C, handle: C::Handle, source: ResolvedSource) -> Self {
        Self {
            client: Arc::new(client),
            handle,
            source,
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &C::Handle {
        &self.handle
    }

    /// Shared so the completion waiter can run in its own task.
    pub fn client(&self) -> Arc<C> {
        self.client.clone()
    }

    pub fn source(&self) -> &ResolvedSource {
        &self.source
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the client on the first call. Returns whether this call did it.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.client.close().await;
        debug!("session closed");
        true
    }
}

/// Starts the engine client and adds the torrent, trying the magnet link
/// before the torrent file. When neither works the client is closed and both
/// causes are returned.
pub async fn bootstrap<E: Engine>(
    engine: &E,
    config: &RunConfiguration,
    download_limit: RateLimiterSpec,
    upload_limit: RateLimiterSpec,
) -> Result<Session<E::Client>, BootstrapError> {
    let client = engine
        .new_client(EngineConfig {
            data_dir: config.data_dir.clone(),
            debug: config.debug,
            listen_port: config.listen_port.port(),
            download_limit,
            upload_limit,
        })
        .await
        .map_err(BootstrapError::Client)?;

    let magnet_failure = match &config.source.magnet {
        Some(uri) => match client.add_magnet(uri).await {
            Ok(handle) => return Ok(Session::new(client, handle, ResolvedSource::Magnet)),
            Err(e) => SourceFailure::Rejected(e),
        },
        None => SourceFailure::NotProvided,
    };

    let file_failure = match &config.source.file {
        Some(path) => match client.add_torrent_file(path).await {
            Ok(handle) => {
                let source = ResolvedSource::File { magnet_failure };
                return Ok(Session::new(client, handle, source));
            }
            Err(e) => SourceFailure::Rejected(e),
        },
        None => SourceFailure::NotProvided,
    };

    client.close().await;
    Err(BootstrapError::NoUsableSource {
        magnet: magnet_failure,
        file: file_failure,
    })
}
