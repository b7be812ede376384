//! The production engine: a small BitTorrent client.
//!
//! One client owns a TCP listener, the bandwidth throttles and any number of
//! transfers. Each transfer gets a tracker announce task and a connector
//! task that dials discovered peers; every connection, inbound or outbound,
//! runs a [`worker`] session.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fetch_core::{CoreError, MagnetLink, Metainfo};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use super::{Engine, EngineClient, EngineConfig, EngineError, TransferHandle};
use peer::{Handshake, PeerConnection, PeerError};
use throttle::Throttle;
use transfer::{Transfer, TransferState};

mod discovery;
mod extension;
mod peer;
pub mod storage;
mod throttle;
mod transfer;
mod worker;

const PEER_ID_PREFIX: &[u8; 8] = b"-TF0100-";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::rng().fill(&mut id[8..]);
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    id
}

/// Client-wide settings every peer session reads.
pub(crate) struct SwarmContext {
    pub peer_id: [u8; 20],
    pub listen_port: u16,
    pub debug: bool,
    pub download: Throttle,
    pub upload: Throttle,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SwarmEngine;

#[async_trait]
impl Engine for SwarmEngine {
    type Client = SwarmClient;

    async fn new_client(&self, config: EngineConfig) -> Result<SwarmClient, EngineError> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|source| EngineError::DataDir {
                path: config.data_dir.clone(),
                source,
            })?;

        let listen = |source| EngineError::Listen {
            port: config.listen_port,
            source,
        };
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))
            .await
            .map_err(listen)?;
        let listen_port = listener.local_addr().map_err(listen)?.port();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(SwarmContext {
            peer_id: generate_peer_id(),
            listen_port,
            debug: config.debug,
            download: Throttle::new(&config.download_limit),
            upload: Throttle::new(&config.upload_limit),
            shutdown: shutdown_rx,
        });
        info!(
            port = listen_port,
            data_dir = %config.data_dir.display(),
            download_limit = ?config.download_limit,
            upload_limit = ?config.upload_limit,
            "engine client started"
        );

        let shared = Arc::new(ClientShared {
            data_dir: config.data_dir,
            ctx,
            transfers: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown,
            closed: AtomicBool::new(false),
        });
        shared.spawn(accept_loop(listener, shared.clone()));
        Ok(SwarmClient { shared })
    }
}

struct ClientShared {
    data_dir: PathBuf,
    ctx: Arc<SwarmContext>,
    transfers: Mutex<Vec<Arc<Transfer>>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl ClientShared {
    fn find(&self, info_hash: &[u8; 20]) -> Option<Arc<Transfer>> {
        lock(&self.transfers)
            .iter()
            .find(|t| t.info_hash == *info_hash)
            .cloned()
    }

    /// Tracks a client task, reaping any that already finished.
    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }
}

pub struct SwarmClient {
    shared: Arc<ClientShared>,
}

impl SwarmClient {
    /// Port the peer listener ended up on.
    pub fn listen_port(&self) -> u16 {
        self.shared.ctx.listen_port
    }

    fn add_transfer(
        &self,
        info_hash: [u8; 20],
        name: String,
        trackers: Vec<String>,
    ) -> Result<Arc<Transfer>, EngineError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let mut transfers = lock(&self.shared.transfers);
        if transfers.iter().any(|t| t.info_hash == info_hash) {
            return Err(EngineError::Duplicate {
                info_hash: hex::encode(info_hash),
            });
        }
        let (transfer, peers) =
            Transfer::new(info_hash, name, trackers, self.shared.data_dir.clone());
        transfers.push(transfer.clone());
        drop(transfers);

        info!(torrent = %transfer.name, info_hash = %transfer.hex_hash(), "transfer added");
        self.shared.spawn(discovery::announce_loop(
            transfer.clone(),
            self.shared.ctx.clone(),
        ));
        self.shared
            .spawn(connect_loop(transfer.clone(), self.shared.ctx.clone(), peers));
        Ok(transfer)
    }

    fn remove_transfer(&self, info_hash: &[u8; 20]) {
        lock(&self.shared.transfers).retain(|t| t.info_hash != *info_hash);
    }
}

impl Drop for SwarmClient {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

#[async_trait]
impl EngineClient for SwarmClient {
    type Handle = SwarmHandle;

    async fn add_magnet(&self, uri: &str) -> Result<SwarmHandle, EngineError> {
        let link = MagnetLink::parse(uri).map_err(EngineError::Magnet)?;
        let name = link
            .display_name
            .clone()
            .unwrap_or_else(|| hex::encode(link.info_hash));
        let transfer = self.add_transfer(link.info_hash, name, link.trackers)?;
        Ok(SwarmHandle { transfer })
    }

    async fn add_torrent_file(&self, path: &Path) -> Result<SwarmHandle, EngineError> {
        let rejected = |source| EngineError::TorrentFile {
            path: path.to_path_buf(),
            source,
        };
        let raw = tokio::fs::read(path).await.map_err(|source| {
            rejected(CoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        })?;
        let metainfo = Metainfo::from_bytes(&raw).map_err(rejected)?;
        let trackers = metainfo.trackers();

        let transfer = self.add_transfer(metainfo.info_hash, metainfo.info.name.clone(), trackers)?;
        if let Err(e) = transfer.install_metadata(metainfo.info_bytes).await {
            self.remove_transfer(&transfer.info_hash);
            return Err(e);
        }
        Ok(SwarmHandle { transfer })
    }

    async fn wait_all(&self) -> bool {
        let transfers = lock(&self.shared.transfers).clone();
        let mut shutdown = self.shared.ctx.shutdown.clone();
        for transfer in transfers {
            let mut states = transfer.state_watch();
            let finished = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return false,
                state = states.wait_for(|s| *s != TransferState::Running) => state.map(|s| *s),
            };
            if !matches!(finished, Ok(TransferState::Complete)) {
                return false;
            }
        }
        !self.shared.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.send_replace(true);
        lock(&self.shared.tasks).abort_all();
        info!("engine client closed");
    }
}

pub struct SwarmHandle {
    transfer: Arc<Transfer>,
}

#[async_trait]
impl TransferHandle for SwarmHandle {
    async fn metadata_ready(&self) {
        self.transfer.wait_metadata().await;
    }

    fn download_all(&self) {
        self.transfer.download_all();
    }

    fn bytes_completed(&self) -> Result<u64, EngineError> {
        Ok(self.transfer.bytes_completed())
    }

    fn bytes_missing(&self) -> Result<u64, EngineError> {
        Ok(self.transfer.bytes_missing())
    }
}

/// Dials every discovered address while the transfer has free peer slots.
async fn connect_loop(
    transfer: Arc<Transfer>,
    ctx: Arc<SwarmContext>,
    mut peers: mpsc::UnboundedReceiver<SocketAddr>,
) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let addr = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            addr = peers.recv() => match addr {
                Some(addr) => addr,
                None => return,
            },
        };
        if addr.port() == 0 || (addr.ip().is_loopback() && addr.port() == ctx.listen_port) {
            continue;
        }
        let Some(slot) = transfer.try_admit(addr) else {
            continue;
        };
        let transfer = transfer.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match PeerConnection::connect(addr, transfer.info_hash, ctx.peer_id).await {
                Ok(conn) => worker::run(conn, transfer, ctx, slot).await,
                Err(e) => trace!(%addr, error = %e, "connect failed"),
            }
        });
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ClientShared>) {
    let mut shutdown = shared.ctx.shutdown.clone();
    loop {
        let (stream, addr) = tokio::select! {
            _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_inbound(stream, addr, &shared).await {
                trace!(%addr, error = %e, "inbound peer dropped");
            }
        });
    }
}

async fn serve_inbound(
    mut stream: TcpStream,
    addr: SocketAddr,
    shared: &ClientShared,
) -> Result<(), PeerError> {
    let remote = peer::read_handshake(&mut stream).await?;
    let transfer = shared
        .find(&remote.info_hash)
        .ok_or(PeerError::Handshake("unknown info hash"))?;
    let slot = transfer
        .try_admit(addr)
        .ok_or(PeerError::Handshake("no free peer slot"))?;
    peer::write_handshake(
        &mut stream,
        &Handshake::new(transfer.info_hash, shared.ctx.peer_id),
    )
    .await?;
    let conn = PeerConnection::established(stream, addr, &remote);
    worker::run(conn, transfer, shared.ctx.clone(), slot).await;
    Ok(())
}

#[cfg(test)]
mod tests;
