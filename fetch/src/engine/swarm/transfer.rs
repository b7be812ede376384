//! Shared state of one torrent: metadata, piece table and completion.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fetch_core::Info;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore, broadcast, mpsc, watch};
use tracing::{debug, error, info};

use super::peer::Bitfield;
use super::storage::Storage;
use crate::engine::EngineError;

/// Concurrent peer connections per transfer, inbound and outbound together.
pub(crate) const MAX_PEERS: usize = 50;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PieceStatus {
    Missing,
    InProgress,
    Have,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TransferState {
    Running,
    Complete,
    Failed,
}

/// Everything that becomes known once the info dictionary is.
pub(crate) struct Payload {
    pub info: Info,
    pub info_bytes: Vec<u8>,
    pub storage: Storage,
}

pub(crate) struct Transfer {
    pub info_hash: [u8; 20],
    pub name: String,
    pub trackers: Vec<String>,
    data_dir: PathBuf,
    payload: OnceCell<Arc<Payload>>,
    metadata_ready: watch::Sender<bool>,
    pieces: Mutex<Vec<PieceStatus>>,
    completed: AtomicU64,
    uploaded: AtomicU64,
    wanted: watch::Sender<bool>,
    state: watch::Sender<TransferState>,
    haves: broadcast::Sender<u32>,
    discovered: mpsc::UnboundedSender<SocketAddr>,
    slots: Arc<Semaphore>,
    connected: Mutex<HashSet<SocketAddr>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transfer {
    /// Returns the transfer and the stream of peer addresses found for it.
    pub(crate) fn new(
        info_hash: [u8; 20],
        name: String,
        trackers: Vec<String>,
        data_dir: PathBuf,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SocketAddr>) {
        let (discovered, peers) = mpsc::unbounded_channel();
        let transfer = Arc::new(Self {
            info_hash,
            name,
            trackers,
            data_dir,
            payload: OnceCell::new(),
            metadata_ready: watch::channel(false).0,
            pieces: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            wanted: watch::channel(false).0,
            state: watch::channel(TransferState::Running).0,
            haves: broadcast::channel(256).0,
            discovered,
            slots: Arc::new(Semaphore::new(MAX_PEERS)),
            connected: Mutex::new(HashSet::new()),
        });
        (transfer, peers)
    }

    pub(crate) fn hex_hash(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Parses the info dictionary and opens storage for it. Only the first
    /// successful call has any effect.
    pub(crate) async fn install_metadata(&self, info_bytes: Vec<u8>) -> Result<(), EngineError> {
        let mut installed = false;
        let flag = &mut installed;
        let payload = self
            .payload
            .get_or_try_init(|| async move {
                let info = Info::from_bytes(&info_bytes).map_err(EngineError::Metadata)?;
                let storage = Storage::open(&self.data_dir, &info).await?;
                let pieces = if storage.has_existing_data() {
                    self.recheck(&info, &storage).await
                } else {
                    vec![PieceStatus::Missing; info.piece_count()]
                };
                *lock(&self.pieces) = pieces;
                *flag = true;
                Ok::<_, EngineError>(Arc::new(Payload {
                    info,
                    info_bytes,
                    storage,
                }))
            })
            .await?;

        if installed {
            info!(
                torrent = %self.name,
                size = payload.info.total_length(),
                pieces = payload.info.piece_count(),
                files = payload.info.files.len(),
                "metadata ready"
            );
            self.metadata_ready.send_replace(true);
            self.check_complete();
        }
        Ok(())
    }

    /// Hashes whatever is already on disk; matching pieces count as downloaded.
    async fn recheck(&self, info: &Info, storage: &Storage) -> Vec<PieceStatus> {
        let mut pieces = Vec::with_capacity(info.piece_count());
        for (index, expected) in info.pieces.iter().enumerate() {
            let size = info.piece_size(index);
            let valid = match storage.read_block(index as u32, 0, size as u32).await {
                Ok(data) => Sha1::digest(&data).as_slice() == expected,
                Err(_) => false,
            };
            if valid {
                self.completed.fetch_add(size, Ordering::Relaxed);
                pieces.push(PieceStatus::Have);
            } else {
                pieces.push(PieceStatus::Missing);
            }
        }
        info!(
            torrent = %self.name,
            have = pieces.iter().filter(|s| **s == PieceStatus::Have).count(),
            pieces = pieces.len(),
            "checked existing data"
        );
        pieces
    }

    pub(crate) fn payload(&self) -> Option<&Arc<Payload>> {
        self.payload.get()
    }

    /// Resolves once metadata is installed. Cancel safe.
    pub(crate) async fn wait_metadata(&self) {
        let mut ready = self.metadata_ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub(crate) fn metadata_watch(&self) -> watch::Receiver<bool> {
        self.metadata_ready.subscribe()
    }

    pub(crate) fn download_all(&self) {
        if !self.wanted.send_replace(true) {
            info!(torrent = %self.name, "downloading all pieces");
        }
        self.check_complete();
    }

    pub(crate) fn is_wanted(&self) -> bool {
        *self.wanted.borrow()
    }

    pub(crate) fn wanted_watch(&self) -> watch::Receiver<bool> {
        self.wanted.subscribe()
    }

    pub(crate) fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    pub(crate) fn bytes_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_missing(&self) -> u64 {
        self.payload().map_or(0, |p| {
            p.info.total_length().saturating_sub(self.bytes_completed())
        })
    }

    pub(crate) fn bytes_uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub(crate) fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn has_piece(&self, index: u32) -> bool {
        lock(&self.pieces).get(index as usize) == Some(&PieceStatus::Have)
    }

    /// Our own bitfield, if we have anything to advertise.
    pub(crate) fn bitfield(&self) -> Option<Bitfield> {
        let pieces = lock(&self.pieces);
        if !pieces.contains(&PieceStatus::Have) {
            return None;
        }
        let mut bits = Bitfield::with_pieces(pieces.len());
        for (i, _) in pieces
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == PieceStatus::Have)
        {
            bits.set(i as u32);
        }
        Some(bits)
    }

    /// Whether `peer` has any piece we still need.
    pub(crate) fn wants_from(&self, peer: &Bitfield) -> bool {
        self.is_wanted()
            && lock(&self.pieces)
                .iter()
                .enumerate()
                .any(|(i, s)| *s != PieceStatus::Have && peer.has(i as u32))
    }

    /// Claims a random missing piece that `peer` has.
    pub(crate) fn pick_piece(&self, peer: &Bitfield) -> Option<u32> {
        if !self.is_wanted() {
            return None;
        }
        let mut pieces = lock(&self.pieces);
        let available: Vec<usize> = pieces
            .iter()
            .enumerate()
            .filter(|(i, s)| **s == PieceStatus::Missing && peer.has(*i as u32))
            .map(|(i, _)| i)
            .collect();
        if available.is_empty() {
            return None;
        }
        let chosen = available[rand::rng().random_range(0..available.len())];
        pieces[chosen] = PieceStatus::InProgress;
        Some(chosen as u32)
    }

    /// Returns an unfinished piece to the pool.
    pub(crate) fn release_piece(&self, index: u32) {
        if let Some(status) = lock(&self.pieces).get_mut(index as usize) {
            if *status == PieceStatus::InProgress {
                *status = PieceStatus::Missing;
            }
        }
    }

    /// Verifies and stores a downloaded piece. `Ok(false)` means the data did
    /// not match its hash; a storage failure fails the whole transfer.
    pub(crate) async fn complete_piece(&self, index: u32, data: Vec<u8>) -> Result<bool, EngineError> {
        let Some(payload) = self.payload() else {
            return Ok(false);
        };
        let matches = payload
            .info
            .pieces
            .get(index as usize)
            .is_some_and(|expected| Sha1::digest(&data).as_slice() == expected);
        if !matches {
            self.release_piece(index);
            return Ok(false);
        }

        if let Err(e) = payload.storage.write_piece(index, &data).await {
            self.release_piece(index);
            self.fail(&e);
            return Err(e.into());
        }

        {
            let mut pieces = lock(&self.pieces);
            if pieces[index as usize] == PieceStatus::Have {
                return Ok(true);
            }
            pieces[index as usize] = PieceStatus::Have;
        }
        let total = self.completed.fetch_add(data.len() as u64, Ordering::Relaxed) + data.len() as u64;
        debug!(torrent = %self.name, piece = index, completed = total, "piece verified");
        let _ = self.haves.send(index);
        self.check_complete();
        Ok(true)
    }

    fn check_complete(&self) {
        if !self.is_wanted() || self.payload().is_none() {
            return;
        }
        if lock(&self.pieces).iter().any(|s| *s != PieceStatus::Have) {
            return;
        }
        let finished = self.state.send_if_modified(|state| {
            let running = *state == TransferState::Running;
            if running {
                *state = TransferState::Complete;
            }
            running
        });
        if finished {
            info!(torrent = %self.name, "transfer complete");
        }
    }

    pub(crate) fn fail(&self, cause: &dyn std::error::Error) {
        let failed = self.state.send_if_modified(|state| {
            let running = *state == TransferState::Running;
            if running {
                *state = TransferState::Failed;
            }
            running
        });
        if failed {
            error!(torrent = %self.name, error = %cause, "transfer failed");
        }
    }

    pub(crate) fn subscribe_haves(&self) -> broadcast::Receiver<u32> {
        self.haves.subscribe()
    }

    /// Queues a candidate peer for the connector.
    pub(crate) fn discovered(&self, addr: SocketAddr) {
        let _ = self.discovered.send(addr);
    }

    /// Reserves a connection slot for `addr` unless it is already connected
    /// or the transfer is at its peer limit.
    pub(crate) fn try_admit(self: &Arc<Self>, addr: SocketAddr) -> Option<PeerSlot> {
        let mut connected = lock(&self.connected);
        if connected.contains(&addr) {
            return None;
        }
        let permit = self.slots.clone().try_acquire_owned().ok()?;
        connected.insert(addr);
        Some(PeerSlot {
            transfer: self.clone(),
            addr,
            _permit: permit,
        })
    }
}

/// A held connection slot; frees itself on drop.
pub(crate) struct PeerSlot {
    transfer: Arc<Transfer>,
    addr: SocketAddr,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        lock(&self.transfer.connected).remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetch_core::bencoding::Bencode;
    use std::collections::BTreeMap;

    /// Info dictionary for a single file split into 4-byte pieces.
    fn info_bytes(name: &str, payload: &[u8]) -> Vec<u8> {
        let hashes: Vec<u8> = payload
            .chunks(4)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Bencode::Bytes(name.as_bytes().to_vec()));
        info.insert(b"length".to_vec(), Bencode::Int(payload.len() as i64));
        info.insert(b"piece length".to_vec(), Bencode::Int(4));
        info.insert(b"pieces".to_vec(), Bencode::Bytes(hashes));
        Bencode::Dict(info).encode()
    }

    fn all_pieces(count: u32) -> Bitfield {
        let mut bits = Bitfield::with_pieces(count as usize);
        (0..count).for_each(|i| bits.set(i));
        bits
    }

    async fn transfer_with(payload: &[u8]) -> (Arc<Transfer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (transfer, _peers) =
            Transfer::new([0; 20], "t".into(), Vec::new(), dir.path().to_path_buf());
        transfer
            .install_metadata(info_bytes("t.bin", payload))
            .await
            .unwrap();
        (transfer, dir)
    }

    #[tokio::test]
    async fn test_metadata_install_is_first_wins() {
        let (transfer, _dir) = transfer_with(b"abcdefghij").await;
        assert_eq!(transfer.bytes_missing(), 10);
        transfer
            .install_metadata(info_bytes("other", b"zz"))
            .await
            .unwrap();
        assert_eq!(transfer.payload().unwrap().info.name, "t.bin");
        tokio::time::timeout(std::time::Duration::from_secs(1), transfer.wait_metadata())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_metadata_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (transfer, _peers) =
            Transfer::new([0; 20], "t".into(), Vec::new(), dir.path().to_path_buf());
        assert!(matches!(
            transfer.install_metadata(b"not bencode".to_vec()).await,
            Err(EngineError::Metadata(_))
        ));
        assert!(transfer.payload().is_none());
        assert_eq!(transfer.bytes_missing(), 0);
    }

    #[tokio::test]
    async fn test_nothing_is_picked_until_wanted() {
        let (transfer, _dir) = transfer_with(b"abcdefgh").await;
        let peer = all_pieces(2);
        assert_eq!(transfer.pick_piece(&peer), None);
        assert!(!transfer.wants_from(&peer));
        transfer.download_all();
        assert!(transfer.wants_from(&peer));
        let first = transfer.pick_piece(&peer).unwrap();
        let second = transfer.pick_piece(&peer).unwrap();
        assert_ne!(first, second);
        assert_eq!(transfer.pick_piece(&peer), None);
        transfer.release_piece(first);
        assert_eq!(transfer.pick_piece(&peer), Some(first));
    }

    #[tokio::test]
    async fn test_pieces_complete_the_transfer() {
        let (transfer, dir) = transfer_with(b"abcdefghij").await;
        let mut haves = transfer.subscribe_haves();
        transfer.download_all();
        let peer = all_pieces(3);
        while let Some(index) = transfer.pick_piece(&peer) {
            let start = index as usize * 4;
            let data = b"abcdefghij"[start..(start + 4).min(10)].to_vec();
            assert!(transfer.complete_piece(index, data).await.unwrap());
            assert_eq!(haves.recv().await.unwrap(), index);
        }
        assert_eq!(transfer.bytes_completed(), 10);
        assert_eq!(transfer.bytes_missing(), 0);
        assert_eq!(transfer.state(), TransferState::Complete);
        assert_eq!(std::fs::read(dir.path().join("t.bin")).unwrap(), b"abcdefghij");
        assert_eq!(transfer.bitfield().unwrap().as_bytes(), &[0xe0]);
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_released() {
        let (transfer, _dir) = transfer_with(b"abcd").await;
        transfer.download_all();
        let index = transfer.pick_piece(&all_pieces(1)).unwrap();
        assert!(!transfer.complete_piece(index, b"xxxx".to_vec()).await.unwrap());
        assert_eq!(transfer.bytes_completed(), 0);
        assert_eq!(transfer.pick_piece(&all_pieces(1)), Some(index));
        assert_eq!(transfer.state(), TransferState::Running);
    }

    #[tokio::test]
    async fn test_existing_data_is_rechecked() {
        let dir = tempfile::tempdir().unwrap();
        // Second piece on disk is corrupt.
        std::fs::write(dir.path().join("t.bin"), b"abcdXXXXij").unwrap();
        let (transfer, _peers) =
            Transfer::new([0; 20], "t".into(), Vec::new(), dir.path().to_path_buf());
        transfer
            .install_metadata(info_bytes("t.bin", b"abcdefghij"))
            .await
            .unwrap();
        assert_eq!(transfer.bytes_completed(), 6);
        assert_eq!(transfer.bytes_missing(), 4);
        assert!(transfer.has_piece(0) && transfer.has_piece(2));
        assert!(!transfer.has_piece(1));
    }

    #[tokio::test]
    async fn test_empty_payload_completes_when_wanted() {
        let (transfer, _dir) = transfer_with(b"").await;
        assert_eq!(transfer.state(), TransferState::Running);
        transfer.download_all();
        assert_eq!(transfer.state(), TransferState::Complete);
    }

    #[test]
    fn test_admission_limits() {
        let (transfer, _peers) = Transfer::new([0; 20], "t".into(), Vec::new(), PathBuf::new());
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let slot = transfer.try_admit(addr).unwrap();
        assert!(transfer.try_admit(addr).is_none(), "duplicate address");
        drop(slot);
        assert!(transfer.try_admit(addr).is_some());

        let held: Vec<_> = (0..MAX_PEERS as u16)
            .filter_map(|port| transfer.try_admit(SocketAddr::from(([10, 0, 0, 2], port))))
            .collect();
        assert_eq!(held.len(), MAX_PEERS);
        assert!(transfer.try_admit("10.0.0.3:1".parse().unwrap()).is_none());
    }
}
