//! One peer connection: choking state, piece requests, uploads and the
//! extension protocol.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use fetch_core::Info;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use super::SwarmContext;
use super::extension::{self, MetadataAssembly, MetadataMessage, PeerExtensions};
use super::peer::{BLOCK_SIZE, Bitfield, MAX_REQUEST, Message, PeerConnection, PeerError};
use super::transfer::{PeerSlot, Transfer};

/// Upper bound on piece indexes accepted before the piece count is known.
const MAX_UNKNOWN_PIECES: u32 = 1 << 20;

/// Runs a session until the peer leaves, misbehaves or the client shuts down.
pub(crate) async fn run(
    conn: PeerConnection,
    transfer: Arc<Transfer>,
    ctx: Arc<SwarmContext>,
    slot: PeerSlot,
) {
    let addr = conn.addr();
    trace!(%addr, torrent = %transfer.name, "peer session started");
    let mut worker = Worker::new(conn, transfer, ctx);
    let result = worker.drive().await;
    worker.abandon_piece();
    match result {
        Ok(()) => trace!(%addr, "peer session closed"),
        Err(e) => debug!(%addr, error = %e, "peer session ended"),
    }
    drop(slot);
}

/// A piece being assembled from 16 KiB blocks.
struct PieceDownload {
    index: u32,
    data: Vec<u8>,
    received: Vec<bool>,
}

impl PieceDownload {
    fn new(index: u32, size: usize) -> Self {
        Self {
            index,
            data: vec![0; size],
            received: vec![false; size.div_ceil(BLOCK_SIZE as usize)],
        }
    }

    fn requests(&self) -> Vec<Message> {
        (0..self.received.len())
            .map(|block| {
                let begin = block * BLOCK_SIZE as usize;
                Message::Request {
                    index: self.index,
                    begin: begin as u32,
                    length: (self.data.len() - begin).min(BLOCK_SIZE as usize) as u32,
                }
            })
            .collect()
    }

    /// Copies a block in; false if it does not line up with a requested one.
    fn accept(&mut self, begin: u32, block: &[u8]) -> bool {
        let begin = begin as usize;
        let slot = begin / BLOCK_SIZE as usize;
        if begin % BLOCK_SIZE as usize != 0 || slot >= self.received.len() {
            return false;
        }
        let expected = (self.data.len() - begin).min(BLOCK_SIZE as usize);
        if block.len() != expected {
            return false;
        }
        self.data[begin..begin + expected].copy_from_slice(block);
        self.received[slot] = true;
        true
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }
}

struct Worker {
    addr: SocketAddr,
    conn: PeerConnection,
    transfer: Arc<Transfer>,
    ctx: Arc<SwarmContext>,
    peer_bits: Bitfield,
    peer_choking: bool,
    am_choking: bool,
    am_interested: bool,
    extensions: PeerExtensions,
    assembly: Option<MetadataAssembly>,
    metadata_refused: bool,
    piece: Option<PieceDownload>,
}

impl Worker {
    fn new(conn: PeerConnection, transfer: Arc<Transfer>, ctx: Arc<SwarmContext>) -> Self {
        Self {
            addr: conn.addr(),
            conn,
            transfer,
            ctx,
            peer_bits: Bitfield::default(),
            peer_choking: true,
            am_choking: true,
            am_interested: false,
            extensions: PeerExtensions::default(),
            assembly: None,
            metadata_refused: false,
            piece: None,
        }
    }

    async fn drive(&mut self) -> Result<(), PeerError> {
        if self.conn.supports_extensions {
            let size = self.transfer.payload().map(|p| p.info_bytes.len());
            let payload = extension::handshake(size, self.ctx.listen_port);
            self.conn.send(&Message::Extended { id: 0, payload }).await?;
        }
        if let Some(bits) = self.transfer.bitfield() {
            let bits = Bytes::copy_from_slice(bits.as_bytes());
            self.conn.send(&Message::Bitfield(bits)).await?;
        }

        let mut haves = self.transfer.subscribe_haves();
        let mut wanted = self.transfer.wanted_watch();
        let mut metadata = self.transfer.metadata_watch();
        let mut shutdown = self.ctx.shutdown.clone();

        loop {
            self.advance().await?;
            tokio::select! {
                _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => return Ok(()),
                message = self.conn.read_message() => self.handle(message?).await?,
                have = haves.recv() => match have {
                    Ok(index) => self.conn.send(&Message::Have(index)).await?,
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = wanted.changed() => {}
                _ = metadata.changed() => {}
            }
        }
    }

    /// Moves the session forward: fetch metadata, update interest, request a piece.
    async fn advance(&mut self) -> Result<(), PeerError> {
        let Some(payload) = self.transfer.payload().cloned() else {
            return self.request_metadata().await;
        };
        self.assembly = None;

        let interested = self.transfer.wants_from(&self.peer_bits);
        if interested != self.am_interested {
            self.am_interested = interested;
            let message = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.conn.send(&message).await?;
        }
        if !interested || self.peer_choking || self.piece.is_some() {
            return Ok(());
        }

        let Some(index) = self.transfer.pick_piece(&self.peer_bits) else {
            return Ok(());
        };
        let piece = PieceDownload::new(index, payload.info.piece_size(index as usize) as usize);
        let requests = piece.requests();
        self.piece = Some(piece);
        for request in &requests {
            self.conn.send(request).await?;
        }
        Ok(())
    }

    async fn request_metadata(&mut self) -> Result<(), PeerError> {
        if self.assembly.is_some() || self.metadata_refused {
            return Ok(());
        }
        let (Some(id), Some(size)) = (self.extensions.ut_metadata, self.extensions.metadata_size)
        else {
            return Ok(());
        };
        let assembly = MetadataAssembly::new(size);
        let count = assembly.piece_count();
        self.assembly = Some(assembly);
        for piece in 0..count {
            let payload = MetadataMessage::Request(piece).encode(0);
            self.conn.send(&Message::Extended { id, payload }).await?;
        }
        debug!(addr = %self.addr, size, "requesting metadata");
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<(), PeerError> {
        if self.ctx.debug {
            trace!(addr = %self.addr, kind = message.name(), "received");
        }
        match message {
            Message::KeepAlive | Message::NotInterested | Message::Cancel { .. } | Message::Other(_) => {}
            Message::Choke => {
                self.peer_choking = true;
                self.abandon_piece();
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => {
                if self.am_choking {
                    self.am_choking = false;
                    self.conn.send(&Message::Unchoke).await?;
                }
            }
            Message::Have(index) => {
                if self.plausible_piece(index) {
                    self.peer_bits.set(index);
                }
            }
            Message::Bitfield(bits) => self.peer_bits = Bitfield::from_bytes(&bits),
            Message::Request {
                index,
                begin,
                length,
            } => self.serve(index, begin, length).await?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.receive(index, begin, block).await?,
            Message::Extended { id: 0, payload } => {
                self.extensions = extension::parse_handshake(&payload).unwrap_or_default();
            }
            Message::Extended {
                id: extension::UT_METADATA,
                payload,
            } => self.on_metadata(payload).await?,
            Message::Extended {
                id: extension::UT_PEX,
                payload,
            } => {
                for addr in extension::pex_added(&payload) {
                    self.transfer.discovered(addr);
                }
            }
            Message::Extended { .. } => {}
        }
        Ok(())
    }

    fn plausible_piece(&self, index: u32) -> bool {
        match self.transfer.payload() {
            Some(payload) => (index as usize) < payload.info.piece_count(),
            None => index < MAX_UNKNOWN_PIECES,
        }
    }

    async fn serve(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if self.am_choking || length == 0 || length > MAX_REQUEST || !self.transfer.has_piece(index)
        {
            return Ok(());
        }
        let Some(payload) = self.transfer.payload().cloned() else {
            return Ok(());
        };
        if !within_piece(&payload.info, index, begin, length) {
            debug!(addr = %self.addr, index, begin, length, "request crosses piece end");
            return Ok(());
        }
        let block = match payload.storage.read_block(index, begin, length).await {
            Ok(block) => block,
            Err(e) => {
                debug!(addr = %self.addr, index, begin, length, error = %e, "unservable request");
                return Ok(());
            }
        };
        self.ctx.upload.acquire(block.len()).await;
        let block = Bytes::from(block);
        self.conn
            .send(&Message::Piece {
                index,
                begin,
                block,
            })
            .await?;
        self.transfer.add_uploaded(u64::from(length));
        Ok(())
    }

    async fn receive(&mut self, index: u32, begin: u32, block: Bytes) -> Result<(), PeerError> {
        self.ctx.download.acquire(block.len()).await;
        let Some(piece) = self.piece.as_mut().filter(|p| p.index == index) else {
            return Ok(());
        };
        if !piece.accept(begin, &block) || !piece.is_complete() {
            return Ok(());
        }
        let Some(piece) = self.piece.take() else {
            return Ok(());
        };
        if self.transfer.complete_piece(index, piece.data).await? {
            Ok(())
        } else {
            Err(PeerError::HashMismatch(index))
        }
    }

    async fn on_metadata(&mut self, payload: Bytes) -> Result<(), PeerError> {
        let message = MetadataMessage::parse(&payload)
            .map_err(|_| PeerError::Metadata("malformed ut_metadata message"))?;
        match message {
            MetadataMessage::Request(piece) => {
                let Some(id) = self.extensions.ut_metadata else {
                    return Ok(());
                };
                let reply = self
                    .transfer
                    .payload()
                    .and_then(|p| {
                        extension::metadata_piece(&p.info_bytes, piece)
                            .map(|data| MetadataMessage::Data { piece, data }.encode(p.info_bytes.len()))
                    })
                    .unwrap_or_else(|| MetadataMessage::Reject(piece).encode(0));
                self.conn.send(&Message::Extended { id, payload: reply }).await?;
            }
            MetadataMessage::Data { piece, data } => {
                let Some(assembly) = self.assembly.as_mut() else {
                    return Ok(());
                };
                if !assembly.accept(piece, &data) {
                    return Err(PeerError::Metadata("unexpected metadata piece"));
                }
                if !assembly.is_complete() {
                    return Ok(());
                }
                let Some(assembly) = self.assembly.take() else {
                    return Ok(());
                };
                let info_bytes = assembly
                    .finish(&self.transfer.info_hash)
                    .ok_or(PeerError::Metadata("metadata does not match info hash"))?;
                if let Err(e) = self.transfer.install_metadata(info_bytes).await {
                    self.transfer.fail(&e);
                    return Err(e.into());
                }
            }
            MetadataMessage::Reject(_) => {
                self.assembly = None;
                self.metadata_refused = true;
            }
        }
        Ok(())
    }

    fn abandon_piece(&mut self) {
        if let Some(piece) = self.piece.take() {
            self.transfer.release_piece(piece.index);
        }
    }
}

/// Whether `begin..begin + length` lies inside piece `index`.
fn within_piece(info: &Info, index: u32, begin: u32, length: u32) -> bool {
    (index as usize) < info.piece_count()
        && u64::from(begin) + u64::from(length) <= info.piece_size(index as usize)
}
