//! Peer wire protocol: handshake, message framing and the per-connection stream.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::engine::EngineError;

pub(crate) const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub(crate) const HANDSHAKE_LEN: usize = 68;
/// Size of a requested block.
pub(crate) const BLOCK_SIZE: u32 = 16 * 1024;
/// Largest block a peer may ask us for.
pub(crate) const MAX_REQUEST: u32 = 128 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(180);
const MAX_FRAME: usize = 1 << 21;

#[derive(Debug, thiserror::Error)]
pub(crate) enum PeerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("bad handshake: {0}")]
    Handshake(&'static str),
    #[error("bad frame: {0}")]
    Frame(&'static str),
    #[error("piece {0} failed verification")]
    HashMismatch(u32),
    #[error("metadata exchange: {0}")]
    Metadata(&'static str),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Extended { id: u8, payload: Bytes },
    /// Anything we do not speak (port, fast extension, ...).
    Other(u8),
}

impl Message {
    /// Short name for logs.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Extended { .. } => "extended",
            Message::Other(_) => "other",
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let (id, body_len) = match self {
            Message::KeepAlive => {
                dst.put_u32(0);
                return;
            }
            Message::Choke => (0, 0),
            Message::Unchoke => (1, 0),
            Message::Interested => (2, 0),
            Message::NotInterested => (3, 0),
            Message::Have(_) => (4, 4),
            Message::Bitfield(bits) => (5, bits.len()),
            Message::Request { .. } => (6, 12),
            Message::Piece { block, .. } => (7, 8 + block.len()),
            Message::Cancel { .. } => (8, 12),
            Message::Extended { payload, .. } => (20, 1 + payload.len()),
            Message::Other(id) => (*id, 0),
        };
        dst.reserve(5 + body_len);
        dst.put_u32(1 + body_len as u32);
        dst.put_u8(id);
        match self {
            Message::Have(index) => dst.put_u32(*index),
            Message::Bitfield(bits) => dst.put_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_slice(block);
            }
            Message::Extended { id, payload } => {
                dst.put_u8(*id);
                dst.put_slice(payload);
            }
            _ => {}
        }
    }

    /// Decodes one frame body (length prefix already stripped).
    fn decode(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = body.get_u8();
        let need = |body: &Bytes, n: usize| {
            if body.len() < n {
                Err(PeerError::Frame("truncated message"))
            } else {
                Ok(())
            }
        };
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                need(&body, 4)?;
                Message::Have(body.get_u32())
            }
            5 => Message::Bitfield(body),
            6 | 8 => {
                need(&body, 12)?;
                let (index, begin, length) = (body.get_u32(), body.get_u32(), body.get_u32());
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                need(&body, 8)?;
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: body,
                }
            }
            20 => {
                need(&body, 1)?;
                let id = body.get_u8();
                Message::Extended { id, payload: body }
            }
            other => Message::Other(other),
        };
        Ok(msg)
    }
}

/// The 68-byte opening exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub extensions: bool,
}

impl Handshake {
    pub(crate) fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            extensions: true,
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = PROTOCOL.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL);
        if self.extensions {
            out[25] |= 0x10; // extension protocol bit
        }
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    pub(crate) fn parse(raw: &[u8; HANDSHAKE_LEN]) -> Result<Self, PeerError> {
        if raw[0] as usize != PROTOCOL.len() || &raw[1..20] != PROTOCOL {
            return Err(PeerError::Handshake("unknown protocol"));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);
        Ok(Self {
            info_hash,
            peer_id,
            extensions: raw[25] & 0x10 != 0,
        })
    }
}

pub(crate) async fn read_handshake(stream: &mut TcpStream) -> Result<Handshake, PeerError> {
    let mut raw = [0u8; HANDSHAKE_LEN];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut raw))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Handshake::parse(&raw)
}

pub(crate) async fn write_handshake(
    stream: &mut TcpStream,
    handshake: &Handshake,
) -> Result<(), PeerError> {
    stream.write_all(&handshake.to_bytes()).await?;
    Ok(())
}

/// Which pieces a remote peer advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    pub(crate) fn with_pieces(count: usize) -> Self {
        Self {
            bits: vec![0; count.div_ceil(8)],
        }
    }

    pub(crate) fn from_bytes(bits: &[u8]) -> Self {
        Self {
            bits: bits.to_vec(),
        }
    }

    pub(crate) fn has(&self, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        self.bits.get(byte).is_some_and(|b| (b >> bit) & 1 == 1)
    }

    pub(crate) fn set(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << (7 - (index % 8));
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

/// A framed, handshaken connection to one peer.
pub(crate) struct PeerConnection {
    addr: SocketAddr,
    stream: TcpStream,
    buffer: BytesMut,
    pub peer_id: [u8; 20],
    pub supports_extensions: bool,
}

impl PeerConnection {
    /// Dials `addr` and performs the outbound handshake.
    pub(crate) async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        client_id: [u8; 20],
    ) -> Result<Self, PeerError> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        write_handshake(&mut stream, &Handshake::new(info_hash, client_id)).await?;
        let remote = read_handshake(&mut stream).await?;
        if remote.info_hash != info_hash {
            return Err(PeerError::Handshake("info hash mismatch"));
        }
        if remote.peer_id == client_id {
            return Err(PeerError::Handshake("connected to ourselves"));
        }
        Ok(Self::established(stream, addr, &remote))
    }

    /// Wraps a stream whose handshake has already been exchanged.
    pub(crate) fn established(stream: TcpStream, addr: SocketAddr, remote: &Handshake) -> Self {
        Self {
            addr,
            stream,
            buffer: BytesMut::with_capacity(32 * 1024),
            peer_id: remote.peer_id,
            supports_extensions: remote.extensions,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        let mut frame = BytesMut::new();
        message.encode(&mut frame);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Reads the next message. Cancel safe: partial frames stay buffered.
    pub(crate) async fn read_message(&mut self) -> Result<Message, PeerError> {
        loop {
            if let Some(message) = parse_frame(&mut self.buffer)? {
                return Ok(message);
            }
            let read = timeout(IDLE_TIMEOUT, self.stream.read_buf(&mut self.buffer))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if read == 0 {
                return Err(PeerError::Closed);
            }
        }
    }
}

fn parse_frame(buffer: &mut BytesMut) -> Result<Option<Message>, PeerError> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME {
        return Err(PeerError::Frame("frame too large"));
    }
    if buffer.len() < 4 + len {
        buffer.reserve(4 + len - buffer.len());
        return Ok(None);
    }
    buffer.advance(4);
    let body = buffer.split_to(len).freeze();
    Message::decode(body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        buf
    }

    #[test]
    fn test_request_layout() {
        let buf = frame(&Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        });
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_parse_waits_for_whole_frame() {
        let full = frame(&Message::Piece {
            index: 3,
            begin: 0,
            block: Bytes::from_static(b"abcdef"),
        });
        let mut partial = BytesMut::from(&full[..7]);
        assert_eq!(parse_frame(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full[7..]);
        assert_eq!(
            parse_frame(&mut partial).unwrap(),
            Some(Message::Piece {
                index: 3,
                begin: 0,
                block: Bytes::from_static(b"abcdef"),
            })
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn test_parse_back_to_back_frames() {
        let mut buf = frame(&Message::KeepAlive);
        buf.extend_from_slice(&frame(&Message::Have(9)));
        buf.extend_from_slice(&[0, 0, 0, 3, 9, 0x1a, 0xe1]); // port message
        assert_eq!(parse_frame(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(parse_frame(&mut buf).unwrap(), Some(Message::Have(9)));
        assert_eq!(parse_frame(&mut buf).unwrap(), Some(Message::Other(9)));
        assert_eq!(parse_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_rejects_oversized_and_truncated() {
        let mut huge = BytesMut::from(&[0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(parse_frame(&mut huge), Err(PeerError::Frame(_))));
        let mut short_have = BytesMut::from(&[0, 0, 0, 2, 4, 0][..]);
        assert!(matches!(parse_frame(&mut short_have), Err(PeerError::Frame(_))));
    }

    #[test]
    fn test_handshake_layout() {
        let hs = Handshake::new([7; 20], *b"-TF0100-abcdefghijkl");
        let raw = hs.to_bytes();
        assert_eq!(raw[0], 19);
        assert_eq!(&raw[1..20], PROTOCOL);
        assert_eq!(raw[25], 0x10);
        assert_eq!(Handshake::parse(&raw).unwrap(), hs);

        let mut bad = raw;
        bad[3] = b'X';
        assert!(Handshake::parse(&bad).is_err());
    }

    #[test]
    fn test_bitfield_bits_are_msb_first() {
        let mut bits = Bitfield::with_pieces(10);
        assert_eq!(bits.as_bytes().len(), 2);
        bits.set(0);
        bits.set(9);
        assert_eq!(bits.as_bytes(), &[0x80, 0x40]);
        assert!(bits.has(0) && bits.has(9));
        assert!(!bits.has(1) && !bits.has(400));
        bits.set(20);
        assert!(bits.has(20));
    }

    #[tokio::test]
    async fn test_handshake_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, remote) = listener.accept().await.unwrap();
            let hs = read_handshake(&mut stream).await.unwrap();
            write_handshake(&mut stream, &Handshake::new(hs.info_hash, [9; 20]))
                .await
                .unwrap();
            let mut conn = PeerConnection::established(stream, remote, &hs);
            conn.read_message().await.unwrap()
        });

        let mut conn = PeerConnection::connect(addr, [1; 20], [2; 20]).await.unwrap();
        assert_eq!(conn.peer_id, [9; 20]);
        assert!(conn.supports_extensions);
        conn.send(&Message::Interested).await.unwrap();
        assert_eq!(server.await.unwrap(), Message::Interested);
    }
}
