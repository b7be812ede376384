//! Extension protocol messages: the extended handshake, `ut_metadata` and `ut_pex`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use fetch_core::bencoding::{Bencode, decode, decode_all, info_hash};
use fetch_core::{CoreError, CoreResult};

/// Extended message ids we advertise. Peers address us with these.
pub(crate) const UT_METADATA: u8 = 1;
pub(crate) const UT_PEX: u8 = 2;

/// `ut_metadata` transfers the info dictionary in 16 KiB pieces.
pub(crate) const METADATA_PIECE_LEN: usize = 16 * 1024;
/// Refuse to buffer info dictionaries beyond this.
const MAX_METADATA_LEN: usize = 16 << 20;

const CLIENT_NAME: &str = concat!("tdsfetch ", env!("CARGO_PKG_VERSION"));

fn dict(entries: Vec<(&str, Bencode)>) -> Bencode {
    Bencode::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// What a peer told us in its extended handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PeerExtensions {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
    pub metadata_size: Option<usize>,
}

pub(crate) fn handshake(metadata_size: Option<usize>, listen_port: u16) -> Bytes {
    let m = dict(vec![
        ("ut_metadata", Bencode::Int(i64::from(UT_METADATA))),
        ("ut_pex", Bencode::Int(i64::from(UT_PEX))),
    ]);
    let mut entries = vec![
        ("m", m),
        ("p", Bencode::Int(i64::from(listen_port))),
        ("v", Bencode::Bytes(CLIENT_NAME.as_bytes().to_vec())),
    ];
    if let Some(size) = metadata_size {
        entries.push(("metadata_size", Bencode::Int(size as i64)));
    }
    Bytes::from(dict(entries).encode())
}

pub(crate) fn parse_handshake(payload: &[u8]) -> CoreResult<PeerExtensions> {
    let root = decode_all(payload)?;
    let id = |name: &[u8]| {
        root.get(b"m")?
            .get(name)?
            .as_int()
            .and_then(|id| u8::try_from(id).ok())
            .filter(|id| *id != 0)
    };
    Ok(PeerExtensions {
        ut_metadata: id(b"ut_metadata"),
        ut_pex: id(b"ut_pex"),
        metadata_size: root
            .get(b"metadata_size")
            .and_then(Bencode::as_int)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n > 0 && *n <= MAX_METADATA_LEN),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetadataMessage {
    Request(u32),
    Data { piece: u32, data: Bytes },
    Reject(u32),
}

impl MetadataMessage {
    pub(crate) fn parse(payload: &Bytes) -> CoreResult<Self> {
        let mut pos = 0;
        let header = decode(payload, &mut pos)?;
        let field = |name: &'static str| {
            header
                .get(name.as_bytes())
                .and_then(Bencode::as_int)
                .ok_or(CoreError::MissingField { field: name })
        };
        let piece = u32::try_from(field("piece")?).map_err(|_| CoreError::InvalidMetainfo {
            reason: "metadata piece out of range",
        })?;
        match field("msg_type")? {
            0 => Ok(Self::Request(piece)),
            1 => Ok(Self::Data {
                piece,
                data: payload.slice(pos..),
            }),
            2 => Ok(Self::Reject(piece)),
            _ => Err(CoreError::InvalidMetainfo {
                reason: "unknown ut_metadata message type",
            }),
        }
    }

    /// Encodes the message; `total_size` is only used for `Data`.
    pub(crate) fn encode(&self, total_size: usize) -> Bytes {
        let (kind, piece) = match self {
            Self::Request(piece) => (0, *piece),
            Self::Data { piece, .. } => (1, *piece),
            Self::Reject(piece) => (2, *piece),
        };
        let mut entries = vec![
            ("msg_type", Bencode::Int(kind)),
            ("piece", Bencode::Int(i64::from(piece))),
        ];
        if let Self::Data { .. } = self {
            entries.push(("total_size", Bencode::Int(total_size as i64)));
        }
        let mut out = dict(entries).encode();
        if let Self::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }
}

/// Slice of the info dictionary served for `piece`, if it exists.
pub(crate) fn metadata_piece(info_bytes: &[u8], piece: u32) -> Option<Bytes> {
    let start = piece as usize * METADATA_PIECE_LEN;
    if start >= info_bytes.len() {
        return None;
    }
    let end = (start + METADATA_PIECE_LEN).min(info_bytes.len());
    Some(Bytes::copy_from_slice(&info_bytes[start..end]))
}

/// Reassembles an info dictionary from `ut_metadata` pieces.
#[derive(Debug)]
pub(crate) struct MetadataAssembly {
    buffer: Vec<u8>,
    received: Vec<bool>,
}

impl MetadataAssembly {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            buffer: vec![0; size],
            received: vec![false; size.div_ceil(METADATA_PIECE_LEN)],
        }
    }

    pub(crate) fn piece_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Stores a piece; false when its index or length does not fit.
    pub(crate) fn accept(&mut self, piece: u32, data: &[u8]) -> bool {
        let index = piece as usize;
        let start = index * METADATA_PIECE_LEN;
        let expected = (self.buffer.len().saturating_sub(start)).min(METADATA_PIECE_LEN);
        if index >= self.received.len() || data.len() != expected {
            return false;
        }
        self.buffer[start..start + expected].copy_from_slice(data);
        self.received[index] = true;
        true
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    /// The assembled dictionary, if it hashes to `expected`.
    pub(crate) fn finish(self, expected: &[u8; 20]) -> Option<Vec<u8>> {
        (self.is_complete() && info_hash(&self.buffer) == *expected).then_some(self.buffer)
    }
}

/// Peers listed under `added` / `added6` in a `ut_pex` message.
pub(crate) fn pex_added(payload: &[u8]) -> Vec<SocketAddr> {
    let Ok(root) = decode_all(payload) else {
        return Vec::new();
    };
    let mut peers = root
        .get(b"added")
        .and_then(Bencode::as_bytes)
        .map(tracker::compact_v4)
        .unwrap_or_default();
    if let Some(v6) = root.get(b"added6").and_then(Bencode::as_bytes) {
        peers.extend(tracker::compact_v6(v6));
    }
    peers
}
