//! Torrent descriptor ("metainfo") parsing.

use std::path::Path;

use crate::bencoding::{Bencode, decode_all, find_info_slice, info_hash};
use crate::error::{CoreError, CoreResult};

/// A single file inside the torrent payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// The length of the file in bytes.
    pub length: u64,
    /// Path components relative to the torrent root.
    pub path: Vec<String>,
}

/// The decoded info dictionary: piece layout and file list.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name of the file (single-file) or root directory (multi-file).
    pub name: String,
    /// Nominal piece size in bytes; the last piece may be shorter.
    pub piece_length: u64,
    /// SHA-1 hash of every piece, in order.
    pub pieces: Vec<[u8; 20]>,
    /// Files in payload order. Single-file torrents have one entry named after `name`.
    pub files: Vec<FileEntry>,
    /// Whether the info dictionary used the multi-file `files` form.
    pub multi_file: bool,
}

impl Info {
    /// Parses a raw bencoded info dictionary, as received over `ut_metadata`.
    pub fn from_bytes(info_bytes: &[u8]) -> CoreResult<Self> {
        Self::from_value(&decode_all(info_bytes)?)
    }

    fn from_value(value: &Bencode) -> CoreResult<Self> {
        if !matches!(value, Bencode::Dict(_)) {
            return Err(CoreError::MissingField { field: "info" });
        }

        let name = value
            .get(b"name")
            .and_then(Bencode::as_string)
            .ok_or(CoreError::MissingField { field: "name" })?;
        check_component(&name)?;

        let piece_length = value
            .get(b"piece length")
            .and_then(Bencode::as_int)
            .filter(|len| *len > 0)
            .ok_or(CoreError::MissingField {
                field: "piece length",
            })? as u64;

        let pieces_bytes = value
            .get(b"pieces")
            .and_then(Bencode::as_bytes)
            .ok_or(CoreError::MissingField { field: "pieces" })?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(CoreError::InvalidMetainfo {
                reason: "pieces length is not a multiple of 20",
            });
        }
        let pieces = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect::<Vec<_>>();

        let (files, multi_file) = match (value.get(b"length"), value.get(b"files")) {
            (Some(length), _) => {
                let length = non_negative(length, "length")?;
                (
                    vec![FileEntry {
                        length,
                        path: vec![name.clone()],
                    }],
                    false,
                )
            }
            (None, Some(Bencode::List(list))) => (parse_files(list)?, true),
            _ => {
                return Err(CoreError::InvalidMetainfo {
                    reason: "neither length nor files present",
                });
            }
        };

        if files
            .iter()
            .try_fold(0u64, |total, f| total.checked_add(f.length))
            .is_none()
        {
            return Err(CoreError::InvalidMetainfo {
                reason: "total length overflows",
            });
        }

        let info = Self {
            name,
            piece_length,
            pieces,
            files,
            multi_file,
        };
        if info.total_length().div_ceil(piece_length) != info.pieces.len() as u64 {
            return Err(CoreError::InvalidMetainfo {
                reason: "piece count does not match total length",
            });
        }
        Ok(info)
    }

    /// Total payload size in bytes. Saturates for hand-built values; parsed
    /// ones are rejected before they can overflow.
    pub fn total_length(&self) -> u64 {
        self.files
            .iter()
            .fold(0u64, |total, f| total.saturating_add(f.length))
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Size of the piece at `index`, accounting for a short final piece.
    pub fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.total_length()
            .saturating_sub(start)
            .min(self.piece_length)
    }
}

fn parse_files(list: &[Bencode]) -> CoreResult<Vec<FileEntry>> {
    let mut files = Vec::with_capacity(list.len());
    for entry in list {
        let length = entry
            .get(b"length")
            .ok_or(CoreError::MissingField { field: "files.length" })
            .and_then(|v| non_negative(v, "files.length"))?;
        let components = entry
            .get(b"path")
            .and_then(Bencode::as_list)
            .ok_or(CoreError::MissingField { field: "files.path" })?;
        let mut path = Vec::with_capacity(components.len());
        for component in components {
            let part = component
                .as_string()
                .ok_or(CoreError::MissingField { field: "files.path" })?;
            check_component(&part)?;
            path.push(part);
        }
        if path.is_empty() {
            return Err(CoreError::MissingField { field: "files.path" });
        }
        files.push(FileEntry { length, path });
    }
    Ok(files)
}

fn non_negative(value: &Bencode, field: &'static str) -> CoreResult<u64> {
    value
        .as_int()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or(CoreError::MissingField { field })
}

// Path components end up joined under the data directory.
fn check_component(part: &str) -> CoreResult<()> {
    if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\']) {
        return Err(CoreError::InvalidMetainfo {
            reason: "unsafe path component",
        });
    }
    Ok(())
}

/// Represents the metadata of a torrent descriptor file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The primary tracker URL, if any.
    pub announce: Option<String>,
    /// Tiered backup trackers (BEP 12).
    pub announce_list: Vec<Vec<String>>,
    /// The SHA-1 hash of the info dictionary.
    pub info_hash: [u8; 20],
    /// Decoded info dictionary.
    pub info: Info,
    /// The info dictionary exactly as it appeared in the file.
    pub info_bytes: Vec<u8>,
}

impl Metainfo {
    /// Reads and parses a `.torrent` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let buf = std::fs::read(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&buf)
    }

    /// Parses a descriptor from memory.
    pub fn from_bytes(buf: &[u8]) -> CoreResult<Self> {
        let root = decode_all(buf)?;
        let info_bytes = find_info_slice(buf)?.to_vec();
        let info = Info::from_value(root.get(b"info").ok_or(CoreError::MissingField {
            field: "info",
        })?)?;

        let announce = root
            .get(b"announce")
            .and_then(Bencode::as_string)
            .filter(|url| !url.is_empty());

        let announce_list = root
            .get(b"announce-list")
            .and_then(Bencode::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(Bencode::as_list)
                    .map(|tier| {
                        tier.iter()
                            .filter_map(Bencode::as_string)
                            .collect::<Vec<_>>()
                    })
                    .filter(|tier| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            announce,
            announce_list,
            info_hash: info_hash(&info_bytes),
            info,
            info_bytes,
        })
    }

    /// Every distinct tracker URL, primary first.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.announce.iter().cloned().collect();
        for url in self.announce_list.iter().flatten() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}
