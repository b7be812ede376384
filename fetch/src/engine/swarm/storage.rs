//! Piece storage over the torrent's file layout.
//!
//! The payload is one contiguous byte range split across files in torrent
//! order. Pieces and blocks are addressed in that range and mapped onto
//! (file, offset) spans.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};

use fetch_core::Info;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("range {offset}+{length} is outside the {total} byte payload")]
    OutOfRange { offset: u64, length: u64, total: u64 },
}

struct FileSlot {
    path: PathBuf,
    /// Offset of the file's first byte in the payload.
    start: u64,
    length: u64,
    file: Mutex<File>,
}

/// A (file, in-file offset, buffer range) triple.
#[derive(Debug, PartialEq, Eq)]
struct Span {
    slot: usize,
    file_offset: u64,
    buf: Range<usize>,
}

pub struct Storage {
    files: Vec<FileSlot>,
    piece_length: u64,
    total_length: u64,
    existing_data: bool,
}

impl Storage {
    /// Creates (or reopens) every payload file under `data_dir`, sized to
    /// its final length. Multi-file torrents live in a directory named after
    /// the torrent.
    pub async fn open(data_dir: &Path, info: &Info) -> Result<Self, StorageError> {
        let root = if info.multi_file {
            data_dir.join(&info.name)
        } else {
            data_dir.to_path_buf()
        };

        let mut offset = 0u64;
        for entry in &info.files {
            offset = offset
                .checked_add(entry.length)
                .ok_or(StorageError::OutOfRange {
                    offset,
                    length: entry.length,
                    total: u64::MAX,
                })?;
        }

        let mut files = Vec::with_capacity(info.files.len());
        let mut start = 0;
        let mut existing_data = false;
        for entry in &info.files {
            let path = entry.path.iter().fold(root.clone(), |p, c| p.join(c));
            let io_err = |source| StorageError::Io {
                path: path.clone(),
                source,
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(io_err)?;
            let on_disk = file.metadata().await.map_err(io_err)?.len();
            existing_data |= on_disk > 0;
            if on_disk != entry.length {
                file.set_len(entry.length).await.map_err(io_err)?;
            }
            debug!(path = %path.display(), length = entry.length, "payload file ready");
            files.push(FileSlot {
                path,
                start,
                length: entry.length,
                file: Mutex::new(file),
            });
            start += entry.length;
        }

        Ok(Self {
            files,
            piece_length: info.piece_length,
            total_length: start,
            existing_data,
        })
    }

    /// Whether any payload file already held data when opened.
    pub fn has_existing_data(&self) -> bool {
        self.existing_data
    }

    /// Writes a verified piece.
    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        let offset = u64::from(index) * self.piece_length;
        for span in self.spans(offset, data.len())? {
            let slot = &self.files[span.slot];
            let mut file = slot.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset))
                .await
                .map_err(|source| slot.io(source))?;
            file.write_all(&data[span.buf])
                .await
                .map_err(|source| slot.io(source))?;
        }
        Ok(())
    }

    /// Reads `length` bytes at `begin` inside piece `index`.
    pub async fn read_block(
        &self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let offset = u64::from(index) * self.piece_length + u64::from(begin);
        let mut block = vec![0u8; length as usize];
        for span in self.spans(offset, block.len())? {
            let slot = &self.files[span.slot];
            let mut file = slot.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset))
                .await
                .map_err(|source| slot.io(source))?;
            file.read_exact(&mut block[span.buf])
                .await
                .map_err(|source| slot.io(source))?;
        }
        Ok(block)
    }

    fn spans(&self, offset: u64, len: usize) -> Result<Vec<Span>, StorageError> {
        let end = offset + len as u64;
        if end > self.total_length {
            return Err(StorageError::OutOfRange {
                offset,
                length: len as u64,
                total: self.total_length,
            });
        }
        let mut spans = Vec::new();
        for (slot, file) in self.files.iter().enumerate() {
            let file_end = file.start + file.length;
            if file_end <= offset || file.start >= end || file.length == 0 {
                continue;
            }
            let from = offset.max(file.start);
            let to = end.min(file_end);
            spans.push(Span {
                slot,
                file_offset: from - file.start,
                buf: (from - offset) as usize..(to - offset) as usize,
            });
        }
        Ok(spans)
    }
}

impl FileSlot {
    fn io(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
