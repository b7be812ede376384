//! Error type shared by the bencode, metainfo and magnet parsers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for `fetch_core` operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures raised while decoding torrent data formats.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input ended before a complete value was read.
    #[error("unexpected end of input while parsing {context}")]
    UnexpectedEof {
        /// What the decoder was reading when the input ran out.
        context: &'static str,
    },
    /// Input contained bytes that are not valid bencode.
    #[error("invalid bencode at byte {pos}: {reason}")]
    InvalidBencode {
        /// Offset of the offending byte.
        pos: usize,
        /// Human readable reason.
        reason: String,
    },
    /// A required metainfo field was absent or had the wrong type.
    #[error("missing or malformed field `{field}`")]
    MissingField {
        /// Name of the field.
        field: &'static str,
    },
    /// Metainfo was structurally valid bencode but semantically broken.
    #[error("invalid torrent metadata: {reason}")]
    InvalidMetainfo {
        /// Why the metadata was rejected.
        reason: &'static str,
    },
    /// A magnet link could not be used.
    #[error("invalid magnet link: {reason}")]
    InvalidMagnet {
        /// Why the link was rejected.
        reason: String,
    },
    /// Reading a descriptor from disk failed.
    #[error("failed to read torrent file {}", path.display())]
    Io {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl CoreError {
    pub(crate) fn invalid(pos: usize, reason: impl Into<String>) -> Self {
        Self::InvalidBencode {
            pos,
            reason: reason.into(),
        }
    }

    pub(crate) fn magnet(reason: impl Into<String>) -> Self {
        Self::InvalidMagnet {
            reason: reason.into(),
        }
    }
}
