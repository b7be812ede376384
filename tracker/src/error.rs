use std::io;

use thiserror::Error;

/// Failures while announcing to a tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The announce URL could not be used.
    #[error("invalid tracker url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: &'static str },
    /// HTTP transport failed.
    #[error("http announce failed")]
    Http(#[from] reqwest::Error),
    /// UDP transport failed.
    #[error("udp announce failed")]
    Io(#[from] io::Error),
    /// No reply arrived in time.
    #[error("tracker did not answer within {0:?}")]
    Timeout(std::time::Duration),
    /// The tracker answered with an explicit failure.
    #[error("tracker failure: {0}")]
    Failure(String),
    /// The reply could not be understood.
    #[error("malformed tracker response: {0}")]
    Malformed(&'static str),
    /// The HTTP body was not bencode.
    #[error("tracker response is not bencode")]
    Bencode(#[from] fetch_core::CoreError),
}
