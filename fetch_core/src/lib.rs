//! Data formats shared by the fetch engine and the tracker client.
//!
//! Bencode, `.torrent` descriptors, magnet links and the bandwidth limiter
//! descriptor. Nothing here performs network IO.

pub mod bencoding;
pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod rate_limit;

pub use error::{CoreError, CoreResult};
pub use magnet::MagnetLink;
pub use metainfo::{FileEntry, Info, Metainfo};
pub use rate_limit::{BURST_BYTES, RateLimiterSpec, TokenBucket};
