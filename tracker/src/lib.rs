//! Tracker announce clients (HTTP and UDP) used for peer discovery.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

pub mod error;
pub mod http;
pub mod udp;

pub use error::TrackerError;
use http::HttpTracker;
use udp::UdpTracker;

/// Upper bound on a single announce round trip.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<TrackerEvent>,
    pub numwant: Option<u32>,
    pub key: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// Seconds the tracker wants between announces.
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
    pub complete: Option<u32>,   // seeders
    pub incomplete: Option<u32>, // leechers
}

#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// The announce URL this client talks to.
    fn url(&self) -> &str;

    async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError>;
}

/// Picks a client implementation from the URL scheme.
pub fn get_tracker_client(url: &str) -> Option<Box<dyn TrackerClient>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(Box::new(HttpTracker::new(url)))
    } else if url.starts_with("udp://") {
        Some(Box::new(UdpTracker::new(url)))
    } else {
        None
    }
}

/// Decodes BEP 23 compact IPv4 peers (6 bytes each).
pub fn compact_v4(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect()
}

/// Decodes BEP 7 compact IPv6 peers (18 bytes each).
pub fn compact_v6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::from((std::net::Ipv6Addr::from(octets), port))
        })
        .collect()
}
