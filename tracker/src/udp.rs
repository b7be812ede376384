//! UDP Tracker Client implementation (BEP 15).

use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{Cursor, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

use super::{
    ANNOUNCE_TIMEOUT, TrackerClient, TrackerError, TrackerEvent, TrackerRequest, TrackerResponse,
    compact_v4,
};

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Client for communicating with UDP trackers.
pub struct UdpTracker {
    url: String,
}

impl UdpTracker {
    /// Creates a new `UdpTracker`.
    ///
    /// # Arguments
    /// * `url` - The UDP URL of the tracker (e.g., `udp://tracker.opentrackr.org:1337`).
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    fn endpoint(&self) -> Result<(String, u16), TrackerError> {
        let invalid = |reason| TrackerError::InvalidUrl {
            url: self.url.clone(),
            reason,
        };
        let parsed = url::Url::parse(&self.url).map_err(|_| invalid("unparseable"))?;
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = parsed.port().ok_or_else(|| invalid("missing port"))?;
        Ok((host.trim_matches(['[', ']']).to_string(), port))
    }

    async fn exchange(&self, socket: &UdpSocket, packet: &[u8]) -> Result<Vec<u8>, TrackerError> {
        socket.send(packet).await?;
        let mut buf = vec![0u8; 4096];
        let amt = timeout(ANNOUNCE_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| TrackerError::Timeout(ANNOUNCE_TIMEOUT))??;
        buf.truncate(amt);
        Ok(buf)
    }
}

#[async_trait]
impl TrackerClient for UdpTracker {
    fn url(&self) -> &str {
        &self.url
    }

    /// Connect handshake for a connection id, then the announce itself.
    async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
        let (host, port) = self.endpoint()?;
        let remote = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or(TrackerError::InvalidUrl {
                url: self.url.clone(),
                reason: "host did not resolve",
            })?;
        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;

        let (connect_tid, announce_tid) = {
            let mut rng = rand::rng();
            (rng.random::<u32>(), rng.random::<u32>())
        };

        let reply = self
            .exchange(&socket, &connect_request(connect_tid)?)
            .await?;
        let connection_id = parse_connect_response(&reply, connect_tid)?;
        trace!(url = %self.url, connection_id, "udp tracker connected");

        let reply = self
            .exchange(
                &socket,
                &announce_request(connection_id, announce_tid, request)?,
            )
            .await?;
        parse_announce_response(&reply, announce_tid)
    }
}

fn connect_request(transaction_id: u32) -> std::io::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(16);
    packet.write_u64::<BigEndian>(PROTOCOL_ID)?;
    packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    Ok(packet)
}

fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    request: &TrackerRequest,
) -> std::io::Result<Vec<u8>> {
    let event_id = match request.event {
        None => 0,
        Some(TrackerEvent::Completed) => 1,
        Some(TrackerEvent::Started) => 2,
        Some(TrackerEvent::Stopped) => 3,
    };
    let num_want = request
        .numwant
        .and_then(|n| i32::try_from(n).ok())
        .unwrap_or(-1);

    let mut packet = Vec::with_capacity(98);
    packet.write_u64::<BigEndian>(connection_id)?;
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    packet.write_all(&request.info_hash)?;
    packet.write_all(&request.peer_id)?;
    packet.write_u64::<BigEndian>(request.downloaded)?;
    packet.write_u64::<BigEndian>(request.left)?;
    packet.write_u64::<BigEndian>(request.uploaded)?;
    packet.write_u32::<BigEndian>(event_id)?;
    packet.write_u32::<BigEndian>(0)?; // IP address: use the sender's
    packet.write_u32::<BigEndian>(request.key)?;
    packet.write_i32::<BigEndian>(num_want)?;
    packet.write_u16::<BigEndian>(request.port)?;
    Ok(packet)
}

/// Reads action and transaction id, surfacing tracker-side errors.
fn read_header(buf: &[u8], expected_tid: u32) -> Result<(u32, Cursor<&[u8]>), TrackerError> {
    if buf.len() < 8 {
        return Err(TrackerError::Malformed("udp reply shorter than header"));
    }
    let mut rdr = Cursor::new(buf);
    let action = rdr.read_u32::<BigEndian>()?;
    let transaction_id = rdr.read_u32::<BigEndian>()?;
    if transaction_id != expected_tid {
        return Err(TrackerError::Malformed("transaction id mismatch"));
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(&buf[8..]).into_owned(),
        ));
    }
    Ok((action, rdr))
}

fn parse_connect_response(buf: &[u8], expected_tid: u32) -> Result<u64, TrackerError> {
    let (action, mut rdr) = read_header(buf, expected_tid)?;
    if action != ACTION_CONNECT || buf.len() < 16 {
        return Err(TrackerError::Malformed("unexpected connect reply"));
    }
    Ok(rdr.read_u64::<BigEndian>()?)
}

fn parse_announce_response(buf: &[u8], expected_tid: u32) -> Result<TrackerResponse, TrackerError> {
    let (action, mut rdr) = read_header(buf, expected_tid)?;
    if action != ACTION_ANNOUNCE || buf.len() < 20 {
        return Err(TrackerError::Malformed("unexpected announce reply"));
    }
    let interval = rdr.read_u32::<BigEndian>()?;
    let leechers = rdr.read_u32::<BigEndian>()?;
    let seeders = rdr.read_u32::<BigEndian>()?;

    Ok(TrackerResponse {
        interval,
        peers: compact_v4(&buf[20..]),
        complete: Some(seeders),
        incomplete: Some(leechers),
    })
}
