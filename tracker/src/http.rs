//! HTTP Tracker Client implementation.

use async_trait::async_trait;
use fetch_core::bencoding::{Bencode, decode_all};
use std::net::{IpAddr, SocketAddr};
use tracing::trace;

use super::{
    ANNOUNCE_TIMEOUT, TrackerClient, TrackerError, TrackerEvent, TrackerRequest, TrackerResponse,
    compact_v4, compact_v6,
};

/// Client for communicating with HTTP/HTTPS trackers.
pub struct HttpTracker {
    url: String,
    http: reqwest::Client,
}

impl HttpTracker {
    /// Creates a new `HttpTracker`.
    ///
    /// # Arguments
    /// * `url` - The URL of the tracker announce endpoint.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn announce_url(&self, request: &TrackerRequest) -> String {
        let info_hash_encoded =
            form_urlencoded::byte_serialize(&request.info_hash).collect::<String>();
        let peer_id_encoded = form_urlencoded::byte_serialize(&request.peer_id).collect::<String>();

        let mut params = form_urlencoded::Serializer::new(String::new());
        params
            .append_pair("port", &request.port.to_string())
            .append_pair("uploaded", &request.uploaded.to_string())
            .append_pair("downloaded", &request.downloaded.to_string())
            .append_pair("left", &request.left.to_string())
            .append_pair("compact", "1")
            .append_pair("key", &format!("{:08x}", request.key));

        if let Some(event) = request.event {
            let event_str = match event {
                TrackerEvent::Started => "started",
                TrackerEvent::Stopped => "stopped",
                TrackerEvent::Completed => "completed",
            };
            params.append_pair("event", event_str);
        }

        if let Some(numwant) = request.numwant {
            params.append_pair("numwant", &numwant.to_string());
        }

        let separator = if self.url.contains('?') { "&" } else { "?" };
        format!(
            "{}{separator}info_hash={}&peer_id={}&{}",
            self.url,
            info_hash_encoded,
            peer_id_encoded,
            params.finish()
        )
    }
}

#[async_trait]
impl TrackerClient for HttpTracker {
    fn url(&self) -> &str {
        &self.url
    }

    async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
        let full_url = self.announce_url(request);
        trace!(url = %full_url, "http announce");

        let bytes = self
            .http
            .get(&full_url)
            .timeout(ANNOUNCE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        parse_http_response(&decode_all(&bytes)?)
    }
}

fn parse_http_response(root: &Bencode) -> Result<TrackerResponse, TrackerError> {
    if !matches!(root, Bencode::Dict(_)) {
        return Err(TrackerError::Malformed("response is not a dictionary"));
    }
    if let Some(failure) = root.get(b"failure reason").and_then(Bencode::as_string) {
        return Err(TrackerError::Failure(failure));
    }

    let interval = root
        .get(b"interval")
        .and_then(Bencode::as_int)
        .and_then(|i| u32::try_from(i).ok())
        .ok_or(TrackerError::Malformed("missing or invalid interval"))?;

    let count = |key: &[u8]| {
        root.get(key)
            .and_then(Bencode::as_int)
            .and_then(|i| u32::try_from(i).ok())
    };

    let mut peers = match root.get(b"peers") {
        Some(Bencode::Bytes(b)) => compact_v4(b),
        Some(Bencode::List(list)) => list.iter().filter_map(dictionary_peer).collect(),
        _ => Vec::new(),
    };
    if let Some(Bencode::Bytes(b)) = root.get(b"peers6") {
        peers.extend(compact_v6(b));
    }

    Ok(TrackerResponse {
        interval,
        peers,
        complete: count(b"complete"),
        incomplete: count(b"incomplete"),
    })
}

// Non-compact form: a list of {ip, port} dictionaries.
fn dictionary_peer(item: &Bencode) -> Option<SocketAddr> {
    let ip: IpAddr = item.get(b"ip")?.as_string()?.parse().ok()?;
    let port = u16::try_from(item.get(b"port")?.as_int()?).ok()?;
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TrackerRequest {
        TrackerRequest {
            info_hash: [0xAB; 20],
            peer_id: *b"-TF0100-abcdefghijkl",
            port: 51413,
            uploaded: 0,
            downloaded: 10,
            left: 90,
            event: Some(TrackerEvent::Started),
            numwant: Some(50),
            key: 0xdead_beef,
        }
    }

    #[test]
    fn test_announce_url_encodes_binary_fields() {
        let tracker = HttpTracker::new("http://t.example/announce");
        let url = tracker.announce_url(&request());
        assert!(url.starts_with("http://t.example/announce?info_hash=%AB%AB"));
        assert!(url.contains("peer_id=-TF0100-abcdefghijkl"));
        assert!(url.contains("port=51413"));
        assert!(url.contains("left=90"));
        assert!(url.contains("event=started"));
        assert!(url.contains("key=deadbeef"));
    }

    #[test]
    fn test_announce_url_keeps_existing_query() {
        let tracker = HttpTracker::new("http://t.example/announce?passkey=1");
        assert!(tracker
            .announce_url(&request())
            .starts_with("http://t.example/announce?passkey=1&info_hash="));
    }

    #[test]
    fn test_parse_compact_response() {
        let body = b"d8:completei3e10:incompletei1e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let response = parse_http_response(&decode_all(body).unwrap()).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.complete, Some(3));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d8:intervali60e5:peersld2:ip9:10.0.0.124:porti80eed2:ip3:bad4:porti1eeee";
        let response = parse_http_response(&decode_all(body).unwrap()).unwrap();
        assert_eq!(response.peers, vec!["10.0.0.12:80".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = b"d14:failure reason12:unregisterede";
        match parse_http_response(&decode_all(body).unwrap()) {
            Err(TrackerError::Failure(reason)) => assert_eq!(reason, "unregistered"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
