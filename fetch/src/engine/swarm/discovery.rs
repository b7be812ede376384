//! Peer discovery through the torrent's trackers.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, info};
use tracker::{TrackerClient, TrackerEvent, TrackerRequest, get_tracker_client};

use super::SwarmContext;
use super::transfer::{Transfer, TransferState};

const DEFAULT_INTERVAL: u32 = 300;
const MIN_INTERVAL: Duration = Duration::from_secs(60);
const MAX_INTERVAL: Duration = Duration::from_secs(1800);
const NUMWANT: u32 = 50;
/// Reported as `left` while the payload size is still unknown.
const UNKNOWN_LEFT: u64 = 16 * 1024;

/// Announces to every tracker, feeds the returned peers to the transfer and
/// re-announces on the shortest interval any tracker asked for.
pub(crate) async fn announce_loop(transfer: Arc<Transfer>, ctx: Arc<SwarmContext>) {
    let trackers: Vec<Arc<dyn TrackerClient>> = transfer
        .trackers
        .iter()
        .filter_map(|url| {
            let client = get_tracker_client(url);
            if client.is_none() {
                debug!(url, "unsupported tracker scheme");
            }
            client.map(Arc::from)
        })
        .collect();
    if trackers.is_empty() {
        info!(torrent = %transfer.name, "no usable trackers, waiting for inbound peers");
        return;
    }

    let key = rand::rng().random();
    let mut shutdown = ctx.shutdown.clone();
    let mut state = transfer.state_watch();
    let mut event = Some(TrackerEvent::Started);
    let mut completion_sent = false;

    loop {
        let request = announce_request(&transfer, ctx.peer_id, ctx.listen_port, key, event);
        let interval = announce_round(&transfer, &trackers, &request).await;
        event = None;

        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            _ = tokio::time::sleep(interval) => {}
            Ok(_) = state.wait_for(|s| *s == TransferState::Complete), if !completion_sent => {
                completion_sent = true;
                event = Some(TrackerEvent::Completed);
            }
        }
    }
}

fn announce_request(
    transfer: &Transfer,
    peer_id: [u8; 20],
    port: u16,
    key: u32,
    event: Option<TrackerEvent>,
) -> TrackerRequest {
    let left = match transfer.payload() {
        Some(_) => transfer.bytes_missing(),
        None => UNKNOWN_LEFT,
    };
    TrackerRequest {
        info_hash: transfer.info_hash,
        peer_id,
        port,
        uploaded: transfer.bytes_uploaded(),
        downloaded: transfer.bytes_completed(),
        left,
        event,
        numwant: Some(NUMWANT),
        key,
    }
}

async fn announce_round(
    transfer: &Transfer,
    trackers: &[Arc<dyn TrackerClient>],
    request: &TrackerRequest,
) -> Duration {
    let mut round = JoinSet::new();
    for tracker in trackers {
        let tracker = tracker.clone();
        let request = request.clone();
        round.spawn(async move {
            let result = tracker.announce(&request).await;
            (tracker, result)
        });
    }

    let mut shortest: Option<u32> = None;
    while let Some(joined) = round.join_next().await {
        let Ok((tracker, result)) = joined else {
            continue;
        };
        match result {
            Ok(response) => {
                debug!(
                    url = tracker.url(),
                    peers = response.peers.len(),
                    seeders = response.complete,
                    leechers = response.incomplete,
                    interval = response.interval,
                    "announce succeeded"
                );
                for peer in response.peers {
                    transfer.discovered(peer);
                }
                shortest = Some(shortest.map_or(response.interval, |s| s.min(response.interval)));
            }
            Err(e) => debug!(url = tracker.url(), error = %e, "announce failed"),
        }
    }
    next_interval(shortest)
}

fn next_interval(requested: Option<u32>) -> Duration {
    Duration::from_secs(u64::from(requested.unwrap_or(DEFAULT_INTERVAL))).clamp(MIN_INTERVAL, MAX_INTERVAL)
}
