//! Async pacing on top of the shared token bucket.

use std::sync::Mutex;

use fetch_core::{RateLimiterSpec, TokenBucket};

/// One direction's bandwidth ceiling, shared by every peer of a client.
pub(crate) struct Throttle {
    bucket: Option<Mutex<TokenBucket>>,
}

impl Throttle {
    pub(crate) fn new(spec: &RateLimiterSpec) -> Self {
        Self {
            bucket: TokenBucket::from_spec(spec).map(Mutex::new),
        }
    }

    /// Waits until `bytes` may be transferred. Returns at once when unlimited.
    pub(crate) async fn acquire(&self, bytes: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let wait = match bucket.lock() {
            Ok(mut bucket) => bucket.reserve(bytes as f64),
            Err(poisoned) => poisoned.into_inner().reserve(bytes as f64),
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
