//! Periodic sampling of transfer progress.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use crate::engine::{EngineError, TransferHandle};

/// Time between progress samples.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub completed: u64,
    pub missing: u64,
    pub at: Instant,
}

impl ProgressSample {
    /// Queries both byte counts from the engine.
    pub fn take<H: TransferHandle>(handle: &H) -> Result<Self, EngineError> {
        Ok(Self {
            completed: handle.bytes_completed()?,
            missing: handle.bytes_missing()?,
            at: Instant::now(),
        })
    }

    pub fn total(&self) -> u64 {
        self.completed.saturating_add(self.missing)
    }

    /// Percent complete, or `None` while the total is zero.
    pub fn percent(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.completed as f64 * 100.0 / total as f64),
        }
    }
}

/// Yields one sample per interval. The first tick fires one full interval
/// after creation.
pub struct ProgressReporter {
    ticker: Interval,
}

impl ProgressReporter {
    pub fn new(period: Duration) -> Self {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { ticker }
    }

    /// Waits for the next tick and samples. Cancel safe.
    pub async fn next<H: TransferHandle>(&mut self, handle: &H) -> Result<ProgressSample, EngineError> {
        self.ticker.tick().await;
        ProgressSample::take(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Script, started};

    fn sample(completed: u64, missing: u64) -> ProgressSample {
        ProgressSample {
            completed,
            missing,
            at: Instant::now(),
        }
    }

    #[test]
    fn test_percent_is_guarded() {
        assert_eq!(sample(0, 0).percent(), None);
        assert_eq!(sample(0, 10).percent(), Some(0.0));
        assert_eq!(sample(10, 0).percent(), Some(100.0));
        assert_eq!(sample(1, 3).percent(), Some(25.0));
        let huge = sample(u64::MAX, u64::MAX);
        assert_eq!(huge.total(), u64::MAX);
        assert!(huge.percent().is_some_and(|p| (0.0..=100.0).contains(&p)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_start_one_interval_in() {
        let (_client, handle) = started(Script::default()).await;

        let start = Instant::now();
        let mut reporter = ProgressReporter::new(PROGRESS_INTERVAL);
        let mut previous = 0;
        for n in 1..=3u32 {
            let sample = reporter.next(&handle).await.unwrap();
            assert_eq!(sample.at - start, PROGRESS_INTERVAL * n);
            assert!(sample.completed >= previous);
            assert_eq!(sample.total(), 1_000_000);
            previous = sample.completed;
        }
    }
}
