//! Status output: progress lines and lifecycle records.

use tracing::{debug, error, info, warn};

use crate::progress::ProgressSample;
use crate::signals::ProcessSignal;

/// Something worth telling the user about, other than progress.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    ConfigFailed { reason: String },
    BootstrapFailed { reason: String },
    MetadataReady,
    TransferStarted,
    Completed,
    Interrupted,
    Terminated { signal: ProcessSignal },
    AbortedBeforeMetadata { signal: ProcessSignal },
    SignalIgnored { signal: ProcessSignal },
    ProgressQueryFailed { reason: String },
}

impl Lifecycle {
    pub fn message(&self) -> &'static str {
        match self {
            Lifecycle::ConfigFailed { .. } => "invalid configuration",
            Lifecycle::BootstrapFailed { .. } => "could not start the download",
            Lifecycle::MetadataReady => "torrent metadata ready",
            Lifecycle::TransferStarted => "transfer started",
            Lifecycle::Completed => "all torrents downloaded",
            Lifecycle::Interrupted => "torrent download interrupted",
            Lifecycle::Terminated { .. } => "closed all clients on termination signal",
            Lifecycle::AbortedBeforeMetadata { .. } => "terminated before metadata arrived",
            Lifecycle::SignalIgnored { .. } => "ignoring signal",
            Lifecycle::ProgressQueryFailed { .. } => "progress query failed",
        }
    }
}

/// Receives every user-facing record. Injected into the orchestration
/// components instead of a global logger.
pub trait StatusSink: Send + Sync {
    fn progress(&self, sample: &ProgressSample);
    fn lifecycle(&self, event: &Lifecycle);
}

/// Emits records as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn progress(&self, sample: &ProgressSample) {
        info!(
            completed = %human_bytes(sample.completed),
            total = %human_bytes(sample.total()),
            percent = %format_percent(sample.percent()),
            "downloading"
        );
    }

    fn lifecycle(&self, event: &Lifecycle) {
        let message = event.message();
        match event {
            Lifecycle::ConfigFailed { reason }
            | Lifecycle::BootstrapFailed { reason }
            | Lifecycle::ProgressQueryFailed { reason } => error!(%reason, "{message}"),
            Lifecycle::Interrupted => error!("{message}"),
            Lifecycle::Terminated { signal } | Lifecycle::AbortedBeforeMetadata { signal } => {
                warn!(%signal, "{message}")
            }
            Lifecycle::SignalIgnored { signal } => debug!(%signal, "{message}"),
            Lifecycle::MetadataReady | Lifecycle::TransferStarted | Lifecycle::Completed => {
                info!("{message}")
            }
        }
    }
}

/// SI byte count: plain bytes below 1 kB, otherwise three decimals.
pub fn human_bytes(n: u64) -> String {
    const UNITS: [(f64, &str); 4] = [(1e12, "TB"), (1e9, "GB"), (1e6, "MB"), (1e3, "KB")];
    let value = n as f64;
    match UNITS.iter().find(|(scale, _)| value >= *scale) {
        Some((scale, unit)) => format!("{:.3} {unit}", value / scale),
        None => format!("{n} B"),
    }
}

/// `%5.2f` style percent, or `n/a` while the total is unknown.
pub fn format_percent(percent: Option<f64>) -> String {
    match percent {
        Some(p) => format!("{p:5.2}%"),
        None => "n/a".to_string(),
    }
}
