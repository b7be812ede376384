//! One run from a resolved configuration to an outcome.

use std::sync::Arc;

use fetch_core::RateLimiterSpec;
use tracing::{debug, info};

use crate::config::RunConfiguration;
use crate::coordinator::{Coordinator, Outcome};
use crate::engine::Engine;
use crate::error::display_chain;
use crate::report::{Lifecycle, StatusSink};
use crate::session::{self, ResolvedSource};
use crate::signals::SignalStream;

/// Bootstraps a session on `engine` and coordinates it until it ends.
/// Signals must already be registered so nothing raised during bootstrap
/// is lost.
pub async fn run<E: Engine>(
    engine: &E,
    config: &RunConfiguration,
    signals: SignalStream,
    sink: Arc<dyn StatusSink>,
) -> Outcome {
    let download_limit = RateLimiterSpec::from_megabits(config.download_limit);
    let upload_limit = RateLimiterSpec::from_megabits(config.upload_limit);
    debug!(?download_limit, ?upload_limit, "bandwidth limits");

    let session = match session::bootstrap(engine, config, download_limit, upload_limit).await {
        Ok(session) => session,
        Err(e) => {
            sink.lifecycle(&Lifecycle::BootstrapFailed {
                reason: display_chain(&e),
            });
            return Outcome::BootstrapFailed;
        }
    };
    let source = match session.source() {
        ResolvedSource::Magnet => "magnet",
        ResolvedSource::File { .. } => "file",
    };
    info!(source, dir = %config.data_dir.display(), "torrent added");

    Coordinator::new(session, signals, sink).run().await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{ListenPort, TorrentSource};
    use crate::engine::scripted::{Script, ScriptedEngine};
    use crate::report::recording::RecordingSink;

    fn config() -> RunConfiguration {
        RunConfiguration {
            data_dir: PathBuf::from("/tmp/downloads"),
            debug: false,
            listen_port: ListenPort::Ephemeral,
            download_limit: Some(-5.0),
            upload_limit: Some(8.0),
            source: TorrentSource {
                magnet: Some("magnet:?xt=scripted".into()),
                file: Some(PathBuf::from("fallback.torrent")),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limits_reach_the_engine() {
        let (engine, log) = ScriptedEngine::new(Script::default());
        let (_tx, signals) = SignalStream::channel();
        let sink = Arc::new(RecordingSink::default());
        assert_eq!(run(&engine, &config(), signals, sink).await, Outcome::Completed);

        let engine_config = log.config.lock().unwrap().clone().unwrap();
        assert!(engine_config.download_limit.is_unlimited());
        match engine_config.upload_limit {
            RateLimiterSpec::Limited { bytes_per_second, .. } => {
                assert!((bytes_per_second - 1_000_000.0).abs() < 1e-6)
            }
            RateLimiterSpec::Unlimited => panic!("upload should be limited"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_failure_is_reported_once() {
        let (engine, log) = ScriptedEngine::new(Script {
            magnet_ok: false,
            file_ok: false,
            ..Script::default()
        });
        let (_tx, signals) = SignalStream::channel();
        let sink = Arc::new(RecordingSink::default());
        let outcome = run(&engine, &config(), signals, sink.clone()).await;

        assert_eq!(outcome, Outcome::BootstrapFailed);
        assert_eq!(outcome.exit_code(), 1);
        assert!(!log.download_started());
        let events = sink.events();
        assert_eq!(events.len(), 1);
        let Lifecycle::BootstrapFailed { reason } = &events[0] else {
            panic!("unexpected {events:?}");
        };
        assert!(reason.contains("magnet: magnet link rejected"));
        assert!(reason.contains("file: torrent file fallback.torrent rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_magnet_failure_stays_quiet_when_file_works() {
        let (engine, log) = ScriptedEngine::new(Script {
            magnet_ok: false,
            ..Script::default()
        });
        let (_tx, signals) = SignalStream::channel();
        let sink = Arc::new(RecordingSink::default());
        assert_eq!(run(&engine, &config(), signals, sink.clone()).await, Outcome::Completed);
        assert_eq!(log.added(), vec!["file"]);
        assert!(
            !sink
                .events()
                .iter()
                .any(|e| matches!(e, Lifecycle::BootstrapFailed { .. }))
        );
    }
}
