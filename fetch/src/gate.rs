//! Waiting for torrent metadata while honoring early termination.

use crate::engine::TransferHandle;
use crate::report::{Lifecycle, StatusSink};
use crate::signals::{ProcessSignal, SignalStream, TerminationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Ready,
    Aborted(ProcessSignal),
}

/// Races metadata arrival against shutdown signals, with no timeout.
///
/// Signals already queued win over metadata that is ready at the same time.
/// Ignorable signals are reported and the wait continues.
pub async fn await_metadata<H: TransferHandle>(
    handle: &H,
    signals: &mut SignalStream,
    sink: &dyn StatusSink,
) -> GateOutcome {
    let mut signals_open = true;
    loop {
        tokio::select! {
            biased;
            request = signals.recv(), if signals_open => match request {
                Some(TerminationRequest::Shutdown(signal)) => return GateOutcome::Aborted(signal),
                Some(TerminationRequest::Ignorable(signal)) => {
                    sink.lifecycle(&Lifecycle::SignalIgnored { signal });
                }
                None => signals_open = false,
            },
            _ = handle.metadata_ready() => return GateOutcome::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::scripted::{Script, ScriptedHandle, started};
    use crate::report::recording::RecordingSink;

    async fn handle(script: Script) -> ScriptedHandle {
        started(script).await.1
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_when_metadata_arrives() {
        let handle = handle(Script {
            metadata_after: Some(Duration::from_secs(2)),
            ..Script::default()
        })
        .await;
        let (_tx, mut signals) = SignalStream::channel();
        let sink = RecordingSink::default();
        assert_eq!(await_metadata(&handle, &mut signals, &sink).await, GateOutcome::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_aborts() {
        let handle = handle(Script {
            metadata_after: None,
            ..Script::default()
        })
        .await;
        let (tx, mut signals) = SignalStream::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(ProcessSignal::Quit).await.unwrap();
        });
        let sink = RecordingSink::default();
        assert_eq!(
            await_metadata(&handle, &mut signals, &sink).await,
            GateOutcome::Aborted(ProcessSignal::Quit)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_signal_beats_ready_metadata() {
        let handle = handle(Script::default()).await;
        let (tx, mut signals) = SignalStream::channel();
        tx.send(ProcessSignal::Interrupt).await.unwrap();
        let sink = RecordingSink::default();
        assert_eq!(
            await_metadata(&handle, &mut signals, &sink).await,
            GateOutcome::Aborted(ProcessSignal::Interrupt)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_and_closed_stream_keep_waiting() {
        let handle = handle(Script {
            metadata_after: Some(Duration::from_secs(5)),
            ..Script::default()
        })
        .await;
        let (tx, mut signals) = SignalStream::channel();
        tx.send(ProcessSignal::Hangup).await.unwrap();
        drop(tx);
        let sink = RecordingSink::default();
        assert_eq!(await_metadata(&handle, &mut signals, &sink).await, GateOutcome::Ready);
        assert_eq!(
            sink.events(),
            vec![Lifecycle::SignalIgnored {
                signal: ProcessSignal::Hangup
            }]
        );
    }
}
