//! The control loop that owns a session from metadata to exit.
//!
//! Metadata, completion, progress ticks and signals are multiplexed over one
//! `select!`. The first terminal event wins. Every terminal path closes the
//! session, then reports, then returns the outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::engine::{EngineClient, TransferHandle};
use crate::error::display_chain;
use crate::gate::{self, GateOutcome};
use crate::progress::{PROGRESS_INTERVAL, ProgressReporter};
use crate::report::{Lifecycle, StatusSink};
use crate::session::Session;
use crate::signals::{ProcessSignal, SignalStream, TerminationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingMetadata,
    Transferring,
    Terminal(Outcome),
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The engine finished without completing every transfer.
    Interrupted,
    Terminated(ProcessSignal),
    /// A shutdown signal arrived before metadata.
    Aborted(ProcessSignal),
    ProgressFailed,
    ConfigFailed,
    BootstrapFailed,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Completed => 0,
            _ => 1,
        }
    }
}

pub struct Coordinator<C: EngineClient> {
    session: Session<C>,
    signals: SignalStream,
    sink: Arc<dyn StatusSink>,
    interval: Duration,
    phase: Phase,
}

impl<C: EngineClient> Coordinator<C> {
    pub fn new(session: Session<C>, signals: SignalStream, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            session,
            signals,
            sink,
            interval: PROGRESS_INTERVAL,
            phase: Phase::AwaitingMetadata,
        }
    }

    /// Overrides the progress sampling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    /// Drives the session to a terminal outcome. Calling it again after it
    /// returned yields the same outcome without touching the session.
    pub async fn run(&mut self) -> Outcome {
        if let Phase::Terminal(outcome) = self.phase {
            return outcome;
        }

        let gate =
            gate::await_metadata(self.session.handle(), &mut self.signals, self.sink.as_ref()).await;
        if let GateOutcome::Aborted(signal) = gate {
            return self
                .finish(Outcome::Aborted(signal), Lifecycle::AbortedBeforeMetadata { signal })
                .await;
        }
        self.sink.lifecycle(&Lifecycle::MetadataReady);

        self.session.handle().download_all();
        self.phase = Phase::Transferring;
        self.sink.lifecycle(&Lifecycle::TransferStarted);

        let client = self.session.client();
        let mut completion = tokio::spawn(async move { client.wait_all().await });
        let mut reporter = ProgressReporter::new(self.interval);
        let mut signals_open = true;

        let (outcome, record) = loop {
            tokio::select! {
                biased;
                finished = &mut completion => break match finished {
                    Ok(true) => (Outcome::Completed, Lifecycle::Completed),
                    Ok(false) => (Outcome::Interrupted, Lifecycle::Interrupted),
                    Err(e) => {
                        debug!(error = %e, "completion waiter died");
                        (Outcome::Interrupted, Lifecycle::Interrupted)
                    }
                },
                request = self.signals.recv(), if signals_open => match request {
                    Some(TerminationRequest::Shutdown(signal)) => {
                        break (Outcome::Terminated(signal), Lifecycle::Terminated { signal });
                    }
                    Some(TerminationRequest::Ignorable(signal)) => {
                        self.sink.lifecycle(&Lifecycle::SignalIgnored { signal });
                    }
                    None => signals_open = false,
                },
                sample = reporter.next(self.session.handle()) => match sample {
                    Ok(sample) => self.sink.progress(&sample),
                    Err(e) => {
                        let reason = display_chain(&e);
                        break (Outcome::ProgressFailed, Lifecycle::ProgressQueryFailed { reason });
                    }
                },
            }
        };
        completion.abort();
        self.finish(outcome, record).await
    }

    async fn finish(&mut self, outcome: Outcome, record: Lifecycle) -> Outcome {
        self.phase = Phase::Terminal(outcome);
        self.session.close().await;
        self.sink.lifecycle(&record);
        outcome
    }
}
