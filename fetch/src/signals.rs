//! Process signals, classified into shutdown requests and ignorable noise.

use std::fmt;
use std::io;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Quit,
    Terminate,
    Hangup,
}

/// What the coordinator should do about a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationRequest {
    Shutdown(ProcessSignal),
    Ignorable(ProcessSignal),
}

impl ProcessSignal {
    pub fn classify(self) -> TerminationRequest {
        match self {
            ProcessSignal::Interrupt | ProcessSignal::Quit | ProcessSignal::Terminate => {
                TerminationRequest::Shutdown(self)
            }
            ProcessSignal::Hangup => TerminationRequest::Ignorable(self),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessSignal::Interrupt => "SIGINT",
            ProcessSignal::Quit => "SIGQUIT",
            ProcessSignal::Terminate => "SIGTERM",
            ProcessSignal::Hangup => "SIGHUP",
        }
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signals delivered since registration, in arrival order.
pub struct SignalStream {
    rx: mpsc::Receiver<ProcessSignal>,
}

impl SignalStream {
    /// Installs handlers for interrupt, quit, terminate and hangup. Hangup is
    /// registered only so that it no longer kills the process.
    ///
    /// Must be called inside a tokio runtime. Signals raised after this
    /// returns are queued until read.
    pub fn register() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel(16);
        install(tx)?;
        Ok(Self { rx })
    }

    /// A stream fed by hand.
    pub fn channel() -> (mpsc::Sender<ProcessSignal>, Self) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Self { rx })
    }

    /// Next classified signal; `None` once every source is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<TerminationRequest> {
        self.rx.recv().await.map(ProcessSignal::classify)
    }
}

#[cfg(unix)]
fn install(tx: mpsc::Sender<ProcessSignal>) -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let kinds = [
        (SignalKind::interrupt(), ProcessSignal::Interrupt),
        (SignalKind::quit(), ProcessSignal::Quit),
        (SignalKind::terminate(), ProcessSignal::Terminate),
        (SignalKind::hangup(), ProcessSignal::Hangup),
    ];
    for (kind, which) in kinds {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(which).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn install(tx: mpsc::Sender<ProcessSignal>) -> io::Result<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(ProcessSignal::Interrupt).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}
