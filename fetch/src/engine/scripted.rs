//! In-memory engine driven by a fixed script, for orchestration tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fetch_core::CoreError;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{Engine, EngineClient, EngineConfig, EngineError, TransferHandle};

#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub fail_client: bool,
    pub magnet_ok: bool,
    pub file_ok: bool,
    /// Delay before metadata is ready; `None` never resolves.
    pub metadata_after: Option<Duration>,
    /// Delay after `wait_all` starts and the result it yields; `None` never finishes.
    pub complete_after: Option<(Duration, bool)>,
    pub total: u64,
    /// Completed bytes grow by this much on every `bytes_completed` query.
    pub step: u64,
    pub fail_queries: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_client: false,
            magnet_ok: true,
            file_ok: true,
            metadata_after: Some(Duration::ZERO),
            complete_after: Some((Duration::from_secs(10), true)),
            total: 1_000_000,
            step: 100_000,
            fail_queries: false,
        }
    }
}

/// Everything the scripted engine observed.
#[derive(Debug, Default)]
pub(crate) struct CallLog {
    pub closes: AtomicUsize,
    pub download_started: AtomicBool,
    pub added: Mutex<Vec<&'static str>>,
    pub config: Mutex<Option<EngineConfig>>,
}

impl CallLog {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn download_started(&self) -> bool {
        self.download_started.load(Ordering::SeqCst)
    }

    pub fn added(&self) -> Vec<&'static str> {
        self.added.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

pub(crate) struct ScriptedEngine {
    script: Script,
    log: Arc<CallLog>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> (Self, Arc<CallLog>) {
        let log = Arc::new(CallLog::default());
        (
            Self {
                script,
                log: log.clone(),
            },
            log,
        )
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    type Client = ScriptedClient;

    async fn new_client(&self, config: EngineConfig) -> Result<ScriptedClient, EngineError> {
        if self.script.fail_client {
            return Err(EngineError::Listen {
                port: config.listen_port,
                source: std::io::Error::other("scripted bind failure"),
            });
        }
        *self.log.config.lock().unwrap() = Some(config);
        let (closed, _) = watch::channel(false);
        Ok(ScriptedClient {
            script: self.script.clone(),
            log: self.log.clone(),
            closed,
        })
    }
}

pub(crate) struct ScriptedClient {
    script: Script,
    log: Arc<CallLog>,
    closed: watch::Sender<bool>,
}

impl ScriptedClient {
    fn handle(&self, via: &'static str) -> ScriptedHandle {
        self.log.added.lock().unwrap().push(via);
        ScriptedHandle {
            ready_at: self.script.metadata_after.map(|d| Instant::now() + d),
            script: self.script.clone(),
            log: self.log.clone(),
            completed: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EngineClient for ScriptedClient {
    type Handle = ScriptedHandle;

    async fn add_magnet(&self, uri: &str) -> Result<ScriptedHandle, EngineError> {
        if !self.script.magnet_ok || uri.is_empty() {
            return Err(EngineError::Magnet(CoreError::InvalidMagnet {
                reason: "scripted magnet failure".into(),
            }));
        }
        Ok(self.handle("magnet"))
    }

    async fn add_torrent_file(&self, path: &Path) -> Result<ScriptedHandle, EngineError> {
        if !self.script.file_ok {
            return Err(EngineError::TorrentFile {
                path: path.to_path_buf(),
                source: CoreError::InvalidMetainfo {
                    reason: "scripted file failure",
                },
            });
        }
        Ok(self.handle("file"))
    }

    async fn wait_all(&self) -> bool {
        let mut closed = self.closed.subscribe();
        let Some((delay, result)) = self.script.complete_after else {
            let _ = closed.wait_for(|c| *c).await;
            return false;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => result,
            _ = closed.wait_for(|c| *c) => false,
        }
    }

    async fn close(&self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

pub(crate) struct ScriptedHandle {
    ready_at: Option<Instant>,
    script: Script,
    log: Arc<CallLog>,
    completed: AtomicU64,
}

#[async_trait]
impl TransferHandle for ScriptedHandle {
    async fn metadata_ready(&self) {
        match self.ready_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn download_all(&self) {
        self.log.download_started.store(true, Ordering::SeqCst);
    }

    fn bytes_completed(&self) -> Result<u64, EngineError> {
        if self.script.fail_queries {
            return Err(EngineError::Closed);
        }
        let total = self.script.total;
        let step = self.script.step;
        let previous = self
            .completed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some((c + step).min(total))
            })
            .unwrap_or(total);
        Ok((previous + step).min(total))
    }

    fn bytes_missing(&self) -> Result<u64, EngineError> {
        if self.script.fail_queries {
            return Err(EngineError::Closed);
        }
        Ok(self.script.total - self.completed.load(Ordering::SeqCst))
    }
}

pub(crate) fn config() -> EngineConfig {
    EngineConfig {
        data_dir: "/unused".into(),
        debug: false,
        listen_port: 0,
        download_limit: fetch_core::RateLimiterSpec::Unlimited,
        upload_limit: fetch_core::RateLimiterSpec::Unlimited,
    }
}

/// A client with one transfer added by magnet.
pub(crate) async fn started(script: Script) -> (ScriptedClient, ScriptedHandle) {
    let (engine, _log) = ScriptedEngine::new(script);
    let client = engine.new_client(config()).await.unwrap();
    let handle = client.add_magnet("magnet:?xt=scripted").await.unwrap();
    (client, handle)
}
