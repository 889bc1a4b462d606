use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use tally_core::LedgerClient;

use crate::sync::backoff::Backoff;
use crate::sync::engine::SyncEngine;
use crate::sync::store::SyncStore;

const DEFAULT_DRAIN_SECS: u64 = 30;
const DEFAULT_DONE_RETENTION_SECS: i64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_base: Option<String>,
    pub api_token: String,
    pub db_path: Option<PathBuf>,
    pub drain_interval: Duration,
    pub done_retention_secs: i64,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_token =
            std::env::var("TALLY_API_TOKEN").context("TALLY_API_TOKEN must be set")?;
        let api_base = std::env::var("TALLY_API_BASE").ok();
        let db_path = std::env::var("TALLY_DB_PATH").ok().map(PathBuf::from);
        let drain_interval =
            Duration::from_secs(read_u64_env("TALLY_DRAIN_SECS", DEFAULT_DRAIN_SECS));
        let done_retention_secs = read_u64_env(
            "TALLY_DONE_RETENTION_SECS",
            DEFAULT_DONE_RETENTION_SECS as u64,
        ) as i64;

        Ok(Self {
            api_base,
            api_token,
            db_path,
            drain_interval,
            done_retention_secs,
        })
    }
}

/// Fire-and-forget drain trigger handed to whatever wants syncing to start
/// now rather than at the next tick (connectivity probes, UI commands).
#[derive(Clone, Debug)]
pub struct DrainHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl DrainHandle {
    pub fn request_drain(&self) {
        let _ = self.tx.send(());
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    drain_tx: mpsc::UnboundedSender<()>,
    drain_rx: mpsc::UnboundedReceiver<()>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = match &config.api_base {
            Some(base) => LedgerClient::with_base_url(base, &config.api_token)?,
            None => LedgerClient::new(&config.api_token)?,
        };
        let store = match &config.db_path {
            Some(path) => SyncStore::open_at(path).await,
            None => SyncStore::open_default().await,
        }
        .context("failed to initialize sync store")?;
        let engine = Arc::new(SyncEngine::new(client, store));

        // A previous process may have died mid-apply or mid-resolution.
        let requeued = engine.recover_processing().await?;
        if requeued > 0 {
            eprintln!("[tallyd] recovered {requeued} stale in-flight items");
        }
        let resumed = engine.resume_decided().await?;
        if resumed > 0 {
            eprintln!("[tallyd] finished {resumed} interrupted conflict resolutions");
        }

        let (drain_tx, drain_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            engine,
            drain_tx,
            drain_rx,
        })
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    pub fn drain_handle(&self) -> DrainHandle {
        DrainHandle {
            tx: self.drain_tx.clone(),
        }
    }

    /// Single drain pass plus housekeeping; used by `--once` and by the
    /// run loop.
    pub async fn drain_once(&self) -> anyhow::Result<()> {
        let summary = self.engine.drain().await?;
        if summary.processed() > 0 {
            eprintln!(
                "[tallyd] drain: committed={} conflicts={} errors={}",
                summary.committed, summary.conflicts, summary.errors
            );
        }
        let pruned = self
            .engine
            .prune_done(self.config.done_retention_secs)
            .await?;
        if pruned > 0 {
            eprintln!("[tallyd] pruned {pruned} done queue items");
        }
        Ok(())
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        eprintln!(
            "[tallyd] started: drain_interval={}s, retention={}s",
            self.config.drain_interval.as_secs(),
            self.config.done_retention_secs
        );

        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300), true);
        let mut failures: u32 = 0;
        let mut ticker = tokio::time::interval(self.config.drain_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = self.drain_rx.recv() => {
                    eprintln!("[tallyd] drain requested");
                }
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("[tallyd] shutting down");
                    return Ok(());
                }
            }

            match self.drain_once().await {
                Ok(()) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff.delay(failures);
                    eprintln!(
                        "[tallyd] drain failed (attempt {failures}): {err}; backing off {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
