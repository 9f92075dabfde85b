//! Sync client - keeps an `OccupancyView` current.
//!
//! Two modes:
//! - `Pushing`: apply messages from a live push stream
//! - `Polling`: fetch a snapshot every `poll_interval`
//!
//! Transitions:
//! - connect success → Pushing
//! - connect failure, grace period elapsed, stream closed, failed or idle → Polling
//! - `retry_push()` or `push_retry_interval` elapsed while Polling → try Pushing
//!
//! Every snapshot fully replaces the view, so switching modes never leaves
//! stale entries behind.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::source::{FeedSource, FeedStream, SyncError};
use super::view::OccupancyView;
use crate::feed::FeedMessage;
use crate::pool::SlotId;

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long a push connection may take before falling back to polling.
    pub push_grace: Duration,
    pub poll_interval: Duration,
    /// While polling, how often to try the push stream again.
    pub push_retry_interval: Duration,
    /// Bound on a single snapshot request.
    pub request_timeout: Duration,
    /// Consecutive failed polls before the client reports itself unavailable.
    pub max_failures: u32,
    pub backoff_base: Duration,
    /// Longest a push stream may stay silent before the client falls back
    /// to polling. Applied by `HttpFeedSource::with_config`.
    pub push_idle_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_grace: env_millis("PARKD_SYNC_PUSH_GRACE_MS", 2_000),
            poll_interval: env_millis("PARKD_SYNC_POLL_INTERVAL_MS", 3_000),
            push_retry_interval: env_millis("PARKD_SYNC_PUSH_RETRY_MS", 30_000),
            request_timeout: env_millis("PARKD_SYNC_REQUEST_TIMEOUT_MS", 5_000),
            max_failures: std::env::var("PARKD_SYNC_MAX_FAILURES")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(5),
            backoff_base: env_millis("PARKD_SYNC_BACKOFF_MS", 100),
            push_idle_timeout: env_millis("PARKD_SYNC_PUSH_IDLE_MS", 30_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Pushing,
    #[default]
    Polling,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub consecutive_failures: u32,
    /// Set only once retries are exhausted without obtaining data.
    pub error: Option<SyncError>,
    /// True once any data has been applied.
    pub synced: bool,
}

pub struct SyncClient {
    source: Arc<dyn FeedSource>,
    config: SyncConfig,
}

impl SyncClient {
    pub fn new(source: Arc<dyn FeedSource>, config: SyncConfig) -> Self {
        Self { source, config }
    }

    /// Start syncing on the current tokio runtime.
    pub fn spawn(self) -> SyncHandle {
        let (view_tx, view_rx) = watch::channel(OccupancyView::default());
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let view_tx = Arc::new(view_tx);
        let cancel = CancellationToken::new();
        let (retry_tx, retry_rx) = watch::channel(());

        let runner = Runner {
            source: self.source,
            config: self.config,
            view: Arc::clone(&view_tx),
            status: status_tx,
            cancel: cancel.clone(),
            retry: retry_rx,
        };
        let task = tokio::spawn(runner.run());

        SyncHandle {
            view_tx,
            view_rx,
            status_rx,
            cancel,
            retry: retry_tx,
            task,
        }
    }
}

/// Handle to a running sync client. Dropping it does not stop the client;
/// call `shutdown`.
pub struct SyncHandle {
    view_tx: Arc<watch::Sender<OccupancyView>>,
    view_rx: watch::Receiver<OccupancyView>,
    status_rx: watch::Receiver<SyncStatus>,
    cancel: CancellationToken,
    retry: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn view(&self) -> watch::Receiver<OccupancyView> {
        self.view_rx.clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub fn current(&self) -> OccupancyView {
        self.view_rx.borrow().clone()
    }

    pub fn mode(&self) -> SyncMode {
        self.status_rx.borrow().mode
    }

    /// Ask a polling client to try the push stream now. Has no effect on a
    /// later polling period if the client is pushing when called.
    pub fn retry_push(&self) {
        self.retry.send_replace(());
    }

    /// Mark the caller's own held slot so the view reports it as reserved.
    pub fn set_own_slot(&self, slot: Option<SlotId>) {
        self.view_tx.send_modify(|view| view.set_own_slot(slot));
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sync task ended abnormally");
        }
    }
}

struct Runner {
    source: Arc<dyn FeedSource>,
    config: SyncConfig,
    view: Arc<watch::Sender<OccupancyView>>,
    status: watch::Sender<SyncStatus>,
    cancel: CancellationToken,
    retry: watch::Receiver<()>,
}

/// `backoff_base * 2^failures`, capped at `push_retry_interval`.
fn backoff(config: &SyncConfig, failures: u32) -> Duration {
    config
        .backoff_base
        .checked_mul(1u32 << failures.min(10))
        .unwrap_or(Duration::MAX)
        .min(config.push_retry_interval)
}

impl Runner {
    async fn run(self) {
        tracing::debug!("Sync client started");
        while !self.cancel.is_cancelled() {
            if let Some(stream) = self.connect().await {
                self.set_mode(SyncMode::Pushing);
                self.push(stream).await;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_mode(SyncMode::Polling);
            self.poll().await;
        }
        tracing::debug!("Sync client stopped");
    }

    async fn connect(&self) -> Option<FeedStream> {
        let grace = self.config.push_grace;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(grace, self.source.subscribe()) => match result {
                Ok(Ok(stream)) => {
                    tracing::info!("Push connection established");
                    Some(stream)
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Push connection failed - polling");
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        grace_ms = grace.as_millis(),
                        "Push connection not established in time - polling"
                    );
                    None
                }
            },
        }
    }

    async fn push(&self, mut stream: FeedStream) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(message)) => self.apply(message),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Push stream failed - polling");
                    return;
                }
                None => {
                    tracing::info!("Push stream closed - polling");
                    return;
                }
            }
        }
    }

    async fn poll(&self) {
        let retry_push_at = Instant::now() + self.config.push_retry_interval;
        let mut failures: u32 = 0;
        // Requests made before this polling period began are ignored.
        let mut retry = self.retry.clone();
        let _ = retry.borrow_and_update();

        loop {
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = tokio::time::timeout(self.config.request_timeout, self.source.snapshot()) => r,
            };

            let wait = match fetched {
                Ok(Ok(views)) => {
                    failures = 0;
                    self.apply(FeedMessage::Snapshot(views));
                    self.config.poll_interval
                }
                Ok(Err(e)) => {
                    failures += 1;
                    self.record_failure(failures, e)
                }
                Err(_) => {
                    failures += 1;
                    self.record_failure(failures, SyncError::Timeout(self.config.request_timeout))
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                Ok(()) = retry.changed() => {
                    tracing::info!("Push retry requested");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if Instant::now() >= retry_push_at {
                tracing::debug!("Retrying push connection");
                return;
            }
        }
    }

    /// Log and publish a failed poll; returns how long to wait before the next one.
    fn record_failure(&self, failures: u32, error: SyncError) -> Duration {
        let backoff = backoff(&self.config, failures);

        let exhausted = failures >= self.config.max_failures;
        if exhausted {
            tracing::error!(
                error = %error,
                attempts = failures,
                "No occupancy data - retries exhausted"
            );
        } else {
            tracing::warn!(
                error = %error,
                attempt = failures,
                backoff_ms = backoff.as_millis(),
                "Snapshot poll failed, retrying"
            );
        }

        self.status.send_modify(|status| {
            status.consecutive_failures = failures;
            if exhausted {
                status.error = Some(SyncError::Unavailable { attempts: failures });
            }
        });
        backoff
    }

    fn apply(&self, message: FeedMessage) {
        self.view.send_if_modified(|view| view.apply(message));
        self.status.send_if_modified(|status| {
            let changed = status.error.is_some() || status.consecutive_failures != 0 || !status.synced;
            status.error = None;
            status.consecutive_failures = 0;
            status.synced = true;
            changed
        });
    }

    fn set_mode(&self, mode: SyncMode) {
        self.status.send_if_modified(|status| {
            if status.mode == mode {
                return false;
            }
            tracing::debug!(from = ?status.mode, to = ?mode, "Sync mode changed");
            status.mode = mode;
            true
        });
    }
}
