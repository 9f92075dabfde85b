//! Where a sync client gets occupancy data from.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use super::client::SyncConfig;
use super::sse::SseDecoder;
use crate::feed::{FeedMessage, OccupancyFeed, SlotView};
use crate::version::PARKD_VERSION;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("transient network failure: {0}")]
    TransientNetworkFailure(String),
    #[error("malformed feed message: {0}")]
    Decode(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no occupancy data after {attempts} attempts")]
    Unavailable { attempts: u32 },
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else {
            SyncError::TransientNetworkFailure(e.to_string())
        }
    }
}

pub type FeedStream = BoxStream<'static, Result<FeedMessage, SyncError>>;

/// Push and pull access to an occupancy feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Every non-available slot.
    async fn snapshot(&self) -> Result<Vec<SlotView>, SyncError>;

    /// Open a push stream. Resolves once the connection is established.
    async fn subscribe(&self) -> Result<FeedStream, SyncError>;
}

#[async_trait]
impl FeedSource for OccupancyFeed {
    async fn snapshot(&self) -> Result<Vec<SlotView>, SyncError> {
        Ok(OccupancyFeed::snapshot(self))
    }

    async fn subscribe(&self) -> Result<FeedStream, SyncError> {
        if self.is_closed() {
            return Err(SyncError::TransientNetworkFailure("feed closed".to_string()));
        }
        Ok(OccupancyFeed::subscribe(self).into_stream().map(Ok).boxed())
    }
}

/// Twice the server's SSE keep-alive interval.
pub const DEFAULT_PUSH_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Feed source backed by a remote parkd server (`/snapshot` and `/events`).
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl HttpFeedSource {
    /// `request_timeout` bounds snapshot requests and connection setup. The
    /// push stream fails after `DEFAULT_PUSH_IDLE_TIMEOUT` of silence.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("parkd/{}", PARKD_VERSION))
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
            idle_timeout: DEFAULT_PUSH_IDLE_TIMEOUT,
        })
    }

    /// Source with the timeouts of a sync client's config.
    pub fn with_config(base_url: impl Into<String>, config: &SyncConfig) -> Result<Self, SyncError> {
        Ok(Self::new(base_url, config.request_timeout)?.with_idle_timeout(config.push_idle_timeout))
    }

    /// Longest the push stream may stay silent, keep-alive comments
    /// included, before it fails with `SyncError::Timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn snapshot(&self) -> Result<Vec<SlotView>, SyncError> {
        let views = self
            .client
            .get(self.url("/snapshot"))
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<SlotView>>()
            .await?;
        Ok(views)
    }

    async fn subscribe(&self) -> Result<FeedStream, SyncError> {
        let response = self
            .client
            .get(self.url("/events"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(url = %self.base_url, "Push stream connected");

        let idle = self.idle_timeout;
        let bytes = response.bytes_stream().map_err(SyncError::from);
        let stream = futures::stream::unfold(
            (bytes.boxed(), SseDecoder::default()),
            move |(mut bytes, mut decoder)| async move {
                loop {
                    if let Some(data) = decoder.next_data() {
                        let message = serde_json::from_str::<FeedMessage>(&data)
                            .map_err(|e| SyncError::Decode(e.to_string()));
                        return Some((message, (bytes, decoder)));
                    }
                    let chunk = match tokio::time::timeout(idle, bytes.next()).await {
                        Ok(chunk) => chunk?,
                        Err(_) => return Some((Err(SyncError::Timeout(idle)), (bytes, decoder))),
                    };
                    match chunk {
                        Ok(chunk) => decoder.push(&chunk),
                        Err(e) => return Some((Err(e), (bytes, decoder))),
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}
