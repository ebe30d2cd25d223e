//! HTTP client for a `tend-api` server acting as replication master.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::normalize_base_url;
use crate::models::{Checkpoint, PullBatch, PullStreamItem, PushRow, Todo};
use crate::replication::{PullStream, ReplicationMaster};
use crate::{Error, Result};

const STREAM_BUFFER: usize = 64;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to the `/pull`, `/push` and `/pullStream` endpoints.
#[derive(Clone)]
pub struct HttpMaster {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpMaster {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpMaster")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpMaster {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Bound every pull and push by `timeout`. The live stream is only
    /// bounded while connecting.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            timeout,
            client: reqwest::Client::builder().connect_timeout(timeout).build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn try_pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
        let response = self
            .client
            .get(self.url("pull"))
            .query(&[
                ("updatedAt", checkpoint.updated_at.to_string()),
                ("id", checkpoint.id.clone()),
                ("batchSize", batch_size.to_string()),
            ])
            .timeout(self.timeout)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<PullBatch>().await?)
    }
}

impl ReplicationMaster for HttpMaster {
    /// A failed pull is treated as "nothing new": the input checkpoint is
    /// echoed back with no documents.
    async fn pull(&self, checkpoint: &Checkpoint, batch_size: usize) -> Result<PullBatch> {
        match self.try_pull(checkpoint, batch_size).await {
            Ok(batch) => Ok(batch),
            Err(error) => {
                tracing::warn!(base_url = %self.base_url, %error, "Pull failed, keeping checkpoint");
                Ok(PullBatch::empty(checkpoint.clone()))
            }
        }
    }

    async fn push(&self, rows: &[PushRow]) -> Result<Vec<Todo>> {
        let response = self
            .client
            .post(self.url("push"))
            .json(rows)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_send_error)?;
        let response = ensure_success(response).await?;
        Ok(response.json::<Vec<Todo>>().await?)
    }

    async fn stream(&self) -> Result<PullStream> {
        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .get(self.url("pullStream"))
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        let response = ensure_success(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(read_event_stream(response, tx));
        Ok(rx)
    }
}

/// Forward `data:` frames until the connection ends, then ask for a resync.
async fn read_event_stream(mut response: reqwest::Response, tx: mpsc::Sender<PullStreamItem>) {
    let mut frames = SseFrames::default();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                for data in frames.push(&chunk) {
                    match PullStreamItem::from_json(&data) {
                        Ok(item) => {
                            if tx.send(item).await.is_err() {
                                return;
                            }
                        }
                        Err(error) => {
                            tracing::warn!(%error, "Ignoring malformed stream frame");
                        }
                    }
                }
            }
            Ok(None) => {
                tracing::info!("Master stream closed");
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "Master stream failed");
                break;
            }
        }
    }
    let _ = tx.send(PullStreamItem::Resync).await;
}

/// Incremental server-sent-events parser.
///
/// Collects `data:` lines into events separated by blank lines. Comments
/// (keep-alives) and other fields are ignored.
#[derive(Debug, Default)]
struct SseFrames {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseFrames {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let raw = self.buffer.drain(..=end).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Remote(parse_api_error(status, &body)))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(ApiErrorBody {
        error: Some(message),
    }) = serde_json::from_str::<ApiErrorBody>(body)
    {
        return format!("{} ({})", message.trim(), status.as_u16());
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        let compact: String = trimmed.chars().take(180).collect();
        format!("{compact} ({})", status.as_u16())
    }
}

fn map_send_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(error)
    }
}
