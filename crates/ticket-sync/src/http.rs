//! reqwest-backed collaborators: the paginated listing, the push stream, and
//! the status command.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::loader::PageSource;
use crate::protocol::Page;
use crate::session::StatusCommand;
use crate::stream::{EventSource, FrameStream};

const STREAM_CONTENT_TYPES: [&str; 3] = [
    "text/event-stream",
    "text/plain",
    "application/octet-stream",
];

#[derive(Clone)]
pub struct HttpPageSource {
    http: Client,
    base_url: String,
    collection: String,
    page_size: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusRequest<'a> {
    ticket_id: &'a str,
    status: i64,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    success: bool,
}

impl HttpPageSource {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>, page_size: u32) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            page_size,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(&config.base_url, &config.collection, config.page_size)
    }

    pub fn with_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn listing_url(&self) -> String {
        format!("{}/{}", self.base_url, self.collection)
    }

    /// Posts a status change. `Ok(false)` means the server declined it.
    pub async fn post_status(&self, id: &str, status: i64) -> SyncResult<bool> {
        let url = format!("{}/status", self.base_url);
        let res = self
            .http
            .post(url)
            .json(&StatusRequest {
                ticket_id: id,
                status,
            })
            .send()
            .await?;
        let res = ensure_success(res).await?;
        let body: StatusResponse = res.json().await?;
        debug!(
            target = "ticket_sync::http",
            id,
            status,
            success = body.success,
            "status update answered"
        );
        Ok(body.success)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, page: u32) -> SyncResult<Page> {
        let res = self
            .http
            .get(self.listing_url())
            .query(&[("limit", self.page_size), ("page", page)])
            .send()
            .await?;
        let res = ensure_success(res).await?;
        let body = res.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl StatusCommand for HttpPageSource {
    async fn update_status(&self, id: &str, status: i64) -> SyncResult<bool> {
        self.post_status(id, status).await
    }
}

/// Server-sent-events endpoint yielding the `data` of each event.
#[derive(Clone)]
pub struct HttpEventSource {
    http: Client,
    url: String,
}

impl HttpEventSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.stream_url())
    }

    pub fn with_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self) -> SyncResult<FrameStream> {
        let res = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let res = ensure_success(res).await?;

        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !STREAM_CONTENT_TYPES
            .iter()
            .any(|accepted| content_type.starts_with(accepted))
        {
            warn!(
                target = "ticket_sync::stream",
                url = %self.url,
                content_type = %content_type,
                "unexpected stream content type; reading it as event-stream anyway"
            );
        }

        let frames = lossy_lines(res.bytes_stream())
            .eventsource()
            .filter_map(|event| {
                let frame = match event {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(Ok(event.data)),
                    Err(err) => Some(Err(SyncError::Transport(err.to_string()))),
                };
                futures::future::ready(frame)
            });
        Ok(frames.boxed())
    }
}

/// Re-chunks a byte stream at line boundaries and decodes each complete run
/// of lines lossily, so one frame with invalid UTF-8 cannot wedge the parser.
fn lossy_lines<S, B, E>(chunks: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    stream::unfold(
        Some((Box::pin(chunks), LineDecoder::default())),
        |state| async move {
            let (mut chunks, mut decoder) = state?;
            loop {
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        if let Some(text) = decoder.push(chunk.as_ref()) {
                            return Some((Ok(text), Some((chunks, decoder))));
                        }
                    }
                    Some(Err(err)) => return Some((Err(err), Some((chunks, decoder)))),
                    None => return decoder.finish().map(|text| (Ok(text), None)),
                }
            }
        },
    )
}

#[derive(Debug, Default)]
struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    /// Buffers `chunk` and returns every complete line seen so far. A trailing
    /// `\r` is held back in case its `\n` arrives in the next chunk.
    fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);
        let len = self.pending.len();
        let cut = (0..len).rev().find(|&i| match self.pending[i] {
            b'\n' => true,
            b'\r' => i + 1 < len,
            _ => false,
        })? + 1;
        let rest = self.pending.split_off(cut);
        let complete = std::mem::replace(&mut self.pending, rest);
        Some(String::from_utf8_lossy(&complete).into_owned())
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Maps a non-2xx response to [`SyncError::Protocol`], logging the body.
async fn ensure_success(res: Response) -> SyncResult<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let url = res.url().to_string();
    let body = res.text().await.unwrap_or_default();
    debug!(
        target = "ticket_sync::http",
        %url,
        status = status.as_u16(),
        body = %body,
        "request rejected"
    );
    Err(SyncError::protocol(status))
}
