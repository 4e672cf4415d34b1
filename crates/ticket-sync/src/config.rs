use std::time::Duration;

use serde::Deserialize;

use crate::backoff::{clamp_jitter, Backoff};
use crate::error::{SyncError, SyncResult};
use crate::stream::StreamConfig;

/// How page data competes with entries the stream already touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Stream data wins for the rest of the session.
    #[default]
    StreamWins,
    /// Page data replaces a live entry only when its `updatedAt` is strictly newer.
    NewestWins,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            stream_url: None,
            collection: default_collection(),
            page_size: default_page_size(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            merge_policy: MergePolicy::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl SyncConfig {
    /// Reads `TICKET_SYNC_*` variables. Callers decide how to fall back on an
    /// error, usually to `SyncConfig::default().normalize()` once logging is up.
    pub fn try_from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TICKET_SYNC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(SyncConfig::normalize)
    }

    pub fn normalize(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = default_base_url();
        }
        self.stream_url = normalize_opt(self.stream_url.take());
        self.collection = self.collection.trim().trim_matches('/').to_string();
        if self.collection.is_empty() {
            self.collection = default_collection();
        }
        if self.page_size == 0 {
            self.page_size = default_page_size();
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            self.backoff_max_ms = self.backoff_base_ms;
        }
        self.backoff_jitter = clamp_jitter(self.backoff_jitter);
        if self.log_filter.trim().is_empty() {
            self.log_filter = default_log_filter();
        }
        self
    }

    /// Checks that the listing and stream endpoints are absolute http(s) urls.
    pub fn validate(&self) -> SyncResult<()> {
        for raw in [self.base_url.clone(), self.stream_url()] {
            let parsed = url::Url::parse(&raw).map_err(|err| SyncError::InvalidUrl {
                url: raw.clone(),
                reason: err.to_string(),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl {
                    url: raw,
                    reason: format!("unsupported scheme {}", parsed.scheme()),
                });
            }
        }
        Ok(())
    }

    pub fn stream_url(&self) -> String {
        self.stream_url
            .clone()
            .unwrap_or_else(|| format!("{}/stream/issues", self.base_url))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .with_jitter(self.backoff_jitter)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            backoff: self.backoff(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            liveness_timeout: match self.liveness_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_collection() -> String {
    "items".to_string()
}

fn default_page_size() -> u32 {
    10
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter() -> f64 {
    0.5
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_liveness_timeout_ms() -> u64 {
    45_000
}

fn default_log_filter() -> String {
    "info,ticket_sync=debug,ticket_dash=debug".to_string()
}
