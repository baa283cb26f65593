//! REST fallback source: full snapshots pulled while push is untrusted.
//!
//! | Snapshot     | Method | Path                                                  |
//! |--------------|--------|-------------------------------------------------------|
//! | Open positions | GET  | `/api/v1/trades/open`                                 |
//! | Trade history  | GET  | `/api/v1/trades?limit=N`                              |
//! | Candlesticks   | GET  | `/api/v1/market-data/candlesticks?timeframe=&limit=`  |
//!
//! Bodies may be a bare JSON array or wrapped in `{"data": [...]}`. A snapshot
//! is all-or-nothing: one undecodable item fails the whole pull so callers
//! keep their previous state.

use async_trait::async_trait;
use pulse_core::config::ClientConfig;
use pulse_core::error::PulseError;
use pulse_core::json_util::unwrap_list;
use pulse_core::{Candlestick, OpenPosition, TradeRecord};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// Snapshot source used by the aggregator when polling.
#[async_trait]
pub trait FallbackSource: Send + Sync {
    async fn open_positions(&self) -> Result<Vec<OpenPosition>, PulseError>;

    /// Most recent trades, newest first.
    async fn trades(&self, limit: usize) -> Result<Vec<TradeRecord>, PulseError>;

    /// `Ok(None)` when the backend has no candlestick data for `timeframe`.
    async fn candlesticks(
        &self,
        timeframe: &str,
        limit: usize,
    ) -> Result<Option<Vec<Candlestick>>, PulseError>;
}

pub struct RestFallbackClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestFallbackClient {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, PulseError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PulseError::Fallback(format!("http client: {e}")))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, PulseError> {
        Self::new(&config.api_base_url, config.request_timeout())
    }

    /// GET `path` and return its list items; `Ok(None)` on 404.
    async fn get_list(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<Vec<Value>>, PulseError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| PulseError::Fallback(format!("GET {path}: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(PulseError::Fallback(format!("GET {path}: HTTP {}", resp.status())));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| PulseError::Fallback(format!("GET {path}: bad body: {e}")))?;
        let items = unwrap_list(body)
            .ok_or_else(|| PulseError::Fallback(format!("GET {path}: expected a list")))?;
        debug!("[fallback] GET {path} → {} items", items.len());
        Ok(Some(items))
    }

    async fn get_required<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, PulseError> {
        match self.get_list(path, query).await? {
            Some(items) => decode_all(path, items),
            None => Err(PulseError::Fallback(format!("GET {path}: HTTP 404"))),
        }
    }
}

fn decode_all<T: DeserializeOwned>(path: &str, items: Vec<Value>) -> Result<Vec<T>, PulseError> {
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| PulseError::Fallback(format!("GET {path}: bad item: {e}")))
        })
        .collect()
}

#[async_trait]
impl FallbackSource for RestFallbackClient {
    async fn open_positions(&self) -> Result<Vec<OpenPosition>, PulseError> {
        self.get_required("/api/v1/trades/open", &[]).await
    }

    async fn trades(&self, limit: usize) -> Result<Vec<TradeRecord>, PulseError> {
        self.get_required("/api/v1/trades", &[("limit", limit.to_string())]).await
    }

    async fn candlesticks(
        &self,
        timeframe: &str,
        limit: usize,
    ) -> Result<Option<Vec<Candlestick>>, PulseError> {
        const PATH: &str = "/api/v1/market-data/candlesticks";
        let query = [("timeframe", timeframe.to_string()), ("limit", limit.to_string())];
        match self.get_list(PATH, &query).await? {
            Some(items) => decode_all(PATH, items).map(Some),
            None => Ok(None),
        }
    }
}
