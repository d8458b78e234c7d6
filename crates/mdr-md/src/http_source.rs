//! HTTP ticker adapter (CoinPaprika `/v1/tickers` shape).
//!
//! Upstream ids are not arrival-ordered, so each payload is stamped with
//! `external_id = "{last_updated}|{id}"`. RFC 3339 UTC timestamps sort
//! lexicographically, which makes the external id a usable cursor.

use async_trait::async_trait;
use mdr_schemas::{RawPayload, SourceKind, EXTERNAL_ID_FIELD};
use serde_json::Value;

use crate::normalize;
use crate::provider::{newer_than, FetchError, SourceAdapter};

const TICKERS_PATH: &str = "/v1/tickers";
const MAX_ERROR_BODY: usize = 256;

pub struct HttpTickerSource {
    label: String,
    base_url: String,
    api_key: Option<String>,
    limit: Option<u32>,
    http: reqwest::Client,
}

impl std::fmt::Debug for HttpTickerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTickerSource")
            .field("label", &self.label)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("limit", &self.limit)
            .finish()
    }
}

impl HttpTickerSource {
    pub fn new(label: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            limit: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }

    fn tickers_url(&self) -> String {
        format!("{}{}", self.base_url, TICKERS_PATH)
    }
}

#[async_trait]
impl SourceAdapter for HttpTickerSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Http
    }

    async fn fetch(&self, since_id: Option<&str>) -> Result<Vec<RawPayload>, FetchError> {
        let mut req = self.http.get(self.tickers_url());
        if let Some(limit) = self.limit {
            req = req.query(&[("limit", limit)]);
        }
        if let Some(key) = &self.api_key {
            req = req.header(reqwest::header::AUTHORIZATION, key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(FetchError::Api {
                status: status.as_u16(),
                message: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let items = match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(items)) => items,
            Ok(_) => return Err(FetchError::Decode("expected a JSON array of tickers".into())),
            Err(e) => return Err(FetchError::Decode(e.to_string())),
        };

        let total = items.len();
        let mut out = Vec::with_capacity(total);
        for item in items {
            let Value::Object(mut payload) = item else {
                tracing::warn!(source = %self.label, "skipping non-object ticker element");
                continue;
            };
            if let Some(id) = stamp_external_id(&payload) {
                payload.insert(EXTERNAL_ID_FIELD.to_string(), Value::String(id));
            }
            if newer_than(&payload, since_id) {
                out.push(payload);
            }
        }

        tracing::debug!(
            source = %self.label,
            fetched = total,
            kept = out.len(),
            "http tickers fetched"
        );
        Ok(out)
    }
}

/// `"{last_updated}|{id}"`, or `None` when either part is missing.
fn stamp_external_id(payload: &RawPayload) -> Option<String> {
    let id = normalize::text(payload.get("id"))?;
    let updated = normalize::text(payload.get("last_updated"))?;
    Some(format!("{updated}|{id}"))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
