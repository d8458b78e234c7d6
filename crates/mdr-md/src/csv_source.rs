//! CSV file adapter.
//!
//! Expected header (case-insensitive, any order, extra columns kept):
//! `external_id,symbol,name,price_usd,market_cap_usd,volume_24h_usd,percent_change_24h,created_at`
//!
//! Each row becomes one payload of string values. A missing file is an empty
//! batch; every other read failure fails the fetch.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use mdr_schemas::{RawPayload, SourceKind};
use serde_json::Value;

use crate::provider::{newer_than, FetchError, SourceAdapter};

const CREATED_AT: &str = "created_at";

#[derive(Debug, Clone)]
pub struct CsvFileSource {
    label: String,
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceAdapter for CsvFileSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Csv
    }

    async fn fetch(&self, since_id: Option<&str>) -> Result<Vec<RawPayload>, FetchError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(source = %self.label, path = %self.path.display(), "csv file absent");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(FetchError::Io(format!("{}: {e}", self.path.display())));
            }
        };

        let fetched_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let rows = parse_rows(&bytes, &fetched_at)?;
        let total = rows.len();
        let out: Vec<RawPayload> = rows
            .into_iter()
            .filter(|p| newer_than(p, since_id))
            .collect();

        tracing::debug!(source = %self.label, rows = total, kept = out.len(), "csv rows read");
        Ok(out)
    }
}

/// Parse CSV bytes into payloads. Empty `created_at` cells get `fetched_at`.
pub fn parse_rows(bytes: &[u8], fetched_at: &str) -> Result<Vec<RawPayload>, FetchError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| FetchError::Decode(format!("csv header: {e}")))?
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();

    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec.map_err(|e| FetchError::Decode(format!("csv row: {e}")))?;
        let mut payload = RawPayload::new();
        for (h, v) in headers.iter().zip(rec.iter()) {
            if h.is_empty() {
                continue;
            }
            payload.insert(h.clone(), Value::String(v.to_string()));
        }
        let blank_created = payload
            .get(CREATED_AT)
            .and_then(Value::as_str)
            .map_or(true, str::is_empty);
        if blank_created {
            payload.insert(CREATED_AT.to_string(), Value::String(fetched_at.to_string()));
        }
        out.push(payload);
    }
    Ok(out)
}
