//! Payload and record builders for tests.

use chrono::{DateTime, Utc};
use mdr_schemas::{CanonicalRecord, PriceE8, RawPayload};
use serde_json::{json, Value};

fn object(v: Value) -> RawPayload {
    match v {
        Value::Object(m) => m,
        _ => RawPayload::new(),
    }
}

/// CSV-schema payload (string cells, as the CSV adapter produces).
pub fn csv_row(external_id: &str, symbol: &str, price_usd: &str, created_at: &str) -> RawPayload {
    object(json!({
        "external_id": external_id,
        "symbol": symbol,
        "name": "",
        "price_usd": price_usd,
        "market_cap_usd": "",
        "volume_24h_usd": "",
        "percent_change_24h": "",
        "created_at": created_at,
    }))
}

/// HTTP ticker payload with the external id already stamped.
pub fn ticker(
    id: &str,
    symbol: &str,
    name: &str,
    price: f64,
    market_cap: Option<f64>,
    last_updated: &str,
) -> RawPayload {
    object(json!({
        "external_id": format!("{last_updated}|{id}"),
        "id": id,
        "symbol": symbol,
        "name": name,
        "last_updated": last_updated,
        "quotes": {"USD": {
            "price": price,
            "market_cap": market_cap,
            "volume_24h": null,
            "percent_change_24h": null,
        }},
    }))
}

pub fn record(
    key: &str,
    source: &str,
    price: &str,
    created_at: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
) -> CanonicalRecord {
    CanonicalRecord {
        key: key.to_string(),
        name: None,
        name_source: None,
        price: PriceE8::parse_decimal(price).unwrap_or_default(),
        market_cap_usd: None,
        volume_24h_usd: None,
        percent_change_24h: None,
        source: source.to_string(),
        created_at,
        ingested_at,
    }
}
