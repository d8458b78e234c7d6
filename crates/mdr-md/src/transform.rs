//! Raw payload → candidate canonical record.
//!
//! # Invariants
//!
//! - Pure: the caller supplies `ingested_at`; no clock reads.
//! - One payload in, one candidate or one [`TransformError`] out. A bad record
//!   never affects its neighbours.
//! - The key is the trimmed, uppercased ticker.
//! - The candidate is attributed to the adapter's label, not to the schema.

use chrono::{DateTime, Utc};
use mdr_schemas::{
    normalize_key, Candidate, CanonicalRecord, RawPayload, SourceKind, EXTERNAL_ID_FIELD,
};
use serde_json::Value;
use thiserror::Error;

use crate::normalize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },
    #[error("invalid field '{field}' value '{raw}': {reason}")]
    InvalidField {
        field: &'static str,
        raw: String,
        reason: String,
    },
}

/// Field names for one raw schema.
struct Layout {
    symbol: &'static str,
    name: &'static str,
    price: &'static str,
    market_cap: &'static str,
    volume: &'static str,
    change: &'static str,
    created_at: &'static str,
}

const HTTP_LAYOUT: Layout = Layout {
    symbol: "symbol",
    name: "name",
    price: "price",
    market_cap: "market_cap",
    volume: "volume_24h",
    change: "percent_change_24h",
    created_at: "last_updated",
};

const CSV_LAYOUT: Layout = Layout {
    symbol: "symbol",
    name: "name",
    price: "price_usd",
    market_cap: "market_cap_usd",
    volume: "volume_24h_usd",
    change: "percent_change_24h",
    created_at: "created_at",
};

/// Map one payload of the given schema to a candidate record.
pub fn transform(
    kind: SourceKind,
    source_label: &str,
    payload: &RawPayload,
    ingested_at: DateTime<Utc>,
) -> Result<Candidate, TransformError> {
    match kind {
        SourceKind::Http => {
            // Volatile fields live under quotes.USD.
            let quote = payload
                .get("quotes")
                .and_then(|q| q.get("USD"))
                .and_then(Value::as_object);
            map(&HTTP_LAYOUT, source_label, payload, quote, ingested_at)
        }
        SourceKind::Csv => map(&CSV_LAYOUT, source_label, payload, None, ingested_at),
    }
}

fn map(
    layout: &Layout,
    source_label: &str,
    payload: &RawPayload,
    quote: Option<&serde_json::Map<String, Value>>,
    ingested_at: DateTime<Utc>,
) -> Result<Candidate, TransformError> {
    let external_id = mdr_schemas::payload_external_id(payload)
        .ok_or(TransformError::MissingField {
            field: EXTERNAL_ID_FIELD,
        })?
        .to_string();

    let key = normalize::text(payload.get(layout.symbol))
        .and_then(|s| normalize_key(&s))
        .ok_or(TransformError::MissingField {
            field: layout.symbol,
        })?;

    let volatile = |field: &'static str| match quote {
        Some(q) => q.get(field),
        None => payload.get(field),
    };

    let price_raw = volatile(layout.price);
    if normalize::is_absent(price_raw) {
        return Err(TransformError::MissingField {
            field: layout.price,
        });
    }
    let price = price_raw
        .map(|v| normalize::parse_price(v).map_err(|r| invalid(layout.price, v, r)))
        .transpose()?
        .ok_or(TransformError::MissingField {
            field: layout.price,
        })?;

    let created_raw = payload.get(layout.created_at);
    if normalize::is_absent(created_raw) {
        return Err(TransformError::MissingField {
            field: layout.created_at,
        });
    }
    let created_at = created_raw
        .map(|v| normalize::parse_timestamp(v).map_err(|r| invalid(layout.created_at, v, r)))
        .transpose()?
        .ok_or(TransformError::MissingField {
            field: layout.created_at,
        })?;

    let opt = |field: &'static str| {
        let raw = volatile(field);
        normalize::parse_opt_f64(raw).map_err(|r| invalid(field, raw.unwrap_or(&Value::Null), r))
    };

    let name = normalize::text(payload.get(layout.name));
    let name_source = name.as_ref().map(|_| source_label.to_string());

    Ok(Candidate {
        external_id,
        record: CanonicalRecord {
            key,
            name,
            name_source,
            price,
            market_cap_usd: opt(layout.market_cap)?,
            volume_24h_usd: opt(layout.volume)?,
            percent_change_24h: opt(layout.change)?,
            source: source_label.to_string(),
            created_at,
            ingested_at,
        },
    })
}

fn invalid(field: &'static str, raw: &Value, reason: String) -> TransformError {
    let raw = match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    TransformError::InvalidField { field, raw, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mdr_schemas::PriceE8;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn obj(v: Value) -> RawPayload {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    fn ticker() -> RawPayload {
        obj(json!({
            "external_id": "2024-05-31T23:59:00Z|btc-bitcoin",
            "id": "btc-bitcoin",
            "symbol": " btc ",
            "name": "Bitcoin",
            "last_updated": "2024-05-31T23:59:00Z",
            "quotes": {"USD": {
                "price": 67000.123456789,
                "market_cap": 1.3e12,
                "volume_24h": null,
                "percent_change_24h": -0.42
            }}
        }))
    }

    #[test]
    fn http_ticker_maps_nested_quote() {
        let c = transform(SourceKind::Http, "coinpaprika", &ticker(), now()).unwrap();
        assert_eq!(c.external_id, "2024-05-31T23:59:00Z|btc-bitcoin");
        assert_eq!(c.record.key, "BTC");
        assert_eq!(c.record.name.as_deref(), Some("Bitcoin"));
        assert_eq!(c.record.price, PriceE8::parse_decimal("67000.12345679").unwrap());
        assert_eq!(c.record.market_cap_usd, Some(1.3e12));
        assert_eq!(c.record.volume_24h_usd, None);
        assert_eq!(c.record.percent_change_24h, Some(-0.42));
        assert_eq!(c.record.source, "coinpaprika");
        assert_eq!(c.record.name_source.as_deref(), Some("coinpaprika"));
        assert_eq!(
            c.record.created_at,
            Utc.with_ymd_and_hms(2024, 5, 31, 23, 59, 0).unwrap()
        );
        assert_eq!(c.record.ingested_at, now());
    }

    #[test]
    fn csv_row_of_strings_maps() {
        let p = obj(json!({
            "external_id": "row-0001",
            "symbol": "eth",
            "name": "",
            "price_usd": "3000.5",
            "market_cap_usd": "",
            "volume_24h_usd": "12345.6",
            "percent_change_24h": "1.25",
            "created_at": "2024-05-31 10:00:00"
        }));
        let c = transform(SourceKind::Csv, "csv", &p, now()).unwrap();
        assert_eq!(c.record.key, "ETH");
        assert_eq!(c.record.name, None);
        assert_eq!(c.record.price, PriceE8::parse_decimal("3000.5").unwrap());
        assert_eq!(c.record.market_cap_usd, None);
        assert_eq!(c.record.volume_24h_usd, Some(12345.6));
    }

    #[test]
    fn missing_price_is_missing_field() {
        let mut p = ticker();
        p.insert("quotes".into(), json!({"USD": {}}));
        let err = transform(SourceKind::Http, "coinpaprika", &p, now()).unwrap_err();
        assert_eq!(err, TransformError::MissingField { field: "price" });
    }

    #[test]
    fn blank_symbol_is_missing_field() {
        let mut p = ticker();
        p.insert("symbol".into(), json!("   "));
        let err = transform(SourceKind::Http, "coinpaprika", &p, now()).unwrap_err();
        assert_eq!(err, TransformError::MissingField { field: "symbol" });
    }

    #[test]
    fn missing_external_id_is_missing_field() {
        let mut p = ticker();
        p.remove("external_id");
        let err = transform(SourceKind::Http, "coinpaprika", &p, now()).unwrap_err();
        assert_eq!(
            err,
            TransformError::MissingField {
                field: "external_id"
            }
        );
    }

    #[test]
    fn non_numeric_price_is_invalid_field() {
        let p = obj(json!({
            "external_id": "r1", "symbol": "X", "price_usd": "abc",
            "created_at": "2024-05-31T10:00:00Z"
        }));
        match transform(SourceKind::Csv, "csv", &p, now()).unwrap_err() {
            TransformError::InvalidField { field, raw, .. } => {
                assert_eq!(field, "price_usd");
                assert_eq!(raw, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_timestamp_and_bad_optional_number_are_invalid() {
        let p = obj(json!({
            "external_id": "r1", "symbol": "X", "price_usd": "1",
            "created_at": "not-a-date"
        }));
        assert!(matches!(
            transform(SourceKind::Csv, "csv", &p, now()),
            Err(TransformError::InvalidField {
                field: "created_at",
                ..
            })
        ));

        let p = obj(json!({
            "external_id": "r1", "symbol": "X", "price_usd": "1",
            "created_at": "2024-05-31T10:00:00Z", "volume_24h_usd": "lots"
        }));
        assert!(matches!(
            transform(SourceKind::Csv, "csv", &p, now()),
            Err(TransformError::InvalidField {
                field: "volume_24h_usd",
                ..
            })
        ));
    }

    #[test]
    fn missing_created_at_is_missing_field() {
        let mut p = ticker();
        p.remove("last_updated");
        let err = transform(SourceKind::Http, "coinpaprika", &p, now()).unwrap_err();
        assert_eq!(
            err,
            TransformError::MissingField {
                field: "last_updated"
            }
        );
    }
}
