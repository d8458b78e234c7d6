//! Layered YAML configuration.
//!
//! Documents are deep-merged in order (later overrides earlier), converted to
//! JSON, checked for literal secrets, canonicalized and hashed. The typed
//! [`IngestConfig`] is then decoded from the merged JSON and validated.
//!
//! The resulting value is built once at startup and passed by reference into
//! the orchestrator and adapters; nothing in the workspace caches settings
//! globally.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

mod ingest;
pub mod secrets;

pub use ingest::{IngestConfig, IngestSection, PriorityConfig, SourceConfig};
pub use secrets::{resolve_secrets, resolve_secrets_with, ResolvedSecrets};

/// Leaf strings that start with one of these abort loading with
/// CONFIG_SECRET_DETECTED. YAML holds env var NAMES only.
const SECRET_SHAPES: &[(&str, &str)] = &[
    ("sk-", "api-key"),
    ("sk_live", "stripe-live"),
    ("sk_test", "stripe-test"),
    ("AKIA", "aws-access-key"),
    ("-----BEGIN", "pem-block"),
    ("ghp_", "github-token"),
    ("glpat-", "gitlab-token"),
    ("xoxb-", "slack-token"),
    ("Bearer ", "auth-header"),
];

/// Strings shorter than this are never treated as secrets.
const MIN_SECRET_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

/// Loaded config plus its typed ingest view.
#[derive(Debug, Clone)]
pub struct LoadedIngestConfig {
    pub loaded: LoadedConfig,
    pub ingest: IngestConfig,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("cannot read config layer {p}")))
        .collect::<Result<Vec<String>>>()?;
    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(serde_json::Map::new());
    for (idx, raw) in yaml_docs.iter().enumerate() {
        let layer: serde_yaml::Value = serde_yaml::from_str(raw)
            .with_context(|| format!("config layer {idx} is not valid YAML"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer {idx} has no JSON form"))?;
        merge_layer(&mut merged, layer);
    }

    if let Some((leaf, kind)) = find_secret_leaf(&merged, String::new()) {
        bail!("CONFIG_SECRET_DETECTED leaf={leaf} kind={kind} value=REDACTED");
    }

    let canonical_json =
        serde_json::to_string(&sorted(&merged)).context("canonical config JSON")?;
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Load layered YAML files and decode + validate the ingest view.
pub fn load_ingest_config(paths: &[&str]) -> Result<LoadedIngestConfig> {
    let loaded = load_layered_yaml(paths)?;
    let ingest = IngestConfig::from_json(&loaded.config_json)?;
    Ok(LoadedIngestConfig { loaded, ingest })
}

pub fn load_ingest_config_from_strings(yaml_docs: &[&str]) -> Result<LoadedIngestConfig> {
    let loaded = load_layered_yaml_from_strings(yaml_docs)?;
    let ingest = IngestConfig::from_json(&loaded.config_json)?;
    Ok(LoadedIngestConfig { loaded, ingest })
}

/// Objects merge key-by-key; any other value (arrays included) replaces
/// what was there.
fn merge_layer(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(into), Value::Object(from)) => {
            for (k, v) in from {
                match into.get_mut(&k) {
                    Some(slot) => merge_layer(slot, v),
                    None => {
                        into.insert(k, v);
                    }
                }
            }
        }
        (slot, other) => *slot = other,
    }
}

/// Object keys sorted at every level, so YAML key order cannot move the hash.
fn sorted(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// JSON pointer and shape name of the first leaf that looks like a secret.
fn find_secret_leaf(v: &Value, at: String) -> Option<(String, &'static str)> {
    match v {
        Value::String(s) => secret_shape(s).map(|kind| (at, kind)),
        Value::Object(map) => map.iter().find_map(|(k, child)| {
            let token = k.replace('~', "~0").replace('/', "~1");
            find_secret_leaf(child, format!("{at}/{token}"))
        }),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, child)| find_secret_leaf(child, format!("{at}/{i}"))),
        _ => None,
    }
}

fn secret_shape(s: &str) -> Option<&'static str> {
    let t = s.trim_start();
    if t.len() < MIN_SECRET_LEN {
        return None;
    }
    SECRET_SHAPES
        .iter()
        .find(|(prefix, _)| t.starts_with(prefix))
        .map(|(_, kind)| *kind)
}
