//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (`api_key_env`,
//!   `scheduler_token_env`).
//! - Binaries call [`resolve_secrets`] once at startup and pass the result
//!   into adapter constructors and the daemon state.
//! - `Debug` output redacts every value.
//! - Error messages reference the env var NAME, never the value.
//!
//! Every secret is optional: a source without a key sends no auth header,
//! and a daemon without a scheduler token leaves trigger/purge open.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::IngestConfig;

#[derive(Clone, Default)]
pub struct ResolvedSecrets {
    /// API keys keyed by source label. Sources whose env var is unset are absent.
    pub api_keys: BTreeMap<String, String>,
    pub scheduler_token: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: BTreeMap<&str, &str> = self
            .api_keys
            .keys()
            .map(|k| (k.as_str(), "<REDACTED>"))
            .collect();
        f.debug_struct("ResolvedSecrets")
            .field("api_keys", &keys)
            .field(
                "scheduler_token",
                &self.scheduler_token.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

impl ResolvedSecrets {
    pub fn api_key(&self, label: &str) -> Option<&str> {
        self.api_keys.get(label).map(String::as_str)
    }
}

/// Resolve from the process environment.
pub fn resolve_secrets(cfg: &IngestConfig) -> Result<ResolvedSecrets> {
    resolve_secrets_with(cfg, |name| std::env::var(name).ok())
}

/// Resolve with an injectable lookup (tests pass a map).
pub fn resolve_secrets_with<F>(cfg: &IngestConfig, lookup: F) -> Result<ResolvedSecrets>
where
    F: Fn(&str) -> Option<String>,
{
    let resolve = |var: &str| -> Result<Option<String>> {
        let name = var.trim();
        if name.is_empty() {
            return Ok(None);
        }
        if !is_env_name(name) {
            bail!("CONFIG_SECRET_ENV_NAME_INVALID name={name}");
        }
        Ok(lookup(name).filter(|v| !v.trim().is_empty()))
    };

    let mut out = ResolvedSecrets::default();
    for s in &cfg.sources {
        if let Some(var) = s.api_key_env.as_deref() {
            if let Some(v) = resolve(var)? {
                out.api_keys.insert(s.label.clone(), v);
            }
        }
    }
    if let Some(var) = cfg.ingest.scheduler_token_env.as_deref() {
        out.scheduler_token = resolve(var)?;
    }
    Ok(out)
}

fn is_env_name(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_ingest_config_from_strings;

    const YAML: &str = r#"
ingest:
  scheduler_token_env: MDR_SCHEDULER_TOKEN
sources:
  - label: coinpaprika
    kind: http
    base_url: http://localhost
    api_key_env: PAPRIKA_KEY
  - label: csv
    kind: csv
    path: x.csv
"#;

    #[test]
    fn resolves_present_vars_and_skips_blank_ones() {
        let cfg = load_ingest_config_from_strings(&[YAML]).unwrap().ingest;
        let env: BTreeMap<&str, &str> =
            [("PAPRIKA_KEY", "k-123"), ("MDR_SCHEDULER_TOKEN", "   ")].into();
        let s = resolve_secrets_with(&cfg, |n| env.get(n).map(|v| v.to_string())).unwrap();
        assert_eq!(s.api_key("coinpaprika"), Some("k-123"));
        assert_eq!(s.api_key("csv"), None);
        assert_eq!(s.scheduler_token, None);
    }

    #[test]
    fn debug_never_prints_values() {
        let mut s = ResolvedSecrets::default();
        s.api_keys.insert("coinpaprika".into(), "super-secret".into());
        s.scheduler_token = Some("tok-456".into());
        let dbg = format!("{s:?}");
        assert!(dbg.contains("coinpaprika"));
        assert!(!dbg.contains("super-secret"));
        assert!(!dbg.contains("tok-456"));
    }

    #[test]
    fn env_name_with_spaces_is_rejected() {
        let y = "ingest:\n  scheduler_token_env: 'not a name'\n";
        let cfg = load_ingest_config_from_strings(&[y]).unwrap().ingest;
        let err = resolve_secrets_with(&cfg, |_| None).unwrap_err();
        assert!(err.to_string().contains("not a name"));
    }
}
