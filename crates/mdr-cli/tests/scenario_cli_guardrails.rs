//! Scenario: CLI commands that must behave without a database.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;

fn yaml_file(body: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    f.write_all(body.as_bytes()).unwrap();
    f
}

#[test]
fn config_hash_is_stable_across_invocations() -> anyhow::Result<()> {
    let base = yaml_file(
        "sources:\n  - { label: csv, kind: csv, path: data/prices.csv }\ningest:\n  fetch_timeout_secs: 10\n",
    );
    let path = base.path().to_string_lossy().to_string();

    let first = std::process::Command::cargo_bin("mdr")?
        .args(["config-hash", &path])
        .output()?;
    let second = std::process::Command::cargo_bin("mdr")?
        .args(["config-hash", &path])
        .output()?;

    assert!(first.status.success());
    let out = String::from_utf8(first.stdout)?;
    assert!(out.starts_with("config_hash="));
    assert_eq!(out, String::from_utf8(second.stdout)?);
    Ok(())
}

#[test]
fn config_hash_rejects_literal_secret() -> anyhow::Result<()> {
    let bad = yaml_file("sources:\n  - { label: x, kind: http, base_url: \"sk-live-abcdef123456\" }\n");
    let mut cmd = std::process::Command::cargo_bin("mdr")?;
    cmd.args(["config-hash", &bad.path().to_string_lossy()]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"))
        .stderr(predicate::str::contains("sk-live").not());
    Ok(())
}

#[test]
fn purge_refuses_without_yes() -> anyhow::Result<()> {
    let mut cmd = std::process::Command::cargo_bin("mdr")?;
    // Unset so a refusal cannot be confused with a connection attempt.
    cmd.env_remove(mdr_db::ENV_DB_URL)
        .args(["purge", "--source", "csv"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("REFUSING PURGE"));
    Ok(())
}

#[test]
fn db_commands_need_database_url() -> anyhow::Result<()> {
    let mut cmd = std::process::Command::cargo_bin("mdr")?;
    cmd.env_remove(mdr_db::ENV_DB_URL)
        .current_dir(std::env::temp_dir())
        .args(["db", "status"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("MDR_DATABASE_URL"));
    Ok(())
}
