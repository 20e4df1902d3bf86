use std::process::Command;

use eyre::Context as _;
use predicates::Predicate as _;

fn run(args: &[&str], cfg: &std::path::Path, data: &std::path::Path) -> eyre::Result<std::process::Output> {
    let exe = assert_cmd::cargo::cargo_bin!("dapp-signer");
    Command::new(exe)
        .env("DAPP_SIGNER_CONFIG_DIR", cfg)
        .env("DAPP_SIGNER_DATA_DIR", data)
        .args(args)
        .output()
        .with_context(|| format!("run dapp-signer {}", args.join(" ")))
}

#[test]
fn check_config_writes_defaults_and_reports_ok() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = run(&["check-config", "--json"], cfg_dir.path(), data_dir.path())?;
    assert!(
        out.status.success(),
        "check-config exited non-zero: status={:?}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).context("parse check-config json")?;
    assert_eq!(v.get("ok").and_then(serde_json::Value::as_bool), Some(true));
    assert!(v.get("resilience").and_then(|x| x.as_object()).is_some());
    assert!(cfg_dir.path().join("config.toml").exists());
    Ok(())
}

#[test]
fn check_config_human_output() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = run(&["check-config"], cfg_dir.path(), data_dir.path())?;
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    assert!(predicates::str::contains("resilience: ok").eval(stdout.as_str()));
    assert!(predicates::str::contains("https://rpc.wallet.coinbase.com").eval(stdout.as_str()));
    Ok(())
}

#[test]
fn check_config_rejects_invalid_resilience() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;
    std::fs::write(
        cfg_dir.path().join("config.toml"),
        "[resilience]\nmax_retries = 11\n",
    )?;

    let out = run(&["check-config", "--json"], cfg_dir.path(), data_dir.path())?;
    assert!(!out.status.success(), "invalid config must fail");
    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).context("parse check-config json")?;
    assert_eq!(v.get("ok").and_then(serde_json::Value::as_bool), Some(false));
    assert!(v
        .get("error")
        .and_then(|x| x.as_str())
        .is_some_and(|e| e.contains("maxRetries")));
    Ok(())
}

#[test]
fn classify_prints_analysis() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = run(
        &["classify", "nonce too low: next nonce 5"],
        cfg_dir.path(),
        data_dir.path(),
    )?;
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse analysis")?;
    assert_eq!(v["type"], "NONCE_TOO_LOW");
    assert_eq!(v["isRecoverable"], true);

    let out = run(
        &["classify", "request failed", "--code", "4001"],
        cfg_dir.path(),
        data_dir.path(),
    )?;
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse analysis")?;
    assert_eq!(v["type"], "USER_REJECTED");
    assert_eq!(v["isRecoverable"], false);
    Ok(())
}

#[test]
fn keygen_and_paths() -> eyre::Result<()> {
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = run(&["keygen"], cfg_dir.path(), data_dir.path())?;
    assert!(out.status.success());
    let key = String::from_utf8(out.stdout)?;
    let key = key.trim();
    assert!(!key.is_empty() && key.chars().all(|c| c.is_ascii_hexdigit()));

    let out = run(&["paths"], cfg_dir.path(), data_dir.path())?;
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse paths")?;
    assert_eq!(
        v.get("config_dir").and_then(|x| x.as_str()),
        cfg_dir.path().to_str()
    );
    Ok(())
}
