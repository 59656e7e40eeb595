use std::process::Command;

use anyhow::Result;
use tempfile::tempdir;

fn provchain() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_provchain"));
    for var in ["RUST_LOG", "PROV_DB", "PROV_LOG_LEVEL", "PROV_CHAIN_MODE"] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn json_console_logs_stay_off_stdout() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("cli.db");
    let cfg = dir.path().join("provchain.toml");
    std::fs::write(&cfg, "[logging]\nlevel = \"info\"\njson_console = true\n")?;

    let out = provchain()
        .arg("--db")
        .arg(&db)
        .arg("--config")
        .arg(&cfg)
        .arg("init-db")
        .output()?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let meta: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert!(meta["store_id"].is_string());

    let stderr = String::from_utf8(out.stderr)?;
    let line = stderr
        .lines()
        .find(|l| l.contains("store initialized"))
        .ok_or_else(|| anyhow::anyhow!("no init log line on stderr: {stderr}"))?;
    let event: serde_json::Value = serde_json::from_str(line)?;
    assert_eq!(event["level"], "INFO");
    Ok(())
}

#[test]
fn scan_output_is_plain_json() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("cli.db");

    let run = |args: &[&str]| -> Result<serde_json::Value> {
        let out = provchain().arg("--db").arg(&db).args(args).output()?;
        anyhow::ensure!(
            out.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        Ok(serde_json::from_slice(&out.stdout)?)
    };

    let maker = run(&["add-user", "--role", "manufacturer", "--email", "M@Example.com"])?;
    assert_eq!(maker["email"], "m@example.com");
    let id = maker["id"].as_i64().unwrap_or_default().to_string();

    let reg = run(&["register", "--actor", &id, "--code", "SKU 001", "--name", "Widget"])?;
    let qr = reg["qr"]["qr_payload"].as_str().unwrap_or_default().to_string();

    let report = run(&["scan", "--qr", &qr])?;
    assert_eq!(report["product_code"], "SKU 001");
    assert_eq!(report["message"], "Original (latest state matches)");
    Ok(())
}
