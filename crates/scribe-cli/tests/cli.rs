use anyhow::Result;
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn scribe() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_scribe"));
    cmd.stdin(Stdio::null());
    cmd
}

#[test]
fn test_configuration_dump_reflects_overrides() -> Result<()> {
    let output = scribe()
        .args(["rec", "--configuration", "-w", "syslog", "--payload", "512"])
        .output()?;

    assert!(output.status.success());
    let config: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(config["writer"], "syslog");
    assert_eq!(config["payload"], 512);
    assert_eq!(config["limit"]["action"], "pass");
    Ok(())
}

#[test]
fn test_file_writer_requires_path() -> Result<()> {
    let output = scribe().args(["rec", "--", "true"]).output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("file.path"), "stderr: {stderr}");
    Ok(())
}

#[test]
fn test_record_then_play_echo() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("session.log");

    let rec = scribe()
        .arg("rec")
        .arg("-o")
        .arg(&path)
        .args(["--", "sh", "-c", "echo hello"])
        .output()?;
    assert!(rec.status.success(), "rec failed: {}", String::from_utf8_lossy(&rec.stderr));
    assert!(String::from_utf8_lossy(&rec.stdout).contains("hello"));

    let play = scribe()
        .arg("play")
        .arg("-i")
        .arg(&path)
        .args(["--speed", "16"])
        .output()?;
    assert!(play.status.success(), "play failed: {}", String::from_utf8_lossy(&play.stderr));
    assert!(String::from_utf8_lossy(&play.stdout).contains("hello"));
    Ok(())
}

#[test]
fn test_exit_code_of_recorded_command() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("session.log");

    let rec = scribe()
        .arg("rec")
        .arg("-o")
        .arg(&path)
        .args(["--", "sh", "-c", "exit 7"])
        .output()?;
    assert_eq!(rec.status.code(), Some(7));
    Ok(())
}

#[test]
fn test_play_missing_file_fails() -> Result<()> {
    let temp = TempDir::new()?;

    let play = scribe()
        .arg("play")
        .arg("-i")
        .arg(temp.path().join("missing.log"))
        .output()?;
    assert!(!play.status.success());
    let stderr = String::from_utf8_lossy(&play.stderr);
    assert!(stderr.contains("Not found"), "stderr: {stderr}");
    Ok(())
}

#[test]
fn test_play_goto_end_of_recording() -> Result<()> {
    let temp = TempDir::new()?;
    let path = temp.path().join("session.log");

    let rec = scribe()
        .arg("rec")
        .arg("-o")
        .arg(&path)
        .args(["--latency", "0.1", "--", "sh", "-c", "echo one; sleep 1; echo two"])
        .output()?;
    assert!(rec.status.success());

    let start = std::time::Instant::now();
    let play = scribe()
        .arg("play")
        .arg("-i")
        .arg(&path)
        .args(["--goto", "end"])
        .output()?;
    assert!(play.status.success());
    let stdout = String::from_utf8_lossy(&play.stdout);
    assert!(stdout.contains("one") && stdout.contains("two"));
    assert!(start.elapsed() < std::time::Duration::from_secs(1));
    Ok(())
}

#[test]
fn test_payload_cap_holds_for_recorded_output() -> Result<()> {
    let temp = TempDir::new()?;
    for payload in [32usize, 18342] {
        let path = temp.path().join(format!("payload-{payload}.log"));
        let rec = scribe()
            .arg("rec")
            .arg("-o")
            .arg(&path)
            .args(["--payload", &payload.to_string()])
            .args(["--", "sh", "-c", "seq 1 6000"])
            .output()?;
        assert!(rec.status.success(), "rec failed: {}", String::from_utf8_lossy(&rec.stderr));

        let mut output = String::new();
        let mut chunks = 0;
        for line in std::fs::read_to_string(&path)?.lines() {
            let record: serde_json::Value = serde_json::from_str(line)?;
            if let Some(txt) = record["txt"].as_str() {
                assert!(txt.len() < payload, "{} byte payload with cap {payload}", txt.len());
                if record["stream"] == "output" {
                    output.push_str(txt);
                    chunks += 1;
                }
            }
        }
        assert!(output.contains("5999\r\n6000\r\n"));
        if payload == 32 {
            assert!(chunks > 100, "only {chunks} output records");
        }
    }
    Ok(())
}
