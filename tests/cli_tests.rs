//! CLI integration tests for the failover binary
//!
//! These tests verify that the CLI commands work correctly by running
//! the actual compiled binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command instance for the failover binary
#[allow(deprecated)]
fn failover_cmd() -> Command {
    let mut cmd = Command::cargo_bin("failover").expect("Failed to find failover binary");
    cmd.env("NO_COLOR", "1")
        .env_remove("FAILOVER_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn write_input(dir: &TempDir, lines: &[&str]) -> std::path::PathBuf {
    let path = dir.path().join("items.txt");
    fs::write(&path, lines.join("\n")).unwrap();
    path
}

// ============================================================================
// --help / --version
// ============================================================================

#[test]
fn test_help_lists_commands() {
    failover_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("classify"))
        .stdout(predicate::str::contains("dry-run"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_flag() {
    failover_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ============================================================================
// classify
// ============================================================================

#[test]
fn test_classify_rate_limit() {
    failover_cmd()
        .args(["classify", "429 Too Many Requests", "--provider", "gemini"])
        .assert()
        .success()
        .stdout(predicate::str::contains("kind:       rate_limit"))
        .stdout(predicate::str::contains("strategy:   wait_and_retry"))
        .stdout(predicate::str::contains("retry in:   60s"));
}

#[test]
fn test_classify_json() {
    let output = failover_cmd()
        .args(["classify", "Invalid API key", "--provider", "sentiment-api", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(value["kind"], "authentication");
    assert_eq!(value["provider"], "sentiment-api");
    assert_eq!(value["retryable"], false);
    assert_eq!(value["recovery_strategy"], "user_action_required");
}

#[test]
fn test_classify_aborted_is_timeout() {
    failover_cmd()
        .args(["classify", "request cancelled", "--aborted"])
        .assert()
        .success()
        .stdout(predicate::str::contains("kind:       timeout"));
}

#[test]
fn test_classify_unknown_provider() {
    failover_cmd()
        .args(["classify", "boom", "--provider", "openai"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown provider"));
}

// ============================================================================
// config / providers
// ============================================================================

#[test]
fn test_config_defaults() {
    failover_cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[circuit_breaker]"))
        .stdout(predicate::str::contains("failure_threshold = 3"));
}

#[test]
fn test_config_file_and_env_override() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("failover.toml");
    fs::write(&path, "[bulk]\nbatch_size = 5\n").unwrap();

    failover_cmd()
        .env("FAILOVER__CIRCUIT_BREAKER__FAILURE_THRESHOLD", "7")
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_size = 5"))
        .stdout(predicate::str::contains("failure_threshold = 7"));
}

#[test]
fn test_config_missing_file() {
    failover_cmd()
        .args(["config", "--config", "does/not/exist.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration file not found"));
}

#[test]
fn test_providers_lists_all() {
    failover_cmd()
        .arg("providers")
        .assert()
        .success()
        .stdout(predicate::str::contains("huggingface"))
        .stdout(predicate::str::contains("Google Gemini"))
        .stdout(predicate::str::contains("sentiment-api"));
}

// ============================================================================
// dry-run
// ============================================================================

#[test]
fn test_dry_run_all_succeed() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, &["great product", "", "terrible support", "it arrived"]);

    let output = failover_cmd()
        .args(["dry-run", "--input"])
        .arg(&input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let stats: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(stats["total_processed"], 3);
    assert_eq!(stats["error_count"], 0);
    assert_eq!(stats["label_distribution"]["positive"], 1);
    assert_eq!(stats["label_distribution"]["negative"], 1);
    assert_eq!(stats["aborted"], false);
}

#[test]
fn test_dry_run_switches_provider_and_notifies() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, &["one", "two", "three", "four", "five"]);
    let config = dir.path().join("failover.toml");
    fs::write(
        &config,
        "[providers]\norder = [\"huggingface\", \"ollama\"]\ndisabled = [\"gemini\", \"sentiment-api\"]\n\n[bulk]\nhigh_error_backoff_ms = 0\ninter_batch_delay_ms = 0\n",
    )
    .unwrap();

    let assert = failover_cmd()
        .args(["dry-run", "--fail", "huggingface=503 Service Unavailable", "--input"])
        .arg(&input)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("Circuit Breaker Opened"));

    let stats: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(stats["total_processed"], 5);
    assert_eq!(stats["error_count"], 3);
    assert_eq!(stats["provider_switches"][0]["from"], "huggingface");
    assert_eq!(stats["provider_switches"][0]["to"], "ollama");
}

#[test]
fn test_dry_run_no_providers_fails() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, &["one"]);
    let config = dir.path().join("failover.toml");
    fs::write(
        &config,
        "[providers]\ndisabled = [\"huggingface\", \"ollama\", \"gemini\", \"sentiment-api\"]\n",
    )
    .unwrap();

    failover_cmd()
        .args(["dry-run", "--input"])
        .arg(&input)
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no healthy providers"));
}

#[test]
fn test_dry_run_rejects_bad_failure_rule() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, &["one"]);

    failover_cmd()
        .args(["dry-run", "--fail", "gemini", "--input"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("PROVIDER=MESSAGE"));
}
