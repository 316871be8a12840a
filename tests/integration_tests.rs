//! Binary-level integration tests.

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;

/// Test context that sets up a temporary gotya home environment.
struct TestContext {
    temp_dir: TempDir,
    home: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let home = temp_dir.path().join(".gotya");
        std::fs::create_dir_all(&home).expect("failed to create gotya home");
        Self { temp_dir, home }
    }

    fn gotya_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_gotya");
        let mut cmd = Command::new(bin_path);
        cmd.env("HOME", self.temp_dir.path());
        cmd.env("GOTYA_HOME", &self.home);
        cmd
    }

    fn write_bundle_source(&self, name: &str) -> PathBuf {
        let src = self.temp_dir.path().join(format!("src-{name}"));
        std::fs::create_dir_all(src.join("meta")).unwrap();
        std::fs::create_dir_all(src.join("data/bin")).unwrap();
        std::fs::write(src.join("data/bin").join(name), format!("#!{name}")).unwrap();
        src
    }
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .arg("--help")
        .output()
        .expect("failed to run gotya");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .arg("version")
        .output()
        .expect("failed to run gotya");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("gotya"));
}

#[test]
fn test_list_with_empty_state() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .arg("list")
        .output()
        .expect("failed to run gotya");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No artifacts installed"));
}

#[test]
fn test_sync_with_no_repositories_succeeds_silently() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .arg("sync")
        .output()
        .expect("failed to run gotya");
    assert!(output.status.success());
    // No indexes directory appears.
    assert!(!ctx.home.join("cache/indexes").exists());
}

#[test]
fn test_update_without_names_or_all_fails() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .arg("update")
        .output()
        .expect("failed to run gotya");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"));
    assert!(stderr.contains("no packages specified"));
}

#[test]
fn test_uninstall_unknown_artifact_fails() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .args(["uninstall", "ghost"])
        .output()
        .expect("failed to run gotya");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not installed"));
}

#[test]
fn test_artifact_create_and_verify_roundtrip() {
    let ctx = TestContext::new();
    let src = ctx.write_bundle_source("demo");
    let out_dir = ctx.temp_dir.path().join("bundles");

    let output = ctx
        .gotya_cmd()
        .args([
            "artifact",
            "create",
            src.to_str().unwrap(),
            "--output-dir",
            out_dir.to_str().unwrap(),
            "--name",
            "demo",
            "--version",
            "1.0.0",
            "--maintainer",
            "dev@example.com",
        ])
        .output()
        .expect("failed to run gotya");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Successfully created artifact: "));

    let bundle = std::fs::read_dir(&out_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let output = ctx
        .gotya_cmd()
        .args(["artifact", "verify", bundle.to_str().unwrap()])
        .output()
        .expect("failed to run gotya");
    assert!(output.status.success());
}

#[test]
fn test_artifact_verify_missing_file_mentions_not_found() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .args(["artifact", "verify", "/nonexistent/bundle.gotya"])
        .output()
        .expect("failed to run gotya");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_index_generate_missing_source_mentions_source_directory() {
    let ctx = TestContext::new();
    let output = ctx
        .gotya_cmd()
        .args([
            "index",
            "generate",
            "/nonexistent/artifacts",
            ctx.temp_dir.path().join("index.json").to_str().unwrap(),
        ])
        .output()
        .expect("failed to run gotya");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("source directory"));
}

#[test]
fn test_index_generate_refuses_existing_output() {
    let ctx = TestContext::new();
    let src = ctx.write_bundle_source("demo");
    let out_dir = ctx.temp_dir.path().join("bundles");

    let status = ctx
        .gotya_cmd()
        .args([
            "artifact",
            "create",
            src.to_str().unwrap(),
            "--output-dir",
            out_dir.to_str().unwrap(),
            "--name",
            "demo",
            "--version",
            "1.0.0",
        ])
        .status()
        .unwrap();
    assert!(status.success());

    let index_path = ctx.temp_dir.path().join("index.json");
    std::fs::write(&index_path, "{}").unwrap();

    let output = ctx
        .gotya_cmd()
        .args([
            "index",
            "generate",
            out_dir.to_str().unwrap(),
            index_path.to_str().unwrap(),
        ])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("output file exists"));

    // --force overwrites.
    let status = ctx
        .gotya_cmd()
        .args([
            "index",
            "generate",
            out_dir.to_str().unwrap(),
            index_path.to_str().unwrap(),
            "--force",
        ])
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn test_config_init_get_set() {
    let ctx = TestContext::new();

    let status = ctx
        .gotya_cmd()
        .args(["config", "init"])
        .status()
        .unwrap();
    assert!(status.success());
    assert!(ctx.home.join("config.toml").exists());

    // init refuses to clobber without --force
    let output = ctx.gotya_cmd().args(["config", "init"]).output().unwrap();
    assert!(!output.status.success());

    let status = ctx
        .gotya_cmd()
        .args(["config", "set", "max_concurrent_syncs", "7"])
        .status()
        .unwrap();
    assert!(status.success());

    let output = ctx
        .gotya_cmd()
        .args(["config", "get", "max_concurrent_syncs"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "7");
}

#[test]
fn test_cache_dir_prints_path() {
    let ctx = TestContext::new();
    let output = ctx.gotya_cmd().args(["cache", "dir"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cache"));
}
