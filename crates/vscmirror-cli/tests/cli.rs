use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Test context with an isolated artifact store
struct TestContext {
    temp_dir: TempDir,
    artifacts: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let artifacts = temp_dir.path().join("artifacts");
        Self {
            temp_dir,
            artifacts,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_vscmirror"));
        cmd.env_remove("VSCMIRROR_CONFIG");
        cmd.env_remove("VSCMIRROR_LISTEN");
        cmd.env_remove("VSCMIRROR_URL_ROOT");
        cmd.env("VSCMIRROR_ARTIFACTS", &self.artifacts);
        cmd.env("RUST_LOG", "warn");
        cmd
    }
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.cmd().arg("--help").output().expect("failed to run vscmirror");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    for sub in ["sync", "serve", "status", "platforms"] {
        assert!(stdout.contains(sub), "missing {sub}");
    }
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    let output = ctx.cmd().arg("--version").output().expect("failed to run vscmirror");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_platforms_lists_catalog() {
    let ctx = TestContext::new();
    let output = ctx.cmd().arg("platforms").output().expect("failed to run vscmirror");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().any(|l| l.starts_with("linux-x64 ")));
    assert!(stdout.lines().any(|l| l.starts_with("cli-alpine ")));
}

#[test]
fn test_platforms_resolved_honours_flags() {
    let ctx = TestContext::new();
    let config = ctx.temp_dir.path().join("mirror.toml");
    std::fs::write(
        &config,
        "[sync]\nplatforms = [\"linux-x64\", \"darwin-arm64\"]\nexclude_platforms = [\"darwin-arm64\"]\n",
    )
    .unwrap();
    let output = ctx
        .cmd()
        .arg("--config")
        .arg(&config)
        .args(["platforms", "--resolved"])
        .output()
        .expect("failed to run vscmirror");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let ids: Vec<&str> = stdout.lines().filter_map(|l| l.split_whitespace().next()).collect();
    assert_eq!(ids, vec!["linux-x64"]);
}

#[test]
fn test_sync_rejects_unknown_platform_before_network() {
    let ctx = TestContext::new();
    let output = ctx
        .cmd()
        .args(["sync", "--platforms", "amiga"])
        .output()
        .expect("failed to run vscmirror");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("amiga"), "{stderr}");
    assert!(!ctx.artifacts.exists());
}

#[test]
fn test_status_on_empty_store() {
    let ctx = TestContext::new();
    let output = ctx
        .cmd()
        .args(["status", "--json"])
        .output()
        .expect("failed to run vscmirror");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["cache"]["extensions"], 0);
    assert!(status["last_sync"].is_null());
}
