//! CLI tests for `smg plan` and `smg publish`.
//!
//! Spawns the smg binary inside a scratch git repository and checks the
//! printed plan and the exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use smuggler::exit_codes;

const MANIFEST: &str = r#"
name = "api"

[build.master]
push = true
deploy = ["web"]

[build."release/.*"]
name = "acme/api"
dockerfile = "docker/Dockerfile.release"
"#;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args([
            "-c",
            "user.name=smg",
            "-c",
            "user.email=smg@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "tag.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed");
}

fn repo(manifest: &str) -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    git(temp.path(), &["init", "-q"]);
    git(temp.path(), &["symbolic-ref", "HEAD", "refs/heads/master"]);
    fs::write(temp.path().join("smg.toml"), manifest).expect("write manifest");
    git(temp.path(), &["add", "smg.toml"]);
    git(temp.path(), &["commit", "-q", "-m", "init"]);
    temp
}

fn head(dir: &Path) -> String {
    let out = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .expect("rev-parse");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn smg(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_smg"))
        .arg("--config")
        .arg(dir.join("no-such-smgd.toml"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("run smg")
}

#[test]
fn plan_on_master_lists_tags_and_channels() {
    let temp = repo(MANIFEST);
    git(temp.path(), &["tag", "v1.0"]);
    let short: String = head(temp.path()).chars().take(9).collect();

    let out = smg(temp.path(), &["plan", "--cluster", "prod"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    let images: Vec<&str> = stdout
        .lines()
        .filter_map(|line| line.strip_prefix("image: "))
        .collect();
    assert_eq!(
        images,
        vec![
            "api:master".to_string(),
            format!("api:{short}"),
            "api:v1.0".to_string(),
            "api:latest".to_string(),
        ]
    );
    assert!(stdout.contains("rule: master\n"));
    assert!(stdout.contains("push: true\n"));
    assert!(stdout.contains("channel: prod/subscriptions/web\n"));
}

#[test]
fn plan_with_pattern_branch_uses_rule_name() {
    let temp = repo(MANIFEST);
    git(temp.path(), &["checkout", "-q", "-b", "release/2.0"]);

    let out = smg(temp.path(), &["plan"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("rule: release/.*\n"));
    assert!(stdout.contains("push: false\n"));
    assert!(stdout.contains("dockerfile: docker/Dockerfile.release\n"));
    assert!(stdout.contains("image: acme/api:release.2.0\n"));
}

#[test]
fn plan_without_matching_rule_exits_with_no_rule_code() {
    let temp = repo(MANIFEST);
    git(temp.path(), &["checkout", "-q", "-b", "topic"]);

    let out = smg(temp.path(), &["plan"]);
    assert_eq!(out.status.code(), Some(exit_codes::NO_MATCHING_RULE));
    assert!(String::from_utf8_lossy(&out.stderr).contains("topic"));
}

#[test]
fn explicit_tag_selects_rule() {
    let temp = repo(MANIFEST);
    git(temp.path(), &["checkout", "-q", "-b", "topic"]);

    let out = smg(temp.path(), &["plan", "--tag", "master"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&out.stdout).contains("rule: master\n"));
}

#[test]
fn invalid_manifest_exits_with_config_code() {
    let temp = repo("name = \"\"\n");
    let out = smg(temp.path(), &["plan"]);
    assert_eq!(out.status.code(), Some(exit_codes::CONFIG));
}

#[test]
fn escaping_deploy_channel_exits_with_config_code() {
    let temp = repo("name = \"api\"\n\n[build.master]\ndeploy = [\"../machines\"]\n");
    let out = smg(temp.path(), &["plan"]);
    assert_eq!(out.status.code(), Some(exit_codes::CONFIG));
    assert!(String::from_utf8_lossy(&out.stderr).contains("../machines"));
}

#[test]
fn publish_rejects_malformed_image_before_contacting_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = smg(
        temp.path(),
        &["publish", "--channel", "web", "--etcd", "http://127.0.0.1:9", "a:b:c"],
    );
    assert_eq!(out.status.code(), Some(exit_codes::BUILD_ABORTED));
}
