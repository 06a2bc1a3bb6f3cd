//! CLI smoke tests.
//!
//! Every test runs against its own temp database; `USAGE_LEDGER_CONFIG` is
//! pointed at an empty file so no user config is picked up.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.toml"), "[logging]\nlevel = \"warn\"\n").expect("config");
        Self { dir }
    }

    #[allow(deprecated)]
    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("usage-ledger").expect("usage-ledger binary should be built");
        cmd.env("USAGE_LEDGER_CONFIG", self.dir.path().join("config.toml"))
            .env("USAGE_LEDGER_DB", self.dir.path().join("ledger.db"))
            .env_remove("RUST_LOG");
        cmd
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.cmd().args(args).output().expect("command should execute");
        assert!(
            output.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
    }
}

#[test]
fn help_lists_command_groups() {
    Workspace::new()
        .cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("snapshot"))
        .stdout(predicate::str::contains("retention"))
        .stdout(predicate::str::contains("consumer"));
}

#[test]
fn init_reports_schema_version() {
    let ws = Workspace::new();
    let out = ws.json(&["init"]);
    assert_eq!(out["schema_version"], 1);
    assert!(ws.dir.path().join("ledger.db").exists());
}

#[test]
fn snapshot_create_show_and_chunks() {
    let ws = Workspace::new();
    ws.json(&["events", "append", "process", "app-1", "--state", "started", "--guid", "evt-1"]);

    let snapshot = ws.json(&["snapshot", "create", "process"]);
    assert_eq!(snapshot["state"], "complete");
    assert_eq!(snapshot["checkpoint_event_guid"], "evt-1");
    let guid = snapshot["guid"].as_str().unwrap().to_string();

    let shown = ws.json(&["snapshot", "show", &guid]);
    assert_eq!(shown["guid"], guid.as_str());

    let chunks = ws.json(&["snapshot", "chunks", &guid]);
    assert_eq!(chunks["total"], 0);

    let listed = ws.json(&["snapshot", "list", "--kind", "process"]);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[test]
fn second_placeholder_is_a_conflict() {
    let ws = Workspace::new();
    ws.json(&["snapshot", "create", "service", "--no-generate"]);
    ws.cmd()
        .args(["snapshot", "create", "service"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already being generated"));
}

#[test]
fn chunks_of_processing_snapshot_are_refused() {
    let ws = Workspace::new();
    let placeholder = ws.json(&["snapshot", "create", "process", "--no-generate"]);
    let guid = placeholder["guid"].as_str().unwrap();
    ws.cmd()
        .args(["snapshot", "chunks", guid])
        .assert()
        .failure()
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn consumer_lifecycle() {
    let ws = Workspace::new();
    let registered = ws.json(&["consumer", "register", "service", "billing", "evt-0"]);
    assert_eq!(registered["last_processed_guid"], "evt-0");

    let updated = ws.json(&["consumer", "update", "service", "billing", "evt-9"]);
    assert_eq!(updated["last_processed_guid"], "evt-9");

    ws.cmd()
        .args(["consumer", "register", "service", "billing", "evt-1"])
        .assert()
        .failure();

    ws.json(&["consumer", "deregister", "service", "billing"]);
    ws.cmd()
        .args(["consumer", "show", "service", "billing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("billing"));
}

#[test]
fn retention_dry_run_reports_without_deleting() {
    let ws = Workspace::new();
    ws.json(&["events", "append", "process", "app-1", "--state", "stopped"]);

    let report = ws.json(&["retention", "run", "process", "--dry-run"]);
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["mode"], "normal");
    assert_eq!(report["deleted_rows"], 0);

    let tail = ws.json(&["events", "tail", "process"]);
    assert_eq!(tail.as_array().unwrap().len(), 1);
}

#[test]
fn unknown_kind_is_rejected_by_the_parser() {
    Workspace::new()
        .cmd()
        .args(["retention", "run", "droplet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown ledger kind"));
}
