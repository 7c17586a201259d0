//! Drives the `epicflow` binary against a throwaway git repository.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn git(repo_dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

fn make_git_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.name", "test-user"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "initial"]);
    dir
}

fn epicflow(repo: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_epicflow"))
        .arg("--repo")
        .arg(repo)
        .args(args)
        .env_remove("EPICFLOW_STATE_DIR")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn init_create_and_select() {
    let repo = make_git_repo();

    let out = epicflow(repo.path(), &["init", "--name", "demo"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout(&out).contains("Base branch: main"));
    assert!(repo.path().join(".epicflow/registry.json").exists());

    let out = epicflow(repo.path(), &["create", "Schema", "--priority", "high"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("Created EPIC-001: Schema"));

    let out = epicflow(
        repo.path(),
        &["create", "Login", "--priority", "critical", "--blocked-by", "EPIC-001"],
    );
    assert!(out.status.success());

    for id in ["EPIC-001", "EPIC-002"] {
        assert!(epicflow(repo.path(), &["status", id, "ready"]).status.success());
    }

    // The critical unit is blocked, so the high one goes first.
    let out = epicflow(repo.path(), &["--json", "next"]);
    assert!(out.status.success());
    assert_eq!(json(&out)["id"], "EPIC-001");

    let out = epicflow(repo.path(), &["--json", "next", "--explain"]);
    let verdicts = json(&out);
    assert_eq!(verdicts[0]["unit_id"], "EPIC-001");
    assert_eq!(verdicts[0]["verdict"], "selected");
    assert_eq!(verdicts[1]["verdict"], "blocked");

    let out = epicflow(repo.path(), &["--json", "list", "--status", "ready"]);
    assert_eq!(json(&out).as_array().unwrap().len(), 2);

    let out = epicflow(repo.path(), &["graph"]);
    assert!(stdout(&out).contains("EPIC-002 [ready] Login  <- EPIC-001"));
}

#[test]
fn cycle_is_rejected_with_failure_exit() {
    let repo = make_git_repo();
    assert!(epicflow(repo.path(), &["init"]).status.success());
    assert!(epicflow(repo.path(), &["create", "A"]).status.success());
    assert!(epicflow(repo.path(), &["create", "B", "--blocked-by", "EPIC-001"])
        .status
        .success());

    let out = epicflow(repo.path(), &["block", "EPIC-001", "--by", "EPIC-002"]);
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("hint:"), "{stderr}");

    let out = epicflow(repo.path(), &["--json", "show", "EPIC-001"]);
    assert!(json(&out)["dependencies"]["blocked_by"]
        .as_array()
        .map_or(true, |a| a.is_empty()));
}

#[test]
fn classify_reports_the_failing_threshold() {
    let repo = make_git_repo();
    assert!(epicflow(repo.path(), &["init"]).status.success());
    assert!(epicflow(repo.path(), &["create", "Login"]).status.success());

    let tasks = serde_json::json!([
        {"path": "src/api/routes.rs", "action": "create"},
        {"path": "src/api/auth.rs", "action": "create"},
        {"path": "web/Login.tsx", "action": "create"},
    ]);
    let task_file = repo.path().join("tasks.json");
    fs::write(&task_file, tasks.to_string()).unwrap();
    let task_arg = task_file.to_string_lossy().into_owned();

    let out = epicflow(repo.path(), &["--json", "classify", "EPIC-001", "--tasks", &task_arg]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report = json(&out);
    assert_eq!(report["plan"]["viable"], false);
    assert_eq!(report["plan"]["failed_threshold"], "file_count");

    let out = epicflow(
        repo.path(),
        &["--json", "classify", "EPIC-001", "--tasks", &task_arg, "--min-files", "3"],
    );
    assert_eq!(json(&out)["plan"]["viable"], true);
}

#[test]
fn running_without_a_worker_fails_and_keeps_the_unit() {
    let repo = make_git_repo();
    assert!(epicflow(repo.path(), &["init"]).status.success());
    assert!(epicflow(repo.path(), &["create", "Docs"]).status.success());
    assert!(epicflow(repo.path(), &["status", "EPIC-001", "ready"]).status.success());

    let tasks = serde_json::json!([{"path": "docs/guide.md", "action": "create"}]);
    fs::write(
        repo.path().join(".epicflow/tasks/EPIC-001.json"),
        tasks.to_string(),
    )
    .unwrap();

    let out = epicflow(repo.path(), &["run", "EPIC-001"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("no worker configured"));

    let out = epicflow(repo.path(), &["--json", "show", "EPIC-001"]);
    assert_eq!(json(&out)["status"], "in_progress");
}

#[test]
fn commands_before_init_point_at_init() {
    let repo = make_git_repo();
    let out = epicflow(repo.path(), &["list"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("epicflow init"));
}
