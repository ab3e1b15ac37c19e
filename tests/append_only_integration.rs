use serde_json::Value;
use std::path::Path;
use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_release-impact");

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(repo: &Path, args: &[&str]) -> anyhow::Result<String> {
    let out = Command::new("git")
        .args(["-c", "user.name=Release Bot", "-c", "user.email=bot@example.com", "-c", "commit.gpgsign=false", "-c", "tag.gpgsign=false"])
        .args(args)
        .current_dir(repo)
        .output()?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn commit_all(repo: &Path, message: &str) -> anyhow::Result<String> {
    git(repo, &["add", "-A", "docs"])?;
    git(repo, &["commit", "-q", "-m", message])?;
    git(repo, &["rev-parse", "HEAD"])
}

fn run_json(repo: &Path, args: &[&str], envs: &[(&str, &str)]) -> anyhow::Result<Value> {
    let mut cmd = Command::new(BIN);
    cmd.arg("--repo").arg(repo).args(args);
    cmd.env_remove("RELEASE_IMPACT_STATE").env_remove("RELEASE_IMPACT_GIT");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let out = cmd.output()?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

fn task_doc(title: &str, section: &str, item: &str) -> String {
    format!("# {title}\n\n**Date**: 2025-01-15\n\n## Summary\n\n{title} done.\n\n## {section}\n\n- {item}\n")
}

#[test]
fn append_only_flow_against_real_git() -> anyhow::Result<()> {
    if !git_available() {
        eprintln!("git not found on PATH, skipping");
        return Ok(());
    }
    let repo = tempfile::tempdir()?;
    let root = repo.path();
    git(root, &["init", "-q"])?;

    write_file(
        &root.join("docs/specs/001-core/task-1-summary.md"),
        &task_doc("Task 1", "New Features", "Added export"),
    )?;
    write_file(
        &root.join("docs/specs/001-core/task-2-summary.md"),
        &task_doc("Task 2", "Bug Fixes", "Fixed crash"),
    )?;
    let first_head = commit_all(root, "first tasks")?;

    let first = run_json(root, &["analyze"], &[])?;
    assert_eq!(first["metadata"]["newDocuments"], 2);
    assert_eq!(first["metadata"]["skippedDocuments"], 0);
    assert_eq!(first["metadata"]["currentCommit"], first_head.as_str());
    assert_eq!(first["results"][0]["impactLevel"], "minor");
    assert_eq!(first["results"][1]["impactLevel"], "patch");
    assert_eq!(first["results"][0]["releaseNoteContent"], "Task 1 done.");

    write_file(
        &root.join("docs/specs/002-api/task-1-summary.md"),
        &task_doc("API task", "Breaking Changes", "Removed v1 endpoints"),
    )?;
    let second_head = commit_all(root, "api task")?;

    let second = run_json(root, &["analyze"], &[])?;
    assert_eq!(second["metadata"]["newDocuments"], 1);
    assert_eq!(second["metadata"]["skippedDocuments"], 2);
    assert_eq!(second["metadata"]["totalDocuments"], 3);
    assert_eq!(second["results"][0], first["results"][0]);
    assert_eq!(second["results"][2]["filePath"], "docs/specs/002-api/task-1-summary.md");
    assert_eq!(second["results"][2]["impactLevel"], "major");
    assert_eq!(second["results"][2]["specName"], "002-api");
    assert_eq!(second["results"][2]["analyzedAtCommit"], second_head.as_str());

    let state = run_json(root, &["state"], &[])?;
    assert_eq!(state["lastAnalyzedCommit"], second_head.as_str());
    assert_eq!(state["accumulatedResults"].as_array().map(Vec::len), Some(3));
    assert_eq!(state["version"], "1.0.0");

    let unchanged = run_json(root, &["analyze"], &[])?;
    assert_eq!(unchanged["metadata"]["newDocuments"], 0);
    assert_eq!(unchanged["metadata"]["totalDocuments"], 3);

    let reset = run_json(root, &["analyze", "--reset"], &[])?;
    assert_eq!(reset["metadata"]["newDocuments"], 3);
    assert_eq!(reset["metadata"]["skippedDocuments"], 0);
    Ok(())
}

#[test]
fn release_and_changes_commands_read_git_history() -> anyhow::Result<()> {
    if !git_available() {
        eprintln!("git not found on PATH, skipping");
        return Ok(());
    }
    let repo = tempfile::tempdir()?;
    let root = repo.path();
    git(root, &["init", "-q"])?;

    write_file(&root.join("docs/specs/001/task-1-summary.md"), "# One\n")?;
    let tagged = commit_all(root, "one")?;
    git(root, &["tag", "-a", "v1.0.0", "-m", "First release"])?;
    git(root, &["tag", "nightly"])?;

    write_file(&root.join("docs/specs/001/task-2-summary.md"), "# Two\n")?;
    write_file(&root.join("docs/specs/001/task-1-summary.md"), "# One, revised\n")?;
    commit_all(root, "two")?;

    let release = run_json(root, &["last-release"], &[])?;
    assert_eq!(release["data"]["name"], "v1.0.0");
    assert_eq!(release["data"]["commit"], tagged.as_str());
    assert_eq!(release["data"]["message"], "First release");
    assert_eq!(release["performance"]["cache_hit"], false);

    let changes = run_json(root, &["changes", "v1.0.0"], &[])?;
    assert_eq!(changes["data"]["added_files"][0], "docs/specs/001/task-2-summary.md");
    assert_eq!(changes["data"]["modified_files"][0], "docs/specs/001/task-1-summary.md");
    assert_eq!(changes["data"]["commits"].as_array().map(Vec::len), Some(1));
    assert_eq!(changes["data"]["commits"][0]["message"], "two");
    Ok(())
}

#[test]
fn binary_falls_back_to_scan_without_git() -> anyhow::Result<()> {
    let repo = tempfile::tempdir()?;
    let root = repo.path();
    write_file(&root.join(".kiro/specs/x/completion/task-1-completion.md"), "# Done\n")?;
    write_file(&root.join("docs/specs/y/task-2-summary.md"), "# Also done\n")?;
    write_file(&root.join("docs/specs/y/README.md"), "# Not a task\n")?;
    let state_file = root.join("custom-state.json");
    let state_env = state_file.to_string_lossy().to_string();
    let envs = [
        ("RELEASE_IMPACT_GIT", "/definitely/not/a/git/binary"),
        ("RELEASE_IMPACT_STATE", state_env.as_str()),
    ];

    let result = run_json(root, &["analyze"], &envs)?;
    assert_eq!(result["metadata"]["newDocuments"], 2);
    assert_eq!(result["metadata"]["currentCommit"], "unknown");
    assert_eq!(result["results"][0]["filePath"], ".kiro/specs/x/completion/task-1-completion.md");
    assert!(state_file.exists());

    let state = run_json(root, &["state"], &envs)?;
    assert_eq!(state["lastAnalyzedCommit"], "unknown");

    let cleared = Command::new(BIN)
        .arg("--repo")
        .arg(root)
        .arg("reset")
        .envs(envs)
        .output()?;
    assert!(cleared.status.success());
    assert!(!state_file.exists());
    assert_eq!(run_json(root, &["state"], &envs)?, Value::Null);
    Ok(())
}

#[test]
fn corrupt_state_is_treated_as_absent() -> anyhow::Result<()> {
    let repo = tempfile::tempdir()?;
    let root = repo.path();
    write_file(&root.join("docs/specs/a/task-1-summary.md"), "# One\n")?;
    write_file(&root.join(".release-impact/analysis-state.json"), "{ definitely not json")?;
    let envs = [("RELEASE_IMPACT_GIT", "/definitely/not/a/git/binary")];

    assert_eq!(run_json(root, &["state"], &envs)?, Value::Null);
    let result = run_json(root, &["analyze"], &envs)?;
    assert_eq!(result["metadata"]["skippedDocuments"], 0);
    assert_eq!(result["metadata"]["newDocuments"], 1);
    assert!(run_json(root, &["state"], &envs)?.is_object());
    Ok(())
}

#[test]
fn non_ascii_spec_directories_are_detected_incrementally() -> anyhow::Result<()> {
    if !git_available() {
        eprintln!("git not found on PATH, skipping");
        return Ok(());
    }
    let repo = tempfile::tempdir()?;
    let root = repo.path();
    git(root, &["init", "-q"])?;

    write_file(&root.join("docs/specs/base/task-1-summary.md"), "# Base\n")?;
    commit_all(root, "base")?;
    let first = run_json(root, &["analyze"], &[])?;
    assert_eq!(first["metadata"]["newDocuments"], 1);

    write_file(&root.join("docs/specs/café/task-2-summary.md"), "# Café task\n")?;
    commit_all(root, "accented spec")?;
    let second = run_json(root, &["analyze"], &[])?;
    assert_eq!(second["metadata"]["newDocuments"], 1);
    assert_eq!(second["metadata"]["totalDocuments"], 2);
    assert_eq!(second["results"][1]["filePath"], "docs/specs/café/task-2-summary.md");
    assert_eq!(second["results"][1]["specName"], "café");
    Ok(())
}
