//! Integration tests for the gitdeploy CLI
//!
//! Every test runs the real binary inside its own temp directory, so the
//! default relative database and apps root land there.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const ENV_OVERRIDES: [&str; 7] = [
    "GITDEPLOY_CONFIG",
    "GITDEPLOY_DB_PATH",
    "GITDEPLOY_APPS_ROOT",
    "GITDEPLOY_STATE_DIR",
    "GITDEPLOY_TIMEOUT_SECS",
    "GITDEPLOY_LAUNCHER",
    "GITDEPLOY_LOG_LEVEL",
];

/// Helper to create a gitdeploy Command rooted at `dir`
fn gitdeploy(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("gitdeploy");
    cmd.current_dir(dir.path());
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd
}

fn add_app(dir: &TempDir, repository: &str) {
    gitdeploy(dir)
        .args(["app", "add", "--name", "Demo", "--repository", repository])
        .args(["--directory", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered application 1 (Demo)"));
}

fn git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

fn make_repo(root: &Path) -> String {
    let repo = root.join("source");
    fs::create_dir_all(&repo).unwrap();
    fs::write(repo.join("index.php"), "<?php\necho 'hello';\n").unwrap();
    fs::write(repo.join("README.md"), "demo\n").unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "initial"]);
    format!("file://{}", repo.display())
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("deploy"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_database_and_directories() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Database:"));

        assert!(dir.path().join(".gitdeploy/gitdeploy.db").exists());
        assert!(dir.path().join(".gitdeploy/logs").is_dir());
        assert!(dir.path().join("apps").is_dir());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir).arg("init").assert().success();
        gitdeploy(&dir).arg("init").assert().success();
    }

    #[test]
    fn test_flags_override_paths() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .args(["--db", "elsewhere/deploy.db", "--apps-root", "sites", "init"])
            .assert()
            .success();
        assert!(dir.path().join("elsewhere/deploy.db").exists());
        assert!(dir.path().join("sites").is_dir());
    }

    #[test]
    fn test_config_file_is_honoured() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            "db_path = \"state/custom.db\"\napps_root = \"www\"\n",
        )
        .unwrap();
        gitdeploy(&dir)
            .args(["--config", "custom.toml", "init"])
            .assert()
            .success();
        assert!(dir.path().join("state/custom.db").exists());
        assert!(dir.path().join("www").is_dir());
    }
}

// =============================================================================
// Applications and environment variables
// =============================================================================

mod records {
    use super::*;

    #[test]
    fn test_app_add_and_list() {
        let dir = TempDir::new().unwrap();
        add_app(&dir, "https://example.com/demo.git");

        gitdeploy(&dir)
            .args(["app", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Demo"))
            .stdout(predicate::str::contains("https://example.com/demo.git (main)"))
            .stdout(predicate::str::contains("inactive"));
    }

    #[test]
    fn test_app_list_empty() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .args(["app", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No applications registered."));
    }

    #[test]
    fn test_app_add_rejects_traversal_directory() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .args(["app", "add", "--name", "Bad", "--repository", "https://example.com/x.git"])
            .args(["--directory", "../etc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("directory"));
    }

    #[test]
    fn test_app_add_rejects_option_like_repository() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .args(["app", "add", "--name", "Bad", "--directory", "bad"])
            .arg("--repository=--upload-pack=touch")
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid repository URL"));
    }

    #[test]
    fn test_env_list_masks_sensitive_values() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .args(["env", "set", "APP_MODE", "production"])
            .assert()
            .success();
        gitdeploy(&dir)
            .args(["env", "set", "DB_PASSWORD", "hunter2", "--sensitive"])
            .args(["--description", "database password"])
            .assert()
            .success();

        gitdeploy(&dir)
            .args(["env", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("APP_MODE=production"))
            .stdout(predicate::str::contains("DB_PASSWORD=********  # database password"))
            .stdout(predicate::str::contains("hunter2").not());
    }

    #[test]
    fn test_env_set_replaces_existing_key() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir).args(["env", "set", "MODE", "a"]).assert().success();
        gitdeploy(&dir).args(["env", "set", "MODE", "b"]).assert().success();
        gitdeploy(&dir)
            .args(["env", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("MODE=b"))
            .stdout(predicate::str::contains("MODE=a").not());
    }

    #[test]
    fn test_env_set_rejects_invalid_key() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .args(["env", "set", "1BAD-KEY", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid variable name"));
    }

    #[test]
    fn test_env_unset() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir).args(["env", "set", "MODE", "a"]).assert().success();
        gitdeploy(&dir)
            .args(["env", "unset", "MODE"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed MODE"));
        gitdeploy(&dir)
            .args(["env", "unset", "MODE"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not defined"));
    }
}

// =============================================================================
// Deployments
// =============================================================================

mod deployments {
    use super::*;

    #[test]
    fn test_status_of_unknown_deployment_fails() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .args(["status", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Deployment 42 not found"));
    }

    #[test]
    fn test_deploy_unknown_application_fails() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir).arg("init").assert().success();
        gitdeploy(&dir)
            .args(["deploy", "7"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Application 7 not found"));
    }

    #[test]
    fn test_logs_before_first_deployment() {
        let dir = TempDir::new().unwrap();
        add_app(&dir, "https://example.com/demo.git");
        gitdeploy(&dir)
            .args(["logs", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No deployment found for application 'Demo'."));
        gitdeploy(&dir)
            .args(["history", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No deployments for Demo."));
    }

    #[test]
    fn test_sweep_with_nothing_abandoned() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir)
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("No abandoned deployments."));
    }

    #[test]
    fn test_worker_refuses_unknown_deployment() {
        let dir = TempDir::new().unwrap();
        gitdeploy(&dir).arg("init").assert().success();
        gitdeploy(&dir).args(["worker", "99"]).assert().code(2);
    }

    #[test]
    fn test_deploy_of_unreachable_repository_fails() {
        let dir = TempDir::new().unwrap();
        let missing = format!("file://{}", dir.path().join("no-such-repo").display());
        add_app(&dir, &missing);

        gitdeploy(&dir)
            .args(["deploy", "1", "--wait"])
            .timeout(std::time::Duration::from_secs(120))
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Deployment 1 queued"))
            .stdout(predicate::str::contains("Status: failed"))
            .stdout(predicate::str::contains("ERROR: Deployment failed"));

        gitdeploy(&dir)
            .args(["history", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"));
    }

    #[test]
    fn test_deploy_local_repository_end_to_end() {
        if which::which("git").is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let repo = make_repo(dir.path());
        add_app(&dir, &repo);
        gitdeploy(&dir)
            .args(["env", "set", "APP_MODE", "production"])
            .assert()
            .success();

        gitdeploy(&dir)
            .args(["deploy", "1", "--wait"])
            .timeout(std::time::Duration::from_secs(120))
            .assert()
            .success()
            .stdout(predicate::str::contains("Status: completed"))
            .stdout(predicate::str::contains("Created custom-env.php with 1 variables."));

        let workspace = dir.path().join("apps/demo");
        assert!(workspace.join("README.md").exists());
        assert!(!workspace.join(".git").exists());
        assert!(workspace.join("deployment.log").exists());
        let env_file = fs::read_to_string(workspace.join("custom-env.php")).unwrap();
        assert!(env_file.contains("APP_MODE"));
        let index = fs::read_to_string(workspace.join("index.php")).unwrap();
        assert!(index.contains("auto-include.php"));
        assert!(index.contains("echo 'hello';"));

        gitdeploy(&dir)
            .args(["status", "1", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"completed\""))
            .stdout(predicate::str::contains("\"progress\": 100"));

        gitdeploy(&dir)
            .args(["app", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("yes"));

        // A second run replaces the tree and keeps deployment.log.
        gitdeploy(&dir)
            .args(["deploy", "1", "--wait"])
            .timeout(std::time::Duration::from_secs(120))
            .assert()
            .success();
        let log = fs::read_to_string(workspace.join("deployment.log")).unwrap();
        assert!(log.contains("Deployment 1 started"));
        assert!(log.contains("Deployment 2 started"));
    }
}
