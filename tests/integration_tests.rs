//! Integration tests for buildyard
//!
//! These drive the binary end to end against a temporary project directory.
//! No container runtime is needed: launches go to a program that does not
//! exist, which the engine must turn into a killed build.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const MISSING_RUNTIME: &str = "buildyard-missing-runtime";

/// Helper to create a buildyard Command
fn buildyard() -> Command {
    let mut cmd = cargo_bin_cmd!("buildyard");
    cmd.env_remove("DOCKER_CMD")
        .env_remove("BUILDYARD_MAX_RUNNING")
        .env_remove("RUST_LOG");
    cmd
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn write_steps(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("steps.toml");
    fs::write(&path, content).unwrap();
    path
}

const INSTALL_RUN: &str = r#"
[[steps]]
name = "install_odoo"
job_type = "install"
order_index = 10

[[steps]]
name = "run_odoo"
job_type = "run"
order_index = 20
"#;

fn submit(dir: &TempDir, dest: &str, steps: &Path) {
    buildyard()
        .current_dir(dir.path())
        .args(["submit", dest, "--steps"])
        .arg(steps)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Submitted build {}", dest)));
}

fn status_json(dir: &TempDir) -> serde_json::Value {
    let output = buildyard()
        .current_dir(dir.path())
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_buildyard_help() {
        buildyard()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("submit"))
            .stdout(predicate::str::contains("tick"));
    }

    #[test]
    fn test_buildyard_version() {
        buildyard().arg("--version").assert().success();
    }

    #[test]
    fn test_status_empty_project() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No builds."));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();
        buildyard()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No builds."));
    }
}

// =============================================================================
// Steps Validation Tests
// =============================================================================

mod validate {
    use super::*;

    #[test]
    fn test_validate_ok() {
        let dir = create_temp_project();
        let steps = write_steps(&dir, INSTALL_RUN);
        buildyard()
            .arg("validate")
            .arg(&steps)
            .assert()
            .success()
            .stdout(predicate::str::contains("is valid (2 steps)"))
            .stdout(predicate::str::contains("install_odoo"));
    }

    #[test]
    fn test_validate_run_not_last() {
        let dir = create_temp_project();
        let steps = write_steps(
            &dir,
            r#"
[[steps]]
name = "install_odoo"
job_type = "install"
order_index = 10

[[steps]]
name = "run_odoo"
job_type = "run"
order_index = 20

[[steps]]
name = "lint"
job_type = "custom_parse"
order_index = 30
command = "flake8"
"#,
        );
        buildyard()
            .arg("validate")
            .arg(&steps)
            .assert()
            .failure()
            .stderr(predicate::str::contains("must be the last step"));
    }

    #[test]
    fn test_validate_missing_file() {
        buildyard()
            .args(["validate", "/nonexistent/steps.toml"])
            .assert()
            .failure();
    }

    #[test]
    fn test_submit_rejects_invalid_steps() {
        let dir = create_temp_project();
        let steps = write_steps(
            &dir,
            r#"
[[steps]]
name = "run_odoo"
job_type = "run"
order_index = 10
"#,
        );
        buildyard()
            .current_dir(dir.path())
            .args(["submit", "1-a", "--steps"])
            .arg(&steps)
            .assert()
            .failure()
            .stderr(predicate::str::contains("preceded by an install or restore"));
        assert!(!dir.path().join(".buildyard/builds.json").exists());
    }
}

// =============================================================================
// Build Lifecycle Tests
// =============================================================================

mod builds {
    use super::*;

    #[test]
    fn test_submit_and_status() {
        let dir = create_temp_project();
        let steps = write_steps(&dir, INSTALL_RUN);
        submit(&dir, "12-fix", &steps);

        assert!(dir.path().join(".buildyard/builds.json").exists());
        assert!(dir.path().join(".buildyard/builds/12-fix").is_dir());

        buildyard()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("12-fix"))
            .stdout(predicate::str::contains("pending"));

        let json = status_json(&dir);
        assert_eq!(json["builds"][0]["dest"], "12-fix");
        assert_eq!(json["builds"][0]["state"], "pending");
        assert_eq!(json["builds"][0]["result"], "ok");
    }

    #[test]
    fn test_submit_duplicate_active_build_fails() {
        let dir = create_temp_project();
        let steps = write_steps(&dir, INSTALL_RUN);
        submit(&dir, "12-fix", &steps);

        buildyard()
            .current_dir(dir.path())
            .args(["submit", "12-fix", "--steps"])
            .arg(&steps)
            .assert()
            .failure()
            .stderr(predicate::str::contains("still pending"));
    }

    #[test]
    fn test_submit_rejects_bad_volume() {
        let dir = create_temp_project();
        let steps = write_steps(&dir, INSTALL_RUN);
        buildyard()
            .current_dir(dir.path())
            .args(["submit", "12-fix", "--volume", "odoo", "--steps"])
            .arg(&steps)
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected DEST=PATH"));
    }

    #[test]
    fn test_status_unknown_build() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .args(["status", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No build named nope"));
    }

    #[test]
    fn test_kill_pending_build() {
        let dir = create_temp_project();
        let steps = write_steps(&dir, INSTALL_RUN);
        submit(&dir, "12-fix", &steps);

        buildyard()
            .current_dir(dir.path())
            .args(["--docker-cmd", MISSING_RUNTIME, "kill", "12-fix"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Killed build 12-fix"));

        let json = status_json(&dir);
        assert_eq!(json["builds"][0]["state"], "killed");
        assert_eq!(json["builds"][0]["result"], "ko");

        // Killing again is a no-op
        buildyard()
            .current_dir(dir.path())
            .args(["--docker-cmd", MISSING_RUNTIME, "kill", "12-fix"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already killed"));

        // A terminal dest can be reused
        submit(&dir, "12-fix", &steps);
    }

    #[test]
    fn test_tick_with_unavailable_runtime_kills_build() {
        let dir = create_temp_project();
        let steps = write_steps(&dir, INSTALL_RUN);
        submit(&dir, "12-fix", &steps);

        buildyard()
            .current_dir(dir.path())
            .args(["--docker-cmd", MISSING_RUNTIME, "tick"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Ticked"));

        let json = status_json(&dir);
        let build = &json["builds"][0];
        assert_eq!(build["state"], "killed");
        assert_eq!(build["result"], "ko");
        let reason = build["reason"].as_str().unwrap();
        assert!(reason.contains("install_odoo failed to start"), "{}", reason);

        // The logs directory was prepared before the launch failed
        assert!(dir.path().join(".buildyard/builds/12-fix/logs").is_dir());
    }

    #[test]
    fn test_watch_stops_after_passes() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .args([
                "--docker-cmd",
                MISSING_RUNTIME,
                "watch",
                "--interval",
                "1",
                "--passes",
                "1",
            ])
            .assert()
            .success();
    }
}

// =============================================================================
// Migration Build Tests
// =============================================================================

mod migrations {
    use super::*;

    fn submit_migration(dir: &TempDir, name: &str) {
        buildyard()
            .current_dir(dir.path())
            .args([
                "submit-migration",
                name,
                "--addon",
                "sale",
                "--target-db",
                "prod",
                "--version-src",
                "16.0",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Submitted migration build"));
    }

    #[test]
    fn test_submit_migration_and_status() {
        let dir = create_temp_project();
        submit_migration(&dir, "sale-mig");

        let json = status_json(&dir);
        assert_eq!(json["migrations"][0]["name"], "sale-mig");
        assert_eq!(json["migrations"][0]["addon"], "sale");
        assert_eq!(json["migrations"][0]["state"], "pending");
    }

    #[test]
    fn test_submit_migration_duplicate_fails() {
        let dir = create_temp_project();
        submit_migration(&dir, "sale-mig");
        buildyard()
            .current_dir(dir.path())
            .args([
                "submit-migration",
                "sale-mig",
                "--addon",
                "sale",
                "--target-db",
                "prod",
                "--version-src",
                "16.0",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_reset_migration_not_done_fails() {
        let dir = create_temp_project();
        submit_migration(&dir, "sale-mig");
        buildyard()
            .current_dir(dir.path())
            .args(["reset-migration", "sale-mig"])
            .assert()
            .failure();
    }

    #[test]
    fn test_reset_unknown_migration_fails() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .args(["reset-migration", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No migration build named nope"));
    }

    #[test]
    fn test_tick_with_unavailable_runtime_ends_migration() {
        let dir = create_temp_project();
        submit_migration(&dir, "sale-mig");

        buildyard()
            .current_dir(dir.path())
            .args(["--docker-cmd", MISSING_RUNTIME, "tick"])
            .assert()
            .success();

        let json = status_json(&dir);
        assert_eq!(json["migrations"][0]["state"], "done");
        assert_eq!(json["migrations"][0]["result"], "ko");

        // Done builds can be reset
        buildyard()
            .current_dir(dir.path())
            .args(["reset-migration", "sale-mig"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Reset migration build sale-mig"));
        let json = status_json(&dir);
        assert_eq!(json["migrations"][0]["state"], "pending");
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("max_running = 4"));
    }

    #[test]
    fn test_config_show_applies_cli_override() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .args(["--docker-cmd", "podman", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("program = \"podman\""));
    }

    #[test]
    fn test_config_show_env_then_cli_precedence() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .env("DOCKER_CMD", "podman")
            .env("BUILDYARD_MAX_RUNNING", "7")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("program = \"podman\""))
            .stdout(predicate::str::contains("max_running = 7"));

        buildyard()
            .current_dir(dir.path())
            .env("DOCKER_CMD", "podman")
            .args(["--docker-cmd", "nerdctl", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("program = \"nerdctl\""));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created engine.toml"));
        assert!(dir.path().join(".buildyard/engine.toml").exists());

        buildyard()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_no_config() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".buildyard")).unwrap();
        fs::write(
            dir.path().join(".buildyard/engine.toml"),
            r#"
[engine]
slot_pattern = "(unclosed"
"#,
        )
        .unwrap();

        buildyard()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("slot_pattern"));
    }

    #[test]
    fn test_invalid_env_max_running_fails() {
        let dir = create_temp_project();
        buildyard()
            .current_dir(dir.path())
            .env("BUILDYARD_MAX_RUNNING", "lots")
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("BUILDYARD_MAX_RUNNING"));
    }
}
