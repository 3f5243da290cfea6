//! Integration tests for the marketplace CLI.
//!
//! These drive the compiled binary against a temporary project directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper to create a marketplace Command rooted in `dir`
fn marketplace(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("marketplace");
    cmd.current_dir(dir.path()).env_remove("RUST_LOG");
    cmd
}

/// Write an `ssh` stand-in that records its arguments and exits with `code`.
fn fake_ssh(dir: &Path, code: i32) -> PathBuf {
    let path = dir.join("fake-ssh");
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> \"$(dirname \"$0\")/ssh-calls.log\"\nexit {}\n",
        code
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Tenant, owner, target and one site ready for jobs.
fn seed_site(dir: &TempDir) {
    marketplace(dir)
        .args(["tenant", "add", "--name", "Acme", "--slug", "acme"])
        .assert()
        .success();
    marketplace(dir)
        .args(["user", "add", "--tenant", "acme", "--email", "jo@example.com"])
        .assert()
        .success();
    marketplace(dir)
        .args([
            "target", "add", "--name", "edge-1", "--host", "203.0.113.10", "--user", "deploy",
        ])
        .assert()
        .success();
    marketplace(dir)
        .args([
            "site",
            "add",
            "--tenant",
            "acme",
            "--name",
            "Jo's shop",
            "--slug",
            "jo-shop",
            "--target",
            "1",
            "--image",
            "nginx:1.27",
            "--owner",
            "1",
            "--host-port",
            "8080",
            "--env",
            "APP_ENV=prod",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("container site-jo-shop"));
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir).arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_database() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized marketplace database"));
        assert!(dir.path().join(".marketplace/marketplace.db").exists());
    }

    #[test]
    fn test_db_path_flag() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .args(["--db-path", "custom/market.db", "init"])
            .assert()
            .success();
        assert!(dir.path().join("custom/market.db").exists());
    }

    #[test]
    fn test_invalid_config_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".marketplace")).unwrap();
        fs::write(
            dir.path().join(".marketplace/marketplace.toml"),
            "[worker\npoll_interval_secs = 3",
        )
        .unwrap();
        marketplace(&dir)
            .arg("init")
            .assert()
            .failure()
            .stderr(predicate::str::contains("marketplace.toml"));
    }
}

// =============================================================================
// Tenancy
// =============================================================================

mod tenancy {
    use super::*;

    #[test]
    fn test_tenant_add_and_list() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .args([
                "tenant", "add", "--name", "Acme", "--slug", "acme", "--domain", "Shop.Acme.com",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created tenant 1 (acme)"));
        marketplace(&dir)
            .args(["tenant", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("shop.acme.com"));
    }

    #[test]
    fn test_duplicate_slug_rejected() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .args(["tenant", "add", "--name", "Acme", "--slug", "acme"])
            .assert()
            .success();
        marketplace(&dir)
            .args(["tenant", "add", "--name", "Other", "--slug", "acme"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("taken"));
    }

    #[test]
    fn test_resolve_host() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .args([
                "tenant", "add", "--name", "Acme", "--slug", "acme", "--domain", "shop.acme.com",
            ])
            .assert()
            .success();
        marketplace(&dir)
            .args(["tenant", "add", "--name", "Globex", "--slug", "globex"])
            .assert()
            .success();

        marketplace(&dir)
            .args(["tenant", "resolve", "SHOP.acme.com:443"])
            .assert()
            .success()
            .stdout(predicate::str::contains("-> acme"));
        marketplace(&dir)
            .env("MARKETPLACE_BASE_DOMAIN", "example.com")
            .args(["tenant", "resolve", "globex.example.com"])
            .assert()
            .success()
            .stdout(predicate::str::contains("-> globex"));
        marketplace(&dir)
            .args(["tenant", "resolve", "unknown.example.org"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No tenant"));
    }
}

// =============================================================================
// Catalog
// =============================================================================

mod catalog {
    use super::*;

    #[test]
    fn test_template_preview_upload() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .args(["tenant", "add", "--name", "Acme", "--slug", "acme"])
            .assert()
            .success();
        marketplace(&dir)
            .args([
                "template", "add", "--tenant", "acme", "--name", "Shop Basic", "--price-cents",
                "4900", "--image", "nginx:1.27",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created template 1 (shop-basic)"));

        fs::write(dir.path().join("Hero Shot.png"), b"\x89PNG").unwrap();
        marketplace(&dir)
            .args(["template", "preview", "1", "Hero Shot.png"])
            .assert()
            .success()
            .stdout(predicate::str::contains("/assets/tenants/1/templates/1/"));

        let stored: Vec<_> = fs::read_dir(dir.path().join(".marketplace/assets/tenants/1/templates/1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].ends_with("-hero-shot.png"));

        marketplace(&dir)
            .args(["template", "list", "--tenant", "acme"])
            .assert()
            .success()
            .stdout(predicate::str::contains("draft").and(predicate::str::contains("hero-shot.png")));
    }

    #[test]
    fn test_template_preview_rejects_non_images() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .args(["tenant", "add", "--name", "Acme", "--slug", "acme"])
            .assert()
            .success();
        marketplace(&dir)
            .args(["template", "add", "--tenant", "acme", "--name", "Kit", "--image", "nginx"])
            .assert()
            .success();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        marketplace(&dir)
            .args(["template", "preview", "1", "notes.txt"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unsupported asset type"));
    }
}

// =============================================================================
// Deployment queue and worker
// =============================================================================

mod deployments {
    use super::*;

    #[test]
    fn test_enqueue_and_list_jobs() {
        let dir = TempDir::new().unwrap();
        seed_site(&dir);
        marketplace(&dir)
            .args(["enqueue", "--site", "1", "--action", "deploy", "--requested-by", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Queued job 1"));
        marketplace(&dir)
            .args(["jobs", "--status", "queued"])
            .assert()
            .success()
            .stdout(predicate::str::contains("deploy").and(predicate::str::contains("queued")));
    }

    #[test]
    fn test_second_active_job_rejected() {
        let dir = TempDir::new().unwrap();
        seed_site(&dir);
        marketplace(&dir)
            .args(["enqueue", "--site", "1", "--action", "deploy"])
            .assert()
            .success();
        marketplace(&dir)
            .args(["enqueue", "--site", "1", "--action", "stop"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already has a queued or running job"));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let dir = TempDir::new().unwrap();
        seed_site(&dir);
        marketplace(&dir)
            .args(["enqueue", "--site", "1", "--action", "restart"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid job action: restart"));
    }

    #[test]
    fn test_worker_once_runs_deploy_over_ssh() {
        let dir = TempDir::new().unwrap();
        seed_site(&dir);
        let ssh = fake_ssh(dir.path(), 0);
        marketplace(&dir)
            .args(["enqueue", "--site", "1", "--action", "deploy"])
            .assert()
            .success();

        marketplace(&dir)
            .env("MARKETPLACE_SSH_BINARY", &ssh)
            .args(["worker", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Processed one job"));

        let calls = fs::read_to_string(dir.path().join("ssh-calls.log")).unwrap();
        assert!(calls.contains("-p 22"));
        assert!(calls.contains("deploy@203.0.113.10 -- docker pull nginx:1.27"));
        assert!(calls.contains("-e APP_ENV=prod nginx:1.27"));

        marketplace(&dir)
            .args(["jobs"])
            .assert()
            .success()
            .stdout(predicate::str::contains("success"));
        marketplace(&dir)
            .args(["site", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("running"));
        marketplace(&dir)
            .args(["logs"])
            .assert()
            .success()
            .stdout(predicate::str::contains("deploy of site jo-shop succeeded"));
    }

    #[test]
    fn test_worker_once_records_failure() {
        let dir = TempDir::new().unwrap();
        seed_site(&dir);
        let ssh = fake_ssh(dir.path(), 1);
        marketplace(&dir)
            .args(["enqueue", "--site", "1", "--action", "deploy"])
            .assert()
            .success();
        marketplace(&dir)
            .env("MARKETPLACE_SSH_BINARY", &ssh)
            .args(["worker", "--once"])
            .assert()
            .success();

        // Stops after the failed pull.
        let calls = fs::read_to_string(dir.path().join("ssh-calls.log")).unwrap();
        assert_eq!(calls.lines().count(), 1);

        marketplace(&dir)
            .args(["jobs", "--status", "failed"])
            .assert()
            .success()
            .stdout(predicate::str::contains("error: Step 'pull'"));
        marketplace(&dir)
            .args(["site", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"));
    }

    #[test]
    fn test_worker_once_with_empty_queue() {
        let dir = TempDir::new().unwrap();
        marketplace(&dir)
            .args(["worker", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No queued jobs"));
    }
}
