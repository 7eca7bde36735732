use assert_cmd::Command;
use predicates::prelude::*;

fn run_control() -> Command {
    let mut cmd = Command::cargo_bin("run-control").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    run_control()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("check-path"));
}

#[test]
fn test_check_path_accepts_relative_paths() {
    run_control()
        .args(["check-path", "inputs/data.csv"])
        .assert()
        .success()
        .stdout(predicate::str::contains("inputs/data.csv"));
}

#[test]
fn test_check_path_rejects_escaping_paths() {
    run_control()
        .args(["check-path", "../../etc/passwd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parent-directory"));

    run_control()
        .args(["check-path", "/etc/passwd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("absolute"));
}

#[test]
fn test_config_prints_effective_configuration() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("run-control.toml"),
        "[policy]\nmax_runs = 7\n",
    )
    .unwrap();

    run_control()
        .current_dir(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[policy]"))
        .stdout(predicate::str::contains("max_runs = 7"))
        .stdout(predicate::str::contains("[worker]"));
}

#[test]
fn test_environment_overrides_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("run-control.toml"),
        "[policy]\nmax_runs = 7\n",
    )
    .unwrap();

    run_control()
        .current_dir(dir.path())
        .env("RUN_CONTROL__POLICY__MAX_RUNS", "3")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_runs = 3"));
}
