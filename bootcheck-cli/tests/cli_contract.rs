//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("bootcheck");
    // Keep the caller's environment from leaking into contract checks.
    for var in [
        "BOOTCHECK_UART_MIRROR_FILE",
        "BOOTCHECK_UART_LIVE_ONLY",
        "BOOTCHECK_DEMO_STEP_DELAY",
        "BOOTCHECK_DEMO_BYTE_DELAY",
        "BOOTCHECK_EMULATOR",
        "BOOTCHECK_KERNEL",
        "BOOTCHECK_FIRMWARE",
        "BOOTCHECK_FIRMWARE_SIZE",
        "BOOTCHECK_NO_SWEEP",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn missing_emulator_args(dir: &std::path::Path) -> Vec<String> {
    vec![
        "--emulator".into(),
        dir.join("no-such-qemu").display().to_string(),
        "--no-build".into(),
        // Never touch emulators running on the developer's machine.
        "--no-sweep".into(),
    ]
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootcheck"))
        .stdout(predicate::str::contains("--uart-mirror-file"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootcheck"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn unknown_flag_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.arg("--definitely-not-a-flag")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn invalid_number_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["--demo-byte-delay", "fast"])
        .assert()
        .code(2);
}

#[test]
fn missing_emulator_exits_one_with_environment_error() {
    let dir = tempdir().expect("tempdir should be created");

    let mut cmd = cli_cmd();
    cmd.args(missing_emulator_args(dir.path()))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("[1/7]"))
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn missing_emulator_json_verdict_on_stdout() {
    let dir = tempdir().expect("tempdir should be created");

    let mut cmd = cli_cmd();
    let output = cmd
        .args(missing_emulator_args(dir.path()))
        .args(["--json", "--quiet"])
        .output()
        .expect("command should execute");

    assert_eq!(output.status.code(), Some(1));
    let verdict: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(verdict["passed"], false);
    assert_eq!(verdict["step"], "launch");
    assert!(verdict["captured"].is_null());
    assert!(
        verdict["reason"]
            .as_str()
            .is_some_and(|r| r.contains("not found"))
    );
}

#[test]
fn quiet_mode_prints_only_the_failure() {
    let dir = tempdir().expect("tempdir should be created");

    let mut cmd = cli_cmd();
    cmd.args(missing_emulator_args(dir.path()))
        .arg("--quiet")
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("[1/7]").not())
        .stderr(predicate::str::contains("FAILED"));
}

#[test]
fn ephemeral_mirror_is_removed_after_failed_launch() {
    let dir = tempdir().expect("tempdir should be created");
    let mirror = dir.path().join("uart.log");

    let mut cmd = cli_cmd();
    cmd.args(missing_emulator_args(dir.path()))
        .arg("--uart-mirror-file")
        .arg(&mirror)
        .arg("--uart-live-only")
        .assert()
        .code(1);

    assert!(!mirror.exists());
}

#[test]
fn persistent_mirror_is_created_empty_after_failed_launch() {
    let dir = tempdir().expect("tempdir should be created");
    let mirror = dir.path().join("uart.log");
    fs::write(&mirror, "stale output from an earlier run").expect("seed mirror");

    let mut cmd = cli_cmd();
    cmd.args(missing_emulator_args(dir.path()))
        .arg("--uart-mirror-file")
        .arg(&mirror)
        .assert()
        .code(1);

    assert_eq!(fs::read_to_string(&mirror).expect("mirror exists"), "");
}

#[test]
fn emulator_from_config_file_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("bootcheck.toml");
    let missing = dir.path().join("qemu-from-config");
    fs::write(
        &config,
        format!(
            "[emulator]\npath = {:?}\nsweep = false\n\n[firmware]\nbuild = false\n",
            missing.display().to_string()
        ),
    )
    .expect("write config");

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("qemu-from-config"));
}

#[test]
fn invalid_config_file_is_ignored_with_warning() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("broken.toml");
    fs::write(&config, "[emulator\npath = ").expect("write config");

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .args(missing_emulator_args(dir.path()))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn no_sweep_is_listed_in_help() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-sweep"));
}

#[test]
fn completions_bash_writes_script() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bootcheck"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_unknown_shell_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "not-a-shell"])
        .assert()
        .code(2);
}
