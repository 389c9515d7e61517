//! Integration tests for the command-line surface

use assert_cmd::Command;
use predicates::prelude::*;

fn sysdelay() -> Command {
    assert_cmd::cargo::cargo_bin_cmd!("sysdelay")
}

#[test]
fn test_help_lists_pid_and_delay() {
    sysdelay()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("-p, --pid <PID>"))
        .stdout(predicate::str::contains("-d, --delay <MICROSECONDS>"));
}

#[test]
fn test_pid_is_required() {
    sysdelay()
        .arg("-d")
        .arg("100")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--pid <PID>"));
}

#[test]
fn test_delay_is_required() {
    sysdelay()
        .arg("-p")
        .arg("1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--delay <MICROSECONDS>"));
}

#[test]
fn test_zero_pid_rejected() {
    sysdelay()
        .args(["-p", "0", "-d", "100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--pid should be > 0"));
}

#[test]
fn test_negative_pid_rejected() {
    sysdelay()
        .args(["-p", "-12", "-d", "100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--pid should be > 0"));
}

#[test]
fn test_zero_delay_rejected() {
    sysdelay()
        .args(["-p", "1", "-d", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--delay should be > 0"));
}

#[test]
fn test_negative_delay_rejected() {
    sysdelay()
        .args(["--pid", "1", "--delay", "-500"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--delay should be > 0"));
}

#[test]
fn test_invalid_pid_format() {
    sysdelay()
        .args(["-p", "not_a_number", "-d", "100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid digit found in string"));
}

#[test]
fn test_unknown_format_rejected() {
    sysdelay()
        .args(["-p", "1", "-d", "100", "--format", "xml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value 'xml'"));
}

#[test]
fn test_nonexistent_pid_reports_discovery_failure() {
    // PID 99999999 is above pid_max, so /proc/99999999/task never exists
    sysdelay()
        .args(["-p", "99999999", "-d", "100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to list threads of process 99999999"));
}
