use assert_cmd::Command;
use predicates::prelude::*;
use std::time::Duration;

fn fault_proxy() -> Command {
    let mut cmd = Command::cargo_bin("fault-proxy").unwrap();
    for var in [
        "FAULT_PROXY_LISTEN",
        "FAULT_PROXY_CONTROL",
        "FAULT_PROXY_DIAL",
        "FAULT_PROXY_MODE",
        "FAULT_PROXY_LOG_LEVEL",
        "FAULT_PROXY_LOG_FORMAT",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_help() {
    fault_proxy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--listen"))
        .stdout(predicate::str::contains("--control"))
        .stdout(predicate::str::contains("--dial"));
}

#[test]
fn test_cli_version() {
    fault_proxy()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fault-proxy"));
}

#[test]
fn test_cli_missing_control_is_config_error() {
    fault_proxy()
        .args(["--listen", "127.0.0.1:", "--dial", "127.0.0.1:7233"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("must specify a control address"));
}

#[test]
fn test_cli_invalid_log_format_is_config_error() {
    fault_proxy()
        .args([
            "--listen",
            "127.0.0.1:",
            "--control",
            "127.0.0.1:0",
            "--dial",
            "127.0.0.1:7233",
            "--log-format",
            "xml",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("fatal:"));
}

#[test]
fn test_cli_bind_failure_exits_2() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    fault_proxy()
        .args(["--listen", &addr, "--control", "127.0.0.1:0", "--dial", "127.0.0.1:7233"])
        .timeout(Duration::from_secs(10))
        .assert()
        .code(2);
}

#[test]
fn test_cli_lifetime_limit_exits_cleanly() {
    fault_proxy()
        .args([
            "--listen",
            "127.0.0.1:",
            "--control",
            "127.0.0.1:0",
            "--dial",
            "127.0.0.1:7233",
            "--max-lifetime-secs",
            "1",
        ])
        .timeout(Duration::from_secs(15))
        .assert()
        .success();
}
