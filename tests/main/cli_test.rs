//! CLI contract tests.

use std::path::Path;

use assert_cmd::Command;

fn spendwire(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("spendwire").expect("binary builds");
    cmd.env("SPENDWIRE_CONFIG_PATH", data_dir.join("absent.toml"))
        .env("SPENDWIRE_DATA_DIR", data_dir)
        .env_remove("RUST_LOG");
    cmd
}

fn stdout(cmd: &mut Command) -> String {
    let output = cmd.output().expect("runs");
    assert!(output.status.success(), "{output:?}");
    String::from_utf8(output.stdout).expect("utf-8")
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let help = stdout(spendwire(dir.path()).arg("--help"));
    for sub in ["start", "pair", "status", "logout"] {
        assert!(help.contains(sub), "missing {sub} in:\n{help}");
    }
}

#[test]
fn status_without_database_reports_no_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = stdout(spendwire(dir.path()).arg("status"));
    assert!(out.starts_with("No sessions"), "{out}");
}

#[test]
fn pair_requires_tenant_and_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    spendwire(dir.path()).args(["pair", "acme"]).assert().failure();
}

#[test]
fn logout_of_unknown_identity_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = stdout(spendwire(dir.path()).args(["logout", "acme", "+15550001"]));
    assert!(out.contains("acme"), "{out}");
    assert!(out.contains("logged out"), "{out}");
}
