//! CLI surface tests: flags, help text, and the configuration-error path
//! when no `nozem.json` is found.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn nozem() -> Command {
    Command::cargo_bin("nozem").unwrap()
}

#[test]
fn version_flag_reports_the_binary_name() {
    nozem().arg("-V").assert().success().stdout(predicate::str::contains("nozem"));
}

#[test]
fn help_flag_describes_the_tool() {
    nozem()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Hermetic, content-addressed build tool"));
}

#[test]
fn build_help_lists_the_documented_flags() {
    nozem()
        .args(["build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--concurrency"))
        .stdout(predicate::str::contains("--bail"))
        .stdout(predicate::str::contains("--no-bail"))
        .stdout(predicate::str::contains("--down"))
        .stdout(predicate::str::contains("--cache-dir"));
}

#[test]
fn build_without_a_unit_file_is_a_configuration_error() {
    let dir = tempdir().unwrap();
    nozem()
        .current_dir(dir.path())
        .arg("build")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("nozem.json"));
}

#[test]
fn build_rejects_an_unknown_target() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("nozem.json"),
        r#"{"units":[{"kind":"command","identifier":"a","root":"packages/a","buildCommand":"echo hi > out.txt","dependencies":[]}]}"#,
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join("packages/a")).unwrap();
    std::fs::write(dir.path().join("packages/a/index.js"), "module.exports = {}").unwrap();

    let cache_dir = tempdir().unwrap();
    nozem()
        .current_dir(dir.path())
        .args(["build", "does-not-exist", "--cache-dir"])
        .arg(cache_dir.path())
        .assert()
        .failure()
        .code(1);
}
