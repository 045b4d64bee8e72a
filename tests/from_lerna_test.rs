//! `from-lerna` importer: scanning a Lerna-style monorepo and emitting
//! `nozem.json`.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn nozem() -> Command {
    Command::cargo_bin("nozem").unwrap()
}

fn write_package(dir: &std::path::Path, name: &str, extra: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("package.json"), format!(r#"{{"name": "{name}", {extra}}}"#)).unwrap();
}

#[test]
fn emits_a_unit_file_with_linked_internal_dependencies() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("lerna.json"), r#"{"packages": ["packages/*"]}"#).unwrap();
    write_package(
        &root.path().join("packages/a"),
        "pkg-a",
        r#""scripts": {"build": "tsc"}, "dependencies": {"pkg-b": "1.0.0", "leftpad": "2.0.0"}"#,
    );
    write_package(&root.path().join("packages/b"), "pkg-b", r#""scripts": {"build": "tsc"}"#);

    nozem()
        .current_dir(root.path())
        .arg("from-lerna")
        .assert()
        .success()
        .stderr(predicate::str::contains("nozem.json"));

    let written = std::fs::read_to_string(root.path().join("nozem.json")).unwrap();
    let parsed: Value = serde_json::from_str(&written).unwrap();
    let units = parsed["units"].as_array().unwrap();
    assert_eq!(units.len(), 2);

    let a = units.iter().find(|u| u["identifier"] == "pkg-a").unwrap();
    assert_eq!(a["kind"], "typescript-build");
    let deps = a["dependencies"].as_array().unwrap();
    assert!(deps.iter().any(|d| d["type"] == "link-npm" && d["node"] == "pkg-b"));
    assert!(deps.iter().any(|d| d["type"] == "npm" && d["name"] == "leftpad"));
}

#[test]
fn errors_when_no_package_declares_a_build_script() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("lerna.json"), r#"{"packages": ["packages/*"]}"#).unwrap();
    write_package(&root.path().join("packages/a"), "pkg-a", r#""scripts": {}"#);

    nozem().current_dir(root.path()).arg("from-lerna").assert().failure().code(1);
}
