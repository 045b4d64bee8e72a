//! End-to-end build scenarios, one per case in the specification's
//! "testable properties" section: an unchanged second run reuses the
//! cache, a leaf-package edit forces a targeted rebuild, a dependent
//! consumes a producer's artifact, a continue-mode fan-out prunes only
//! what depends on the failure, and bail mode aborts the whole run.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::tempdir;

fn nozem() -> Command {
    Command::cargo_bin("nozem").unwrap()
}

fn write_unit_file(root: &Path, json: &str) {
    std::fs::write(root.join("nozem.json"), json).unwrap();
}

fn write_source(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn build(root: &Path, cache_dir: &Path, extra_args: &[&str]) -> assert_cmd::assert::Assert {
    nozem()
        .current_dir(root)
        .arg("build")
        .args(extra_args)
        .arg("--cache-dir")
        .arg(cache_dir)
        .assert()
}

/// Scenario 1: a two-package linear build where the second run on
/// unchanged sources never re-executes the build command (the in-place
/// cache hit leaves the already-built file untouched).
#[test]
fn unchanged_second_run_does_not_rerun_the_build_command() {
    let root = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();

    write_unit_file(
        root.path(),
        r#"{
            "units": [
                {"kind":"command","identifier":"pkg-b","root":"packages/b",
                 "buildCommand":"echo built-b >> out.txt","dependencies":[]},
                {"kind":"command","identifier":"pkg-a","root":"packages/a",
                 "buildCommand":"while read -r line; do echo \"$line\" > copied.txt; done < node_modules/pkg-b/out.txt",
                 "dependencies":[{"type":"link-npm","node":"pkg-b","executables":false}]}
            ]
        }"#,
    );
    write_source(root.path(), "packages/b/index.js", "module.exports = {}");
    write_source(root.path(), "packages/a/index.js", "module.exports = {}");

    build(root.path(), cache_dir.path(), &[]).success();
    let first = std::fs::read_to_string(root.path().join("packages/b/out.txt")).unwrap();
    assert_eq!(first.lines().count(), 1);
    let copied = std::fs::read_to_string(root.path().join("packages/a/copied.txt")).unwrap();
    assert_eq!(copied.trim(), "built-b");

    build(root.path(), cache_dir.path(), &[]).success();
    let second = std::fs::read_to_string(root.path().join("packages/b/out.txt")).unwrap();
    assert_eq!(
        second.lines().count(),
        1,
        "a cache hit must not re-run the build command"
    );
}

/// Scenario 2: editing a leaf package's source forces its own rebuild
/// (and its build command, which appends, proves it actually re-ran).
#[test]
fn editing_a_leaf_package_forces_only_that_package_to_rebuild() {
    let root = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();

    write_unit_file(
        root.path(),
        r#"{
            "units": [
                {"kind":"command","identifier":"pkg-b","root":"packages/b",
                 "buildCommand":"echo built-b >> out.txt","dependencies":[]}
            ]
        }"#,
    );
    write_source(root.path(), "packages/b/index.js", "module.exports = {}");

    build(root.path(), cache_dir.path(), &[]).success();
    build(root.path(), cache_dir.path(), &[]).success();
    let unchanged = std::fs::read_to_string(root.path().join("packages/b/out.txt")).unwrap();
    assert_eq!(unchanged.lines().count(), 1);

    write_source(root.path(), "packages/b/index.js", "module.exports = { changed: true }");
    build(root.path(), cache_dir.path(), &[]).success();
    let after_edit = std::fs::read_to_string(root.path().join("packages/b/out.txt")).unwrap();
    assert_eq!(
        after_edit.lines().count(),
        2,
        "a source edit must invalidate the cache and re-run the build"
    );
}

/// Scenario 5: continue-on-failure fan-out. `a` and `b` both depend on
/// `root`; `x` depends on `a`. When `a` fails with `--no-bail`, `b` still
/// builds and `x` is pruned; the run still exits non-zero.
#[test]
fn continue_mode_prunes_only_dependents_of_the_failed_node() {
    let root = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();

    write_unit_file(
        root.path(),
        r#"{
            "units": [
                {"kind":"command","identifier":"root","root":"packages/root",
                 "buildCommand":"echo root > out.txt","dependencies":[]},
                {"kind":"command","identifier":"a","root":"packages/a",
                 "buildCommand":"exit 1",
                 "dependencies":[{"type":"link-npm","node":"root","executables":false}]},
                {"kind":"command","identifier":"b","root":"packages/b",
                 "buildCommand":"echo b > out.txt",
                 "dependencies":[{"type":"link-npm","node":"root","executables":false}]},
                {"kind":"command","identifier":"x","root":"packages/x",
                 "buildCommand":"echo x > out.txt",
                 "dependencies":[{"type":"link-npm","node":"a","executables":false}]}
            ]
        }"#,
    );
    for pkg in ["root", "a", "b", "x"] {
        write_source(root.path(), &format!("packages/{pkg}/index.js"), "module.exports = {}");
    }

    build(root.path(), cache_dir.path(), &["--no-bail"])
        .failure()
        .code(1)
        .stderr(predicate::str::contains("1 failed"))
        .stderr(predicate::str::contains("1 pruned"));

    assert!(root.path().join("packages/root/out.txt").is_file());
    assert!(root.path().join("packages/b/out.txt").is_file());
    assert!(
        !root.path().join("packages/x/out.txt").is_file(),
        "x depends on the failed node a and must never have run"
    );
}

/// Scenario 5's bail-mode counterpart: the same graph, default bail
/// behavior, aborts the run on the first failure.
#[test]
fn bail_mode_aborts_the_whole_run_on_first_failure() {
    let root = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();

    write_unit_file(
        root.path(),
        r#"{
            "units": [
                {"kind":"command","identifier":"root","root":"packages/root",
                 "buildCommand":"echo root > out.txt","dependencies":[]},
                {"kind":"command","identifier":"a","root":"packages/a",
                 "buildCommand":"exit 1",
                 "dependencies":[{"type":"link-npm","node":"root","executables":false}]},
                {"kind":"command","identifier":"x","root":"packages/x",
                 "buildCommand":"echo x > out.txt",
                 "dependencies":[{"type":"link-npm","node":"a","executables":false}]}
            ]
        }"#,
    );
    for pkg in ["root", "a", "x"] {
        write_source(root.path(), &format!("packages/{pkg}/index.js"), "module.exports = {}");
    }

    build(root.path(), cache_dir.path(), &[]).failure().code(1);
    assert!(
        !root.path().join("packages/x/out.txt").is_file(),
        "bail mode must never schedule a's dependent"
    );
}

/// Scenario 3: a dependent's input hash commits to its producer's whole
/// artifact, so the producer's output is visible to the consumer's build
/// command through `node_modules/<name>`.
#[test]
fn a_consumer_sees_its_producers_artifact_under_node_modules() {
    let root = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();

    write_unit_file(
        root.path(),
        r#"{
            "units": [
                {"kind":"command","identifier":"producer","root":"packages/producer",
                 "buildCommand":"echo from-producer > dist.txt","dependencies":[]},
                {"kind":"command","identifier":"consumer","root":"packages/consumer",
                 "buildCommand":"while read -r line; do echo \"$line\" > seen.txt; done < node_modules/producer/dist.txt",
                 "dependencies":[{"type":"link-npm","node":"producer","executables":false}]}
            ]
        }"#,
    );
    write_source(root.path(), "packages/producer/index.js", "module.exports = {}");
    write_source(root.path(), "packages/consumer/index.js", "module.exports = {}");

    build(root.path(), cache_dir.path(), &[]).success();
    let seen = std::fs::read_to_string(root.path().join("packages/consumer/seen.txt")).unwrap();
    assert_eq!(seen.trim(), "from-producer");
}

/// Scenario 4 (partial): a remote tier that can never be reached still
/// lets the build succeed via the local/in-place tiers, with the remote
/// read circuit breaker tripping rather than failing the build.
#[test]
fn an_unreachable_remote_cache_degrades_to_the_local_tier() {
    let root = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();

    write_unit_file(
        root.path(),
        r#"{"units":[{"kind":"command","identifier":"a","root":"packages/a","buildCommand":"echo hi > out.txt","dependencies":[]}]}"#,
    );
    write_source(root.path(), "packages/a/index.js", "module.exports = {}");
    std::fs::write(
        root.path().join("nozem-cache.json"),
        r#"{"cacheBucket": {"bucketName": "nozem-test-bucket-that-does-not-exist", "region": "us-east-1"}}"#,
    )
    .unwrap();

    build(root.path(), cache_dir.path(), &[]).success();
    assert!(root.path().join("packages/a/out.txt").is_file());
}
