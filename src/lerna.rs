//! The `from-lerna` importer: scans a Lerna-style (or plain npm/yarn
//! workspaces) monorepo and emits the `nozem.json` unit file the build
//! graph loads. Versions are pinned directly from each `package.json`; no
//! registry resolution is performed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use crate::unit::{CommandUnit, Dependency, TypeScriptBuildUnit, Unit, UnitFile};

const LERNA_MANIFEST: &str = "lerna.json";
const DEFAULT_PACKAGE_GLOBS: &[&str] = &["packages/*"];

struct Member {
    name: String,
    root: PathBuf,
    build_command: Option<String>,
    test_command: Option<String>,
    dependencies: BTreeMap<String, String>,
}

/// Scans `monorepo_root` for workspace package globs (from `lerna.json`, or
/// failing that a root `package.json`'s `workspaces` array), reads each
/// member's `package.json`, and emits one TypeScript-build unit per member
/// that declares a `build` script.
pub fn import(monorepo_root: &Path) -> Result<UnitFile> {
    let patterns = workspace_patterns(monorepo_root)?;
    let member_dirs = expand_patterns(monorepo_root, &patterns)?;

    let mut members = Vec::new();
    for dir in member_dirs {
        if let Some(member) = read_member(monorepo_root, &dir)? {
            members.push(member);
        }
    }
    if members.is_empty() {
        bail!("no workspace packages found under {}", monorepo_root.display());
    }

    let buildable: HashMap<&str, &Member> = members
        .iter()
        .filter(|m| m.build_command.is_some())
        .map(|m| (m.name.as_str(), m))
        .collect();

    let mut units = Vec::with_capacity(buildable.len());
    for member in members.iter().filter(|m| m.build_command.is_some()) {
        let mut dependencies = Vec::with_capacity(member.dependencies.len());
        for (dep_name, version) in &member.dependencies {
            if let Some(target) = buildable.get(dep_name.as_str()) {
                dependencies.push(Dependency::LinkNpm {
                    node: target.name.clone(),
                    executables: false,
                });
            } else {
                dependencies.push(Dependency::Npm {
                    name: dep_name.clone(),
                    version_range: version.clone(),
                    version: version.clone(),
                    resolved_location: PathBuf::from("node_modules").join(dep_name),
                });
            }
        }

        units.push(Unit::TypeScriptBuild(TypeScriptBuildUnit {
            command: CommandUnit {
                identifier: member.name.clone(),
                root: normalize(&member.root),
                non_sources: vec!["node_modules".into(), "dist".into()],
                non_artifacts: vec![],
                build_command: member.build_command.clone(),
                test_command: member.test_command.clone(),
                dependencies,
                env: BTreeMap::new(),
                external_files: vec![],
                in_place: false,
            },
            patch_tsconfig: true,
        }));
    }

    if units.is_empty() {
        bail!("no workspace package declares a \"build\" script; nothing to import");
    }

    Ok(UnitFile { units })
}

fn normalize(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// The glob patterns workspace members live under: `lerna.json`'s
/// `packages` array if present, else the root `package.json`'s
/// `workspaces` array, else the conventional `packages/*` default.
fn workspace_patterns(monorepo_root: &Path) -> Result<Vec<String>> {
    let lerna_path = monorepo_root.join(LERNA_MANIFEST);
    if lerna_path.is_file() {
        let contents = std::fs::read_to_string(&lerna_path).with_context(|| format!("reading {}", lerna_path.display()))?;
        let manifest: Value = serde_json::from_str(&contents).with_context(|| format!("parsing {}", lerna_path.display()))?;
        if let Some(packages) = manifest.get("packages").and_then(Value::as_array) {
            let patterns: Vec<String> = packages
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !patterns.is_empty() {
                return Ok(patterns);
            }
        }
        return Ok(DEFAULT_PACKAGE_GLOBS.iter().map(|s| s.to_string()).collect());
    }

    let root_manifest_path = monorepo_root.join("package.json");
    if root_manifest_path.is_file() {
        let contents = std::fs::read_to_string(&root_manifest_path)
            .with_context(|| format!("reading {}", root_manifest_path.display()))?;
        let manifest: Value =
            serde_json::from_str(&contents).with_context(|| format!("parsing {}", root_manifest_path.display()))?;
        if let Some(workspaces) = manifest.get("workspaces") {
            let patterns: Vec<String> = match workspaces {
                Value::Array(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
                Value::Object(obj) => obj
                    .get("packages")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            if !patterns.is_empty() {
                return Ok(patterns);
            }
        }
    }

    Ok(DEFAULT_PACKAGE_GLOBS.iter().map(|s| s.to_string()).collect())
}

/// Expands each glob pattern (relative to `monorepo_root`) into the
/// directories it matches, deduplicated and sorted.
fn expand_patterns(monorepo_root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut dirs = std::collections::BTreeSet::new();
    for pattern in patterns {
        let full_pattern = monorepo_root.join(pattern);
        let full_pattern_str = full_pattern
            .to_str()
            .ok_or_else(|| anyhow!("non-UTF8 workspace glob: {}", full_pattern.display()))?;
        for entry in glob::glob(full_pattern_str).with_context(|| format!("invalid workspace glob `{pattern}`"))? {
            let path = entry?;
            if path.is_dir() {
                dirs.insert(path);
            }
        }
    }
    Ok(dirs.into_iter().collect())
}

fn read_member(monorepo_root: &Path, dir: &Path) -> Result<Option<Member>> {
    let manifest_path = dir.join("package.json");
    if !manifest_path.is_file() {
        return Ok(None);
    }
    let contents =
        std::fs::read_to_string(&manifest_path).with_context(|| format!("reading {}", manifest_path.display()))?;
    let manifest: Value =
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", manifest_path.display()))?;
    let name = manifest
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{} has no \"name\" field", manifest_path.display()))?
        .to_string();

    let root = dir.strip_prefix(monorepo_root).unwrap_or(dir).to_path_buf();
    let build_command = manifest
        .pointer("/scripts/build")
        .and_then(Value::as_str)
        .map(str::to_string);
    let test_command = manifest
        .pointer("/scripts/test")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut dependencies = BTreeMap::new();
    for field in ["dependencies", "devDependencies"] {
        if let Some(map) = manifest.get(field).and_then(Value::as_object) {
            for (dep_name, version) in map {
                if let Some(version) = version.as_str() {
                    dependencies.insert(dep_name.clone(), version.to_string());
                }
            }
        }
    }

    Ok(Some(Member {
        name,
        root,
        build_command,
        test_command,
        dependencies,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_package(dir: &Path, name: &str, json_extra: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("package.json"),
            format!(r#"{{"name": "{name}", {json_extra}}}"#),
        )
        .unwrap();
    }

    #[test]
    fn imports_linear_dependency_as_link_npm() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("lerna.json"), r#"{"packages": ["packages/*"]}"#).unwrap();
        write_package(
            &root.path().join("packages/a"),
            "pkg-a",
            r#""scripts": {"build": "tsc"}, "dependencies": {"pkg-b": "1.0.0", "leftpad": "2.0.0"}"#,
        );
        write_package(
            &root.path().join("packages/b"),
            "pkg-b",
            r#""scripts": {"build": "tsc"}"#,
        );

        let unit_file = import(root.path()).unwrap();
        assert_eq!(unit_file.units.len(), 2);

        let a = unit_file.units.iter().find(|u| u.identifier() == "pkg-a").unwrap();
        let deps = a.dependencies();
        assert!(deps.iter().any(|d| matches!(d, Dependency::LinkNpm { node, .. } if node == "pkg-b")));
        assert!(deps.iter().any(|d| matches!(d, Dependency::Npm { name, .. } if name == "leftpad")));
    }

    #[test]
    fn members_without_a_build_script_become_external_npm_edges() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("lerna.json"), r#"{"packages": ["packages/*"]}"#).unwrap();
        write_package(
            &root.path().join("packages/a"),
            "pkg-a",
            r#""scripts": {"build": "tsc"}, "dependencies": {"pkg-c": "1.0.0"}"#,
        );
        write_package(&root.path().join("packages/c"), "pkg-c", r#""scripts": {}"#);

        let unit_file = import(root.path()).unwrap();
        assert_eq!(unit_file.units.len(), 1);
        let a = &unit_file.units[0];
        assert!(a
            .dependencies()
            .iter()
            .any(|d| matches!(d, Dependency::Npm { name, .. } if name == "pkg-c")));
    }

    #[test]
    fn falls_back_to_root_package_json_workspaces() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("package.json"), r#"{"name": "root", "workspaces": ["packages/*"]}"#).unwrap();
        write_package(
            &root.path().join("packages/a"),
            "pkg-a",
            r#""scripts": {"build": "tsc"}"#,
        );

        let unit_file = import(root.path()).unwrap();
        assert_eq!(unit_file.units.len(), 1);
    }

    #[test]
    fn no_buildable_packages_is_an_error() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("lerna.json"), r#"{"packages": ["packages/*"]}"#).unwrap();
        write_package(&root.path().join("packages/a"), "pkg-a", r#""scripts": {}"#);

        assert!(import(root.path()).is_err());
    }
}
