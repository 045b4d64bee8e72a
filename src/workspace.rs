//! Orchestration: resolves each unit's declared dependency edges into
//! concrete build inputs and drives the scheduler over the build graph.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::Mutex;

use crate::build::{self, BuildInputs, DependencyInstall};
use crate::cache::CacheChain;
use crate::env;
use crate::error::NozemError;
use crate::fileset::FileSet;
use crate::graph::Graph;
use crate::ignore_matcher::IgnoreMatcher;
use crate::merkle::Hash;
use crate::scheduler::{self, FailureMode, RunReport};
use crate::unit::{CommandUnit, Dependency, NpmDependencyInput, Unit, UnitFile};

/// The directory extract-unit artifacts are materialized under, relative
/// to the monorepo root, since extract units have no source tree of their
/// own to persist into.
const EXTRACT_ARTIFACT_DIR: &str = ".nzm-extract";

/// What a completed unit leaves behind for its dependents to consume: its
/// artifact, if it has one, or nothing if it was built non-hermetically in
/// place.
#[derive(Clone)]
struct CompletedUnit {
    hermetic: bool,
    artifact_hash: Option<Hash>,
    files: Option<FileSet>,
}

pub struct RunOptions {
    pub concurrency: usize,
    pub bail: bool,
    pub downstream: bool,
}

/// Loads the graph, resolves `targets`, and runs the scheduler to
/// completion, dispatching each buildable unit to the hermetic sandbox
/// build, the in-place build, or the extract-unit build as appropriate.
pub async fn run_build(
    monorepo_root: PathBuf,
    unit_file: UnitFile,
    graph: Graph,
    targets: &[String],
    options: RunOptions,
    cache: CacheChain,
) -> Result<RunReport> {
    let selected = graph
        .resolve_targets(targets, options.downstream)
        .map_err(|err| NozemError::Graph(err.to_string()))?;

    let units: HashMap<String, Unit> = unit_file
        .units
        .into_iter()
        .map(|u| (u.identifier().to_string(), u))
        .collect();

    let monorepo_root = Arc::new(monorepo_root);
    let units = Arc::new(units);
    let cache = Arc::new(cache);
    let matcher = Arc::new(
        IgnoreMatcher::from_root(&monorepo_root).context("loading root .gitignore")?,
    );
    let completed: Arc<Mutex<HashMap<String, CompletedUnit>>> = Arc::new(Mutex::new(HashMap::new()));

    let mode = if options.bail { FailureMode::Bail } else { FailureMode::Continue };

    let report = scheduler::run(&graph, &selected, options.concurrency, mode, move |id| {
        let units = units.clone();
        let cache = cache.clone();
        let completed = completed.clone();
        let matcher = matcher.clone();
        let monorepo_root = monorepo_root.clone();
        async move { build_one(&id, &units, &cache, &completed, &matcher, &monorepo_root).await }
    })
    .await?;

    Ok(report)
}

async fn build_one(
    id: &str,
    units: &HashMap<String, Unit>,
    cache: &CacheChain,
    completed: &Mutex<HashMap<String, CompletedUnit>>,
    matcher: &IgnoreMatcher,
    monorepo_root: &Path,
) -> Result<()> {
    let unit = units.get(id).ok_or_else(|| anyhow!("unknown unit `{id}`"))?;

    if let Unit::Extract(extract) = unit {
        let (deps, dep_files, _copy, _os) = {
            let guard = completed.lock().await;
            resolve_dependencies(&extract.dependencies, monorepo_root, &guard)?
        };
        if !deps.values().all(NpmDependencyInput::is_hashable) {
            bail!("extract unit `{id}` depends on a non-hermetic unit and cannot be built hermetically");
        }
        let artifact_dir = monorepo_root.join(EXTRACT_ARTIFACT_DIR).join(id);
        let artifact = build::build_extract_unit(&dep_files, &extract.extract_patterns, &artifact_dir).await?;
        completed.lock().await.insert(
            id.to_string(),
            CompletedUnit {
                hermetic: true,
                artifact_hash: Some(artifact.artifact_hash),
                files: Some(artifact.files),
            },
        );
        return Ok(());
    }

    let (command_unit, patch_tsconfig): (&CommandUnit, bool) = match unit {
        Unit::Command(c) => (c, false),
        Unit::TypeScriptBuild(t) => (&t.command, t.patch_tsconfig),
        Unit::Extract(_) => unreachable!("handled above"),
    };

    let package_dir = monorepo_root.join(&command_unit.root);
    let (deps, dep_files, copy_files, os_tools) = {
        let guard = completed.lock().await;
        resolve_dependencies(&command_unit.dependencies, monorepo_root, &guard)?
    };
    let hermetic = deps.values().all(NpmDependencyInput::is_hashable);

    if command_unit.in_place || !hermetic {
        let resolved_env = env::resolve(&command_unit.env, &|k| std::env::var(k).ok());
        let env_pairs: Vec<(String, String)> =
            resolved_env.iter().map(|v| (v.key.clone(), v.value.clone())).collect();
        if let Some(cmd) = &command_unit.build_command {
            build::build_in_place(&package_dir, cmd, &env_pairs)
                .with_context(|| format!("building `{id}` in place"))?;
        }
        completed.lock().await.insert(
            id.to_string(),
            CompletedUnit {
                hermetic: false,
                artifact_hash: None,
                files: None,
            },
        );
        return Ok(());
    }

    let mut source_matcher = matcher.clone();
    source_matcher
        .add_patterns(&command_unit.non_sources.join("\n"))
        .with_context(|| format!("parsing nonSources patterns for `{id}`"))?;
    let mut artifact_matcher = matcher.clone();
    artifact_matcher
        .add_patterns(&command_unit.non_artifacts.join("\n"))
        .with_context(|| format!("parsing nonArtifacts patterns for `{id}`"))?;

    let sources =
        FileSet::walk(&package_dir, &source_matcher).with_context(|| format!("walking sources for `{id}`"))?;
    let external_files = resolve_external_files(command_unit, monorepo_root);

    let inputs = BuildInputs {
        unit: command_unit,
        package_dir: package_dir.clone(),
        relative_root: PathBuf::from(&command_unit.root),
        sources,
        deps,
        dep_files,
        copy_files,
        os_tools,
        external_files,
        patch_tsconfig,
    };

    let artifact = build::build_unit(&inputs, cache, &artifact_matcher, true)
        .await
        .with_context(|| format!("building `{id}`"))?;
    completed.lock().await.insert(
        id.to_string(),
        CompletedUnit {
            hermetic: true,
            artifact_hash: Some(artifact.artifact_hash),
            files: Some(artifact.files),
        },
    );
    Ok(())
}

fn resolve_external_files(unit: &CommandUnit, monorepo_root: &Path) -> BTreeMap<String, PathBuf> {
    unit.external_files
        .iter()
        .map(|rel| (rel.clone(), monorepo_root.join(rel)))
        .collect()
}

/// Translates a unit's declared dependency edges into the typed inputs
/// `BuildInputs` needs: the hashable `NpmDependencyInput` per name (for the
/// input Merkle), the concrete files to realize `link-npm`/`npm` edges
/// under `node_modules/<name>` with, the files to realize `copy` edges
/// with, and the resolved absolute path of each `os` tool.
#[allow(clippy::type_complexity)]
fn resolve_dependencies(
    edges: &[Dependency],
    monorepo_root: &Path,
    completed: &HashMap<String, CompletedUnit>,
) -> Result<(
    BTreeMap<String, NpmDependencyInput>,
    BTreeMap<String, DependencyInstall>,
    BTreeMap<String, FileSet>,
    BTreeMap<String, PathBuf>,
)> {
    let mut deps = BTreeMap::new();
    let mut dep_files = BTreeMap::new();
    let mut copy_files = BTreeMap::new();
    let mut os_tools = BTreeMap::new();

    for edge in edges {
        match edge {
            Dependency::Npm {
                name,
                version,
                resolved_location,
                ..
            } => {
                let directory = if resolved_location.is_absolute() {
                    resolved_location.clone()
                } else {
                    monorepo_root.join(resolved_location)
                };
                deps.insert(
                    name.clone(),
                    NpmDependencyInput::NpmRegistryDependency {
                        name: name.clone(),
                        files_identifier: version.clone(),
                        directory: directory.clone(),
                    },
                );
                dep_files.insert(
                    name.clone(),
                    DependencyInstall {
                        files: FileSet::new(directory, vec![]),
                        bundled: false,
                        executables: false,
                    },
                );
            }
            Dependency::LinkNpm { node, executables } => {
                let upstream = completed
                    .get(node)
                    .ok_or_else(|| anyhow!("dependency `{node}` was not built before its dependent"))?;
                if !upstream.hermetic {
                    deps.insert(
                        node.clone(),
                        NpmDependencyInput::MonoRepoInPlace {
                            unit_identifier: node.clone(),
                        },
                    );
                    continue;
                }
                let hash = upstream.artifact_hash.clone().expect("hermetic unit has an artifact hash");
                deps.insert(
                    node.clone(),
                    NpmDependencyInput::MonoRepoBuild {
                        unit_identifier: node.clone(),
                        files_identifier: hash.to_string(),
                    },
                );
                let files = upstream.files.as_ref().expect("hermetic unit has artifact files");
                dep_files.insert(
                    node.clone(),
                    DependencyInstall {
                        files: downstream_view(files),
                        bundled: true,
                        executables: *executables,
                    },
                );
            }
            Dependency::Copy { node, subdir } => {
                let upstream = completed
                    .get(node)
                    .ok_or_else(|| anyhow!("dependency `{node}` was not built before its dependent"))?;
                if !upstream.hermetic {
                    bail!("cannot copy the output of non-hermetic unit `{node}`");
                }
                let hash = upstream.artifact_hash.clone().expect("hermetic unit has an artifact hash");
                deps.insert(
                    node.clone(),
                    NpmDependencyInput::MonoRepoBuild {
                        unit_identifier: node.clone(),
                        files_identifier: hash.to_string(),
                    },
                );
                let files = upstream.files.as_ref().expect("hermetic unit has artifact files");
                let key = subdir.clone().unwrap_or_else(|| node.clone());
                copy_files.insert(key, downstream_view(files));
            }
            Dependency::Os { executable, rename } => {
                let resolved = resolve_os_tool(executable)
                    .with_context(|| format!("resolving OS tool `{executable}`"))?;
                let name = rename.clone().unwrap_or_else(|| executable.clone());
                os_tools.insert(name, resolved);
            }
        }
    }

    Ok((deps, dep_files, copy_files, os_tools))
}

/// Scans `$PATH` for `executable`, the hermetic build's stand-in for a
/// `which`-equivalent lookup (§5 names sub-process `which`-equivalent
/// resolution as a suspension point; no shell is actually spawned for it).
fn resolve_os_tool(executable: &str) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(executable);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("OS tool `{executable}` was not found on PATH")
}

/// A `MonoRepoBuild` dependency's files as seen by a downstream consumer:
/// `.ts` sources that have a sibling `.d.ts` are dropped (the declaration
/// file is authoritative), and `tsconfig.json` is dropped entirely, so a
/// downstream package's input hash tracks only what can actually affect
/// its own compilation.
fn downstream_view(files: &FileSet) -> FileSet {
    let all: std::collections::HashSet<&PathBuf> = files.paths().iter().collect();
    files.filter(|path| {
        if path.file_name().map(|n| n == "tsconfig.json").unwrap_or(false) {
            return false;
        }
        let is_ts = path.extension().and_then(|e| e.to_str()) == Some("ts");
        let is_declaration = path.to_string_lossy().ends_with(".d.ts");
        if is_ts && !is_declaration {
            let declaration = path.with_extension("d.ts");
            if all.contains(&declaration) {
                return false;
            }
        }
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleNode;

    fn upstream(hermetic: bool, hash: &str, files: Option<FileSet>) -> CompletedUnit {
        CompletedUnit {
            hermetic,
            artifact_hash: if hermetic {
                Some(MerkleNode::direct(crate::merkle::Hash::from_bytes(hash.as_bytes())).hash())
            } else {
                None
            },
            files,
        }
    }

    #[test]
    fn link_npm_to_non_hermetic_unit_propagates_in_place() {
        let mut completed = HashMap::new();
        completed.insert("flaky".to_string(), upstream(false, "", None));
        let edges = vec![Dependency::LinkNpm {
            node: "flaky".into(),
            executables: false,
        }];
        let (deps, _dep_files, _copy, _os) =
            resolve_dependencies(&edges, Path::new("/repo"), &completed).unwrap();
        assert!(!deps["flaky"].is_hashable());
    }

    #[test]
    fn link_npm_to_hermetic_unit_carries_artifact_hash() {
        let files = FileSet::new("/repo/packages/producer", vec![PathBuf::from("dist/index.js")]);
        let mut completed = HashMap::new();
        completed.insert("producer".to_string(), upstream(true, "v1", Some(files)));
        let edges = vec![Dependency::LinkNpm {
            node: "producer".into(),
            executables: true,
        }];
        let (deps, dep_files, _copy, _os) =
            resolve_dependencies(&edges, Path::new("/repo"), &completed).unwrap();
        assert!(deps["producer"].is_hashable());
        assert!(dep_files["producer"].bundled);
        assert!(dep_files["producer"].executables);
    }

    #[test]
    fn downstream_view_drops_ts_sources_with_sibling_declarations_and_tsconfig() {
        let files = FileSet::new(
            "/repo/packages/producer",
            vec![
                PathBuf::from("dist/index.ts"),
                PathBuf::from("dist/index.d.ts"),
                PathBuf::from("dist/other.ts"),
                PathBuf::from("tsconfig.json"),
            ],
        );
        let filtered = downstream_view(&files);
        let paths: Vec<&PathBuf> = filtered.paths().iter().collect();
        assert!(!paths.contains(&&PathBuf::from("dist/index.ts")));
        assert!(paths.contains(&&PathBuf::from("dist/index.d.ts")));
        assert!(paths.contains(&&PathBuf::from("dist/other.ts")));
        assert!(!paths.contains(&&PathBuf::from("tsconfig.json")));
    }

    #[test]
    fn copy_dependency_on_non_hermetic_unit_is_rejected() {
        let mut completed = HashMap::new();
        completed.insert("flaky".to_string(), upstream(false, "", None));
        let edges = vec![Dependency::Copy {
            node: "flaky".into(),
            subdir: None,
        }];
        let result = resolve_dependencies(&edges, Path::new("/repo"), &completed);
        assert!(result.is_err());
    }
}
