//! The hermetic unit build: for one package, compute its input Merkle,
//! look up the cache chain, and on a miss run a sandboxed build.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::cache::{CacheChain, CacheLocator};
use crate::env;
use crate::fileset::FileSet;
use crate::ignore_matcher::IgnoreMatcher;
use crate::merkle::{Hash, MerkleNode, SerializedMerkle};
use crate::sandbox::{self, Sandbox};
use crate::unit::{CommandUnit, NpmDependencyInput};

/// A logic-version cache buster: bumping this invalidates every cached
/// artifact regardless of input content, for use when the build
/// procedure itself changes in a way that isn't otherwise reflected in
/// the hash.
pub const LOGIC_VERSION: &str = "1";

/// `tsconfig.json` keys stripped when `patch_tsconfig` is set, so a
/// package built standalone in a sandbox doesn't try to resolve project
/// references or emit inline sourcemaps that would leak the sandbox path
/// into the committed artifact.
const TSCONFIG_STRIP_KEYS: &[&str] = &["references", "composite", "inlineSourceMap", "inlineSources"];

/// How to realize one resolved NPM dependency inside a sandbox's
/// `node_modules/`: a `MonoRepoBuild` is copied in (its artifact is a
/// throwaway build output, re-created every sandbox), a registry
/// dependency is symlinked (it already lives on disk, unchanging).
#[derive(Clone)]
pub struct DependencyInstall {
    pub files: FileSet,
    pub bundled: bool,
    pub executables: bool,
}

/// The fully assembled set of typed inputs for one package build, ready
/// to be hashed and, on a cache miss, realized in a sandbox.
pub struct BuildInputs<'a> {
    pub unit: &'a CommandUnit,
    pub package_dir: PathBuf,
    /// The package's root directory relative to the monorepo root (used to
    /// mirror the monorepo layout inside the sandbox).
    pub relative_root: PathBuf,
    pub sources: FileSet,
    pub deps: BTreeMap<String, NpmDependencyInput>,
    pub dep_files: BTreeMap<String, DependencyInstall>,
    /// `copy` dependency edges: another unit's artifact, copied directly
    /// into a subdirectory of `src/` (as opposed to `link-npm`'s
    /// `node_modules/<name>` placement).
    pub copy_files: BTreeMap<String, FileSet>,
    pub os_tools: BTreeMap<String, PathBuf>,
    pub external_files: BTreeMap<String, PathBuf>,
    pub patch_tsconfig: bool,
}

/// The outcome of building (or fetching) one unit.
pub struct BuiltArtifact {
    pub artifact_hash: Hash,
    pub files: FileSet,
    pub from_cache: bool,
}

impl<'a> BuildInputs<'a> {
    /// Whether every NPM dependency is hashable; if not, this package must
    /// skip the sandbox and build directly in the source tree.
    pub fn is_hermetic(&self) -> bool {
        self.deps.values().all(NpmDependencyInput::is_hashable)
    }

    /// Composes the input Merkle: `{source, env, deps, osTools,
    /// externalFiles, v}`.
    pub fn input_merkle(&self) -> Result<MerkleNode> {
        let source_node = self.sources.merkle()?;

        let resolved_env = env::resolve(&self.unit.env, &|k| std::env::var(k).ok());
        let env_children = env::hashable(&resolved_env)
            .into_iter()
            .map(|(k, v)| (k.to_string(), MerkleNode::direct(Hash::from_bytes(v.as_bytes()))))
            .collect::<Vec<_>>();
        let env_node = MerkleNode::composite(env_children);

        let deps_children = self
            .deps
            .iter()
            .filter_map(|(name, dep)| {
                dep.files_identifier()
                    .map(|id| (name.clone(), MerkleNode::direct(Hash::from_bytes(id.as_bytes()))))
            })
            .collect::<Vec<_>>();
        let deps_node = MerkleNode::composite(deps_children);

        let os_tools_children = self
            .os_tools
            .iter()
            .map(|(name, path)| {
                (
                    name.clone(),
                    MerkleNode::direct(Hash::from_bytes(path.to_string_lossy().as_bytes())),
                )
            })
            .collect::<Vec<_>>();
        let os_tools_node = MerkleNode::composite(os_tools_children);

        let mut external_children = Vec::with_capacity(self.external_files.len());
        for (name, path) in &self.external_files {
            let bytes = std::fs::read(path).with_context(|| format!("reading external file {}", path.display()))?;
            external_children.push((name.clone(), MerkleNode::direct(Hash::from_bytes(&bytes))));
        }
        let external_node = MerkleNode::composite(external_children);

        Ok(MerkleNode::composite([
            ("source".to_string(), source_node),
            ("env".to_string(), env_node),
            ("deps".to_string(), deps_node),
            ("osTools".to_string(), os_tools_node),
            ("externalFiles".to_string(), external_node),
            ("v".to_string(), MerkleNode::direct(Hash::from_bytes(LOGIC_VERSION.as_bytes()))),
        ]))
    }
}

/// Installs dependencies, OS tools, and external files into a sandbox
/// already holding a package's sources, per §4.6 step 3: bundled
/// (monorepo-built) dependencies are copied into `node_modules/<name>`,
/// registry dependencies are symlinked there instead, OS tools become
/// `bin/` symlinks, and external files are copied in at their
/// monorepo-relative path. Takes owned/borrowed maps rather than
/// `&BuildInputs` so it can be called from inside a `spawn_blocking`
/// closure that only owns cloned data, not a reference borrowed from the
/// calling task's stack.
fn install_into_sandbox(
    dep_files: &BTreeMap<String, DependencyInstall>,
    copy_files: &BTreeMap<String, FileSet>,
    os_tools: &BTreeMap<String, PathBuf>,
    external_files: &BTreeMap<String, PathBuf>,
    sbox: &Sandbox,
) -> Result<()> {
    for (name, install) in dep_files {
        let subdir = PathBuf::from("node_modules").join(name);
        if install.bundled {
            sbox.add_src_files(&install.files, Some(subdir.as_path()))
                .with_context(|| format!("copying dependency `{name}` into sandbox"))?;
        } else {
            sbox.install_symlink(&subdir, install.files.root())
                .with_context(|| format!("linking dependency `{name}` into sandbox"))?;
        }
        if install.executables {
            let bin_dir = install.files.root().join(".bin");
            if bin_dir.is_dir() {
                for entry in
                    std::fs::read_dir(&bin_dir).with_context(|| format!("listing executables for `{name}`"))?
                {
                    let entry = entry?;
                    sbox.install_executable(&entry.path(), None)?;
                }
            }
        }
    }

    for (subdir, files) in copy_files {
        sbox.add_src_files(files, Some(Path::new(subdir)))
            .with_context(|| format!("copying `{subdir}` into sandbox"))?;
    }

    for (name, path) in os_tools {
        sbox.install_executable(path, Some(name.as_str()))
            .with_context(|| format!("linking OS tool `{name}` into sandbox"))?;
    }

    for (rel, path) in external_files {
        let dest = sbox.src_dir().join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(path, &dest)
            .with_context(|| format!("copying external file {} into sandbox", path.display()))?;
    }

    Ok(())
}

/// Removes the project-reference and inline-sourcemap keys from
/// `tsconfig.json` at `dir`, if present, so a package built standalone in
/// a sandbox doesn't reference sibling project paths that don't exist
/// there. A missing `tsconfig.json` is not an error — not every
/// TypeScript-build unit necessarily has one at its root.
fn patch_tsconfig(dir: &Path) -> Result<()> {
    let path = dir.join("tsconfig.json");
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).context("reading tsconfig.json"),
    };
    let mut value: Value = serde_json::from_str(&contents).context("parsing tsconfig.json")?;
    if let Some(obj) = value.as_object_mut() {
        for key in TSCONFIG_STRIP_KEYS {
            obj.remove(*key);
        }
    }
    std::fs::write(&path, serde_json::to_string_pretty(&value)?).context("writing patched tsconfig.json")?;
    Ok(())
}

/// Runs the hermetic build procedure for one unit: cache lookup, and on a
/// miss, a sandboxed build. Pass `run_test` to additionally execute the
/// unit's `test_command` after a successful build (test outputs are
/// copied back alongside build outputs but do not become part of the
/// stored artifact hash).
pub async fn build_unit(
    inputs: &BuildInputs<'_>,
    cache: &CacheChain,
    matcher: &IgnoreMatcher,
    run_test: bool,
) -> Result<BuiltArtifact> {
    let input_node = inputs.input_merkle()?;
    let input_hash = input_node.hash();
    let locator = CacheLocator::named(input_hash.clone(), inputs.unit.identifier.clone());
    let serialized_input = SerializedMerkle::from(&input_node);

    if let Some(hit) = cache.lookup(&locator, &inputs.package_dir, &serialized_input).await {
        let files = hit.fetch(&inputs.package_dir)?;
        return Ok(BuiltArtifact {
            artifact_hash: hit.artifact_hash,
            files,
            from_cache: true,
        });
    }

    let resolved_env = env::resolve(&inputs.unit.env, &|k| std::env::var(k).ok());
    let env_pairs: Vec<(String, String)> = resolved_env
        .iter()
        .map(|v| (v.key.clone(), v.value.clone()))
        .collect();

    let package_dir = inputs.package_dir.clone();
    let relative_root = inputs.relative_root.clone();
    let build_command = inputs.unit.build_command.clone();
    let test_command = inputs.unit.test_command.clone();
    let sources = inputs.sources.clone();
    let patch = inputs.patch_tsconfig;
    let dep_files = inputs.dep_files.clone();
    let copy_files = inputs.copy_files.clone();
    let os_tools = inputs.os_tools.clone();
    let external_files = inputs.external_files.clone();
    let matcher = matcher.clone();

    // The sandbox build shells out to the package's build/test commands and
    // does the file copying around it, so it runs on the blocking thread
    // pool rather than tying up a tokio worker for the duration of an
    // external npm/tsc invocation (§5 bounded concurrency assumes each
    // in-flight build only occupies a scheduler permit, not a worker
    // thread).
    let (files, artifact_hash) = tokio::task::spawn_blocking(move || -> Result<(FileSet, Hash)> {
        sandbox::with(move |sbox| {
            sbox.touch_file(".nzmroot")?;
            if !relative_root.as_os_str().is_empty() {
                sbox.move_src_dir(&relative_root)?;
            }
            sbox.add_src_files(&sources, None)
                .context("copying sources into sandbox")?;
            install_into_sandbox(&dep_files, &copy_files, &os_tools, &external_files, sbox)
                .context("installing dependency inputs")?;

            if patch {
                patch_tsconfig(sbox.src_dir()).context("patching tsconfig.json")?;
            }

            if let Some(command) = &build_command {
                sbox.execute(command, &env_pairs).context("running build command")?;
            }

            let artifacts = sbox
                .in_source_artifacts(&matcher)
                .context("snapshotting build artifacts")?;

            if run_test {
                if let Some(command) = &test_command {
                    sbox.execute(command, &env_pairs).context("running test command")?;
                }
            }

            let merkle = artifacts.merkle()?;
            let hash = merkle.hash();

            let dest = &package_dir;
            for rel in artifacts.paths() {
                let from = sbox.src_dir().join(rel);
                let to = dest.join(rel);
                if let Some(parent) = to.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&from, &to)
                    .with_context(|| format!("copying artifact {} back to source tree", rel.display()))?;
            }
            let materialized = FileSet::new(dest.clone(), artifacts.paths().to_vec());
            Ok((materialized, hash))
        })
    })
    .await
    .context("sandbox build task panicked")??;

    cache
        .queue_for_storing(&locator, &inputs.package_dir, &files, &serialized_input, &artifact_hash)
        .await;

    Ok(BuiltArtifact {
        artifact_hash,
        files,
        from_cache: false,
    })
}

/// Builds an extract unit: installs its dependencies (other units' already
/// realized output) into a throwaway sandbox and takes the subset of files
/// matching `extract_patterns` as the artifact, materialized into
/// `artifact_dir` (an identifier-scoped directory this unit owns for the
/// life of the process, since an extract unit has no monorepo source
/// directory of its own to write back into).
pub async fn build_extract_unit(
    dep_files: &BTreeMap<String, DependencyInstall>,
    extract_patterns: &[String],
    artifact_dir: &Path,
) -> Result<BuiltArtifact> {
    let dep_files = dep_files.clone();
    let extract_patterns = extract_patterns.to_vec();
    let artifact_dir = artifact_dir.to_path_buf();

    let (files, artifact_hash) = tokio::task::spawn_blocking(move || -> Result<(FileSet, Hash)> {
        sandbox::with(move |sbox| {
            for (name, install) in &dep_files {
                if install.bundled {
                    sbox.add_src_files(&install.files, Some(Path::new(name)))
                        .with_context(|| format!("copying `{name}` into extract sandbox"))?;
                } else {
                    sbox.install_symlink(Path::new(name), install.files.root())
                        .with_context(|| format!("linking `{name}` into extract sandbox"))?;
                }
            }

            let all = sbox
                .in_source_artifacts(&IgnoreMatcher::new())
                .context("listing extract sandbox contents")?;
            let matched = filter_by_patterns(&all, &extract_patterns)?;

            std::fs::create_dir_all(&artifact_dir)?;
            for rel in matched.paths() {
                let from = sbox.src_dir().join(rel);
                let to = artifact_dir.join(rel);
                if let Some(parent) = to.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&from, &to)
                    .with_context(|| format!("copying extracted file {}", rel.display()))?;
            }
            let materialized = FileSet::new(artifact_dir.clone(), matched.paths().to_vec());
            let hash = materialized.merkle()?.hash();
            Ok((materialized, hash))
        })
    })
    .await
    .context("extract sandbox task panicked")??;

    Ok(BuiltArtifact {
        artifact_hash,
        files,
        from_cache: false,
    })
}

/// Keeps only the paths in `set` matching at least one of `patterns`
/// (glob syntax, matched against the path relative to `set`'s root).
fn filter_by_patterns(set: &FileSet, patterns: &[String]) -> Result<FileSet> {
    let compiled: Vec<glob::Pattern> = patterns
        .iter()
        .map(|p| glob::Pattern::new(p).with_context(|| format!("invalid extract pattern `{p}`")))
        .collect::<Result<_>>()?;
    Ok(set.filter(|path| {
        let normalized = path.to_string_lossy().replace('\\', "/");
        compiled.iter().any(|pat| pat.matches(&normalized))
    }))
}

/// Builds a non-hermetic unit directly in its source directory, via the
/// external package-manager-driven build, when one of its dependencies is
/// a `MonoRepoInPlace` unit and therefore produces no hashable identity.
pub fn build_in_place(package_dir: &Path, build_command: &str, env_pairs: &[(String, String)]) -> Result<()> {
    let mut cmd = std::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(build_command).current_dir(package_dir);
    for (k, v) in env_pairs {
        cmd.env(k, v);
    }
    let status = cmd.status().context("spawning in-place build command")?;
    if !status.success() {
        anyhow::bail!("in-place build command failed in {}", package_dir.display());
    }
    Ok(())
}
