//! The in-place sidecar cache: a `.nzm-buildcache` file next to the
//! package's source, recording the input tree (truncated) and the
//! artifact's own file list and hash.
//!
//! When the package's current input hash matches what the sidecar
//! recorded, and the artifact files still on disk hash to the recorded
//! `artifactHash`, the source tree's current contents *are* the cached
//! artifact — nothing needs to be copied.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{CacheLocator, CachedArtifact, TierName};
use crate::fileset::FileSet;
use crate::ignore_matcher::IgnoreMatcher;
use crate::merkle::{Hash, MerkleDifference, SerializedMerkle};

pub const SIDECAR_FILE_NAME: &str = ".nzm-buildcache";

/// Input trees recorded in the sidecar are truncated to this many levels
/// of nesting; deeper subtrees collapse to their leaf hash only, keeping
/// the sidecar small.
pub const CHANGE_DETAIL_LEVELS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    input_tree: SerializedMerkle,
    artifacts: ArtifactPaths,
    artifact_hash: Hash,
    artifact_tree: SerializedMerkle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactPaths {
    relative_paths: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InPlaceCache;

impl InPlaceCache {
    pub fn new() -> Self {
        InPlaceCache
    }

    fn sidecar_path(package_dir: &Path) -> std::path::PathBuf {
        package_dir.join(SIDECAR_FILE_NAME)
    }

    fn read_sidecar(package_dir: &Path) -> Option<Sidecar> {
        let path = Self::sidecar_path(package_dir);
        let contents = fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn lookup(
        &self,
        locator: &CacheLocator,
        package_dir: &Path,
        current_input_tree: &SerializedMerkle,
    ) -> Option<CachedArtifact> {
        let sidecar = Self::read_sidecar(package_dir)?;
        if sidecar.input_tree.root != locator.input_hash {
            let current_truncated = truncate_tree(current_input_tree, CHANGE_DETAIL_LEVELS);
            let diff = MerkleDifference::between(&sidecar.input_tree, &current_truncated);
            if !diff.is_empty() {
                let name = locator.display_name.as_deref().unwrap_or("package");
                eprintln!(
                    "nozem: in-place cache miss for {name}: {} changed, {} added, {} removed",
                    diff.changed.len(),
                    diff.added.len(),
                    diff.removed.len()
                );
            }
            return None;
        }
        let matcher = IgnoreMatcher::new();
        let current = recompute_artifact_hash(package_dir, &sidecar.artifacts.relative_paths, &matcher).ok()?;
        if current != sidecar.artifact_hash {
            return None;
        }
        let artifact_hash = sidecar.artifact_hash.clone();
        let package_dir = package_dir.to_path_buf();
        let paths: Vec<std::path::PathBuf> = sidecar
            .artifacts
            .relative_paths
            .iter()
            .map(std::path::PathBuf::from)
            .collect();
        Some(CachedArtifact {
            artifact_hash,
            source_tier: TierName::InPlace,
            fetch: Box::new(move |_target_dir| Ok(FileSet::new(package_dir, paths))),
        })
    }

    /// Writes the sidecar atomically (temp file then rename), per the
    /// single-writer ownership of a package's own sidecar.
    pub fn store(
        &self,
        package_dir: &Path,
        files: &FileSet,
        input_tree: &SerializedMerkle,
        artifact_hash: &Hash,
    ) -> Result<()> {
        let truncated = truncate_tree(input_tree, CHANGE_DETAIL_LEVELS);
        let artifact_tree = files.merkle().map(|n| SerializedMerkle::from(&n))?;
        let sidecar = Sidecar {
            input_tree: truncated,
            artifacts: ArtifactPaths {
                relative_paths: files
                    .paths()
                    .iter()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .collect(),
            },
            artifact_hash: artifact_hash.clone(),
            artifact_tree,
        };
        let json = serde_json::to_string_pretty(&sidecar)?;
        let final_path = Self::sidecar_path(package_dir);
        let tmp_path = package_dir.join(format!("{SIDECAR_FILE_NAME}.tmp"));
        fs::write(&tmp_path, json).with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("renaming sidecar into place at {}", final_path.display()))?;
        Ok(())
    }
}

fn recompute_artifact_hash(
    package_dir: &Path,
    relative_paths: &[String],
    _matcher: &IgnoreMatcher,
) -> Result<Hash> {
    let paths = relative_paths.iter().map(std::path::PathBuf::from).collect();
    let set = FileSet::new(package_dir, paths).only_existing();
    let merkle = set.merkle()?;
    Ok(merkle.hash())
}

/// Keeps `leaves` for display but drops the depth information beyond
/// `depth` levels of the path, since `SerializedMerkle` is already fully
/// flattened; here "truncation" means the top-`depth`-level leaf groupings
/// are retained, with deeper subtrees collapsed to a single composite hash
/// over everything they contain — not just the first leaf to reach that
/// prefix, since multiple distinct deep leaves commonly share a truncated
/// prefix (e.g. `deps/a/b/c` and `deps/a/b/d` at depth 3) and silently
/// keeping only one would corrupt the sidecar's diagnostic detail.
fn truncate_tree(tree: &SerializedMerkle, depth: usize) -> SerializedMerkle {
    use std::collections::BTreeMap;
    let mut groups: BTreeMap<String, BTreeMap<String, Hash>> = BTreeMap::new();
    for (path, hash) in &tree.leaves {
        let segments: Vec<&str> = path.split('/').collect();
        let take = depth.min(segments.len());
        let truncated_path = segments[..take].join("/");
        let remainder = segments[take..].join("/");
        groups.entry(truncated_path).or_default().insert(remainder, hash.clone());
    }
    let leaves = groups
        .into_iter()
        .map(|(truncated_path, remainder_hashes)| {
            let hash = if remainder_hashes.len() == 1 && remainder_hashes.contains_key("") {
                remainder_hashes[""].clone()
            } else {
                let mut buf = String::new();
                for (remainder, hash) in &remainder_hashes {
                    buf.push_str(remainder);
                    buf.push('=');
                    buf.push_str(hash.as_str());
                    buf.push('\n');
                }
                Hash::from_bytes(buf.as_bytes())
            };
            (truncated_path, hash)
        })
        .collect();
    SerializedMerkle {
        root: tree.root.clone(),
        leaves,
    }
}
