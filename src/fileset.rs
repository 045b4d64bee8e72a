//! `FileSet`: a rooted, sorted collection of relative file paths, with
//! content hashing memoized per path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::ignore_matcher::IgnoreMatcher;
use crate::merkle::Hash;

/// A set of paths relative to a single root directory, always kept sorted
/// and de-duplicated. Two `FileSet`s with the same root and the same
/// relative paths are considered to describe the same input set regardless
/// of how they were constructed.
#[derive(Debug, Clone)]
pub struct FileSet {
    root: PathBuf,
    paths: Vec<PathBuf>,
    hash_cache: std::sync::Arc<Mutex<BTreeMap<PathBuf, Hash>>>,
}

impl FileSet {
    pub fn new(root: impl Into<PathBuf>, mut paths: Vec<PathBuf>) -> Self {
        paths.sort();
        paths.dedup();
        FileSet {
            root: root.into(),
            paths,
            hash_cache: std::sync::Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Walks `root`, applying `matcher` to prune ignored files and
    /// directories, and returns the resulting set of relative paths.
    /// Descends directory by directory rather than flattening the whole
    /// tree up front, so each subdirectory's own `.gitignore` (if any) is
    /// loaded and applied only within that subdirectory, per the matcher's
    /// lazy per-directory loading contract.
    pub fn walk(root: impl Into<PathBuf>, matcher: &IgnoreMatcher) -> Result<Self> {
        let root = root.into();
        let mut paths = Vec::new();
        walk_dir(&root, "", matcher, &mut paths)?;
        Ok(FileSet::new(root, paths))
    }

    /// Returns a new `FileSet` with `root` changed to `new_root`, and every
    /// path that was present under the old root preserved unchanged (the
    /// relative paths do not change, only the root they resolve against).
    pub fn rebase(&self, new_root: impl Into<PathBuf>) -> FileSet {
        FileSet::new(new_root, self.paths.clone())
    }

    /// Returns a new `FileSet` excluding any path present in `other`
    /// (compared by relative path only).
    pub fn except(&self, other: &FileSet) -> FileSet {
        let exclude: std::collections::HashSet<&PathBuf> = other.paths.iter().collect();
        let kept = self
            .paths
            .iter()
            .filter(|p| !exclude.contains(p))
            .cloned()
            .collect();
        FileSet::new(self.root.clone(), kept)
    }

    /// Returns a new `FileSet` keeping only paths for which `predicate`
    /// returns true.
    pub fn filter(&self, predicate: impl Fn(&Path) -> bool) -> FileSet {
        let kept = self
            .paths
            .iter()
            .filter(|p| predicate(p))
            .cloned()
            .collect();
        FileSet::new(self.root.clone(), kept)
    }

    /// Returns a new `FileSet` keeping only paths that currently exist on
    /// disk under `root` (used after a dependency subtree has been copied
    /// partially, or after a build step has deleted files).
    pub fn only_existing(&self) -> FileSet {
        let kept = self
            .paths
            .iter()
            .filter(|p| self.root.join(p).exists())
            .cloned()
            .collect();
        FileSet::new(self.root.clone(), kept)
    }

    /// Hashes the content of a single relative path, memoizing the result
    /// for the lifetime of this `FileSet` (clones of a `FileSet` share the
    /// same cache, since constructing it is assumed to be done once per
    /// logical walk). A symbolic link hashes its target string rather than
    /// the file it points at, so the Merkle tree commits to the link
    /// itself, not whatever it happens to resolve to.
    pub fn file_hash(&self, rel: &Path) -> Result<Hash> {
        if let Some(cached) = self.hash_cache.lock().unwrap().get(rel) {
            return Ok(cached.clone());
        }
        let full = self.root.join(rel);
        let meta = fs::symlink_metadata(&full).with_context(|| format!("reading {}", full.display()))?;
        let hash = if meta.file_type().is_symlink() {
            let target = fs::read_link(&full).with_context(|| format!("reading link {}", full.display()))?;
            Hash::from_bytes(target.to_string_lossy().as_bytes())
        } else {
            let bytes = fs::read(&full).with_context(|| format!("reading {}", full.display()))?;
            Hash::from_bytes(&bytes)
        };
        self.hash_cache
            .lock()
            .unwrap()
            .insert(rel.to_path_buf(), hash.clone());
        Ok(hash)
    }

    /// Clears the memoized hash cache. Exposed for tests that mutate files
    /// on disk between calls and need to force a re-read.
    pub fn clear_hash_cache(&self) {
        self.hash_cache.lock().unwrap().clear();
    }

    /// Builds a Merkle composite node over every file in this set, keyed by
    /// its relative path (with `/` separators, platform-independent).
    pub fn merkle(&self) -> Result<crate::merkle::MerkleNode> {
        let mut children = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let key = path.to_string_lossy().replace('\\', "/");
            let hash = self.file_hash(path)?;
            children.push((key, crate::merkle::MerkleNode::direct(hash)));
        }
        Ok(crate::merkle::MerkleNode::composite(children))
    }
}

/// Recursively visits `dir` (whose path relative to the walk root is
/// `rel_dir`), loading its own `.gitignore` into a descended copy of
/// `matcher` before testing its children, and appending every admitted
/// file's root-relative path to `paths`. Symbolic links are treated as
/// files, never followed as directories, matching the walk contract.
fn walk_dir(dir: &Path, rel_dir: &str, matcher: &IgnoreMatcher, paths: &mut Vec<PathBuf>) -> Result<()> {
    let scoped = matcher
        .descend(dir, rel_dir)
        .with_context(|| format!("loading .gitignore under {}", dir.display()))?;

    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("reading directory {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        let rel = if rel_dir.is_empty() {
            name_str.to_string()
        } else {
            format!("{rel_dir}/{name_str}")
        };
        let meta = entry
            .metadata()
            .with_context(|| format!("reading metadata for {}", entry.path().display()))?;
        let is_symlink = meta.file_type().is_symlink();
        let is_dir = meta.is_dir() && !is_symlink;

        if scoped.is_ignored(Path::new(&rel), is_dir) {
            continue;
        }

        if is_dir {
            walk_dir(&entry.path(), &rel, &scoped, paths)?;
        } else {
            paths.push(PathBuf::from(rel));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore_matcher::IgnoreMatcher;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn walk_collects_files_and_prunes_ignored() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/x.js"), "x").unwrap();
        fs::write(dir.path().join("index.ts"), "export {}").unwrap();
        fs::write(dir.path().join(".gitignore"), "node_modules\n").unwrap();

        let matcher = IgnoreMatcher::from_root(dir.path()).unwrap();
        let set = FileSet::walk(dir.path(), &matcher).unwrap();
        assert_eq!(set.paths(), &[PathBuf::from("index.ts")]);
    }

    #[test]
    fn except_removes_overlapping_paths() {
        let a = FileSet::new("/root", vec![PathBuf::from("a"), PathBuf::from("b")]);
        let b = FileSet::new("/root", vec![PathBuf::from("b")]);
        let diff = a.except(&b);
        assert_eq!(diff.paths(), &[PathBuf::from("a")]);
    }

    #[test]
    fn file_hash_is_memoized() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let set = FileSet::new(dir.path(), vec![PathBuf::from("a.txt")]);
        let h1 = set.file_hash(Path::new("a.txt")).unwrap();
        fs::write(dir.path().join("a.txt"), "changed").unwrap();
        let h2 = set.file_hash(Path::new("a.txt")).unwrap();
        assert_eq!(h1, h2, "cached hash should not see the on-disk change");
        set.clear_hash_cache();
        let h3 = set.file_hash(Path::new("a.txt")).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn file_hash_of_a_symlink_hashes_its_target_string_not_its_contents() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), "actual contents").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link.txt")).unwrap();

        let set = FileSet::new(dir.path(), vec![PathBuf::from("link.txt")]);
        let link_hash = set.file_hash(Path::new("link.txt")).unwrap();
        assert_eq!(link_hash, Hash::from_bytes(b"real.txt"));
    }
}
