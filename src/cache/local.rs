//! The local directory cache: `$HOME/.cache/nozem/local/<hh>/<hash>.{tar.gz,json}`.
//!
//! Tarball packing follows the in-memory-archive-then-hash pattern: files
//! are appended into a `tar::Builder`, gzip-compressed, and written as one
//! blob, with a sibling `.json` index recording the artifact's own file
//! list and hash. A one-at-a-time guard serializes cache cleanup so
//! concurrent builds don't race to delete the same oldest entries.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{CacheLocator, CachedArtifact, TierName};
use crate::fileset::FileSet;
use crate::merkle::Hash;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalIndex {
    artifact_hash: Hash,
    artifacts: Vec<String>,
}

/// Default total size budget for the local tarball directory before the
/// cleaner starts evicting the oldest entries.
pub const DEFAULT_MAX_SIZE_MB: u64 = 2048;

#[derive(Clone)]
pub struct LocalCache {
    root: PathBuf,
    max_size_mb: u64,
    cleanup_guard: Arc<Mutex<()>>,
    cleanup_pending: Arc<AtomicBool>,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>, max_size_mb: u64) -> Self {
        LocalCache {
            root: root.into(),
            max_size_mb,
            cleanup_guard: Arc::new(Mutex::new(())),
            cleanup_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `$HOME/.cache/nozem/local`, the default location when
    /// `nozem-cache.json` does not override `cacheDir`.
    pub fn default_root() -> Result<PathBuf> {
        let home = dirs::home_dir().context("resolving home directory for default cache location")?;
        Ok(home.join(".cache").join("nozem").join("local"))
    }

    fn shard_dir(&self, hash: &Hash) -> PathBuf {
        let prefix = &hash.as_str()[..4.min(hash.as_str().len())];
        self.root.join(prefix)
    }

    fn tarball_path(&self, hash: &Hash) -> PathBuf {
        self.shard_dir(hash).join(format!("{hash}.tar.gz"))
    }

    fn index_path(&self, hash: &Hash) -> PathBuf {
        self.shard_dir(hash).join(format!("{hash}.json"))
    }

    pub async fn lookup(&self, locator: &CacheLocator) -> Option<CachedArtifact> {
        let index_path = self.index_path(&locator.input_hash);
        let contents = tokio::fs::read_to_string(&index_path).await.ok()?;
        let index: LocalIndex = serde_json::from_str(&contents).ok()?;
        let tarball_path = self.tarball_path(&locator.input_hash);
        let artifact_hash = index.artifact_hash.clone();
        let artifacts = index.artifacts.clone();
        Some(CachedArtifact {
            artifact_hash,
            source_tier: TierName::Local,
            fetch: Box::new(move |target_dir| extract_tarball(&tarball_path, target_dir, &artifacts)),
        })
    }

    pub async fn store(&self, locator: &CacheLocator, files: &FileSet, artifact_hash: &Hash) -> Result<()> {
        let shard = self.shard_dir(&locator.input_hash);
        tokio::fs::create_dir_all(&shard).await?;
        let tarball_path = self.tarball_path(&locator.input_hash);
        pack_tarball(&tarball_path, files)?;
        let index = LocalIndex {
            artifact_hash: artifact_hash.clone(),
            artifacts: files
                .paths()
                .iter()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .collect(),
        };
        let index_path = self.index_path(&locator.input_hash);
        tokio::fs::write(&index_path, serde_json::to_string_pretty(&index)?).await?;
        self.request_cleanup();
        Ok(())
    }

    /// Synchronous variant of `store`, used to promote a remote-tier hit
    /// into the local tier right after fetching it, so the next lookup on
    /// this hash is served locally instead of going back to the network.
    pub fn store_sync(&self, locator: &CacheLocator, files: &FileSet, artifact_hash: &Hash) -> Result<()> {
        let shard = self.shard_dir(&locator.input_hash);
        fs::create_dir_all(&shard)?;
        let tarball_path = self.tarball_path(&locator.input_hash);
        pack_tarball(&tarball_path, files)?;
        let index = LocalIndex {
            artifact_hash: artifact_hash.clone(),
            artifacts: files
                .paths()
                .iter()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .collect(),
        };
        let index_path = self.index_path(&locator.input_hash);
        fs::write(&index_path, serde_json::to_string_pretty(&index)?)?;
        self.request_cleanup();
        Ok(())
    }

    /// Requests a cleanup pass; collapses concurrent requests into at
    /// most one follow-on run via the pending flag plus the mutex guard.
    fn request_cleanup(&self) {
        if self
            .cleanup_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let root = self.root.clone();
        let max_size_mb = self.max_size_mb;
        let guard = self.cleanup_guard.clone();
        let pending = self.cleanup_pending.clone();
        tokio::spawn(async move {
            let _permit = guard.lock().await;
            pending.store(false, Ordering::SeqCst);
            if let Err(err) = cleanup(&root, max_size_mb).await {
                eprintln!("nozem: local cache cleanup failed: {err:#}");
            }
        });
    }
}

fn pack_tarball(tarball_path: &Path, files: &FileSet) -> Result<()> {
    let file = fs::File::create(tarball_path)
        .with_context(|| format!("creating {}", tarball_path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for rel in files.paths() {
        let abs = files.root().join(rel);
        builder
            .append_path_with_name(&abs, rel)
            .with_context(|| format!("archiving {}", abs.display()))?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

fn extract_tarball(tarball_path: &Path, target_dir: &Path, artifacts: &[String]) -> Result<FileSet> {
    let file = fs::File::open(tarball_path)
        .with_context(|| format!("opening {}", tarball_path.display()))?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    fs::create_dir_all(target_dir)?;
    archive
        .unpack(target_dir)
        .with_context(|| format!("unpacking {}", tarball_path.display()))?;
    let paths = artifacts.iter().map(PathBuf::from).collect();
    Ok(FileSet::new(target_dir, paths))
}

/// Drops the oldest tarballs (by file modification time) until the total
/// size of `*.tar.gz` files under `root` is at or below `max_size_mb`.
async fn cleanup(root: &Path, max_size_mb: u64) -> Result<()> {
    let budget_bytes = max_size_mb.saturating_mul(1_000_000);
    let mut entries: Vec<(PathBuf, PathBuf, u64, std::time::SystemTime)> = Vec::new();
    let mut total: u64 = 0;

    let mut shard_iter = match tokio::fs::read_dir(root).await {
        Ok(it) => it,
        Err(_) => return Ok(()),
    };
    while let Ok(Some(shard)) = shard_iter.next_entry().await {
        if !shard.file_type().await?.is_dir() {
            continue;
        }
        let mut file_iter = tokio::fs::read_dir(shard.path()).await?;
        while let Ok(Some(entry)) = file_iter.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("gz") {
                continue;
            }
            let meta = entry.metadata().await?;
            total += meta.len();
            let index_path = path.with_extension("").with_extension("json");
            entries.push((path, index_path, meta.len(), meta.modified()?));
        }
    }

    if total <= budget_bytes {
        return Ok(());
    }

    entries.sort_by_key(|(_, _, _, modified)| *modified);
    for (tarball, index, size, _) in entries {
        if total <= budget_bytes {
            break;
        }
        tokio::fs::remove_file(&tarball).await.ok();
        tokio::fs::remove_file(&index).await.ok();
        total = total.saturating_sub(size);
    }
    Ok(())
}
