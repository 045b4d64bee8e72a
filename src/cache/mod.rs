//! The multi-tier artifact cache: in-place sidecar, local directory, and
//! remote object store, composed into a single lookup chain.

pub mod inplace;
pub mod local;
pub mod remote;

use std::path::Path;

use anyhow::Result;

use crate::fileset::FileSet;
use crate::merkle::{Hash, SerializedMerkle};

/// The locator a cache lookup is keyed by. Only `input_hash` matters for
/// correctness; `display_name` is for logging.
#[derive(Debug, Clone)]
pub struct CacheLocator {
    pub input_hash: Hash,
    pub display_name: Option<String>,
}

impl CacheLocator {
    pub fn new(input_hash: Hash) -> Self {
        CacheLocator {
            input_hash,
            display_name: None,
        }
    }

    pub fn named(input_hash: Hash, display_name: impl Into<String>) -> Self {
        CacheLocator {
            input_hash,
            display_name: Some(display_name.into()),
        }
    }
}

/// A cache hit: enough information to materialize the artifact into a
/// target directory without re-running the build.
pub struct CachedArtifact {
    pub artifact_hash: Hash,
    pub source_tier: TierName,
    fetch: Box<dyn FnOnce(&Path) -> Result<FileSet> + Send>,
}

impl CachedArtifact {
    pub fn fetch(self, target_dir: &Path) -> Result<FileSet> {
        (self.fetch)(target_dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierName {
    InPlace,
    Local,
    Remote,
}

/// The three tiers chained together. Each tier is independently optional:
/// in-place is always available (it's just a file next to the package),
/// local is available unless disabled, remote is available unless its
/// circuit breakers have tripped or it was never configured.
pub struct CacheChain {
    pub inplace: inplace::InPlaceCache,
    pub local: Option<local::LocalCache>,
    pub remote: Option<remote::RemoteCache>,
}

impl CacheChain {
    /// Looks up `locator` through in-place, then local, then remote,
    /// returning the first hit. A remote hit's `fetch` writes the
    /// downloaded tarball into the local tier's directory as a side
    /// effect, so subsequent lookups for the same hash don't go back to
    /// the network. `current_input_tree` is only consulted on an in-place
    /// miss, to explain what changed relative to the sidecar's recorded
    /// tree.
    pub async fn lookup(
        &self,
        locator: &CacheLocator,
        package_dir: &Path,
        current_input_tree: &SerializedMerkle,
    ) -> Option<CachedArtifact> {
        if let Some(hit) = self.inplace.lookup(locator, package_dir, current_input_tree) {
            return Some(hit);
        }
        if let Some(local) = &self.local {
            if let Some(hit) = local.lookup(locator).await {
                return Some(hit);
            }
        }
        if let Some(remote) = &self.remote {
            if let Some(hit) = remote.lookup(locator).await {
                // Rewrite the artifact into the local tier as it's fetched so
                // subsequent runs are served locally instead of hitting the
                // network again.
                let artifact_hash = hit.artifact_hash.clone();
                let locator = locator.clone();
                let local = self.local.clone();
                return Some(CachedArtifact {
                    artifact_hash: artifact_hash.clone(),
                    source_tier: TierName::Remote,
                    fetch: Box::new(move |target_dir| {
                        let files = hit.fetch(target_dir)?;
                        if let Some(local) = &local {
                            if let Err(err) = local.store_sync(&locator, &files, &artifact_hash) {
                                eprintln!("nozem: promoting remote hit to local cache failed: {err:#}");
                            }
                        }
                        Ok(files)
                    }),
                });
            }
        }
        None
    }

    /// Enqueues an asynchronous store to every writable tier. Failures in
    /// any tier must not abort the caller; they are logged and, for the
    /// remote tier, trip that tier's write circuit breaker.
    pub async fn queue_for_storing(
        &self,
        locator: &CacheLocator,
        package_dir: &Path,
        files: &FileSet,
        input_tree: &SerializedMerkle,
        artifact_hash: &Hash,
    ) {
        if let Err(err) = self
            .inplace
            .store(package_dir, files, input_tree, artifact_hash)
        {
            eprintln!("nozem: in-place cache write failed: {err:#}");
        }
        if let Some(local) = &self.local {
            if let Err(err) = local.store(locator, files, artifact_hash).await {
                eprintln!("nozem: local cache write failed: {err:#}");
            }
        }
        if let Some(remote) = &self.remote {
            remote.queue_store(locator.clone(), files.clone(), artifact_hash.clone());
        }
    }
}
