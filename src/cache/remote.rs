//! The remote object-store tier: a generic key/blob contract backed by a
//! shelled-out CLI (e.g. `aws s3 cp`, `oras push`), with two independent
//! circuit breakers — a read-disable flag tripped by any read failure, and
//! a write-disable flag tripped by any write failure. Once tripped, all
//! subsequent calls on that side short-circuit without attempting I/O.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::{CacheLocator, CachedArtifact, TierName};
use crate::fileset::FileSet;
use crate::merkle::Hash;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteIndex {
    artifact_hash: Hash,
    artifacts: Vec<String>,
}

/// Connection details for an S3-like bucket, as read from
/// `nozem-cache.json`'s `cacheBucket` field.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub bucket_name: String,
    pub region: String,
    pub profile_name: Option<String>,
}

pub struct RemoteCache {
    bucket: BucketConfig,
    local_mirror_dir: PathBuf,
    read_disabled: Arc<AtomicBool>,
    write_disabled: Arc<AtomicBool>,
}

impl RemoteCache {
    pub fn new(bucket: BucketConfig, local_mirror_dir: PathBuf) -> Self {
        RemoteCache {
            bucket,
            local_mirror_dir,
            read_disabled: Arc::new(AtomicBool::new(false)),
            write_disabled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reads_enabled(&self) -> bool {
        !self.read_disabled.load(Ordering::SeqCst)
    }

    pub fn writes_enabled(&self) -> bool {
        !self.write_disabled.load(Ordering::SeqCst)
    }

    fn index_key(&self, hash: &Hash) -> String {
        format!("nozem/index/{hash}.json")
    }

    fn data_key(&self, hash: &Hash) -> String {
        format!("nozem/data/{hash}.tar.gz")
    }

    fn local_index_mirror_path(&self, hash: &Hash) -> PathBuf {
        let shard = &hash.as_str()[..4.min(hash.as_str().len())];
        self.local_mirror_dir.join(shard).join(format!("{hash}.json"))
    }

    /// Spawns a one-shot background scan that mirrors every remote index
    /// file into `local_mirror_dir`, so a subsequent `lookup` can check
    /// "does this hash exist at all" against disk instead of the network.
    /// Best-effort: any failure here just means the mirror stays cold and
    /// `lookup` falls back to a direct network read, same as before this
    /// scan ever ran.
    pub fn spawn_startup_mirror_scan(&self) {
        if !self.reads_enabled() {
            return;
        }
        let bucket_name = self.bucket.bucket_name.clone();
        let region = self.bucket.region.clone();
        let profile = self.bucket.profile_name.clone();
        let local_mirror_dir = self.local_mirror_dir.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = mirror_index_scan(&bucket_name, &region, profile.as_deref(), &local_mirror_dir) {
                eprintln!("nozem: remote cache index mirror scan failed (non-fatal): {err:#}");
            }
        });
    }

    pub async fn lookup(&self, locator: &CacheLocator) -> Option<CachedArtifact> {
        if !self.reads_enabled() {
            return None;
        }
        let mirror_path = self.local_index_mirror_path(&locator.input_hash);
        let index_bytes = if let Ok(bytes) = std::fs::read(&mirror_path) {
            bytes
        } else {
            let index_key = self.index_key(&locator.input_hash);
            let bytes = match self.get_object(&index_key).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    eprintln!("nozem: remote cache read failed, disabling remote reads: {err:#}");
                    self.read_disabled.store(true, Ordering::SeqCst);
                    return None;
                }
            };
            if let Some(parent) = mirror_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(&mirror_path, &bytes).ok();
            bytes
        };
        let index: RemoteIndex = serde_json::from_slice(&index_bytes).ok()?;
        let data_key = self.data_key(&locator.input_hash);
        let artifact_hash = index.artifact_hash.clone();
        let artifacts = index.artifacts.clone();
        let bucket_name = self.bucket.bucket_name.clone();
        let region = self.bucket.region.clone();
        let profile = self.bucket.profile_name.clone();
        let local_mirror_dir = self.local_mirror_dir.clone();
        let input_hash = locator.input_hash.clone();
        Some(CachedArtifact {
            artifact_hash,
            source_tier: TierName::Remote,
            fetch: Box::new(move |target_dir| {
                fetch_and_mirror(
                    &bucket_name,
                    &region,
                    profile.as_deref(),
                    &data_key,
                    &local_mirror_dir,
                    &input_hash,
                    target_dir,
                    &artifacts,
                )
            }),
        })
    }

    /// Enqueues a background store; spawned rather than awaited, matching
    /// the "caller does not await the remote-store future" ordering
    /// guarantee. Failures here only trip the write circuit breaker, never
    /// fail the build.
    pub fn queue_store(&self, locator: CacheLocator, files: FileSet, artifact_hash: Hash) {
        if !self.writes_enabled() {
            return;
        }
        let bucket_name = self.bucket.bucket_name.clone();
        let region = self.bucket.region.clone();
        let profile = self.bucket.profile_name.clone();
        let write_disabled = self.write_disabled.clone();
        let index_key = self.index_key(&locator.input_hash);
        let data_key = self.data_key(&locator.input_hash);
        tokio::task::spawn_blocking(move || {
            let result = store_blocking(
                &bucket_name,
                &region,
                profile.as_deref(),
                &index_key,
                &data_key,
                &files,
                &artifact_hash,
            );
            if let Err(err) = result {
                eprintln!("nozem: remote cache write failed, disabling remote writes: {err:#}");
                write_disabled.store(true, Ordering::SeqCst);
            }
        });
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let bucket_name = self.bucket.bucket_name.clone();
        let region = self.bucket.region.clone();
        let profile = self.bucket.profile_name.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || get_object_blocking(&bucket_name, &region, profile.as_deref(), &key))
            .await
            .context("remote cache read task panicked")?
    }
}

/// Lists `nozem/index/` under the bucket and downloads any entry not
/// already present in `local_mirror_dir`.
fn mirror_index_scan(bucket_name: &str, region: &str, profile: Option<&str>, local_mirror_dir: &Path) -> Result<()> {
    let mut cmd = Command::new("aws");
    cmd.arg("s3")
        .arg("ls")
        .arg("--recursive")
        .arg(format!("s3://{bucket_name}/nozem/index/"));
    cmd.arg("--region").arg(region);
    if let Some(profile) = profile {
        cmd.arg("--profile").arg(profile);
    }
    let output = cmd.output().context("spawning aws s3 ls")?;
    if !output.status.success() {
        bail!("aws s3 ls failed for nozem/index/");
    }
    let listing = String::from_utf8_lossy(&output.stdout);
    for line in listing.lines() {
        // Standard `aws s3 ls` output: "<date> <time> <size> <key>".
        let Some(key) = line.split_whitespace().nth(3) else {
            continue;
        };
        let Some(hash_hex) = key
            .rsplit('/')
            .next()
            .and_then(|name| name.strip_suffix(".json"))
        else {
            continue;
        };
        let hash = Hash::from_hex(hash_hex.to_string());
        let mirror_path = local_mirror_dir
            .join(&hash_hex[..4.min(hash_hex.len())])
            .join(format!("{hash}.json"));
        if mirror_path.exists() {
            continue;
        }
        if let Ok(bytes) = get_object_blocking(bucket_name, region, profile, key) {
            if let Some(parent) = mirror_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(&mirror_path, bytes).ok();
        }
    }
    Ok(())
}

fn get_object_blocking(bucket_name: &str, region: &str, profile: Option<&str>, key: &str) -> Result<Vec<u8>> {
    let tmp = tempfile::NamedTempFile::new()?;
    let mut cmd = Command::new("aws");
    cmd.arg("s3").arg("cp").arg(format!("s3://{bucket_name}/{key}"));
    cmd.arg(tmp.path());
    cmd.arg("--region").arg(region);
    if let Some(profile) = profile {
        cmd.arg("--profile").arg(profile);
    }
    let status = cmd.status().context("spawning aws s3 cp")?;
    if !status.success() {
        bail!("aws s3 cp failed for {key}");
    }
    std::fs::read(tmp.path()).context("reading downloaded object")
}

#[allow(clippy::too_many_arguments)]
fn fetch_and_mirror(
    bucket_name: &str,
    region: &str,
    profile: Option<&str>,
    data_key: &str,
    local_mirror_dir: &Path,
    input_hash: &Hash,
    target_dir: &Path,
    artifacts: &[String],
) -> Result<FileSet> {
    let bytes = get_object_blocking(bucket_name, region, profile, data_key)?;

    let shard = local_mirror_dir.join(&input_hash.as_str()[..4.min(input_hash.as_str().len())]);
    std::fs::create_dir_all(&shard).ok();
    let mirrored_tarball = shard.join(format!("{input_hash}.tar.gz"));
    std::fs::write(&mirrored_tarball, &bytes).ok();

    std::fs::create_dir_all(target_dir)?;
    let decoder = flate2::read::GzDecoder::new(bytes.as_slice());
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(target_dir)?;

    let paths = artifacts.iter().map(PathBuf::from).collect();
    Ok(FileSet::new(target_dir, paths))
}

fn store_blocking(
    bucket_name: &str,
    region: &str,
    profile: Option<&str>,
    index_key: &str,
    data_key: &str,
    files: &FileSet,
    artifact_hash: &Hash,
) -> Result<()> {
    let mut tarball_buf = Vec::new();
    {
        let encoder = flate2::write::GzEncoder::new(&mut tarball_buf, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for rel in files.paths() {
            let abs = files.root().join(rel);
            builder.append_path_with_name(&abs, rel)?;
        }
        builder.into_inner()?.finish()?;
    }
    let index = RemoteIndex {
        artifact_hash: artifact_hash.clone(),
        artifacts: files
            .paths()
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect(),
    };
    let index_json = serde_json::to_vec_pretty(&index)?;

    put_object(bucket_name, region, profile, data_key, &tarball_buf)?;
    put_object(bucket_name, region, profile, index_key, &index_json)?;
    Ok(())
}

fn put_object(bucket_name: &str, region: &str, profile: Option<&str>, key: &str, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new()?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    let mut cmd = Command::new("aws");
    cmd.arg("s3")
        .arg("cp")
        .arg(tmp.path())
        .arg(format!("s3://{bucket_name}/{key}"));
    cmd.arg("--region").arg(region);
    if let Some(profile) = profile {
        cmd.arg("--profile").arg(profile);
    }
    let status = cmd.status().context("spawning aws s3 cp")?;
    if !status.success() {
        bail!("aws s3 cp failed for {key}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes_start_enabled() {
        let cache = RemoteCache::new(
            BucketConfig {
                bucket_name: "test-bucket".into(),
                region: "us-east-1".into(),
                profile_name: None,
            },
            PathBuf::from("/tmp/nozem-mirror"),
        );
        assert!(cache.reads_enabled());
        assert!(cache.writes_enabled());
    }

    #[test]
    fn tripping_read_breaker_disables_only_reads() {
        let cache = RemoteCache::new(
            BucketConfig {
                bucket_name: "test-bucket".into(),
                region: "us-east-1".into(),
                profile_name: None,
            },
            PathBuf::from("/tmp/nozem-mirror"),
        );
        cache.read_disabled.store(true, Ordering::SeqCst);
        assert!(!cache.reads_enabled());
        assert!(cache.writes_enabled());
    }

    #[test]
    fn local_index_mirror_path_shards_by_hash_prefix() {
        let cache = RemoteCache::new(
            BucketConfig {
                bucket_name: "test-bucket".into(),
                region: "us-east-1".into(),
                profile_name: None,
            },
            PathBuf::from("/tmp/nozem-mirror"),
        );
        let hash = Hash::from_bytes(b"some input");
        let path = cache.local_index_mirror_path(&hash);
        let expected = PathBuf::from("/tmp/nozem-mirror")
            .join(&hash.as_str()[..4])
            .join(format!("{hash}.json"));
        assert_eq!(path, expected);
    }
}
