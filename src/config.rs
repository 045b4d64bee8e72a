//! Loading `nozem.json` and `nozem-cache.json`, searched upward from the
//! current directory, and the cache-directory override chain.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::local::LocalCache;
use crate::cache::remote::BucketConfig;
use crate::error::NozemError;
use crate::unit::UnitFile;

pub const UNIT_FILE_NAME: &str = "nozem.json";
pub const CACHE_CONFIG_FILE_NAME: &str = "nozem-cache.json";
pub const CACHE_DIR_ENV_VAR: &str = "NOZEM_CACHE_DIR";

/// The parsed contents of `nozem-cache.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    pub cache_dir: Option<String>,
    pub cache_bucket: Option<BucketConfigJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfigJson {
    pub bucket_name: String,
    pub region: String,
    pub profile_name: Option<String>,
}

impl From<BucketConfigJson> for BucketConfig {
    fn from(json: BucketConfigJson) -> Self {
        BucketConfig {
            bucket_name: json.bucket_name,
            region: json.region,
            profile_name: json.profile_name,
        }
    }
}

/// Walks upward from `start_dir` (inclusive) looking for `file_name`,
/// stopping at the filesystem root.
fn find_upward(start_dir: &Path, file_name: &str) -> Option<PathBuf> {
    let mut dir = Some(start_dir.to_path_buf());
    while let Some(current) = dir {
        let candidate = current.join(file_name);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent().map(Path::to_path_buf);
    }
    None
}

/// Loads `nozem.json`, searched upward from `start_dir`. Returns the parsed
/// unit file plus the directory it was found in (the monorepo root).
pub fn load_unit_file(start_dir: &Path) -> Result<(UnitFile, PathBuf)> {
    let path = find_upward(start_dir, UNIT_FILE_NAME).ok_or_else(|| {
        NozemError::Configuration(format!(
            "no {UNIT_FILE_NAME} found in {} or any parent directory",
            start_dir.display()
        ))
    })?;
    let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let unit_file: UnitFile = serde_json::from_str(&contents)
        .map_err(|err| NozemError::Configuration(format!("invalid {}: {err}", path.display())))?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| start_dir.to_path_buf());
    Ok((unit_file, root))
}

/// Loads `nozem-cache.json`, searched upward from `start_dir`. Absent is
/// not an error; the defaults apply.
pub fn load_cache_config(start_dir: &Path) -> Result<CacheConfig> {
    match find_upward(start_dir, CACHE_CONFIG_FILE_NAME) {
        None => Ok(CacheConfig::default()),
        Some(path) => {
            let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&contents)
                .map_err(|err| NozemError::Configuration(format!("invalid {}: {err}", path.display())).into())
        }
    }
}

/// Resolves the local cache directory, in priority order: an explicit CLI
/// flag, then `NOZEM_CACHE_DIR`, then `nozem-cache.json`'s `cacheDir`, then
/// the default `$HOME/.cache/nozem/local`.
pub fn resolve_cache_dir(config: &CacheConfig, cli_override: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = cli_override {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(dir) = std::env::var(CACHE_DIR_ENV_VAR) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = &config.cache_dir {
        return Ok(PathBuf::from(dir));
    }
    LocalCache::default_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_unit_file_searches_upward_from_a_nested_directory() {
        let root = tempdir().unwrap();
        std::fs::write(
            root.path().join(UNIT_FILE_NAME),
            r#"{"units":[{"kind":"command","identifier":"a","root":"packages/a","dependencies":[]}]}"#,
        )
        .unwrap();
        let nested = root.path().join("packages/a");
        std::fs::create_dir_all(&nested).unwrap();

        let (unit_file, found_root) = load_unit_file(&nested).unwrap();
        assert_eq!(unit_file.units.len(), 1);
        assert_eq!(found_root, root.path());
    }

    #[test]
    fn missing_unit_file_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let err = load_unit_file(dir.path()).unwrap_err();
        assert!(err.to_string().contains("nozem.json"));
    }

    #[test]
    fn cache_dir_override_priority_prefers_cli_flag() {
        let config = CacheConfig {
            cache_dir: Some("/from/config".into()),
            cache_bucket: None,
        };
        let resolved = resolve_cache_dir(&config, Some("/from/cli")).unwrap();
        assert_eq!(resolved, PathBuf::from("/from/cli"));
    }

    #[test]
    fn cache_dir_falls_back_to_config_when_no_override_given() {
        let config = CacheConfig {
            cache_dir: Some("/from/config".into()),
            cache_bucket: None,
        };
        std::env::remove_var(CACHE_DIR_ENV_VAR);
        let resolved = resolve_cache_dir(&config, None).unwrap();
        assert_eq!(resolved, PathBuf::from("/from/config"));
    }
}
