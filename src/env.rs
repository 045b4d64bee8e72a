//! Environment-variable handling for a unit's declared `env` map.
//!
//! Two prefix conventions apply to values/keys declared in `nozem.json`:
//! - A value beginning with `|` means "inherit this variable from the
//!   parent process if set, otherwise use the remainder of the string as
//!   the default".
//! - A key beginning with `&` is passed to the child process but excluded
//!   from the input hash (for values known to vary between otherwise
//!   identical runs without affecting the build's output).

use std::collections::BTreeMap;

/// One resolved environment entry: its name as it will appear in the child
/// process, its value, and whether it should be excluded from hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEnvVar {
    pub key: String,
    pub value: String,
    pub hash_excluded: bool,
}

/// Resolves a unit's declared env map against the current process
/// environment, returning the entries sorted by key.
pub fn resolve(declared: &BTreeMap<String, String>, process_env: &dyn Fn(&str) -> Option<String>) -> Vec<ResolvedEnvVar> {
    let mut resolved = Vec::with_capacity(declared.len());
    for (raw_key, raw_value) in declared {
        let hash_excluded = raw_key.starts_with('&');
        let key = if hash_excluded {
            raw_key[1..].to_string()
        } else {
            raw_key.clone()
        };
        let value = if let Some(default) = raw_value.strip_prefix('|') {
            process_env(&key).unwrap_or_else(|| default.to_string())
        } else {
            raw_value.clone()
        };
        resolved.push(ResolvedEnvVar {
            key,
            value,
            hash_excluded,
        });
    }
    resolved.sort_by(|a, b| a.key.cmp(&b.key));
    resolved
}

/// The subset of resolved variables that feed the input Merkle: those not
/// marked hash-excluded.
pub fn hashable(resolved: &[ResolvedEnvVar]) -> Vec<(&str, &str)> {
    resolved
        .iter()
        .filter(|v| !v.hash_excluded)
        .map(|v| (v.key.as_str(), v.value.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherit_prefix_falls_back_to_default() {
        let mut declared = BTreeMap::new();
        declared.insert("NODE_ENV".to_string(), "|production".to_string());
        let resolved = resolve(&declared, &|_| None);
        assert_eq!(resolved[0].key, "NODE_ENV");
        assert_eq!(resolved[0].value, "production");
    }

    #[test]
    fn inherit_prefix_prefers_process_value() {
        let mut declared = BTreeMap::new();
        declared.insert("NODE_ENV".to_string(), "|production".to_string());
        let resolved = resolve(&declared, &|k| {
            if k == "NODE_ENV" {
                Some("test".to_string())
            } else {
                None
            }
        });
        assert_eq!(resolved[0].value, "test");
    }

    #[test]
    fn ampersand_prefix_is_excluded_from_hash_but_kept_for_execution() {
        let mut declared = BTreeMap::new();
        declared.insert("&BUILD_TIMESTAMP".to_string(), "now".to_string());
        declared.insert("API_URL".to_string(), "https://example.test".to_string());
        let resolved = resolve(&declared, &|_| None);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().any(|v| v.key == "BUILD_TIMESTAMP" && v.hash_excluded));
        let hashed = hashable(&resolved);
        assert!(hashed.iter().all(|(k, _)| *k != "BUILD_TIMESTAMP"));
        assert!(hashed.iter().any(|(k, _)| *k == "API_URL"));
    }
}
