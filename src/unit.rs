//! Static schema read from `nozem.json`: units and the dependency edges
//! between them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The top-level contents of `nozem.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFile {
    pub units: Vec<Unit>,
}

/// One buildable entity. Tagged by `kind` in JSON (internally tagged,
/// following the declared-on-disk schema in §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Unit {
    #[serde(rename = "command")]
    Command(CommandUnit),
    #[serde(rename = "typescript-build")]
    TypeScriptBuild(TypeScriptBuildUnit),
    #[serde(rename = "extract")]
    Extract(ExtractUnit),
}

impl Unit {
    pub fn identifier(&self) -> &str {
        match self {
            Unit::Command(u) => &u.identifier,
            Unit::TypeScriptBuild(u) => &u.command.identifier,
            Unit::Extract(u) => &u.identifier,
        }
    }

    pub fn dependencies(&self) -> &[Dependency] {
        match self {
            Unit::Command(u) => &u.dependencies,
            Unit::TypeScriptBuild(u) => &u.command.dependencies,
            Unit::Extract(u) => &u.dependencies,
        }
    }

    pub fn root(&self) -> Option<&str> {
        match self {
            Unit::Command(u) => Some(&u.root),
            Unit::TypeScriptBuild(u) => Some(&u.command.root),
            Unit::Extract(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandUnit {
    pub identifier: String,
    pub root: String,
    #[serde(default)]
    pub non_sources: Vec<String>,
    #[serde(default)]
    pub non_artifacts: Vec<String>,
    pub build_command: Option<String>,
    pub test_command: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Paths (relative to the monorepo root) of non-package files this
    /// unit's build depends on but that don't belong to any unit's own
    /// source tree (e.g. a shared root-level config file).
    #[serde(default)]
    pub external_files: Vec<String>,
    /// Marks a unit uncacheable (`MonoRepoInPlace`); it produces no
    /// hashable identity and is always built in place.
    #[serde(default)]
    pub in_place: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeScriptBuildUnit {
    #[serde(flatten)]
    pub command: CommandUnit,
    #[serde(default)]
    pub patch_tsconfig: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractUnit {
    pub identifier: String,
    pub extract_patterns: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// A dependency edge, tagged by `type` per the on-disk schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Dependency {
    #[serde(rename = "npm")]
    Npm {
        name: String,
        #[serde(rename = "versionRange")]
        version_range: String,
        version: String,
        #[serde(rename = "resolvedLocation")]
        resolved_location: PathBuf,
    },
    #[serde(rename = "link-npm")]
    LinkNpm {
        node: String,
        #[serde(default)]
        executables: bool,
    },
    #[serde(rename = "os")]
    Os {
        executable: String,
        rename: Option<String>,
    },
    #[serde(rename = "copy")]
    Copy {
        node: String,
        subdir: Option<String>,
    },
}

impl Dependency {
    /// The unit identifier this edge points at, if it targets another unit
    /// in the graph (as opposed to an external registry package or OS
    /// tool).
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Dependency::LinkNpm { node, .. } | Dependency::Copy { node, .. } => Some(node),
            Dependency::Npm { .. } | Dependency::Os { .. } => None,
        }
    }
}

/// One resolved NPM-style dependency input, classified by how it
/// contributes to the input Merkle and how hashable (cacheable) it is.
#[derive(Debug, Clone)]
pub enum NpmDependencyInput {
    /// Lives under some ancestor `node_modules/`. `files_identifier` is its
    /// declared version (unique by registry convention).
    NpmRegistryDependency {
        name: String,
        files_identifier: String,
        directory: PathBuf,
    },
    /// Another monorepo package, built by nozem itself. `files_identifier`
    /// is the downstream artifact hash.
    MonoRepoBuild {
        unit_identifier: String,
        files_identifier: String,
    },
    /// A monorepo package marked uncacheable. Produces no hashable
    /// identity; any dependent becomes uncacheable transitively.
    MonoRepoInPlace { unit_identifier: String },
}

impl NpmDependencyInput {
    pub fn is_hashable(&self) -> bool {
        !matches!(self, NpmDependencyInput::MonoRepoInPlace { .. })
    }

    pub fn files_identifier(&self) -> Option<&str> {
        match self {
            NpmDependencyInput::NpmRegistryDependency {
                files_identifier, ..
            }
            | NpmDependencyInput::MonoRepoBuild {
                files_identifier, ..
            } => Some(files_identifier),
            NpmDependencyInput::MonoRepoInPlace { .. } => None,
        }
    }
}
