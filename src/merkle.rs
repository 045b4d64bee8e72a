//! Merkle-style content hashing.
//!
//! A `MerkleNode` is either a direct hash (raw bytes, already hashed upstream
//! — e.g. a file's content hash) or a composite of named children. The
//! composite hash is computed by sorting children by key, then hashing the
//! concatenation of `"${key}=${child_hash}\n"` for each one. Sorting makes
//! the result independent of insertion order, which is what lets two
//! differently-built `MerkleNode` trees for the same logical inputs compare
//! equal.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// A lowercase hex-encoded SHA-1 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(String);

impl Hash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Hash(hex_lower(&hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses a hash that is already known to be hex; used when reading
    /// cache index files back off disk.
    pub fn from_hex(s: impl Into<String>) -> Self {
        Hash(s.into())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// A node in the Merkle tree: either a pre-hashed leaf, or a composite of
/// named children whose hash is derived from theirs.
#[derive(Debug, Clone)]
pub enum MerkleNode {
    Direct(Hash),
    Composite(BTreeMap<String, MerkleNode>),
}

impl MerkleNode {
    pub fn direct(hash: Hash) -> Self {
        MerkleNode::Direct(hash)
    }

    pub fn composite(children: impl IntoIterator<Item = (String, MerkleNode)>) -> Self {
        MerkleNode::Composite(children.into_iter().collect())
    }

    /// Computes the hash of this node. For a `Direct` node this is just the
    /// stored hash; for a `Composite` node, children are visited in key
    /// order (guaranteed by `BTreeMap`) and their hashes concatenated as
    /// `"${key}=${child_hash}\n"` before hashing the whole buffer.
    pub fn hash(&self) -> Hash {
        match self {
            MerkleNode::Direct(h) => h.clone(),
            MerkleNode::Composite(children) => {
                let mut buf = String::new();
                for (key, child) in children {
                    buf.push_str(key);
                    buf.push('=');
                    buf.push_str(child.hash().as_str());
                    buf.push('\n');
                }
                Hash::from_bytes(buf.as_bytes())
            }
        }
    }

    /// Recursively collects `(path, hash)` pairs for every leaf, with path
    /// segments joined by `/`. Used to build the diff in `MerkleDifference`.
    fn leaves(&self, prefix: &str, out: &mut BTreeMap<String, Hash>) {
        match self {
            MerkleNode::Direct(h) => {
                out.insert(prefix.to_string(), h.clone());
            }
            MerkleNode::Composite(children) => {
                for (key, child) in children {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}/{key}")
                    };
                    child.leaves(&path, out);
                }
            }
        }
    }
}

/// A flattened, comparable serialization of a `MerkleNode` tree: every leaf
/// path mapped to its hash, plus the root hash. Used for persisting a
/// build's input hash to disk (`nozem-cache.json` style index entries) and
/// for diffing two trees against each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedMerkle {
    pub root: Hash,
    pub leaves: BTreeMap<String, Hash>,
}

impl From<&MerkleNode> for SerializedMerkle {
    fn from(node: &MerkleNode) -> Self {
        let mut leaves = BTreeMap::new();
        node.leaves("", &mut leaves);
        SerializedMerkle {
            root: node.hash(),
            leaves,
        }
    }
}

/// Intermediate form used while rebuilding a tree from flattened leaf
/// paths, before we know whether a given path segment is itself a leaf or
/// has further children.
enum Rebuilt {
    Leaf(Hash),
    Node(BTreeMap<String, Rebuilt>),
}

fn insert_leaf(map: &mut BTreeMap<String, Rebuilt>, parts: &[&str], hash: Hash) {
    if parts.len() == 1 {
        map.insert(parts[0].to_string(), Rebuilt::Leaf(hash));
        return;
    }
    let child = map
        .entry(parts[0].to_string())
        .or_insert_with(|| Rebuilt::Node(BTreeMap::new()));
    if let Rebuilt::Node(sub) = child {
        insert_leaf(sub, &parts[1..], hash);
    }
}

fn rebuilt_into_node(map: BTreeMap<String, Rebuilt>) -> MerkleNode {
    let children = map.into_iter().map(|(key, value)| {
        let node = match value {
            Rebuilt::Leaf(hash) => MerkleNode::Direct(hash),
            Rebuilt::Node(sub) => rebuilt_into_node(sub),
        };
        (key, node)
    });
    MerkleNode::Composite(children.collect())
}

impl SerializedMerkle {
    /// Reconstructs the `MerkleNode` tree implied by `leaves`, then
    /// validates that re-hashing it reproduces `root` — rejecting data that
    /// was corrupted or tampered with in transit rather than silently
    /// trusting the stored root. This is the other half of the round-trip
    /// contract `hash(deserialize(serialize(t))) == hash(t)`.
    pub fn deserialize(&self) -> Result<MerkleNode> {
        let node = if self.leaves.len() == 1 && self.leaves.contains_key("") {
            MerkleNode::Direct(self.leaves[""].clone())
        } else {
            let mut map = BTreeMap::new();
            for (path, hash) in &self.leaves {
                let parts: Vec<&str> = path.split('/').collect();
                insert_leaf(&mut map, &parts, hash.clone());
            }
            rebuilt_into_node(map)
        };
        let computed = node.hash();
        if computed != self.root {
            bail!(
                "merkle tree corrupted: stored root {} does not match {} recomputed from its leaves",
                self.root,
                computed
            );
        }
        Ok(node)
    }
}

/// The set of leaf paths whose hash differs between two trees (added,
/// removed, or changed), used to explain cache misses to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleDifference {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl MerkleDifference {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn between(before: &SerializedMerkle, after: &SerializedMerkle) -> Self {
        let mut diff = MerkleDifference::default();
        for (path, hash) in &after.leaves {
            match before.leaves.get(path) {
                None => diff.added.push(path.clone()),
                Some(prev) if prev != hash => diff.changed.push(path.clone()),
                _ => {}
            }
        }
        for path in before.leaves.keys() {
            if !after.leaves.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }
        diff.added.sort();
        diff.removed.sort();
        diff.changed.sort();
        diff
    }
}
