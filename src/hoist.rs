//! The dependency hoisting algorithm.
//!
//! Turns a (possibly deeply nested) `DependencyNode` tree into a flattened,
//! conflict-free tree resembling what a package manager's `node_modules`
//! layout would produce: shared dependencies are promoted towards the root
//! as far as they can go without shadowing a different version something
//! else actually needs.

use std::collections::{BTreeMap, HashSet};

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// A node in the NPM-style dependency tree. `version` plus `package` form
/// the node's identity; `dependencies` maps a dependency name to the child
/// node satisfying it at this position in the tree, in original
/// declaration order — `move_up_pass` must visit siblings in that order,
/// not alphabetically, since which sibling reaches a shared parent slot
/// first determines which version wins the hoist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub version: String,
    pub package: String,
    pub dependencies: IndexMap<String, DependencyNode>,
}

impl DependencyNode {
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        DependencyNode {
            version: version.into(),
            package: package.into(),
            dependencies: IndexMap::new(),
        }
    }

    pub fn with_dep(mut self, name: impl Into<String>, child: DependencyNode) -> Self {
        self.dependencies.insert(name.into(), child);
        self
    }

    fn name_at_version(&self) -> String {
        format!("{}@{}", self.package, self.version)
    }

    /// The canonical JSON form of this node: a leaf's (empty) `dependencies`
    /// map is omitted entirely rather than written out as `{}`, per the
    /// spec's "empty dependencies maps are deleted for canonical output"
    /// rule — this can't be done by deleting the entry from its parent
    /// (every leaf package, hoisted or not, still needs to appear there),
    /// only by leaving the key out of the serialized representation.
    pub fn to_canonical_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("package".to_string(), Value::String(self.package.clone()));
        obj.insert("version".to_string(), Value::String(self.version.clone()));
        if !self.dependencies.is_empty() {
            let mut deps = Map::new();
            for (name, child) in &self.dependencies {
                deps.insert(name.clone(), child.to_canonical_json());
            }
            obj.insert("dependencies".to_string(), Value::Object(deps));
        }
        Value::Object(obj)
    }
}

/// Runs the two-phase hoisting algorithm and returns the flattened tree.
/// `should_hoist_inside` constrains recursion: when it returns `false` for
/// a node, that node's own subtree is left untouched (used to skip
/// re-linking registry packages whose own `node_modules` is already
/// correct).
pub fn hoist(root: DependencyNode, should_hoist_inside: &dyn Fn(&DependencyNode) -> bool) -> DependencyNode {
    let original = snapshot_original_dependencies(&root);
    let mut tree = root;
    move_up(&mut tree, should_hoist_inside);
    remove_duplicates(&mut tree, &mut Vec::new());
    remove_useless(&mut tree, &original);
    tree
}

/// The `name@version` strings each node declared before any mutation,
/// recorded per node so later necessity checks can consult the original
/// requirement regardless of what hoisting has since moved around.
type Snapshot = BTreeMap<NodePath, HashSet<String>>;

/// Identifies a node by the sequence of dependency names followed from the
/// root to reach it. Stable across the mutations `hoist` performs, since
/// phase A only ever copies `(name, child)` pairs upward without altering
/// existing paths below the copy source.
type NodePath = Vec<String>;

fn snapshot_original_dependencies(root: &DependencyNode) -> Snapshot {
    let mut snapshot = Snapshot::new();
    fn visit(node: &DependencyNode, path: NodePath, out: &mut Snapshot) {
        let originals: HashSet<String> = node
            .dependencies
            .iter()
            .map(|(_, child)| child.name_at_version())
            .collect();
        out.insert(path.clone(), originals);
        for (name, child) in &node.dependencies {
            let mut child_path = path.clone();
            child_path.push(name.clone());
            visit(child, child_path, out);
        }
    }
    visit(root, Vec::new(), &mut snapshot);
    snapshot
}

/// Phase A. Repeats passes until a pass makes no change: for every node
/// with a parent, any dependency the parent does not already declare is
/// copied up into the parent (the child keeps its own copy too, for now;
/// phase B removes what turns out to be redundant or useless).
fn move_up(root: &mut DependencyNode, should_hoist_inside: &dyn Fn(&DependencyNode) -> bool) -> bool {
    loop_move_up(root, should_hoist_inside)
}

fn loop_move_up(root: &mut DependencyNode, should_hoist_inside: &dyn Fn(&DependencyNode) -> bool) -> bool {
    let mut changed_any = false;
    loop {
        let changed = move_up_pass(root, should_hoist_inside);
        if !changed {
            break;
        }
        changed_any = true;
    }
    changed_any
}

/// One pass copies every grandchild-level dependency up into its
/// grandparent when the grandparent doesn't already have that name, then
/// recurses into children. Returns whether anything changed in this pass.
fn move_up_pass(node: &mut DependencyNode, should_hoist_inside: &dyn Fn(&DependencyNode) -> bool) -> bool {
    if !should_hoist_inside(node) {
        return false;
    }
    let mut changed = false;
    let to_adopt: Vec<(String, DependencyNode)> = node
        .dependencies
        .values()
        .flat_map(|child| child.dependencies.iter())
        .filter(|(name, _)| !node.dependencies.contains_key(name.as_str()))
        .map(|(name, child)| (name.clone(), child.clone()))
        .collect();
    let mut seen = HashSet::new();
    for (name, child) in to_adopt {
        if seen.contains(&name) || node.dependencies.contains_key(&name) {
            continue;
        }
        seen.insert(name.clone());
        node.dependencies.insert(name, child);
        changed = true;
    }
    for child in node.dependencies.values_mut() {
        if move_up_pass(child, should_hoist_inside) {
            changed = true;
        }
    }
    changed
}

/// Phase B step 1: for each node, delete `(name, child)` if some strict
/// ancestor already provides that exact `name@version` — not merely the
/// same name at a different version, since removing a node's own copy of
/// a conflicting version would leave resolution falling through to the
/// ancestor's differently-versioned copy instead (spec.md's rationale for
/// why hoisting must never shadow a conflicting version).
fn remove_duplicates(node: &mut DependencyNode, ancestors: &mut Vec<BTreeMap<String, String>>) {
    let provided: BTreeMap<String, String> = node
        .dependencies
        .iter()
        .map(|(name, child)| (name.clone(), child.version.clone()))
        .collect();

    let mut to_remove = Vec::new();
    for (name, child) in &node.dependencies {
        if ancestors.iter().any(|a| a.get(name) == Some(&child.version)) {
            to_remove.push(name.clone());
        }
    }
    for name in to_remove {
        node.dependencies.shift_remove(&name);
    }

    ancestors.push(provided);
    for child in node.dependencies.values_mut() {
        remove_duplicates(child, ancestors);
    }
    ancestors.pop();
}

/// Phase B step 2: for each node `n`, remove `(name, child)` unless some
/// node in `n`'s own subtree (including `n`) originally declared
/// `name@child.version` — i.e. unless this exact dependency is still
/// needed somewhere below this point in the tree.
fn remove_useless(node: &mut DependencyNode, original: &Snapshot) {
    remove_useless_at(node, &mut Vec::new(), original);
}

fn remove_useless_at(node: &mut DependencyNode, path: &mut NodePath, original: &Snapshot) {
    let mut to_remove = Vec::new();
    for (name, child) in &node.dependencies {
        let needed = subtree_originally_needs(node, path, &child.name_at_version(), original);
        if !needed {
            to_remove.push(name.clone());
        }
    }
    for name in to_remove {
        node.dependencies.shift_remove(&name);
    }
    for (name, child) in node.dependencies.iter_mut() {
        path.push(name.clone());
        remove_useless_at(child, path, original);
        path.pop();
    }
}

/// Checks whether `target` (a `name@version` string) was originally
/// required anywhere in the subtree rooted at `node` (whose path is
/// `path`), consulting the pre-mutation snapshot rather than the node's
/// current (possibly already-hoisted) dependency map.
fn subtree_originally_needs(
    node: &DependencyNode,
    path: &NodePath,
    target: &str,
    original: &Snapshot,
) -> bool {
    if let Some(set) = original.get(path) {
        if set.contains(target) {
            return true;
        }
    }
    for (name, child) in &node.dependencies {
        let mut child_path = path.clone();
        child_path.push(name.clone());
        if subtree_originally_needs(child, &child_path, target, original) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_true(_: &DependencyNode) -> bool {
        true
    }

    fn flat(node: &DependencyNode, prefix: &str, out: &mut Vec<String>) {
        for (name, child) in &node.dependencies {
            let label = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            out.push(format!("{label}={}", child.version));
            flat(child, &label, out);
        }
        out.sort();
    }

    fn render(node: &DependencyNode) -> Vec<String> {
        let mut out = Vec::new();
        flat(node, "", &mut out);
        out
    }

    #[test]
    fn case_1_non_conflicting_tree_flattens() {
        let root = DependencyNode::new("root", "0.0.0")
            .with_dep(
                "stringutil",
                DependencyNode::new("stringutil", "1.0.0")
                    .with_dep("leftpad", DependencyNode::new("leftpad", "2.0.0")),
            )
            .with_dep(
                "numutil",
                DependencyNode::new("numutil", "3.0.0")
                    .with_dep("isodd", DependencyNode::new("isodd", "4.0.0")),
            );
        let hoisted = hoist(root, &always_true);
        let mut expected = vec![
            "stringutil=1.0.0".to_string(),
            "leftpad=2.0.0".to_string(),
            "numutil=3.0.0".to_string(),
            "isodd=4.0.0".to_string(),
        ];
        expected.sort();
        assert_eq!(render(&hoisted), expected);
    }

    #[test]
    fn case_2_duplicates_deduped() {
        let root = DependencyNode::new("root", "0.0.0")
            .with_dep(
                "a",
                DependencyNode::new("a", "1.0.0")
                    .with_dep("leftpad", DependencyNode::new("leftpad", "2.0.0")),
            )
            .with_dep(
                "b",
                DependencyNode::new("b", "1.0.0")
                    .with_dep("leftpad", DependencyNode::new("leftpad", "2.0.0")),
            );
        let hoisted = hoist(root, &always_true);
        assert!(hoisted.dependencies.contains_key("leftpad"));
        assert!(!hoisted.dependencies["a"].dependencies.contains_key("leftpad"));
        assert!(!hoisted.dependencies["b"].dependencies.contains_key("leftpad"));
    }

    #[test]
    fn case_3_conflicting_versions_stay_in_place() {
        let root = DependencyNode::new("root", "0.0.0")
            .with_dep(
                "stringutil",
                DependencyNode::new("stringutil", "1.0.0")
                    .with_dep("leftpad", DependencyNode::new("leftpad", "2.0.0")),
            )
            .with_dep(
                "numutil",
                DependencyNode::new("numutil", "3.0.0")
                    .with_dep("leftpad", DependencyNode::new("leftpad", "5.0.0"))
                    .with_dep("isodd", DependencyNode::new("isodd", "4.0.0")),
            );
        let hoisted = hoist(root, &always_true);
        assert_eq!(hoisted.dependencies["leftpad"].version, "2.0.0");
        assert_eq!(
            hoisted.dependencies["numutil"].dependencies["leftpad"].version,
            "5.0.0"
        );
        assert_eq!(hoisted.dependencies["isodd"].version, "4.0.0");
    }

    #[test]
    fn case_4_deduped_package_deps_not_hoisted_uselessly() {
        let root = DependencyNode::new("root", "0.0.0")
            .with_dep(
                "stringutil",
                DependencyNode::new("stringutil", "1.0.0").with_dep(
                    "leftpad",
                    DependencyNode::new("leftpad", "2.0.0")
                        .with_dep("spacemaker", DependencyNode::new("spacemaker", "3.0.0")),
                ),
            )
            .with_dep(
                "leftpad",
                DependencyNode::new("leftpad", "2.0.0")
                    .with_dep("spacemaker", DependencyNode::new("spacemaker", "3.0.0")),
            )
            .with_dep("spacemaker", DependencyNode::new("spacemaker", "4.0.0"));
        let hoisted = hoist(root, &always_true);
        assert_eq!(hoisted.dependencies["leftpad"].version, "2.0.0");
        assert_eq!(hoisted.dependencies["spacemaker"].version, "4.0.0");
        assert_eq!(
            hoisted.dependencies["leftpad"].dependencies["spacemaker"].version,
            "3.0.0"
        );
        assert!(!hoisted.dependencies["stringutil"]
            .dependencies
            .contains_key("leftpad"));
    }

    #[test]
    fn case_5_hoisting_order_does_not_produce_wrong_versions() {
        let root = DependencyNode::new("root", "0.0.0").with_dep(
            "stringutil",
            DependencyNode::new("stringutil", "1.0.0")
                .with_dep(
                    "wrapper",
                    DependencyNode::new("wrapper", "100.0.0").with_dep(
                        "leftPad",
                        DependencyNode::new("leftPad", "2.0.0")
                            .with_dep("spacemaker", DependencyNode::new("spacemaker", "3.0.0")),
                    ),
                )
                .with_dep("spacemaker", DependencyNode::new("spacemaker", "4.0.0")),
        );
        let hoisted = hoist(root, &always_true);
        assert_eq!(
            hoisted.dependencies["stringutil"].version,
            "1.0.0"
        );
        assert_eq!(
            hoisted.dependencies["stringutil"].dependencies["spacemaker"].version,
            "4.0.0"
        );
        assert_eq!(hoisted.dependencies["wrapper"].version, "100.0.0");
        assert_eq!(hoisted.dependencies["leftPad"].version, "2.0.0");
        assert_eq!(hoisted.dependencies["spacemaker"].version, "3.0.0");
    }

    #[test]
    fn canonical_json_omits_empty_dependencies_key() {
        let leaf = DependencyNode::new("isodd", "4.0.0");
        let json = leaf.to_canonical_json();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("dependencies"));
        assert_eq!(obj["package"], "isodd");
        assert_eq!(obj["version"], "4.0.0");
    }

    #[test]
    fn canonical_json_keeps_non_empty_dependencies_key() {
        let parent = DependencyNode::new("numutil", "3.0.0")
            .with_dep("isodd", DependencyNode::new("isodd", "4.0.0"));
        let json = parent.to_canonical_json();
        let obj = json.as_object().unwrap();
        let deps = obj["dependencies"].as_object().unwrap();
        assert!(!deps["isodd"].as_object().unwrap().contains_key("dependencies"));
    }
}
