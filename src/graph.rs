//! The build graph: one node per unit, with incoming edges from each
//! declared dependency, plus target selection (incoming/outgoing closure,
//! directory-based selection).

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};

use crate::unit::{Unit, UnitFile};

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub root: Option<String>,
    pub deps: Vec<String>,
}

/// The loaded, validated build graph: one node per unit, keyed by
/// identifier, with `deps` holding only edges that target another unit in
/// the graph (external-npm and os-tool edges aren't graph edges).
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: HashMap<String, GraphNode>,
    dependents: HashMap<String, Vec<String>>,
}

impl Graph {
    /// Builds the graph from a parsed `nozem.json`, validating that every
    /// unit identifier is unique and every dependency edge resolves to a
    /// known unit.
    pub fn load(unit_file: &UnitFile) -> Result<Graph> {
        let mut nodes = HashMap::new();
        for unit in &unit_file.units {
            let id = unit.identifier().to_string();
            if nodes.contains_key(&id) {
                bail!("duplicate unit identifier: {id}");
            }
            let deps = unit
                .dependencies()
                .iter()
                .filter_map(|d| d.node_id().map(str::to_string))
                .collect();
            nodes.insert(
                id.clone(),
                GraphNode {
                    id,
                    root: unit.root().map(str::to_string),
                    deps,
                },
            );
        }

        for node in nodes.values() {
            for dep in &node.deps {
                if !nodes.contains_key(dep) {
                    bail!("unit `{}` depends on unknown unit `{}`", node.id, dep);
                }
            }
        }

        if nodes.is_empty() {
            bail!("no units declared in nozem.json");
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in nodes.values() {
            for dep in &node.deps {
                dependents.entry(dep.clone()).or_default().push(node.id.clone());
            }
        }

        let graph = Graph { nodes, dependents };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        for id in self.nodes.keys() {
            self.visit_acyclic(id, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    fn visit_acyclic(&self, id: &str, visited: &mut HashSet<String>, stack: &mut HashSet<String>) -> Result<()> {
        if stack.contains(id) {
            bail!("circular dependency detected at `{id}`");
        }
        if visited.contains(id) {
            return Ok(());
        }
        stack.insert(id.to_string());
        if let Some(node) = self.nodes.get(id) {
            for dep in &node.deps {
                self.visit_acyclic(dep, visited, stack)?;
            }
        }
        stack.remove(id);
        visited.insert(id.to_string());
        Ok(())
    }

    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Everything `ids` transitively depend upon, including `ids`
    /// themselves.
    pub fn incoming_closure(&self, ids: &[String]) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = ids.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.deps.iter().cloned());
            }
        }
        seen
    }

    /// Everything reachable by following dependents of `ids` (reverse
    /// reachability), including `ids` themselves.
    pub fn outgoing_closure(&self, ids: &[String]) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = ids.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            stack.extend(self.dependents_of(&id).iter().cloned());
        }
        seen
    }

    /// All unit identifiers whose declared `root` lies within `dir`
    /// (a path relative to the monorepo root, as declared in the unit).
    pub fn select_by_directory(&self, dir: &str) -> Vec<String> {
        let dir = dir.trim_end_matches('/');
        self.nodes
            .values()
            .filter(|n| match &n.root {
                Some(root) => root == dir || root.starts_with(&format!("{dir}/")),
                None => false,
            })
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Resolves a raw `TARGET` list from the CLI into a concrete set of
    /// unit identifiers to build, per §4.7's target-selection rules:
    /// explicit identifiers/directories plus their incoming closure,
    /// optionally extended with the outgoing closure when `downstream` is
    /// set. An empty `targets` list selects the whole graph.
    pub fn resolve_targets(&self, targets: &[String], downstream: bool) -> Result<HashSet<String>> {
        if targets.is_empty() {
            return Ok(self.all_ids().into_iter().collect());
        }
        let mut explicit = Vec::new();
        for target in targets {
            if self.nodes.contains_key(target) {
                explicit.push(target.clone());
                continue;
            }
            let by_dir = self.select_by_directory(target);
            if by_dir.is_empty() {
                bail!("unknown build target: `{target}` is neither a unit identifier nor a directory containing one");
            }
            explicit.extend(by_dir);
        }
        let mut selected = self.incoming_closure(&explicit);
        if downstream {
            let explicit_vec: Vec<String> = explicit.clone();
            selected.extend(self.outgoing_closure(&explicit_vec));
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{CommandUnit, Dependency, Unit};
    use std::collections::BTreeMap;

    fn command(id: &str, root: &str, deps: Vec<&str>) -> Unit {
        Unit::Command(CommandUnit {
            identifier: id.into(),
            root: root.into(),
            non_sources: vec![],
            non_artifacts: vec![],
            build_command: None,
            test_command: None,
            dependencies: deps
                .into_iter()
                .map(|d| Dependency::LinkNpm {
                    node: d.into(),
                    executables: false,
                })
                .collect(),
            env: BTreeMap::new(),
            in_place: false,
            external_files: vec![],
        })
    }

    #[test]
    fn loads_and_validates_edges() {
        let unit_file = UnitFile {
            units: vec![command("a", "packages/a", vec!["b"]), command("b", "packages/b", vec![])],
        };
        let graph = Graph::load(&unit_file).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.dependents_of("b"), &["a".to_string()]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let unit_file = UnitFile {
            units: vec![command("a", "packages/a", vec!["missing"])],
        };
        assert!(Graph::load(&unit_file).is_err());
    }

    #[test]
    fn rejects_cycles() {
        let unit_file = UnitFile {
            units: vec![command("a", "packages/a", vec!["b"]), command("b", "packages/b", vec!["a"])],
        };
        assert!(Graph::load(&unit_file).is_err());
    }

    #[test]
    fn incoming_closure_includes_transitive_deps() {
        let unit_file = UnitFile {
            units: vec![
                command("a", "packages/a", vec!["b"]),
                command("b", "packages/b", vec!["c"]),
                command("c", "packages/c", vec![]),
            ],
        };
        let graph = Graph::load(&unit_file).unwrap();
        let closure = graph.incoming_closure(&["a".to_string()]);
        assert_eq!(closure.len(), 3);
    }

    #[test]
    fn resolve_targets_with_downstream_includes_outgoing_closure() {
        let unit_file = UnitFile {
            units: vec![
                command("a", "packages/a", vec!["b"]),
                command("b", "packages/b", vec![]),
                command("c", "packages/c", vec!["b"]),
            ],
        };
        let graph = Graph::load(&unit_file).unwrap();
        let selected = graph.resolve_targets(&["b".to_string()], true).unwrap();
        assert!(selected.contains("a"));
        assert!(selected.contains("c"));
    }
}
