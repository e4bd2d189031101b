//! Dependency graph over registered plugins
//!
//! Nodes are kept in id order so every traversal is deterministic: roots are
//! visited by id, and a node's dependencies in declaration order. Edges may
//! point at plugins that are not registered yet; those are reported when a
//! load order is requested, not when the node is inserted.

use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{PluginError, PluginResult};
use crate::types::{Dependency, PluginMetadata};

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub version: Version,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, GraphNode>,
    /// Plugins with a live instance
    active: BTreeSet<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a plugin. A duplicate id or a dependency cycle rejects the
    /// insert and leaves the graph untouched.
    pub fn add_plugin(&mut self, metadata: &PluginMetadata) -> PluginResult<()> {
        if self.nodes.contains_key(&metadata.id) {
            return Err(PluginError::AlreadyRegistered {
                plugin_id: metadata.id.clone(),
            });
        }

        self.check_acyclic(&metadata.id, &metadata.dependencies)?;

        self.nodes.insert(
            metadata.id.clone(),
            GraphNode {
                version: metadata.version.clone(),
                dependencies: metadata.dependencies.clone(),
            },
        );

        tracing::debug!(
            target: "dependency_graph",
            plugin_id = %metadata.id,
            dependencies = metadata.dependencies.len(),
            "Plugin added to dependency graph"
        );
        Ok(())
    }

    /// Swap a node's version and dependencies, with the same cycle check
    pub fn replace_plugin(&mut self, metadata: &PluginMetadata) -> PluginResult<()> {
        if !self.nodes.contains_key(&metadata.id) {
            return Err(PluginError::not_found(&metadata.id));
        }

        self.check_acyclic(&metadata.id, &metadata.dependencies)?;

        self.nodes.insert(
            metadata.id.clone(),
            GraphNode {
                version: metadata.version.clone(),
                dependencies: metadata.dependencies.clone(),
            },
        );
        Ok(())
    }

    /// Remove a plugin nobody requires
    pub fn remove_plugin(&mut self, plugin_id: &str) -> PluginResult<GraphNode> {
        if !self.nodes.contains_key(plugin_id) {
            return Err(PluginError::not_found(plugin_id));
        }

        let dependents = self.required_dependents_of(plugin_id);
        if !dependents.is_empty() {
            return Err(PluginError::DependentsActive {
                plugin_id: plugin_id.to_string(),
                dependents,
            });
        }

        self.active.remove(plugin_id);
        self.nodes
            .remove(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))
    }

    /// Fail if `plugin_id` with these dependencies would be part of a cycle.
    /// Edges of an existing node with the same id are ignored.
    pub fn check_acyclic(&self, plugin_id: &str, dependencies: &[Dependency]) -> PluginResult<()> {
        let mut visited = HashSet::new();
        let mut path = vec![plugin_id.to_string()];

        for dep in dependencies {
            if self.reaches(plugin_id, &dep.target_id, &mut visited, &mut path) {
                tracing::warn!(
                    target: "dependency_graph",
                    plugin_id = %plugin_id,
                    cycle = %path.join(" -> "),
                    "Rejected plugin that would introduce a cycle"
                );
                return Err(PluginError::CyclicDependency {
                    plugin_id: plugin_id.to_string(),
                    cycle: path,
                });
            }
        }
        Ok(())
    }

    /// DFS from `current` looking for `origin`; `path` holds the cycle on success
    fn reaches(
        &self,
        origin: &str,
        current: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(current.to_string());
        if current == origin {
            return true;
        }

        if visited.insert(current.to_string()) {
            if let Some(node) = self.nodes.get(current) {
                for dep in &node.dependencies {
                    if self.reaches(origin, &dep.target_id, visited, path) {
                        return true;
                    }
                }
            }
        }

        path.pop();
        false
    }

    /// Every registered plugin, dependencies before dependents
    pub fn compute_load_order(&self) -> PluginResult<Vec<String>> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visiting = Vec::new();
        let mut visited = HashSet::new();

        for id in self.nodes.keys() {
            self.visit(id, None, &mut order, &mut visiting, &mut visited)?;
        }
        Ok(order)
    }

    /// Every registered plugin, dependents before dependencies
    pub fn compute_unload_order(&self) -> PluginResult<Vec<String>> {
        let mut order = self.compute_load_order()?;
        order.reverse();
        Ok(order)
    }

    /// The requested plugins plus their non-optional dependency closure,
    /// dependencies first. Optional dependencies are only ordered, never
    /// pulled in.
    pub fn load_order_for(&self, ids: &[&str]) -> PluginResult<Vec<String>> {
        let mut closure = BTreeSet::new();
        let mut stack: Vec<String> = Vec::new();

        for id in ids {
            if !self.nodes.contains_key(*id) {
                return Err(PluginError::not_found(*id));
            }
            stack.push(id.to_string());
        }

        while let Some(id) = stack.pop() {
            if !closure.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for dep in node.dependencies.iter().filter(|d| !d.optional) {
                if !self.nodes.contains_key(&dep.target_id) {
                    return Err(PluginError::UnsatisfiedDependency {
                        plugin_id: id.clone(),
                        target_id: dep.target_id.clone(),
                        required: dep.constraint.to_string(),
                        actual: None,
                    });
                }
                stack.push(dep.target_id.clone());
            }
        }

        let mut order = Vec::with_capacity(closure.len());
        let mut visiting = Vec::new();
        let mut visited = HashSet::new();
        for id in ids {
            self.visit(id, Some(&closure), &mut order, &mut visiting, &mut visited)?;
        }

        tracing::debug!(
            target: "dependency_graph",
            requested = ?ids,
            order = ?order,
            "Computed load order"
        );
        Ok(order)
    }

    /// Post-order DFS, restricted to `within` when given
    fn visit(
        &self,
        id: &str,
        within: Option<&BTreeSet<String>>,
        order: &mut Vec<String>,
        visiting: &mut Vec<String>,
        visited: &mut HashSet<String>,
    ) -> PluginResult<()> {
        if visited.contains(id) {
            return Ok(());
        }
        if within.is_some_and(|set| !set.contains(id)) {
            return Ok(());
        }
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        if let Some(start) = visiting.iter().position(|v| v == id) {
            let mut cycle = visiting[start..].to_vec();
            cycle.push(id.to_string());
            return Err(PluginError::CyclicDependency {
                plugin_id: id.to_string(),
                cycle,
            });
        }
        visiting.push(id.to_string());

        for dep in &node.dependencies {
            self.visit(&dep.target_id, within, order, visiting, visited)?;
        }

        visiting.pop();
        visited.insert(id.to_string());
        order.push(id.to_string());
        Ok(())
    }

    /// Check every declared dependency of a registered plugin against the
    /// versions currently in the graph
    pub fn validate_constraints(&self, plugin_id: &str) -> PluginResult<()> {
        let node = self
            .nodes
            .get(plugin_id)
            .ok_or_else(|| PluginError::not_found(plugin_id))?;
        self.validate_dependencies(plugin_id, &node.dependencies)
    }

    /// Same as [`validate_constraints`](Self::validate_constraints) for
    /// dependencies that are not in the graph yet
    pub fn validate_dependencies(
        &self,
        plugin_id: &str,
        dependencies: &[Dependency],
    ) -> PluginResult<()> {
        for dep in dependencies {
            let actual = self.nodes.get(&dep.target_id).map(|n| &n.version);
            let satisfied = actual.is_some_and(|v| dep.constraint.matches(v));

            if satisfied {
                continue;
            }

            if dep.optional {
                tracing::debug!(
                    target: "dependency_graph",
                    plugin_id = %plugin_id,
                    target_id = %dep.target_id,
                    "Optional dependency not satisfied, ignoring"
                );
                continue;
            }

            return Err(PluginError::UnsatisfiedDependency {
                plugin_id: plugin_id.to_string(),
                target_id: dep.target_id.clone(),
                required: dep.constraint.to_string(),
                actual: actual.map(|v| v.to_string()),
            });
        }
        Ok(())
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.nodes.contains_key(plugin_id)
    }

    pub fn node(&self, plugin_id: &str) -> Option<&GraphNode> {
        self.nodes.get(plugin_id)
    }

    pub fn version_of(&self, plugin_id: &str) -> Option<&Version> {
        self.nodes.get(plugin_id).map(|n| &n.version)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies_of(&self, plugin_id: &str) -> Vec<String> {
        self.nodes
            .get(plugin_id)
            .map(|n| n.dependencies.iter().map(|d| d.target_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Direct dependents, optional or not, sorted by id
    pub fn dependents_of(&self, plugin_id: &str) -> Vec<String> {
        self.dependents_matching(plugin_id, |_| true)
    }

    /// Direct dependents holding a non-optional edge
    pub fn required_dependents_of(&self, plugin_id: &str) -> Vec<String> {
        self.dependents_matching(plugin_id, |d| !d.optional)
    }

    /// The edge a dependent declared towards `plugin_id`
    pub fn edge(&self, from: &str, to: &str) -> Option<&Dependency> {
        self.nodes
            .get(from)?
            .dependencies
            .iter()
            .find(|d| d.target_id == to)
    }

    fn dependents_matching(&self, plugin_id: &str, keep: impl Fn(&Dependency) -> bool) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| {
                node.dependencies
                    .iter()
                    .any(|d| d.target_id == plugin_id && keep(d))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Everything that transitively requires `plugin_id` through non-optional
    /// edges, most dependent first
    pub fn transitive_dependents(&self, plugin_id: &str) -> PluginResult<Vec<String>> {
        let mut reached = BTreeSet::new();
        let mut stack = vec![plugin_id.to_string()];

        while let Some(id) = stack.pop() {
            for dependent in self.required_dependents_of(&id) {
                if reached.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }

        let mut order: Vec<String> = self
            .compute_load_order()?
            .into_iter()
            .filter(|id| reached.contains(id))
            .collect();
        order.reverse();
        Ok(order)
    }

    pub fn mark_active(&mut self, plugin_id: &str) {
        if self.nodes.contains_key(plugin_id) {
            self.active.insert(plugin_id.to_string());
        }
    }

    pub fn mark_inactive(&mut self, plugin_id: &str) {
        self.active.remove(plugin_id);
    }

    pub fn is_active(&self, plugin_id: &str) -> bool {
        self.active.contains(plugin_id)
    }

    pub fn active(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }
}
