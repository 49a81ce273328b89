//!
//! Deploy-time checks for sets of variable templates.
//!
//! Run before a configuration is saved, without any resolved values:
//! - `detect_circular_references`: named templates that reference each other in a loop.
//! - `validate_references`: references to services, projects or env vars a `Catalog` does not know.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vartpl_ast::{ParseError, RefKind};
use vartpl_parser::parse_parts;

pub trait Catalog {
    fn contains(&self, kind: RefKind, name: &str) -> bool;
}

/// In-memory set of known entity names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntityCatalog {
    pub services: BTreeSet<String>,
    pub projects: BTreeSet<String>,
    pub env: BTreeSet<String>,
}

impl EntityCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.services.insert(name.into());
        self
    }

    pub fn with_project(mut self, name: impl Into<String>) -> Self {
        self.projects.insert(name.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>) -> Self {
        self.env.insert(name.into());
        self
    }
}

impl Catalog for EntityCatalog {
    fn contains(&self, kind: RefKind, name: &str) -> bool {
        match kind {
            RefKind::Service => self.services.contains(name),
            RefKind::Project => self.projects.contains(name),
            RefKind::Env => self.env.contains(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("unknown {kind} '{name}' in {raw}")]
    UnknownEntity { kind: RefKind, name: String, raw: String },
}

/// Reports every reference whose entity is missing from the catalog.
pub fn validate_references(template: &str, catalog: &dyn Catalog) -> Vec<CheckError> {
    match parse_parts(template) {
        Err(e) => vec![CheckError::Parse(e)],
        Ok(parsed) => parsed
            .references()
            .filter(|r| !catalog.contains(r.kind, &r.name))
            .map(|r| CheckError::UnknownEntity { kind: r.kind, name: r.name.clone(), raw: r.raw.clone() })
            .collect(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub has_circular_references: bool,
    /// One ordered walk per DFS root that reached a cycle.
    pub cycles: Vec<Vec<String>>,
}

/// Color states for cycle detection using DFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited.
    White,
    /// On the current DFS stack.
    Gray,
    /// Finished.
    Black,
}

/// Directed graph between named templates.
///
/// `a -> b` when a reference in `a` has a full path equal to `b`, or otherwise an entity name
/// equal to `b`. References to anything that is not a named template add no edge.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Nodes follow `names`, then any remaining template keys in sorted order.
    /// Edges follow the order references appear in each template.
    pub fn build<S: AsRef<str>>(names: &[S], templates: &HashMap<String, String>) -> Self {
        let mut graph = DependencyGraph::default();
        for name in names {
            graph.ensure_node(name.as_ref());
        }
        let mut extra: Vec<_> = templates.keys().filter(|k| !graph.index.contains_key(k.as_str())).collect();
        extra.sort();
        for name in extra {
            graph.ensure_node(name);
        }

        for from in 0..graph.nodes.len() {
            let Some(template) = templates.get(&graph.nodes[from]) else { continue };
            let parsed = match parse_parts(template) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!(node = %graph.nodes[from], "template does not parse, no edges: {}", e.message);
                    continue;
                }
            };
            for reference in parsed.references() {
                let target = graph.index.get(&reference.full_path).or_else(|| graph.index.get(&reference.name)).copied();
                if let Some(to) = target {
                    if !graph.edges[from].contains(&to) {
                        graph.edges[from].push(to);
                    }
                }
            }
        }
        graph
    }

    fn ensure_node(&mut self, name: &str) {
        if !self.index.contains_key(name) {
            self.index.insert(name.to_string(), self.nodes.len());
            self.nodes.push(name.to_string());
            self.edges.push(Vec::new());
        }
    }

    pub fn nodes(&self) -> &[String] { &self.nodes }

    pub fn edges(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| self.edges[i].iter().map(|&to| self.nodes[to].as_str()).collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize { self.edges.iter().map(Vec::len).sum() }

    /// Finds at most one cycle per DFS root, roots taken in node order.
    pub fn detect_cycles(&self) -> CycleReport {
        let mut colors = vec![Color::White; self.nodes.len()];
        let mut cycles = Vec::new();

        for root in 0..self.nodes.len() {
            if colors[root] != Color::White {
                continue;
            }
            if let Some(cycle) = self.dfs_visit(root, &mut colors) {
                cycles.push(cycle.into_iter().map(|i| self.nodes[i].clone()).collect());
            }
        }

        CycleReport { has_circular_references: !cycles.is_empty(), cycles }
    }

    /// Iterative DFS from `root`; returns `Some(cycle)` as soon as an edge reaches a gray node.
    ///
    /// The stack holds the gray path as `(node, index of the next edge to follow)`.
    fn dfs_visit(&self, root: usize, colors: &mut [Color]) -> Option<Vec<usize>> {
        colors[root] = Color::Gray;
        let mut stack = vec![(root, 0)];

        while let Some(top) = stack.last_mut() {
            let (node, edge) = *top;
            let Some(&next) = self.edges[node].get(edge) else {
                colors[node] = Color::Black;
                stack.pop();
                continue;
            };
            top.1 += 1;

            match colors[next] {
                Color::Gray => {
                    let start = stack.iter().position(|&(n, _)| n == next)?;
                    let cycle = stack[start..].iter().map(|&(n, _)| n).collect();
                    // Abandoned walk: finish everything still on the stack.
                    for &(n, _) in &stack {
                        colors[n] = Color::Black;
                    }
                    return Some(cycle);
                }
                Color::White => {
                    colors[next] = Color::Gray;
                    stack.push((next, 0));
                }
                Color::Black => {}
            }
        }
        None
    }

    /// Node names with every dependency before its dependents, or `None` if the graph has a cycle.
    pub fn resolution_order(&self) -> Option<Vec<String>> {
        if self.detect_cycles().has_circular_references {
            return None;
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());

        for root in 0..self.nodes.len() {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            let mut stack = vec![(root, 0)];
            while let Some(top) = stack.last_mut() {
                let (node, edge) = *top;
                match self.edges[node].get(edge) {
                    None => {
                        order.push(node);
                        stack.pop();
                    }
                    Some(&next) => {
                        top.1 += 1;
                        if !visited[next] {
                            visited[next] = true;
                            stack.push((next, 0));
                        }
                    }
                }
            }
        }
        Some(order.into_iter().map(|i| self.nodes[i].clone()).collect())
    }
}

/// Builds the template graph for `templates` and reports circular references.
pub fn detect_circular_references<S: AsRef<str>>(names: &[S], templates: &HashMap<String, String>) -> CycleReport {
    let report = DependencyGraph::build(names, templates).detect_cycles();
    if report.has_circular_references {
        for cycle in &report.cycles {
            tracing::warn!("circular variable reference: {}", cycle.join(" -> "));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn templates(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn edges_follow_reference_order_without_duplicates() {
        let t = templates(&[("a", "${services.c.url} ${services.b.url} ${services.c.port}"), ("b", ""), ("c", "")]);
        let g = DependencyGraph::build(&["a", "b", "c"], &t);
        assert_eq!(g.edges("a"), vec!["c", "b"]);
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn full_path_keys_match_before_names() {
        let t = templates(&[("env.PORT", "8080"), ("url", "http://${services.web.host}:${env.PORT}")]);
        let g = DependencyGraph::build(&["url", "env.PORT"], &t);
        assert_eq!(g.edges("url"), vec!["env.PORT"]);
    }

    #[test]
    fn context_references_are_not_edges() {
        let t = templates(&[("a", "${services.api.url}"), ("b", "${env.HOME}")]);
        let g = DependencyGraph::build(&["a", "b"], &t);
        assert_eq!(g.edge_count(), 0);
        assert!(!g.detect_cycles().has_circular_references);
    }

    #[test]
    fn extra_keys_come_after_names_sorted() {
        let t = templates(&[("z", ""), ("m", ""), ("a", "")]);
        let g = DependencyGraph::build(&["m"], &t);
        assert_eq!(g.nodes(), &["m".to_string(), "a".to_string(), "z".to_string()]);
    }

    #[test]
    fn self_loop_is_a_cycle_of_one() {
        let t = templates(&[("a", "${services.a.value}")]);
        let report = DependencyGraph::build(&["a"], &t).detect_cycles();
        assert_eq!(report.cycles, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn cycle_starts_at_first_repeated_node() {
        // x -> a -> b -> c -> a
        let t = templates(&[
            ("x", "${services.a.v}"),
            ("a", "${services.b.v}"),
            ("b", "${services.c.v}"),
            ("c", "${services.a.v}"),
        ]);
        let report = DependencyGraph::build(&["x", "a", "b", "c"], &t).detect_cycles();
        assert_eq!(report.cycles, vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]);
    }

    #[test]
    fn unparseable_template_contributes_no_edges() {
        let t = templates(&[("a", "${services.b.v"), ("b", "${services.a.v}")]);
        let g = DependencyGraph::build(&["a", "b"], &t);
        assert!(g.edges("a").is_empty());
        assert!(!g.detect_cycles().has_circular_references);
    }

    #[test]
    fn resolution_order_puts_dependencies_first() {
        let t = templates(&[("url", "${services.host.v}:${services.port.v}"), ("host", "${env.HOST}"), ("port", "80")]);
        let order = DependencyGraph::build(&["url", "host", "port"], &t).resolution_order().unwrap();
        assert_eq!(order, vec!["host", "port", "url"]);
    }

    #[test]
    fn resolution_order_is_none_when_cyclic() {
        let t = templates(&[("a", "${services.b.v}"), ("b", "${services.a.v}")]);
        assert_eq!(DependencyGraph::build(&["a", "b"], &t).resolution_order(), None);
    }

    #[test]
    fn validate_reports_each_unknown_entity() {
        let catalog = EntityCatalog::new().with_service("api").with_env("NODE_ENV");
        let errors = validate_references("${services.api.url} ${services.db.host} ${projects.shop.name} ${env.NODE_ENV}", &catalog);
        assert_eq!(
            errors,
            vec![
                CheckError::UnknownEntity { kind: RefKind::Service, name: "db".into(), raw: "${services.db.host}".into() },
                CheckError::UnknownEntity { kind: RefKind::Project, name: "shop".into(), raw: "${projects.shop.name}".into() },
            ]
        );
        assert_eq!(errors[0].to_string(), "unknown service 'db' in ${services.db.host}");
    }

    #[test]
    fn validate_surfaces_parse_errors() {
        let errors = validate_references("${}", &EntityCatalog::new());
        assert!(matches!(errors.as_slice(), [CheckError::Parse(_)]));
    }
}
