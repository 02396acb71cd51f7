// kiln-common/src/dependency/resolver.rs
//
// Turns a set of requested formulae into a dependency-ordered plan. The graph
// is an adjacency list over node indices plus a separate mark array; nothing
// here touches the filesystem.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::dependency::DependencyTag;
use crate::error::{KilnError, Result};
use crate::formulary::Formulary;
use crate::model::formula::Formula;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Traverse dependencies declared with `kind = "optional"`.
    pub include_optional: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub formula: Arc<Formula>,
    /// Union of the tags of every edge that reached this node. Empty for
    /// nodes that were only requested directly.
    pub accumulated_tags: DependencyTag,
    pub requested: bool,
}

impl ResolvedNode {
    pub fn name(&self) -> &str {
        &self.formula.name
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    /// Dependencies before dependents.
    pub order: Vec<ResolvedNode>,
    edges: HashMap<String, Vec<String>>,
}

impl ResolvedGraph {
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(ResolvedNode::name).collect()
    }

    pub fn node(&self, name: &str) -> Option<&ResolvedNode> {
        self.order.iter().find(|n| n.name() == name)
    }

    /// Direct dependencies of `name` that are part of this plan.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of `name` within this plan, in plan order.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.order
            .iter()
            .map(ResolvedNode::name)
            .filter(|n| self.dependencies_of(n).iter().any(|d| d == name))
            .collect()
    }

    /// The part of the plan that still has to run when the formulae in
    /// `present` are already installed. From a present node only runtime
    /// dependencies are followed, so tools it needed to build drop out.
    pub fn without_build_only_of(&self, present: &HashSet<String>) -> ResolvedGraph {
        let mut needed: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&ResolvedNode> =
            self.order.iter().filter(|n| n.requested).collect();
        while let Some(node) = queue.pop_front() {
            if !needed.insert(node.name()) {
                continue;
            }
            let follow: Vec<&str> = if present.contains(node.name()) {
                node.formula
                    .runtime_dependencies()
                    .into_iter()
                    .map(|d| d.name.as_str())
                    .collect()
            } else {
                self.dependencies_of(node.name())
                    .iter()
                    .map(String::as_str)
                    .collect()
            };
            queue.extend(follow.into_iter().filter_map(|name| self.node(name)));
        }

        for node in &self.order {
            if !needed.contains(node.name()) {
                debug!("Not planning {}: only needed to build installed formulae", node.name());
            }
        }
        let order: Vec<ResolvedNode> = self
            .order
            .iter()
            .filter(|n| needed.contains(n.name()))
            .cloned()
            .collect();
        let edges = order
            .iter()
            .map(|n| {
                let deps = self
                    .dependencies_of(n.name())
                    .iter()
                    .filter(|d| needed.contains(d.as_str()))
                    .cloned()
                    .collect();
                (n.name().to_string(), deps)
            })
            .collect();
        ResolvedGraph { order, edges }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

struct Graph {
    formulae: Vec<Arc<Formula>>,
    index: HashMap<String, usize>,
    adjacency: Vec<Vec<usize>>,
    tags: Vec<DependencyTag>,
}

impl Graph {
    fn intern(&mut self, formula: Arc<Formula>) -> (usize, bool) {
        if let Some(&idx) = self.index.get(&formula.name) {
            return (idx, false);
        }
        let idx = self.formulae.len();
        self.index.insert(formula.name.clone(), idx);
        self.formulae.push(formula);
        self.adjacency.push(Vec::new());
        self.tags.push(DependencyTag::empty());
        (idx, true)
    }

    /// Discovers every node reachable from `roots` and records edges in
    /// declaration order.
    fn build(
        roots: &[Arc<Formula>],
        formulary: &Formulary,
        options: ResolveOptions,
    ) -> Result<Self> {
        let mut graph = Graph {
            formulae: Vec::new(),
            index: HashMap::new(),
            adjacency: Vec::new(),
            tags: Vec::new(),
        };
        let mut queue: Vec<usize> = Vec::new();
        for root in roots {
            let (idx, fresh) = graph.intern(Arc::clone(root));
            if fresh {
                queue.push(idx);
            }
        }

        let mut cursor = 0;
        while cursor < queue.len() {
            let current = queue[cursor];
            cursor += 1;
            let formula = Arc::clone(&graph.formulae[current]);

            for dep in &formula.dependencies {
                if dep.is_optional() && !options.include_optional {
                    debug!(
                        "Skipping optional dependency '{}' of '{}'",
                        dep.name, formula.name
                    );
                    continue;
                }
                let dep_formula = match graph.index.get(&dep.name) {
                    Some(&idx) => Arc::clone(&graph.formulae[idx]),
                    None => formulary.get(&dep.name).map_err(|e| match e {
                        KilnError::UnknownFormula(missing) => KilnError::UnknownDependency {
                            dependent: formula.name.clone(),
                            missing,
                        },
                        other => other,
                    })?,
                };
                let (dep_idx, fresh) = graph.intern(dep_formula);
                graph.tags[dep_idx] |= dep.tags;
                graph.adjacency[current].push(dep_idx);
                if fresh {
                    queue.push(dep_idx);
                }
            }
        }
        Ok(graph)
    }
}

/// Resolves a single formula. See [`resolve_all`].
pub fn resolve(
    formula: &Arc<Formula>,
    formulary: &Formulary,
    options: ResolveOptions,
) -> Result<ResolvedGraph> {
    resolve_all(std::slice::from_ref(formula), formulary, options)
}

/// Produces a topological order over `roots` and everything they depend on.
/// Leaves come first; among independent nodes the order follows declaration
/// order in the owning formula, then the order of `roots`.
pub fn resolve_all(
    roots: &[Arc<Formula>],
    formulary: &Formulary,
    options: ResolveOptions,
) -> Result<ResolvedGraph> {
    let graph = Graph::build(roots, formulary, options)?;
    let node_count = graph.formulae.len();
    let mut marks = vec![Mark::Unvisited; node_count];
    let mut order: Vec<usize> = Vec::with_capacity(node_count);

    let root_indices: Vec<usize> = roots
        .iter()
        .filter_map(|r| graph.index.get(&r.name).copied())
        .collect();

    for &root in &root_indices {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // Explicit stack of (node, next child position).
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::InProgress;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if let Some(&child) = graph.adjacency[node].get(top.1) {
                top.1 += 1;
                match marks[child] {
                    Mark::Unvisited => {
                        marks[child] = Mark::InProgress;
                        stack.push((child, 0));
                    }
                    Mark::InProgress => {
                        let start = stack
                            .iter()
                            .position(|(n, _)| *n == child)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|(n, _)| graph.formulae[*n].name.clone())
                            .collect();
                        cycle.push(graph.formulae[child].name.clone());
                        debug!("Dependency cycle: {}", cycle.join(" -> "));
                        return Err(KilnError::CyclicDependency(cycle));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                order.push(node);
                stack.pop();
            }
        }
    }

    debug_assert!(order.iter().enumerate().all(|(pos, &n)| {
        graph.adjacency[n]
            .iter()
            .all(|dep| order[..pos].contains(dep))
    }));

    let requested: Vec<bool> = (0..node_count).map(|i| root_indices.contains(&i)).collect();
    let edges = graph
        .adjacency
        .iter()
        .enumerate()
        .map(|(i, deps)| {
            (
                graph.formulae[i].name.clone(),
                deps.iter().map(|d| graph.formulae[*d].name.clone()).collect(),
            )
        })
        .collect();
    let order = order
        .into_iter()
        .map(|i| ResolvedNode {
            formula: Arc::clone(&graph.formulae[i]),
            accumulated_tags: graph.tags[i],
            requested: requested[i],
        })
        .collect::<Vec<_>>();

    debug!(
        "Resolved plan: {}",
        order
            .iter()
            .map(ResolvedNode::name)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(ResolvedGraph { order, edges })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::dependency::{Dependency, DependencyKind};
    use crate::model::Step;

    fn formula(name: &str, deps: &[(&str, DependencyKind)]) -> Formula {
        Formula {
            name: name.to_string(),
            version: "1.0".to_string(),
            desc: format!("{name} formula"),
            homepage: "https://example.com".to_string(),
            url: format!("https://example.com/{name}-1.0.tar.gz"),
            sha256: "0".repeat(64),
            license: "MIT".to_string(),
            dependencies: deps
                .iter()
                .map(|(n, k)| Dependency::new_with_tags(*n, (*k).into()))
                .collect(),
            flags: BTreeMap::new(),
            install: vec![Step::Shell {
                script: "true".to_string(),
            }],
            test: Vec::new(),
        }
    }

    fn index(formulae: Vec<Formula>) -> Formulary {
        Formulary::from_formulae(formulae)
    }

    use DependencyKind::{Build, Optional, Runtime};

    #[test]
    fn leaves_come_first_in_declaration_order() {
        let formulary = index(vec![
            formula("app", &[("zlib", Runtime), ("go", Build), ("pkgconf", Build)]),
            formula("zlib", &[]),
            formula("go", &[]),
            formula("pkgconf", &[("zlib", Runtime)]),
        ]);
        let root = formulary.get("app").unwrap();
        let graph = resolve(&root, &formulary, ResolveOptions::default()).unwrap();
        assert_eq!(graph.names(), vec!["zlib", "go", "pkgconf", "app"]);
        assert!(graph.node("app").unwrap().requested);
        assert_eq!(
            graph.node("zlib").unwrap().accumulated_tags,
            DependencyTag::RUNTIME
        );
        assert_eq!(graph.dependents_of("zlib"), vec!["pkgconf", "app"]);
    }

    #[test]
    fn build_dependency_of_guise() {
        let formulary = index(vec![formula("guise", &[("go", Build)]), formula("go", &[])]);
        let root = formulary.get("guise").unwrap();
        let graph = resolve(&root, &formulary, ResolveOptions::default()).unwrap();
        assert_eq!(graph.names(), vec!["go", "guise"]);
        assert_eq!(graph.node("go").unwrap().accumulated_tags, DependencyTag::BUILD);
        assert_eq!(graph.dependencies_of("guise"), ["go".to_string()]);
    }

    #[test]
    fn installed_formulae_keep_only_runtime_dependencies() {
        let formulary = index(vec![
            formula("guise", &[("go", Build), ("zlib", Runtime)]),
            formula("go", &[("bootstrap", Build)]),
            formula("bootstrap", &[]),
            formula("zlib", &[]),
        ]);
        let root = formulary.get("guise").unwrap();
        let graph = resolve(&root, &formulary, ResolveOptions::default()).unwrap();
        assert_eq!(graph.names(), vec!["bootstrap", "go", "zlib", "guise"]);

        let present: HashSet<String> = ["guise".to_string()].into();
        let pruned = graph.without_build_only_of(&present);
        assert_eq!(pruned.names(), vec!["zlib", "guise"]);
        assert_eq!(pruned.dependencies_of("guise"), ["zlib".to_string()]);
        assert!(pruned.node("go").is_none());

        let nothing = graph.without_build_only_of(&HashSet::new());
        assert_eq!(nothing.names(), graph.names());
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let formulary = index(vec![
            formula("a", &[("b", Runtime)]),
            formula("b", &[("c", Runtime)]),
            formula("c", &[("a", Build)]),
        ]);
        let root = formulary.get("a").unwrap();
        match resolve(&root, &formulary, ResolveOptions::default()) {
            Err(KilnError::CyclicDependency(cycle)) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let formulary = index(vec![formula("loop", &[("loop", Runtime)])]);
        let root = formulary.get("loop").unwrap();
        assert!(matches!(
            resolve(&root, &formulary, ResolveOptions::default()),
            Err(KilnError::CyclicDependency(c)) if c == vec!["loop", "loop"]
        ));
    }

    #[test]
    fn unknown_dependency_names_both_sides() {
        let formulary = index(vec![formula("guise", &[("go", Build)])]);
        let root = formulary.get("guise").unwrap();
        match resolve(&root, &formulary, ResolveOptions::default()) {
            Err(KilnError::UnknownDependency { dependent, missing }) => {
                assert_eq!(dependent, "guise");
                assert_eq!(missing, "go");
            }
            other => panic!("expected unknown dependency, got {other:?}"),
        }
    }

    #[test]
    fn optional_dependencies_only_when_requested() {
        let formulary = index(vec![
            formula("app", &[("docs", Optional)]),
            formula("docs", &[]),
        ]);
        let root = formulary.get("app").unwrap();
        let without = resolve(&root, &formulary, ResolveOptions::default()).unwrap();
        assert_eq!(without.names(), vec!["app"]);
        let with = resolve(
            &root,
            &formulary,
            ResolveOptions {
                include_optional: true,
            },
        )
        .unwrap();
        assert_eq!(with.names(), vec!["docs", "app"]);
    }

    #[test]
    fn multiple_roots_share_nodes() {
        let formulary = index(vec![
            formula("a", &[("lib", Runtime)]),
            formula("b", &[("lib", Runtime)]),
            formula("lib", &[]),
        ]);
        let roots = vec![formulary.get("b").unwrap(), formulary.get("a").unwrap()];
        let graph = resolve_all(&roots, &formulary, ResolveOptions::default()).unwrap();
        assert_eq!(graph.names(), vec!["lib", "b", "a"]);
    }
}
