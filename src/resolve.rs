//! Dependency resolution
//!
//! Expands a root recipe breadth-first into a [`DependencyGraph`]:
//!
//! - every distinct reference becomes exactly one node (dedup by identity,
//!   a node already in the graph is linked but not expanded again);
//! - two references with the same `name@user/channel` but different versions
//!   are a [`ResolutionError::VersionConflict`], never a silent pick;
//! - a requirement cycle is a [`ResolutionError::CyclicDependency`] naming the
//!   chain.
//!
//! The build order lists dependencies before dependents. Among nodes that do
//! not depend on each other the one discovered first comes first, so the
//! order is stable for identical input.

use crate::loader::RecipeLoader;
use crate::recipe::RecipeNode;
use crate::reference::{ReferenceError, RequirementRef};
use crate::store::{PackageStore, StoreError};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    MalformedReference(#[from] ReferenceError),

    #[error("{}", format_cycle(path))]
    CyclicDependency { path: Vec<RequirementRef> },

    #[error("version conflict for {name}: {}", versions.join(" vs "))]
    VersionConflict { name: String, versions: Vec<String> },

    #[error("{}", format_not_found(reference, required_by.as_ref()))]
    RecipeNotFound {
        reference: RequirementRef,
        required_by: Option<RequirementRef>,
    },

    #[error("failed to load recipe for {reference}: {message}")]
    Load {
        reference: RequirementRef,
        message: String,
    },

    #[error("cannot read published package {reference}: {source}")]
    Store {
        reference: RequirementRef,
        #[source]
        source: StoreError,
    },
}

fn format_cycle(path: &[RequirementRef]) -> String {
    let chain: Vec<String> = path.iter().map(|r| r.to_string()).collect();
    format!("dependency cycle detected: {}", chain.join(" -> "))
}

fn format_not_found(reference: &RequirementRef, required_by: Option<&RequirementRef>) -> String {
    let mut msg = format!("no recipe or published package for {}", reference);
    if let Some(parent) = required_by {
        let _ = write!(msg, " (required by {})", parent);
    }
    msg
}

/// How a node entered the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOrigin {
    /// Loaded from a recipe; will run its lifecycle unless already published
    Recipe,
    /// No recipe available, but a published package exists in the store
    Published,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub recipe: RecipeNode,
    pub origin: NodeOrigin,
    /// Indices of direct `requires` dependencies
    requires: Vec<usize>,
    /// Indices of direct `build_requires` dependencies
    build_requires: Vec<usize>,
}

/// Resolved, acyclic dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// In discovery order; index 0 is the root
    nodes: Vec<GraphNode>,
    index: HashMap<RequirementRef, usize>,
    order: Vec<usize>,
    /// Position of each node in `order`
    rank: Vec<usize>,
}

impl DependencyGraph {
    pub fn root(&self) -> &RequirementRef {
        &self.nodes[0].recipe.reference
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, reference: &RequirementRef) -> Option<&GraphNode> {
        self.index.get(reference).map(|&i| &self.nodes[i])
    }

    /// Dependencies before dependents.
    pub fn build_order(&self) -> Vec<&RequirementRef> {
        self.order
            .iter()
            .map(|&i| &self.nodes[i].recipe.reference)
            .collect()
    }

    /// Direct `requires` then `build_requires`.
    pub fn direct_dependencies(&self, reference: &RequirementRef) -> Vec<&RequirementRef> {
        match self.index.get(reference) {
            Some(&i) => self.nodes[i]
                .requires
                .iter()
                .chain(self.nodes[i].build_requires.iter())
                .map(|&d| &self.nodes[d].recipe.reference)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every package whose exported info `reference` builds against.
    ///
    /// The transitive `requires` closure comes first, then each
    /// `build_requires` entry together with its own `requires` closure. Within
    /// each group the build order is kept. A dependency's build requirements
    /// are not propagated to its dependents.
    pub fn dependency_closure(&self, reference: &RequirementRef) -> Vec<&RequirementRef> {
        let Some(&start) = self.index.get(reference) else {
            return Vec::new();
        };

        let host = self.requires_closure(self.nodes[start].requires.iter().copied());
        let mut tools = self.requires_closure(self.nodes[start].build_requires.iter().copied());
        tools.retain(|i| !host.contains(i));

        let mut host: Vec<usize> = host.into_iter().collect();
        let mut tools: Vec<usize> = tools.into_iter().collect();
        host.sort_by_key(|&i| self.rank[i]);
        tools.sort_by_key(|&i| self.rank[i]);

        host.into_iter()
            .chain(tools)
            .map(|i| &self.nodes[i].recipe.reference)
            .collect()
    }

    fn requires_closure(&self, seeds: impl Iterator<Item = usize>) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = seeds.collect();
        while let Some(i) = queue.pop_front() {
            if seen.insert(i) {
                queue.extend(self.nodes[i].requires.iter().copied());
            }
        }
        seen
    }
}

/// Expands recipes through a loader, optionally falling back to a store.
pub struct Resolver<'a> {
    loader: &'a dyn RecipeLoader,
    store: Option<&'a dyn PackageStore>,
}

impl<'a> Resolver<'a> {
    pub fn new(loader: &'a dyn RecipeLoader) -> Self {
        Self {
            loader,
            store: None,
        }
    }

    /// Requirements without a recipe resolve to their published package.
    pub fn with_store(mut self, store: &'a dyn PackageStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn resolve(&self, root: RecipeNode) -> Result<DependencyGraph, ResolutionError> {
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut index: HashMap<RequirementRef, usize> = HashMap::new();
        // package key -> first version seen, for conflict detection
        let mut versions: HashMap<String, RequirementRef> = HashMap::new();

        versions.insert(root.reference.package_key(), root.reference.clone());
        index.insert(root.reference.clone(), 0);
        nodes.push(GraphNode {
            recipe: root,
            origin: NodeOrigin::Recipe,
            requires: Vec::new(),
            build_requires: Vec::new(),
        });

        let mut queue: VecDeque<usize> = VecDeque::from([0]);
        while let Some(current) = queue.pop_front() {
            let parent = nodes[current].recipe.reference.clone();
            let requirements: Vec<(RequirementRef, bool)> = nodes[current]
                .recipe
                .requires
                .iter()
                .map(|r| (r.clone(), false))
                .chain(
                    nodes[current]
                        .recipe
                        .build_requires
                        .iter()
                        .map(|r| (r.clone(), true)),
                )
                .collect();

            for (requirement, is_build) in requirements {
                check_version(&mut versions, &requirement)?;

                let dep = match index.get(&requirement) {
                    Some(&existing) => existing,
                    None => {
                        let (recipe, origin) = self.load(&requirement, &parent)?;
                        let i = nodes.len();
                        debug!(reference = %requirement, parent = %parent, "discovered dependency");
                        index.insert(requirement.clone(), i);
                        nodes.push(GraphNode {
                            recipe,
                            origin,
                            requires: Vec::new(),
                            build_requires: Vec::new(),
                        });
                        queue.push_back(i);
                        i
                    }
                };

                let edges = if is_build {
                    &mut nodes[current].build_requires
                } else {
                    &mut nodes[current].requires
                };
                if !edges.contains(&dep) {
                    edges.push(dep);
                }
            }
        }

        detect_cycle(&nodes)?;
        let order = topological_order(&nodes);
        let mut rank = vec![0; nodes.len()];
        for (position, &i) in order.iter().enumerate() {
            rank[i] = position;
        }

        Ok(DependencyGraph {
            nodes,
            index,
            order,
            rank,
        })
    }

    fn load(
        &self,
        reference: &RequirementRef,
        parent: &RequirementRef,
    ) -> Result<(RecipeNode, NodeOrigin), ResolutionError> {
        match self.loader.load(reference) {
            Ok(Some(recipe)) => {
                if &recipe.reference != reference {
                    return Err(ResolutionError::Load {
                        reference: reference.clone(),
                        message: format!("loader returned recipe for {}", recipe.reference),
                    });
                }
                return Ok((recipe, NodeOrigin::Recipe));
            }
            Ok(None) => {}
            Err(e) => {
                if let Some(malformed) = e.downcast_ref::<ReferenceError>() {
                    return Err(ResolutionError::MalformedReference(malformed.clone()));
                }
                return Err(ResolutionError::Load {
                    reference: reference.clone(),
                    message: format!("{:#}", e),
                });
            }
        }

        if let Some(store) = self.store {
            match store.find(reference) {
                Ok(Some(_)) => {
                    debug!(reference = %reference, "no recipe, using published package");
                    return Ok((RecipeNode::new(reference.clone()), NodeOrigin::Published));
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(ResolutionError::Store {
                        reference: reference.clone(),
                        source,
                    });
                }
            }
        }

        Err(ResolutionError::RecipeNotFound {
            reference: reference.clone(),
            required_by: Some(parent.clone()),
        })
    }
}

fn check_version(
    versions: &mut HashMap<String, RequirementRef>,
    requirement: &RequirementRef,
) -> Result<(), ResolutionError> {
    let key = requirement.package_key();
    match versions.get(&key) {
        Some(seen) if seen.version() != requirement.version() => {
            Err(ResolutionError::VersionConflict {
                name: key,
                versions: vec![seen.version().to_string(), requirement.version().to_string()],
            })
        }
        Some(_) => Ok(()),
        None => {
            versions.insert(key, requirement.clone());
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    OnStack,
    Done,
}

/// Iterative DFS from the root keeping the active path; a dependency that is
/// still on the path closes a cycle.
fn detect_cycle(nodes: &[GraphNode]) -> Result<(), ResolutionError> {
    let mut state = vec![VisitState::Unvisited; nodes.len()];
    let children = |i: usize| -> Vec<usize> {
        nodes[i]
            .requires
            .iter()
            .chain(nodes[i].build_requires.iter())
            .copied()
            .collect()
    };

    // (node, index of next child to visit)
    let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
    state[0] = VisitState::OnStack;

    while let Some(&mut (node, ref mut next)) = stack.last_mut() {
        let deps = children(node);
        if *next >= deps.len() {
            state[node] = VisitState::Done;
            stack.pop();
            continue;
        }
        let dep = deps[*next];
        *next += 1;

        match state[dep] {
            VisitState::Unvisited => {
                state[dep] = VisitState::OnStack;
                stack.push((dep, 0));
            }
            VisitState::OnStack => {
                let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                let mut path: Vec<RequirementRef> = stack[start..]
                    .iter()
                    .map(|&(n, _)| nodes[n].recipe.reference.clone())
                    .collect();
                path.push(nodes[dep].recipe.reference.clone());
                return Err(ResolutionError::CyclicDependency { path });
            }
            VisitState::Done => {}
        }
    }

    Ok(())
}

/// Kahn's algorithm; the ready set is ordered by discovery index.
fn topological_order(nodes: &[GraphNode]) -> Vec<usize> {
    let mut pending: Vec<usize> = vec![0; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (i, node) in nodes.iter().enumerate() {
        let deps: BTreeSet<usize> = node
            .requires
            .iter()
            .chain(node.build_requires.iter())
            .copied()
            .collect();
        pending[i] = deps.len();
        for d in deps {
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &dependent in &dependents[i] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    order
}
