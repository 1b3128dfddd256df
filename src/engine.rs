//! The kitchen: resolves a root recipe and runs every node of its graph.
//!
//! Nodes run in build order on up to `jobs` worker threads. A node starts
//! once all of its dependencies have finished; a node whose dependency failed
//! is skipped and never configured. Published packages short-circuit: a
//! dependency already in the store is reused, not rebuilt.

use crate::config::KitchenConfig;
use crate::lifecycle::{CancelToken, LifecycleRunner, RunError};
use crate::loader::RecipeLoader;
use crate::output;
use crate::recipe::{RecipeNode, Stage, StageResult};
use crate::reference::RequirementRef;
use crate::resolve::{DependencyGraph, NodeOrigin, ResolutionError, Resolver};
use crate::store::{PackageInfo, PackageStore, StoreError};
use crate::tool::{BuildTool, CommandTool};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use thiserror::Error;
use tracing::{debug, info};

/// How far the root recipe is taken. Dependencies are always packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    /// Configure and build the root
    Build,
    /// Also package and publish it
    Package,
    /// Also run its test hook
    Test,
}

impl Goal {
    pub fn last_stage(&self) -> Stage {
        match self {
            Goal::Build => Stage::Build,
            Goal::Package => Stage::Package,
            Goal::Test => Stage::Test,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Goal::Build => "Building",
            Goal::Package => "Packaging",
            Goal::Test => "Testing",
        }
    }
}

#[derive(Debug, Error)]
pub enum KitchenError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Publishing would have replaced different content; the run stopped.
    #[error(transparent)]
    StoreConflict(StoreError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for KitchenError {
    fn from(e: StoreError) -> Self {
        match e {
            e @ StoreError::Conflict { .. } => KitchenError::StoreConflict(e),
            e => KitchenError::Store(e),
        }
    }
}

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Lifecycle ran to completion
    Succeeded,
    /// Already published; nothing ran
    Reused,
    Failed { stage: Stage, diagnostic: String },
    /// Not attempted because a dependency did not succeed
    Skipped { because: RequirementRef },
    Cancelled,
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Succeeded | NodeOutcome::Reused)
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Succeeded => write!(f, "ok"),
            NodeOutcome::Reused => write!(f, "reused"),
            NodeOutcome::Failed { stage, .. } => write!(f, "StageFailure({})", stage),
            NodeOutcome::Skipped { because } => write!(f, "Skipped ({} did not succeed)", because),
            NodeOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub reference: RequirementRef,
    pub outcome: NodeOutcome,
    pub log: Vec<StageResult>,
    pub package: Option<PackageInfo>,
}

/// Per-node results in build order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub root: RequirementRef,
    pub goal: Goal,
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.outcome.is_success())
    }

    pub fn node(&self, reference: &RequirementRef) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.reference == reference)
    }

    /// Nodes that failed directly.
    pub fn failed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::Failed { .. }))
    }

    /// Nodes skipped because of a failure upstream.
    pub fn skipped(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.outcome, NodeOutcome::Skipped { .. }))
    }
}

/// Drives resolution and the lifecycle of every node.
pub struct Kitchen {
    config: KitchenConfig,
    store: Arc<dyn PackageStore>,
    loader: Arc<dyn RecipeLoader>,
    tool: Arc<dyn BuildTool>,
    cancel: CancelToken,
}

impl Kitchen {
    /// A kitchen using the configured shell commands as build tool.
    pub fn new(
        config: KitchenConfig,
        store: Arc<dyn PackageStore>,
        loader: Arc<dyn RecipeLoader>,
    ) -> Self {
        let tool: Arc<dyn BuildTool> = Arc::new(CommandTool::new(config.tool.clone()));
        Self {
            config,
            store,
            loader,
            tool,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn BuildTool>) -> Self {
        self.tool = tool;
        self
    }

    pub fn config(&self) -> &KitchenConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn PackageStore {
        self.store.as_ref()
    }

    /// Cancelling it stops the run before the next stage of every node.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn resolve(&self, root: RecipeNode) -> Result<DependencyGraph, ResolutionError> {
        Resolver::new(self.loader.as_ref())
            .with_store(self.store.as_ref())
            .resolve(root)
    }

    pub fn build(&self, root: RecipeNode) -> Result<RunReport, KitchenError> {
        self.run(root, Goal::Build)
    }

    pub fn package(&self, root: RecipeNode) -> Result<RunReport, KitchenError> {
        self.run(root, Goal::Package)
    }

    pub fn test(&self, root: RecipeNode) -> Result<RunReport, KitchenError> {
        self.run(root, Goal::Test)
    }

    /// Resolve `root`, then run the graph.
    ///
    /// Resolution errors return before any hook or tool runs.
    pub fn run(&self, root: RecipeNode, goal: Goal) -> Result<RunReport, KitchenError> {
        let graph = self.resolve(root)?;
        output::action(&format!("{} {}", goal.verb(), graph.root()));
        self.run_graph(&graph, goal)
    }

    /// Run every node of an already-resolved graph.
    pub fn run_graph(
        &self,
        graph: &DependencyGraph,
        goal: Goal,
    ) -> Result<RunReport, KitchenError> {
        let order: Vec<RequirementRef> = graph.build_order().into_iter().cloned().collect();
        let total = order.len();
        let runner = LifecycleRunner::new(&self.config, self.store.as_ref(), Arc::clone(&self.tool))
            .with_cancel_token(self.cancel.clone());

        let mut reports: HashMap<RequirementRef, NodeReport> = HashMap::new();
        let mut in_flight: HashSet<RequirementRef> = HashSet::new();
        let mut started = 0usize;
        let mut halted: Option<KitchenError> = None;

        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel::<(RequirementRef, Result<NodeReport, KitchenError>)>();
            let mut running = 0usize;

            loop {
                // Start every ready node, skipping those with a failed dependency.
                for reference in &order {
                    if running >= self.config.jobs {
                        break;
                    }
                    if reports.contains_key(reference) || in_flight.contains(reference) {
                        continue;
                    }
                    let deps = graph.direct_dependencies(reference);
                    if deps.iter().any(|d| !reports.contains_key(*d)) {
                        continue;
                    }

                    if let Some(blocker) = deps
                        .iter()
                        .find(|d| reports.get(**d).is_some_and(|r| !r.outcome.is_success()))
                    {
                        debug!(reference = %reference, because = %blocker, "skipping");
                        reports.insert(
                            reference.clone(),
                            bare_report(
                                reference,
                                NodeOutcome::Skipped {
                                    because: (*blocker).clone(),
                                },
                            ),
                        );
                        continue;
                    }
                    if halted.is_some() || self.cancel.is_cancelled() {
                        reports.insert(
                            reference.clone(),
                            bare_report(reference, NodeOutcome::Cancelled),
                        );
                        continue;
                    }

                    started += 1;
                    running += 1;
                    in_flight.insert(reference.clone());
                    output::action_numbered(started, total, &reference.to_string());

                    let closure: Vec<PackageInfo> = graph
                        .dependency_closure(reference)
                        .into_iter()
                        .filter_map(|d| reports.get(d).and_then(|r| r.package.clone()))
                        .collect();
                    let is_root = reference == graph.root();
                    let tx = tx.clone();
                    let runner = &runner;
                    let reference = reference.clone();
                    s.spawn(move || {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.run_node(runner, graph, &reference, &closure, is_root, goal)
                        }))
                        .unwrap_or_else(|_| {
                            Ok(bare_report(
                                &reference,
                                NodeOutcome::Failed {
                                    stage: Stage::Configure,
                                    diagnostic: "recipe runner panicked".to_string(),
                                },
                            ))
                        });
                        let _ = tx.send((reference, result));
                    });
                }

                if running == 0 {
                    break;
                }
                let Ok((reference, result)) = rx.recv() else {
                    break;
                };
                running -= 1;
                in_flight.remove(&reference);
                match result {
                    Ok(report) => {
                        reports.insert(reference, report);
                    }
                    Err(e) => {
                        reports.insert(
                            reference.clone(),
                            bare_report(&reference, NodeOutcome::Cancelled),
                        );
                        if halted.is_none() {
                            halted = Some(e);
                        }
                    }
                }
            }
        });

        if let Some(e) = halted {
            return Err(e);
        }

        let nodes = order
            .iter()
            .map(|r| {
                reports
                    .remove(r)
                    .unwrap_or_else(|| bare_report(r, NodeOutcome::Cancelled))
            })
            .collect();
        let report = RunReport {
            root: graph.root().clone(),
            goal,
            nodes,
        };
        summarize(&report);
        Ok(report)
    }

    fn run_node(
        &self,
        runner: &LifecycleRunner<'_>,
        graph: &DependencyGraph,
        reference: &RequirementRef,
        closure: &[PackageInfo],
        is_root: bool,
        goal: Goal,
    ) -> Result<NodeReport, KitchenError> {
        let Some(node) = graph.node(reference) else {
            return Ok(bare_report(reference, NodeOutcome::Cancelled));
        };

        // Prebuilt leaves and published dependencies are not rebuilt. The
        // root is rebuilt unless only its package is wanted.
        let reusable = node.origin == NodeOrigin::Published
            || (self.config.immutable_publish && (!is_root || goal == Goal::Package));
        if reusable && let Some(info) = self.store.find(reference)? {
            output::skip(&format!("{} already published, reusing", reference));
            return Ok(NodeReport {
                reference: reference.clone(),
                outcome: NodeOutcome::Reused,
                log: Vec::new(),
                package: Some(info),
            });
        }

        let last = if is_root { goal.last_stage() } else { Stage::Package };
        let run = match runner.run(&node.recipe, closure, last) {
            Ok(run) => run,
            Err(RunError::StoreConflict(e)) => return Err(KitchenError::StoreConflict(e)),
            Err(RunError::Cancelled { log, .. }) => {
                return Ok(NodeReport {
                    reference: reference.clone(),
                    outcome: NodeOutcome::Cancelled,
                    log,
                    package: None,
                });
            }
        };

        let outcome = match run.failure() {
            Some(failure) => NodeOutcome::Failed {
                stage: failure.stage,
                diagnostic: failure.diagnostic.clone().unwrap_or_default(),
            },
            None => NodeOutcome::Succeeded,
        };
        info!(reference = %reference, outcome = %outcome, "node finished");
        Ok(NodeReport {
            reference: reference.clone(),
            outcome,
            log: run.log,
            package: run.package,
        })
    }
}

fn bare_report(reference: &RequirementRef, outcome: NodeOutcome) -> NodeReport {
    NodeReport {
        reference: reference.clone(),
        outcome,
        log: Vec::new(),
        package: None,
    }
}

fn summarize(report: &RunReport) {
    for node in &report.nodes {
        output::report_line(
            &node.reference.to_string(),
            &node.outcome.to_string(),
            node.outcome.is_success(),
        );
        if let NodeOutcome::Failed { diagnostic, .. } = &node.outcome {
            for line in diagnostic.lines() {
                output::detail(line);
            }
        }
    }
    if report.is_success() {
        output::success(&format!("{} done", report.root));
    }
}
