//! Recipe definitions
//!
//! A recipe is plain data (identity and requirements) plus a [`StageHooks`]
//! implementation. Each of the four hooks is optional: a hook that returns
//! `None` is "not defined" and the runner applies its default for that stage.

use crate::env::BuildContext;
use crate::reference::RequirementRef;
use crate::tool::BuildTool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variables a package exports to its dependents.
pub type ExportedEnv = BTreeMap<String, String>;

/// Outcome of a hook: `Err` carries the diagnostic text.
pub type HookResult<T = ()> = Result<T, String>;

/// Lifecycle stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Configure,
    Build,
    Package,
    Test,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Configure, Stage::Build, Stage::Package, Stage::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Configure => "configure",
            Stage::Build => "build",
            Stage::Package => "package",
            Stage::Test => "test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Configure => write!(f, "Configure"),
            Stage::Build => write!(f, "Build"),
            Stage::Package => write!(f, "Package"),
            Stage::Test => write!(f, "Test"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Success,
    Failure,
}

/// Record of one executed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub diagnostic: Option<String>,
}

impl StageResult {
    pub fn success(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            diagnostic: None,
        }
    }

    pub fn failure(stage: Stage, diagnostic: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Failure,
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

/// Everything a hook (or the build tool) may look at while a stage runs.
pub struct StageContext<'a> {
    pub build: &'a BuildContext,
    /// Recipe sources; the build directory when the recipe has none
    pub source_dir: &'a Path,
    /// Fresh per run
    pub build_dir: &'a Path,
    /// Final location of the package in the store
    pub install_dir: &'a Path,
    pub build_type: &'a str,
    pub tool: &'a Arc<dyn BuildTool>,
}

impl StageContext<'_> {
    /// Synthesized environment plus the engine-provided variables.
    ///
    /// Engine variables win over exported ones so a dependency cannot
    /// redirect `INSTALL_DIR` of its dependent.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        let mut env = self.build.environment.clone();
        env.insert("PACKAGE_REF".to_string(), self.build.reference.to_string());
        env.insert(
            "SOURCE_DIR".to_string(),
            self.source_dir.to_string_lossy().to_string(),
        );
        env.insert(
            "BUILD_DIR".to_string(),
            self.build_dir.to_string_lossy().to_string(),
        );
        env.insert(
            "INSTALL_DIR".to_string(),
            self.install_dir.to_string_lossy().to_string(),
        );
        env.insert("BUILD_TYPE".to_string(), self.build_type.to_string());
        env.insert("ARCH".to_string(), std::env::consts::ARCH.to_string());
        env.insert("NPROC".to_string(), num_cpus::get().to_string());
        env
    }
}

/// The four optional lifecycle operations of a recipe.
///
/// Returning `None` means the recipe does not define that hook.
pub trait StageHooks: Send + Sync {
    fn configure(&self, _ctx: &StageContext<'_>) -> Option<HookResult> {
        None
    }

    fn build(&self, _ctx: &StageContext<'_>) -> Option<HookResult> {
        None
    }

    /// Install outputs into `ctx.install_dir` and return the exported env.
    fn package(&self, _ctx: &StageContext<'_>) -> Option<HookResult<ExportedEnv>> {
        None
    }

    fn test(&self, _ctx: &StageContext<'_>) -> Option<HookResult> {
        None
    }
}

/// A recipe with no hooks at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl StageHooks for NoHooks {}

/// A loaded recipe: identity, requirements and hooks.
#[derive(Clone)]
pub struct RecipeNode {
    pub reference: RequirementRef,
    pub requires: Vec<RequirementRef>,
    pub build_requires: Vec<RequirementRef>,
    /// Generator names; empty means the configured defaults
    pub generators: Vec<String>,
    pub source_dir: Option<PathBuf>,
    pub hooks: Arc<dyn StageHooks>,
}

impl RecipeNode {
    pub fn new(reference: RequirementRef) -> Self {
        Self {
            reference,
            requires: Vec::new(),
            build_requires: Vec::new(),
            generators: Vec::new(),
            source_dir: None,
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_requires(mut self, requires: Vec<RequirementRef>) -> Self {
        self.requires = requires;
        self
    }

    pub fn with_build_requires(mut self, build_requires: Vec<RequirementRef>) -> Self {
        self.build_requires = build_requires;
        self
    }

    pub fn with_generators(mut self, generators: Vec<String>) -> Self {
        self.generators = generators;
        self
    }

    pub fn with_source_dir(mut self, dir: PathBuf) -> Self {
        self.source_dir = Some(dir);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn StageHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// `requires` followed by `build_requires`, in declaration order.
    pub fn all_requirements(&self) -> impl Iterator<Item = &RequirementRef> {
        self.requires.iter().chain(self.build_requires.iter())
    }
}

impl fmt::Debug for RecipeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeNode")
            .field("reference", &self.reference)
            .field("requires", &self.requires)
            .field("build_requires", &self.build_requires)
            .field("generators", &self.generators)
            .field("source_dir", &self.source_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> RequirementRef {
        s.parse().unwrap()
    }

    #[test]
    fn test_all_requirements_order() {
        let node = RecipeNode::new(r("app/1.0@u/c"))
            .with_requires(vec![r("a/1@u/c"), r("b/1@u/c")])
            .with_build_requires(vec![r("cmake/3.13.0@conan/stable")]);
        let names: Vec<_> = node.all_requirements().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "cmake"]);
    }

    #[test]
    fn test_no_hooks_defines_nothing() {
        let hooks = NoHooks;
        let build = BuildContext::empty(r("a/1@u/c"));
        let tool: Arc<dyn BuildTool> = Arc::new(crate::tool::NoopTool);
        let ctx = StageContext {
            build: &build,
            source_dir: Path::new("/src"),
            build_dir: Path::new("/build"),
            install_dir: Path::new("/install"),
            build_type: "Release",
            tool: &tool,
        };
        assert!(hooks.configure(&ctx).is_none());
        assert!(hooks.build(&ctx).is_none());
        assert!(hooks.package(&ctx).is_none());
        assert!(hooks.test(&ctx).is_none());
    }

    #[test]
    fn test_process_env_engine_vars_win() {
        let mut build = BuildContext::empty(r("a/1@u/c"));
        build
            .environment
            .insert("INSTALL_DIR".to_string(), "/elsewhere".to_string());
        build
            .environment
            .insert("A_DIR".to_string(), "/install/A".to_string());
        let tool: Arc<dyn BuildTool> = Arc::new(crate::tool::NoopTool);
        let ctx = StageContext {
            build: &build,
            source_dir: Path::new("/src"),
            build_dir: Path::new("/build"),
            install_dir: Path::new("/install/a"),
            build_type: "Debug",
            tool: &tool,
        };
        let env = ctx.process_env();
        assert_eq!(env["INSTALL_DIR"], "/install/a");
        assert_eq!(env["A_DIR"], "/install/A");
        assert_eq!(env["BUILD_TYPE"], "Debug");
        assert_eq!(env["PACKAGE_REF"], "a/1@u/c");
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Build.to_string(), "Build");
        assert_eq!(Stage::Package.as_str(), "package");
    }
}
