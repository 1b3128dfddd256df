//! Recipe lifecycle runner
//!
//! Runs the stages of one recipe on the calling thread:
//!
//! ```text
//! Pending -> Configuring -> Building -> Packaging -> Testing -> Done
//!     \___________\_____________\____________\________-> Failed
//! ```
//!
//! Each stage runs only if the previous one succeeded. The package stage
//! writes into a staging folder private to this run; the store commits it
//! together with the metadata, so a cancelled or failed run never leaves a
//! half-published package behind. Runs of the same reference take turns on
//! its build directory through a sibling lock file.

use crate::config::KitchenConfig;
use crate::env::{BuildContext, Synthesizer};
use crate::lock::{EntryLock, sibling_lock_path};
use crate::output;
use crate::recipe::{ExportedEnv, HookResult, RecipeNode, Stage, StageContext, StageResult};
use crate::store::{PackageInfo, PackageStore, PutOutcome, StoreError};
use crate::tool::BuildTool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Configuring,
    Building,
    Packaging,
    Testing,
    Done,
    Failed,
}

impl RunState {
    fn entering(stage: Stage) -> Self {
        match stage {
            Stage::Configure => RunState::Configuring,
            Stage::Build => RunState::Building,
            Stage::Package => RunState::Packaging,
            Stage::Test => RunState::Testing,
        }
    }
}

/// Cooperative cancellation, checked before each stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Errors that stop the whole run rather than failing one stage.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    StoreConflict(StoreError),

    #[error("cancelled before {stage} of {reference}")]
    Cancelled {
        reference: String,
        stage: Stage,
        log: Vec<StageResult>,
    },
}

/// Outcome of one recipe's lifecycle.
#[derive(Debug, Clone)]
pub struct LifecycleRun {
    pub state: RunState,
    pub log: Vec<StageResult>,
    /// Published (or reused) package, once the package stage succeeded
    pub package: Option<PackageInfo>,
    /// The package stage reused an already-published package
    pub reused: bool,
    pub build_dir: PathBuf,
}

impl LifecycleRun {
    /// The failed stage, if any.
    pub fn failure(&self) -> Option<&StageResult> {
        self.log.iter().find(|r| !r.is_success())
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Runs lifecycles against one store with one build tool.
pub struct LifecycleRunner<'a> {
    config: &'a KitchenConfig,
    store: &'a dyn PackageStore,
    tool: Arc<dyn BuildTool>,
    synthesizer: Synthesizer,
    cancel: CancelToken,
}

impl<'a> LifecycleRunner<'a> {
    pub fn new(
        config: &'a KitchenConfig,
        store: &'a dyn PackageStore,
        tool: Arc<dyn BuildTool>,
    ) -> Self {
        Self {
            config,
            store,
            tool,
            synthesizer: Synthesizer::new(config.default_generators.clone()),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fresh per-recipe build directory.
    pub fn build_dir(&self, node: &RecipeNode) -> PathBuf {
        node.reference
            .path_segments()
            .iter()
            .fold(self.config.build_dir.clone(), |dir, segment| dir.join(segment))
    }

    /// Run `node` through `last` (`Build`, `Package` or `Test`).
    ///
    /// `deps` is the node's dependency closure in build order; its context is
    /// synthesized here so that a bad generator fails the configure stage.
    pub fn run(
        &self,
        node: &RecipeNode,
        deps: &[PackageInfo],
        last: Stage,
    ) -> Result<LifecycleRun, RunError> {
        let build_dir = self.build_dir(node);
        let mut run = LifecycleRun {
            state: RunState::Pending,
            log: Vec::new(),
            package: None,
            reused: false,
            build_dir: build_dir.clone(),
        };

        let _build_lock = match EntryLock::acquire_file(&sibling_lock_path(&build_dir)) {
            Ok(lock) => lock,
            Err(e) => {
                run.state = RunState::Failed;
                run.log.push(StageResult::failure(
                    Stage::Configure,
                    format!("cannot lock {}: {}", build_dir.display(), e),
                ));
                return Ok(run);
            }
        };

        let build = match self.synthesizer.synthesize(node, deps) {
            Ok(build) => build,
            Err(e) => {
                run.state = RunState::Failed;
                run.log.push(StageResult::failure(Stage::Configure, e.to_string()));
                return Ok(run);
            }
        };

        let source_dir = node.source_dir.clone().unwrap_or_else(|| build_dir.clone());
        let install_dir = self.store.install_path(&node.reference);
        let ctx = StageContext {
            build: &build,
            source_dir: &source_dir,
            build_dir: &build_dir,
            install_dir: &install_dir,
            build_type: &self.config.build_type,
            tool: &self.tool,
        };

        for stage in Stage::ALL {
            if stage_index(stage) > stage_index(last) {
                break;
            }
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled {
                    reference: node.reference.to_string(),
                    stage,
                    log: run.log,
                });
            }
            run.state = RunState::entering(stage);

            let result = match stage {
                Stage::Configure => self.configure(node, &ctx),
                Stage::Build => self.timed(node, stage, || {
                    node.hooks.build(&ctx).unwrap_or_else(|| self.tool.build(&ctx))
                }),
                Stage::Package => self.package(node, &ctx, &mut run)?,
                Stage::Test => match self.test(node, &ctx) {
                    Some(result) => result,
                    None => {
                        debug!(reference = %node.reference, "no test hook");
                        break;
                    }
                },
            };

            match result {
                Ok(()) => run.log.push(StageResult::success(stage)),
                Err(diagnostic) => {
                    warn!(reference = %node.reference, stage = stage.as_str(), "stage failed");
                    run.log.push(StageResult::failure(stage, diagnostic));
                    run.state = RunState::Failed;
                    return Ok(run);
                }
            }
        }

        run.state = RunState::Done;
        Ok(run)
    }

    /// Show a spinner around a blocking hook call.
    fn timed(&self, node: &RecipeNode, stage: Stage, f: impl FnOnce() -> HookResult) -> HookResult {
        let label = format!("{}: {}", node.reference.name(), stage.as_str());
        let pb = output::stage_spinner(&label);
        let result = f();
        match &result {
            Ok(()) => output::progress_success(pb, &label),
            Err(_) => output::progress_fail(pb, &format!("{} failed", label)),
        }
        result
    }

    fn configure(&self, node: &RecipeNode, ctx: &StageContext<'_>) -> HookResult {
        prepare_build_dir(ctx.build_dir, ctx.build)?;
        self.timed(node, Stage::Configure, || {
            node.hooks
                .configure(ctx)
                .unwrap_or_else(|| self.tool.configure(ctx))
        })
    }

    fn package(
        &self,
        node: &RecipeNode,
        ctx: &StageContext<'_>,
        run: &mut LifecycleRun,
    ) -> Result<HookResult, RunError> {
        let reference = &node.reference;

        if self.config.immutable_publish {
            match self.store.find(reference) {
                Ok(Some(existing)) => {
                    output::skip(&format!("{} already published, reusing", reference));
                    run.package = Some(existing);
                    run.reused = true;
                    return Ok(Ok(()));
                }
                Ok(None) => {}
                Err(e) => return Ok(Err(e.to_string())),
            }
        }

        // Removed on drop unless the store renamed it into place.
        let staging = match self.store.stage(reference) {
            Ok(dir) => dir,
            Err(e) => return Ok(Err(e.to_string())),
        };
        let staged_ctx = StageContext {
            install_dir: staging.path(),
            ..*ctx
        };

        let mut exported = ExportedEnv::new();
        let hook = self.timed(node, Stage::Package, || match node.hooks.package(&staged_ctx) {
            Some(Ok(env)) => {
                exported = env;
                Ok(())
            }
            Some(Err(diagnostic)) => Err(diagnostic),
            None => Ok(()),
        });
        if let Err(diagnostic) = hook.and_then(|()| validate_exports(&exported)) {
            return Ok(Err(diagnostic));
        }

        let install_path = self.store.install_path(reference);
        let info = PackageInfo::new(
            reference.clone(),
            install_path.clone(),
            relocate(exported, staging.path(), &install_path),
        )
        .with_context_digest(ctx.build.digest());

        match self.store.publish(info.clone(), staging.path()) {
            Ok(PutOutcome::Published) => {
                info!(reference = %reference, path = %install_path.display(), "package published");
            }
            Ok(PutOutcome::Unchanged) => {
                debug!(reference = %reference, "identical package already published");
            }
            Err(e @ StoreError::Conflict { .. }) => return Err(RunError::StoreConflict(e)),
            Err(e) => return Ok(Err(e.to_string())),
        }
        run.package = Some(info);
        Ok(Ok(()))
    }

    fn test(&self, node: &RecipeNode, ctx: &StageContext<'_>) -> Option<HookResult> {
        let label = format!("{}: test", node.reference.name());
        let pb = output::stage_spinner(&label);
        let result = node.hooks.test(ctx);
        match &result {
            Some(Ok(())) => output::progress_success(pb, &label),
            Some(Err(_)) => output::progress_fail(pb, &format!("{} failed", label)),
            None => output::progress_done(pb),
        }
        result
    }
}

fn stage_index(stage: Stage) -> usize {
    Stage::ALL.iter().position(|s| *s == stage).unwrap_or(0)
}

fn reset_dir(dir: &Path) -> HookResult {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .map_err(|e| format!("cannot clear {}: {}", dir.display(), e))?;
    }
    std::fs::create_dir_all(dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))
}

/// Empty the build directory and write the generator files into it.
fn prepare_build_dir(build_dir: &Path, build: &BuildContext) -> HookResult {
    reset_dir(build_dir)?;
    for file in &build.generator_files {
        let path = build_dir.join(&file.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
        }
        std::fs::write(&path, &file.content)
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        debug!(path = %path.display(), "wrote generator file");
    }
    Ok(())
}

/// Exported names must be usable as environment variable names.
fn validate_exports(env: &ExportedEnv) -> HookResult {
    for key in env.keys() {
        let mut chars = key.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(format!("invalid exported variable name '{}'", key));
        }
    }
    Ok(())
}

/// Rewrite values pointing into the staging folder to the final install path.
fn relocate(env: ExportedEnv, staging: &Path, install: &Path) -> ExportedEnv {
    env.into_iter()
        .map(|(key, value)| {
            let relocated = match Path::new(&value).strip_prefix(staging) {
                Ok(rest) if rest.as_os_str().is_empty() => install.to_string_lossy().to_string(),
                Ok(rest) => install.join(rest).to_string_lossy().to_string(),
                Err(_) => value,
            };
            (key, relocated)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{StageHooks, StageStatus};
    use crate::reference::RequirementRef;
    use crate::store::{DiskStore, MemoryStore};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    fn r(s: &str) -> RequirementRef {
        s.parse().unwrap()
    }

    /// Records tool calls; optionally fails one step.
    #[derive(Default)]
    struct StubTool {
        calls: Mutex<Vec<&'static str>>,
        fail_build: bool,
    }

    impl BuildTool for StubTool {
        fn configure(&self, _ctx: &StageContext<'_>) -> HookResult {
            self.calls.lock().unwrap().push("configure");
            Ok(())
        }

        fn build(&self, _ctx: &StageContext<'_>) -> HookResult {
            self.calls.lock().unwrap().push("build");
            if self.fail_build {
                Err("make: *** [all] Error 2".to_string())
            } else {
                Ok(())
            }
        }
    }

    /// Package hook exporting `<NAME>_DIR`, optional test hook.
    struct ExportingHooks {
        var: &'static str,
        test_result: Option<HookResult>,
        seen_env: Mutex<Option<BTreeMap<String, String>>>,
    }

    impl ExportingHooks {
        fn new(var: &'static str) -> Self {
            Self {
                var,
                test_result: None,
                seen_env: Mutex::new(None),
            }
        }
    }

    impl StageHooks for ExportingHooks {
        fn configure(&self, ctx: &StageContext<'_>) -> Option<HookResult> {
            *self.seen_env.lock().unwrap() = Some(ctx.process_env());
            Some(Ok(()))
        }

        fn package(&self, ctx: &StageContext<'_>) -> Option<HookResult<ExportedEnv>> {
            std::fs::create_dir_all(ctx.install_dir.join("lib")).unwrap();
            std::fs::write(ctx.install_dir.join("lib/lib.a"), "archive").unwrap();
            let mut env = ExportedEnv::new();
            env.insert(
                self.var.to_string(),
                ctx.install_dir.join("share/cmake").to_string_lossy().to_string(),
            );
            Some(Ok(env))
        }

        fn test(&self, _ctx: &StageContext<'_>) -> Option<HookResult> {
            self.test_result.clone()
        }
    }

    /// Package hook that stages its files slowly, tracking overlapping calls.
    #[derive(Default)]
    struct SlowPackage {
        inside: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl StageHooks for SlowPackage {
        fn package(&self, ctx: &StageContext<'_>) -> Option<HookResult<ExportedEnv>> {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            let lib = ctx.install_dir.join("lib");
            std::fs::create_dir_all(&lib).unwrap();
            std::fs::write(lib.join("one.a"), "one").unwrap();
            std::thread::sleep(Duration::from_millis(300));
            std::fs::write(lib.join("two.a"), "two").unwrap();
            self.inside.fetch_sub(1, Ordering::SeqCst);
            let mut env = ExportedEnv::new();
            env.insert("A_DIR".to_string(), ctx.install_dir.to_string_lossy().to_string());
            Some(Ok(env))
        }
    }

    fn package_on_disk(config: &KitchenConfig, node: &RecipeNode) -> LifecycleRun {
        let store = DiskStore::open(config.store_dir.clone()).unwrap();
        let runner = LifecycleRunner::new(config, &store, Arc::new(StubTool::default()));
        runner.run(node, &[], Stage::Package).unwrap()
    }

    /// Package `node` from two threads, the second starting 100ms later.
    fn package_twice(configs: [&KitchenConfig; 2], node: &RecipeNode) -> [LifecycleRun; 2] {
        std::thread::scope(|s| {
            let first = s.spawn(|| package_on_disk(configs[0], node));
            let second = s.spawn(|| {
                std::thread::sleep(Duration::from_millis(100));
                package_on_disk(configs[1], node)
            });
            [first.join().unwrap(), second.join().unwrap()]
        })
    }

    fn setup() -> (TempDir, KitchenConfig, MemoryStore) {
        let dir = TempDir::new().unwrap();
        let config = KitchenConfig::rooted_at(dir.path());
        let store = MemoryStore::new(config.store_dir.clone());
        (dir, config, store)
    }

    fn stages(run: &LifecycleRun) -> Vec<(Stage, StageStatus)> {
        run.log.iter().map(|r| (r.stage, r.status)).collect()
    }

    #[test]
    fn test_defaults_to_build_tool() {
        let (_dir, config, store) = setup();
        let tool = Arc::new(StubTool::default());
        let runner = LifecycleRunner::new(&config, &store, tool.clone());
        let node = RecipeNode::new(r("a/1.0@u/c"));

        let run = runner.run(&node, &[], Stage::Package).unwrap();
        assert!(run.is_done());
        assert_eq!(*tool.calls.lock().unwrap(), vec!["configure", "build"]);
        assert_eq!(
            stages(&run),
            vec![
                (Stage::Configure, StageStatus::Success),
                (Stage::Build, StageStatus::Success),
                (Stage::Package, StageStatus::Success),
            ]
        );
        let info = run.package.unwrap();
        assert!(info.exported_env.is_empty());
        assert_eq!(store.get(&node.reference).unwrap(), info);
    }

    #[test]
    fn test_build_goal_stops_before_package() {
        let (_dir, config, store) = setup();
        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let node = RecipeNode::new(r("a/1.0@u/c"));
        let run = runner.run(&node, &[], Stage::Build).unwrap();
        assert!(run.is_done());
        assert_eq!(run.log.len(), 2);
        assert!(store.find(&node.reference).unwrap().is_none());
    }

    #[test]
    fn test_build_failure_stops_lifecycle() {
        let (_dir, config, store) = setup();
        let tool = Arc::new(StubTool {
            fail_build: true,
            ..Default::default()
        });
        let runner = LifecycleRunner::new(&config, &store, tool);
        let node =
            RecipeNode::new(r("a/1.0@u/c")).with_hooks(Arc::new(ExportingHooks::new("A_DIR")));

        let run = runner.run(&node, &[], Stage::Test).unwrap();
        assert_eq!(run.state, RunState::Failed);
        let failure = run.failure().unwrap();
        assert_eq!(failure.stage, Stage::Build);
        assert!(failure.diagnostic.as_deref().unwrap().contains("Error 2"));
        assert_eq!(run.log.len(), 2);
        assert!(store.find(&node.reference).unwrap().is_none());
    }

    #[test]
    fn test_exports_relocated_to_install_path() {
        let (_dir, config, store) = setup();
        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let node =
            RecipeNode::new(r("a/1.0@u/c")).with_hooks(Arc::new(ExportingHooks::new("A_DIR")));

        let run = runner.run(&node, &[], Stage::Package).unwrap();
        let info = run.package.unwrap();
        let install = store.install_path(&node.reference);
        assert_eq!(info.install_path, install);
        assert_eq!(
            info.exported_env["A_DIR"],
            install.join("share/cmake").to_string_lossy()
        );
        assert!(install.join("lib/lib.a").exists());
        let entry = install.parent().unwrap();
        let leftovers = std::fs::read_dir(entry)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging"))
            .count();
        assert_eq!(leftovers, 0);
        assert!(info.context_digest.is_some());
    }

    #[test]
    fn test_dependency_env_visible_at_configure() {
        let (_dir, config, store) = setup();
        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let hooks = Arc::new(ExportingHooks::new("B_DIR"));
        let node = RecipeNode::new(r("b/1.0@u/c")).with_hooks(hooks.clone());
        let dep = PackageInfo::new(
            r("a/1.0@user/stable"),
            PathBuf::from("/install/A"),
            [("A_DIR".to_string(), "/install/A".to_string())].into_iter().collect(),
        );

        runner.run(&node, &[dep], Stage::Build).unwrap();
        let seen = hooks.seen_env.lock().unwrap().clone().unwrap();
        assert_eq!(seen["A_DIR"], "/install/A");
    }

    #[test]
    fn test_generator_files_written_before_configure() {
        let (_dir, mut config, store) = setup();
        config.default_generators = vec!["cmake".to_string()];
        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let node = RecipeNode::new(r("a/1.0@u/c"));
        let run = runner.run(&node, &[], Stage::Configure).unwrap();
        assert!(run.build_dir.join("kitchenbuildinfo.cmake").exists());
    }

    #[test]
    fn test_unknown_generator_fails_configure() {
        let (_dir, config, store) = setup();
        let tool = Arc::new(StubTool::default());
        let runner = LifecycleRunner::new(&config, &store, tool.clone());
        let node = RecipeNode::new(r("a/1.0@u/c")).with_generators(vec!["premake".to_string()]);
        let run = runner.run(&node, &[], Stage::Package).unwrap();
        assert_eq!(run.failure().unwrap().stage, Stage::Configure);
        assert!(tool.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_immutable_publish_reuses_existing() {
        let (_dir, config, store) = setup();
        let reference = r("a/1.0@u/c");
        let existing =
            PackageInfo::new(reference.clone(), PathBuf::from("/prebuilt/a"), BTreeMap::new());
        store.put(&reference, existing.clone()).unwrap();

        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let node = RecipeNode::new(reference).with_hooks(Arc::new(ExportingHooks::new("A_DIR")));
        let run = runner.run(&node, &[], Stage::Package).unwrap();
        assert!(run.reused);
        assert_eq!(run.package, Some(existing));
    }

    #[test]
    fn test_republish_with_drift_is_store_conflict() {
        let (_dir, mut config, store) = setup();
        config.immutable_publish = false;
        let reference = r("a/1.0@u/c");
        store
            .put(
                &reference,
                PackageInfo::new(
                    reference.clone(),
                    store.install_path(&reference),
                    BTreeMap::new(),
                ),
            )
            .unwrap();

        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let node = RecipeNode::new(reference).with_hooks(Arc::new(ExportingHooks::new("A_DIR")));
        let err = runner.run(&node, &[], Stage::Package).unwrap_err();
        assert!(matches!(err, RunError::StoreConflict(StoreError::Conflict { .. })));
    }

    #[test]
    fn test_failed_test_keeps_package() {
        let (_dir, config, store) = setup();
        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let mut hooks = ExportingHooks::new("A_DIR");
        hooks.test_result = Some(Err("example exited with 1".to_string()));
        let node = RecipeNode::new(r("a/1.0@u/c")).with_hooks(Arc::new(hooks));

        let run = runner.run(&node, &[], Stage::Test).unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failure().unwrap().stage, Stage::Test);
        assert!(store.find(&node.reference).unwrap().is_some());
    }

    #[test]
    fn test_missing_test_hook_is_done() {
        let (_dir, config, store) = setup();
        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let node = RecipeNode::new(r("a/1.0@u/c"));
        let run = runner.run(&node, &[], Stage::Test).unwrap();
        assert!(run.is_done());
        assert_eq!(run.log.len(), 3);
    }

    #[test]
    fn test_cancelled_before_start() {
        let (_dir, config, store) = setup();
        let cancel = CancelToken::new();
        cancel.cancel();
        let tool = Arc::new(StubTool::default());
        let runner = LifecycleRunner::new(&config, &store, tool.clone()).with_cancel_token(cancel);
        let err = runner
            .run(&RecipeNode::new(r("a/1.0@u/c")), &[], Stage::Package)
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled { stage: Stage::Configure, .. }));
        assert!(tool.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_export_name_fails_package() {
        struct BadExport;
        impl StageHooks for BadExport {
            fn package(&self, _ctx: &StageContext<'_>) -> Option<HookResult<ExportedEnv>> {
                Some(Ok([("1BAD-NAME".to_string(), "/x".to_string())].into_iter().collect()))
            }
        }
        let (_dir, config, store) = setup();
        let runner = LifecycleRunner::new(&config, &store, Arc::new(StubTool::default()));
        let node = RecipeNode::new(r("a/1.0@u/c")).with_hooks(Arc::new(BadExport));
        let run = runner.run(&node, &[], Stage::Package).unwrap();
        assert_eq!(run.failure().unwrap().stage, Stage::Package);
        assert!(store.find(&node.reference).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_writers_publish_complete_package() {
        let dir = TempDir::new().unwrap();
        let config_a = KitchenConfig::rooted_at(dir.path());
        let mut config_b = config_a.clone();
        config_b.build_dir = dir.path().join("other-build");
        let node = RecipeNode::new(r("a/1.0@u/c")).with_hooks(Arc::new(SlowPackage::default()));

        let runs = package_twice([&config_a, &config_b], &node);
        assert!(runs.iter().all(LifecycleRun::is_done));

        let store = DiskStore::open(config_a.store_dir.clone()).unwrap();
        let info = store.get(&node.reference).unwrap();
        assert!(info.install_path.join("lib/one.a").exists());
        assert!(info.install_path.join("lib/two.a").exists());
        assert_eq!(info.exported_env["A_DIR"], info.install_path.to_string_lossy());
    }

    #[test]
    fn test_runs_sharing_build_dir_take_turns() {
        let (dir, config, _store) = setup();
        let hooks = Arc::new(SlowPackage::default());
        let node = RecipeNode::new(r("a/1.0@u/c")).with_hooks(hooks.clone());

        let runs = package_twice([&config, &config], &node);
        assert!(runs.iter().all(LifecycleRun::is_done));
        assert_eq!(hooks.max_seen.load(Ordering::SeqCst), 1);

        let store = DiskStore::open(dir.path().join("store")).unwrap();
        let install = store.get(&node.reference).unwrap().install_path;
        assert!(install.join("lib/one.a").exists());
        assert!(install.join("lib/two.a").exists());
    }

    #[test]
    fn test_relocate() {
        let env: ExportedEnv = [
            ("A".to_string(), "/store/.staging".to_string()),
            ("B".to_string(), "/store/.staging/lib".to_string()),
            ("C".to_string(), "/usr/lib".to_string()),
        ]
        .into_iter()
        .collect();
        let out = relocate(env, Path::new("/store/.staging"), Path::new("/store/package"));
        assert_eq!(out["A"], "/store/package");
        assert_eq!(out["B"], "/store/package/lib");
        assert_eq!(out["C"], "/usr/lib");
    }
}
