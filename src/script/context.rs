//! Hook execution scope for script helpers
//!
//! Helpers registered with the Rhai engine are plain functions; the stage
//! they run in is found through a thread-local scope installed around each
//! hook call.

use crate::env::BuildContext;
use crate::recipe::StageContext;
use crate::tool::BuildTool;
use rhai::EvalAltResult;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What helpers see of the running stage.
#[derive(Clone)]
pub struct HookScope {
    pub build: Arc<BuildContext>,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub install_dir: PathBuf,
    pub build_type: String,
    pub tool: Arc<dyn BuildTool>,
    /// `process_env()` of the stage, computed once
    pub env: BTreeMap<String, String>,
}

impl HookScope {
    pub fn from_stage(ctx: &StageContext<'_>) -> Self {
        Self {
            build: Arc::new(ctx.build.clone()),
            source_dir: ctx.source_dir.to_path_buf(),
            build_dir: ctx.build_dir.to_path_buf(),
            install_dir: ctx.install_dir.to_path_buf(),
            build_type: ctx.build_type.to_string(),
            tool: Arc::clone(ctx.tool),
            env: ctx.process_env(),
        }
    }

    /// Relative paths are taken from the build directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.build_dir.join(p)
        }
    }

    /// Rebuild a stage context borrowing from this scope.
    pub fn with_stage<R>(&self, f: impl FnOnce(&StageContext<'_>) -> R) -> R {
        let ctx = StageContext {
            build: &self.build,
            source_dir: &self.source_dir,
            build_dir: &self.build_dir,
            install_dir: &self.install_dir,
            build_type: &self.build_type,
            tool: &self.tool,
        };
        f(&ctx)
    }
}

thread_local! {
    static SCOPE: RefCell<Option<HookScope>> = const { RefCell::new(None) };
}

fn set_scope(scope: Option<HookScope>) -> Option<HookScope> {
    SCOPE.with(|s| std::mem::replace(&mut *s.borrow_mut(), scope))
}

/// Installs a scope for the current thread and restores the previous one
/// when dropped, including on panic.
pub struct ScopeGuard {
    previous: Option<HookScope>,
}

impl ScopeGuard {
    pub fn enter(scope: HookScope) -> Self {
        Self {
            previous: set_scope(Some(scope)),
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        set_scope(self.previous.take());
    }
}

/// Clone of the active scope.
///
/// Helpers call back into the build tool, which may take a while; the
/// thread-local is never borrowed across that call.
pub fn current() -> Result<HookScope, Box<EvalAltResult>> {
    SCOPE.with(|s| {
        s.borrow()
            .clone()
            .ok_or_else(|| "helper called outside of a lifecycle hook".into())
    })
}
