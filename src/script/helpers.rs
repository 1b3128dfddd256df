//! Functions available to recipe scripts
//!
//! - **build**: `tool_configure()`, `tool_build()`, `run(cmd)`, `run_in(dir, cmd)`
//! - **filesystem**: `mkdir(path)`, `copy(pattern, dest)`, `write_file(path, content)`, `exists(path)`
//! - **env**: `env(name)`
//! - **log**: `log(msg)`
//!
//! Relative paths are resolved against the build directory of the running
//! hook, and commands see the synthesized environment.

use super::context::{self, HookScope};
use crate::tool::run_shell;
use rhai::{Engine, EvalAltResult};
use std::path::Path;
use tracing::info;
use walkdir::WalkDir;

type HelperResult<T = ()> = Result<T, Box<EvalAltResult>>;

pub fn register_all(engine: &mut Engine) {
    engine.register_fn("tool_configure", tool_configure);
    engine.register_fn("tool_build", tool_build);
    engine.register_fn("run", run);
    engine.register_fn("run_in", run_in);

    engine.register_fn("mkdir", mkdir);
    engine.register_fn("copy", copy);
    engine.register_fn("write_file", write_file);
    engine.register_fn("exists", exists);

    engine.register_fn("env", env);
    engine.register_fn("log", log);

    engine.on_print(|msg| info!(target: "kitchen::recipe", "{}", msg));
    engine.on_debug(|msg, _, pos| tracing::debug!(target: "kitchen::recipe", "{} ({})", msg, pos));
}

/// Run the configured build tool's configure step.
pub fn tool_configure() -> HelperResult {
    let scope = context::current()?;
    scope
        .with_stage(|ctx| scope.tool.configure(ctx))
        .map_err(Into::into)
}

/// Run the configured build tool's build step.
pub fn tool_build() -> HelperResult {
    let scope = context::current()?;
    scope
        .with_stage(|ctx| scope.tool.build(ctx))
        .map_err(Into::into)
}

/// Run a shell command in the build directory.
///
/// ```rhai
/// run(`make -j${env("NPROC")}`);
/// ```
pub fn run(cmd: &str) -> HelperResult {
    let scope = context::current()?;
    run_shell(cmd, &scope.build_dir, &scope.env).map_err(Into::into)
}

/// Run a shell command in `dir`.
pub fn run_in(dir: &str, cmd: &str) -> HelperResult {
    let scope = context::current()?;
    run_shell(cmd, &scope.resolve(dir), &scope.env).map_err(Into::into)
}

pub fn mkdir(path: &str) -> HelperResult {
    let scope = context::current()?;
    let dir = scope.resolve(path);
    std::fs::create_dir_all(&dir)
        .map_err(|e| format!("cannot create {}: {}", dir.display(), e).into())
}

/// Copy everything matching `pattern` into the directory `dest`.
///
/// Matched directories are copied recursively. Returns the number of files
/// copied; a pattern matching nothing is an error.
///
/// ```rhai
/// copy("lib/*.a", ctx.install_dir + "/lib");
/// ```
pub fn copy(pattern: &str, dest: &str) -> HelperResult<i64> {
    let scope = context::current()?;
    let pattern_path = scope.resolve(pattern);
    let dest = scope.resolve(dest);

    let matches: Vec<_> = glob::glob(&pattern_path.to_string_lossy())
        .map_err(|e| format!("invalid pattern: {}", e))?
        .filter_map(|r| r.ok())
        .collect();
    if matches.is_empty() {
        return Err(format!("no files match pattern: {}", pattern).into());
    }

    std::fs::create_dir_all(&dest)
        .map_err(|e| format!("cannot create {}: {}", dest.display(), e))?;

    let mut copied = 0;
    for src in &matches {
        let name = src.file_name().ok_or("invalid filename")?;
        copied += copy_tree(src, &dest.join(name))?;
    }
    Ok(copied)
}

fn copy_tree(src: &Path, dest: &Path) -> HelperResult<i64> {
    if src.is_file() {
        std::fs::copy(src, dest).map_err(|e| {
            format!("copy failed: {} -> {}: {}", src.display(), dest.display(), e)
        })?;
        return Ok(1);
    }

    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| format!("cannot walk {}: {}", src.display(), e))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| format!("unexpected path {}: {}", entry.path().display(), e))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| format!("cannot create {}: {}", target.display(), e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                format!(
                    "copy failed: {} -> {}: {}",
                    entry.path().display(),
                    target.display(),
                    e
                )
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

pub fn write_file(path: &str, content: &str) -> HelperResult {
    let scope = context::current()?;
    let file = scope.resolve(path);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    std::fs::write(&file, content)
        .map_err(|e| format!("cannot write {}: {}", file.display(), e).into())
}

pub fn exists(path: &str) -> HelperResult<bool> {
    let scope = context::current()?;
    Ok(scope.resolve(path).exists())
}

/// Stage environment first, then the process environment; empty if unset.
pub fn env(name: &str) -> HelperResult<String> {
    let scope = context::current()?;
    Ok(lookup_env(&scope, name))
}

fn lookup_env(scope: &HookScope, name: &str) -> String {
    scope
        .env
        .get(name)
        .cloned()
        .or_else(|| std::env::var(name).ok())
        .unwrap_or_default()
}

pub fn log(msg: &str) {
    info!(target: "kitchen::recipe", "{}", msg);
}
