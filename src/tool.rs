//! External build tool
//!
//! The runner never spawns processes itself: configure and build go through a
//! [`BuildTool`], so the lifecycle can be exercised with stub tools. The
//! default [`CommandTool`] runs configured shell commands in the build
//! directory with the synthesized environment.

use crate::config::ToolConfig;
use crate::recipe::{HookResult, StageContext};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Lines of stderr kept in a failure diagnostic
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// The native build tool collaborator. Opaque beyond pass/fail + diagnostic.
pub trait BuildTool: Send + Sync {
    fn configure(&self, ctx: &StageContext<'_>) -> HookResult;
    fn build(&self, ctx: &StageContext<'_>) -> HookResult;
}

/// Runs `sh -c <command>` for each step.
#[derive(Debug, Clone)]
pub struct CommandTool {
    config: ToolConfig,
}

impl CommandTool {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }
}

impl BuildTool for CommandTool {
    fn configure(&self, ctx: &StageContext<'_>) -> HookResult {
        run_shell(&self.config.configure, ctx.build_dir, &ctx.process_env())
    }

    fn build(&self, ctx: &StageContext<'_>) -> HookResult {
        run_shell(&self.config.build, ctx.build_dir, &ctx.process_env())
    }
}

/// A tool that succeeds without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTool;

impl BuildTool for NoopTool {
    fn configure(&self, _ctx: &StageContext<'_>) -> HookResult {
        Ok(())
    }

    fn build(&self, _ctx: &StageContext<'_>) -> HookResult {
        Ok(())
    }
}

/// Run a shell command in `dir` with `env` layered over the inherited
/// environment. Output is captured; a failure returns the stderr tail.
pub fn run_shell(cmd: &str, dir: &Path, env: &BTreeMap<String, String>) -> HookResult {
    debug!(command = cmd, dir = %dir.display(), "running shell command");

    let output = Command::new("sh")
        .args(["-c", cmd])
        .current_dir(dir)
        .envs(env)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("command failed to start: {}\n  command: {}", e, cmd))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.is_empty() {
        debug!(command = cmd, "stdout:\n{}", stdout.trim_end());
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES)..].join("\n");
        let mut diagnostic = format!(
            "command failed with exit code: {:?}\n  command: {}\n  in: {}",
            output.status.code(),
            cmd,
            dir.display()
        );
        if !tail.is_empty() {
            diagnostic.push('\n');
            diagnostic.push_str(&tail);
        }
        return Err(diagnostic);
    }

    Ok(())
}
