//! Common test utilities.

#![allow(dead_code)]

use kitchen_recipe::config::ToolConfig;
use kitchen_recipe::{BuildTool, CommandTool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Create a test environment with an empty recipes directory
pub fn create_test_env() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let recipes_dir = dir.path().join("recipes");
    std::fs::create_dir_all(&recipes_dir).unwrap();
    (dir, recipes_dir)
}

/// Write `<name>.rhai` into `dir` and return its path
pub fn write_recipe(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(format!("{}.rhai", name));
    std::fs::write(&path, content).unwrap();
    path
}

/// Build tool that records each step in `tool.log` instead of invoking cmake
pub fn shell_tool() -> Arc<dyn BuildTool> {
    Arc::new(CommandTool::new(shell_tool_config()))
}

pub fn shell_tool_config() -> ToolConfig {
    ToolConfig {
        configure: "echo configure >> tool.log".to_string(),
        build: "echo build >> tool.log".to_string(),
    }
}
