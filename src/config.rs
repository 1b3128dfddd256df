//! Kitchen configuration
//!
//! One explicit [`KitchenConfig`] is threaded through resolution and the
//! lifecycle runner; nothing reads process-wide state after startup.
//!
//! ```toml
//! # kitchen.toml
//! default_user = "local"
//! default_channel = "testing"
//! build_type = "Debug"
//! jobs = 4
//! generators = ["cmake", "virtualenv"]
//!
//! [tool]
//! configure = "cmake -S \"$SOURCE_DIR\" -B . -DCMAKE_BUILD_TYPE=$BUILD_TYPE"
//! build = "cmake --build . --parallel $NPROC"
//! ```

use crate::reference::ReferenceDefaults;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_BUILD_TYPE: &str = "Release";
const DEFAULT_CONFIGURE_CMD: &str =
    "cmake -S \"$SOURCE_DIR\" -B . -DCMAKE_BUILD_TYPE=$BUILD_TYPE -DCMAKE_INSTALL_PREFIX=\"$INSTALL_DIR\"";
const DEFAULT_BUILD_CMD: &str = "cmake --build . --parallel $NPROC";

/// Commands run by the default build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub configure: String,
    pub build: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            configure: DEFAULT_CONFIGURE_CMD.to_string(),
            build: DEFAULT_BUILD_CMD.to_string(),
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct KitchenConfig {
    /// user/channel applied to `name/version` references
    pub defaults: ReferenceDefaults,
    /// Exposed to hooks and the build tool as `BUILD_TYPE`
    pub build_type: String,
    /// Root of the package store
    pub store_dir: PathBuf,
    /// Root under which each recipe gets a fresh build directory
    pub build_dir: PathBuf,
    /// Maximum number of recipes built concurrently
    pub jobs: usize,
    /// Reuse an already-published package instead of packaging again
    pub immutable_publish: bool,
    /// Generators used when a recipe does not declare any
    pub default_generators: Vec<String>,
    pub tool: ToolConfig,
}

impl Default for KitchenConfig {
    fn default() -> Self {
        Self {
            defaults: ReferenceDefaults::default(),
            build_type: DEFAULT_BUILD_TYPE.to_string(),
            store_dir: data_home().join("kitchen/store"),
            build_dir: cache_home().join("kitchen/build"),
            jobs: num_cpus::get().max(1),
            immutable_publish: true,
            default_generators: Vec::new(),
            tool: ToolConfig::default(),
        }
    }
}

impl KitchenConfig {
    /// Defaults rooted in one directory; handy for tests and throwaway runs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            store_dir: root.join("store"),
            build_dir: root.join("build"),
            ..Self::default()
        }
    }

    /// Load configuration from an explicit file, or from the default location
    /// if it exists. A missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        match path {
            Some(path) => config.apply(KitchenToml::read(path)?),
            None => {
                if let Some(path) = default_config_path()
                    && path.exists()
                {
                    config.apply(KitchenToml::read(&path)?);
                }
            }
        }
        Ok(config)
    }

    /// Parse configuration from TOML text on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let parsed: KitchenToml =
            toml::from_str(content).context("Failed to parse kitchen config")?;
        let mut config = Self::default();
        config.apply(parsed);
        Ok(config)
    }

    fn apply(&mut self, file: KitchenToml) {
        if let Some(user) = file.default_user {
            self.defaults.user = user;
        }
        if let Some(channel) = file.default_channel {
            self.defaults.channel = channel;
        }
        if let Some(build_type) = file.build_type {
            self.build_type = build_type;
        }
        if let Some(dir) = file.store_dir {
            self.store_dir = dir;
        }
        if let Some(dir) = file.build_dir {
            self.build_dir = dir;
        }
        if let Some(jobs) = file.jobs {
            self.jobs = jobs.max(1);
        }
        if let Some(immutable) = file.immutable_publish {
            self.immutable_publish = immutable;
        }
        if let Some(generators) = file.generators {
            self.default_generators = generators;
        }
        if let Some(tool) = file.tool {
            if let Some(configure) = tool.configure {
                self.tool.configure = configure;
            }
            if let Some(build) = tool.build {
                self.tool.build = build;
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct KitchenToml {
    default_user: Option<String>,
    default_channel: Option<String>,
    build_type: Option<String>,
    store_dir: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    jobs: Option<usize>,
    immutable_publish: Option<bool>,
    generators: Option<Vec<String>>,
    tool: Option<ToolToml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ToolToml {
    configure: Option<String>,
    build: Option<String>,
}

impl KitchenToml {
    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// `$KITCHEN_CONFIG`, else `$XDG_CONFIG_HOME/kitchen/kitchen.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KITCHEN_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("kitchen/kitchen.toml"))
}

fn data_home() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".local/share"))
}

fn cache_home() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"))
}
