//! Declarative package-recipe engine
//!
//! A recipe names a package (`name/version@user/channel`), lists what it
//! requires, and may define four lifecycle hooks. The [`Kitchen`] resolves the
//! dependency graph, synthesizes each recipe's build environment from the
//! packages it depends on, runs configure → build → package → test, and
//! publishes the result into a [`PackageStore`] that dependents read from.
//!
//! # Example Recipe
//!
//! ```rhai
//! let name = "libField";
//! let version = "master";
//! let requires = ["boost/1.69.0@conan/stable", "hdf5/1.10.5@cd3/devel"];
//! let generators = ["cmake", "virtualenv"];
//!
//! // configure() and build() default to the configured build tool
//!
//! fn package(ctx) {
//!     copy("lib/*.a", ctx.install_dir + "/lib");
//!     copy(ctx.source_dir + "/include/*", ctx.install_dir + "/include");
//!     #{ LIBFIELD_DIR: ctx.install_dir + "/share/cmake" }
//! }
//! ```
//!
//! # Engine-Provided Functions
//!
//! - `tool_configure()`, `tool_build()` - Run the configured build tool
//! - `run(cmd)`, `run_in(dir, cmd)` - Execute a shell command
//! - `mkdir(path)`, `copy(pattern, dest)`, `write_file(path, content)`, `exists(path)`
//! - `env(name)` - Read the synthesized environment
//! - `log(msg)`
//!
//! # Variables Available to Commands
//!
//! - `PACKAGE_REF`, `SOURCE_DIR`, `BUILD_DIR`, `INSTALL_DIR`, `BUILD_TYPE`
//! - `ARCH` - Target architecture (x86_64, aarch64)
//! - `NPROC` - Number of CPUs
//! - every variable exported by a dependency

pub mod config;
pub mod engine;
pub mod env;
pub mod generators;
pub mod lifecycle;
pub mod loader;
mod lock;
pub mod output;
pub mod recipe;
pub mod reference;
pub mod resolve;
pub mod script;
pub mod store;
pub mod tool;

pub use config::KitchenConfig;
pub use engine::{Goal, Kitchen, KitchenError, NodeOutcome, NodeReport, RunReport};
pub use env::{BuildContext, Synthesizer};
pub use lifecycle::{CancelToken, LifecycleRunner};
pub use loader::{DirectoryLoader, MemoryLoader, RecipeLoader};
pub use recipe::{RecipeNode, Stage, StageContext, StageHooks, StageResult, StageStatus};
pub use reference::{ReferenceDefaults, ReferenceError, RequirementRef};
pub use resolve::{DependencyGraph, ResolutionError, Resolver};
pub use script::RhaiRecipe;
pub use store::{DiskStore, MemoryStore, PackageInfo, PackageStore, StoreError};
pub use tool::{BuildTool, CommandTool, NoopTool};
