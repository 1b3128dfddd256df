//! Kitchen CLI - build, package and test Rhai recipes
//!
//! Usage:
//!   kitchen build <recipe>         Configure and build a recipe and its dependencies
//!   kitchen package <recipe>       Also package and publish the recipe
//!   kitchen test <recipe>          Also run the recipe's test hook
//!   kitchen resolve <recipe>       Show the build order
//!   kitchen info <ref>             Show a published package
//!
//! `<recipe>` is either a path to a `.rhai` file or a reference such as
//! `libField/master@cd3/devel` looked up in the recipes directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kitchen_recipe::{
    DirectoryLoader, DiskStore, Goal, Kitchen, KitchenConfig, KitchenError, PackageStore,
    RecipeLoader, RecipeNode, ReferenceError, RequirementRef, ResolutionError, RhaiRecipe,
    StoreError, output,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_RESOLUTION: u8 = 3;
const EXIT_STORE_CONFLICT: u8 = 4;

/// Default recipes directory (XDG compliant)
fn default_recipes_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("kitchen/recipes")
}

#[derive(Parser)]
#[command(name = "kitchen")]
#[command(about = "Build, package and test Rhai package recipes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to recipes directory
    #[arg(short = 'r', long, global = true, env = "KITCHEN_RECIPES")]
    recipes_path: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, global = true, env = "KITCHEN_CONFIG")]
    config: Option<PathBuf>,

    /// Package store directory
    #[arg(long, global = true, env = "KITCHEN_STORE")]
    store: Option<PathBuf>,

    /// Root of the per-recipe build directories
    #[arg(short, long, global = true)]
    build_dir: Option<PathBuf>,

    /// Number of recipes built concurrently
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Verbose diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure and build a recipe (dependencies are packaged)
    Build {
        /// Recipe file or reference
        recipe: String,
    },

    /// Build, package and publish a recipe
    Package {
        /// Recipe file or reference
        recipe: String,
    },

    /// Build, package and test a recipe
    Test {
        /// Recipe file or reference
        recipe: String,
    },

    /// Show the build order of a recipe's dependency graph
    Resolve {
        /// Recipe file or reference
        recipe: String,
    },

    /// Show a published package
    Info {
        /// Package reference
        reference: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            let code = exit_code_for(&err);
            output::error(&format!("{:#}", err));
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "kitchen_recipe=debug,kitchen=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<KitchenError>() {
        return match err {
            KitchenError::Resolution(err) => resolution_exit_code(err),
            KitchenError::StoreConflict(_) => EXIT_STORE_CONFLICT,
            KitchenError::Store(_) => EXIT_FAILURE,
        };
    }
    // Recipe loading wraps reference errors in context.
    for cause in err.chain() {
        if let Some(err) = cause.downcast_ref::<ResolutionError>() {
            return resolution_exit_code(err);
        }
        if cause.is::<ReferenceError>() {
            return EXIT_RESOLUTION;
        }
    }
    EXIT_FAILURE
}

fn resolution_exit_code(err: &ResolutionError) -> u8 {
    match err {
        ResolutionError::Store { .. } => EXIT_FAILURE,
        _ => EXIT_RESOLUTION,
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let recipes_path = cli.recipes_path.clone().unwrap_or_else(default_recipes_path);

    let store = DiskStore::open(&config.store_dir)
        .with_context(|| format!("Failed to open package store: {}", config.store_dir.display()))?;
    let loader = DirectoryLoader::new(&recipes_path, config.clone());

    match cli.command {
        Commands::Build { recipe } => cook(config, store, loader, &recipe, Goal::Build),
        Commands::Package { recipe } => cook(config, store, loader, &recipe, Goal::Package),
        Commands::Test { recipe } => cook(config, store, loader, &recipe, Goal::Test),

        Commands::Resolve { recipe } => {
            let root = load_root(&recipe, &loader, &config)?;
            let kitchen = Kitchen::new(config, Arc::new(store), Arc::new(loader));
            let graph = kitchen.resolve(root)?;

            output::action(&format!("Build order for {}", graph.root()));
            let order = graph.build_order();
            let total = order.len();
            for (i, reference) in order.into_iter().enumerate() {
                let status = match kitchen.store().find(reference)? {
                    Some(_) => "published",
                    None => "not built",
                };
                output::action_numbered(i + 1, total, &format!("{} ({})", reference, status));
                let deps = graph.direct_dependencies(reference);
                if !deps.is_empty() {
                    let names: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
                    output::detail(&format!("requires {}", names.join(", ")));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Info { reference } => {
            let reference = RequirementRef::parse(&reference, &config.defaults)
                .map_err(ResolutionError::from)?;
            let info = match store.get(&reference) {
                Ok(info) => info,
                Err(StoreError::NotFound(_)) => {
                    output::warning(&format!("{} is not published", reference));
                    return Ok(ExitCode::from(EXIT_FAILURE));
                }
                Err(err) => return Err(err.into()),
            };

            output::action(&info.reference.to_string());
            output::info(&format!("Install path: {}", info.install_path.display()));
            if let Some(digest) = &info.context_digest {
                output::info(&format!("Context:      {}", digest));
            }
            if info.exported_env.is_empty() {
                output::info("Exports:      (none)");
            } else {
                output::info("Exports:");
                for (name, value) in &info.exported_env {
                    output::detail(&format!("{}={}", name, value));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cook(
    config: KitchenConfig,
    store: DiskStore,
    loader: DirectoryLoader,
    recipe: &str,
    goal: Goal,
) -> Result<ExitCode> {
    let root = load_root(recipe, &loader, &config)?;
    let kitchen = Kitchen::new(config, Arc::new(store), Arc::new(loader));
    let report = kitchen.run(root, goal)?;

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_FAILURE))
    }
}

fn load_config(cli: &Cli) -> Result<KitchenConfig> {
    let mut config = KitchenConfig::load(cli.config.as_deref())?;
    if let Some(store) = &cli.store {
        config.store_dir = store.clone();
    }
    if let Some(build_dir) = &cli.build_dir {
        config.build_dir = build_dir.clone();
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs.max(1);
    }
    Ok(config)
}

/// Resolve the CLI argument into the root node: a recipe file, or a
/// reference looked up through the loader.
fn load_root(recipe: &str, loader: &DirectoryLoader, config: &KitchenConfig) -> Result<RecipeNode> {
    if is_recipe_file(recipe) {
        let path = Path::new(recipe);
        if !path.exists() {
            anyhow::bail!("Recipe file not found: {}", recipe);
        }
        let script = RhaiRecipe::load(path, config)?;
        let reference = script.reference(config)?;
        return Ok(script.into_node(&reference));
    }

    let reference =
        RequirementRef::parse(recipe, &config.defaults).map_err(ResolutionError::from)?;
    match loader.load(&reference)? {
        Some(node) => Ok(node),
        None => Err(ResolutionError::RecipeNotFound {
            reference,
            required_by: None,
        }
        .into()),
    }
}

fn is_recipe_file(arg: &str) -> bool {
    arg.ends_with(".rhai") || (!arg.contains('@') && Path::new(arg).is_file())
}
