//! Rhai recipes
//!
//! A recipe file declares its identity and requirements as top-level
//! variables and may define any of the four lifecycle hooks:
//!
//! ```rhai
//! let name = "libField";
//! let version = "master";
//! let requires = ["boost/1.69.0@conan/stable", "hdf5/1.10.5@cd3/devel"];
//! let build_requires = ["cmake_installer/3.13.0@conan/stable"];
//! let generators = ["cmake", "virtualenv"];
//!
//! fn package(ctx) {
//!     copy("lib/*.a", ctx.install_dir + "/lib");
//!     #{ LIBFIELD_DIR: ctx.install_dir }
//! }
//!
//! fn test(ctx) {
//!     run("./example");
//! }
//! ```
//!
//! `user` and `channel` are optional. Hooks take the stage context map
//! (`name`, `version`, `user`, `channel`, `reference`, `env`, `build_dir`,
//! `source_dir`, `install_dir`, `build_type`) or no argument at all. A hook
//! fails by throwing; `package` returns a map of exported variables.

mod context;
mod helpers;

use crate::config::KitchenConfig;
use crate::recipe::{ExportedEnv, HookResult, RecipeNode, StageContext, StageHooks};
use crate::reference::RequirementRef;
use anyhow::{Context, Result, anyhow};
use context::{HookScope, ScopeGuard};
use rhai::{AST, Array, Dynamic, Engine, EvalAltResult, Map, Scope};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Engine with every recipe helper registered.
pub fn new_engine() -> Engine {
    let mut engine = Engine::new();
    helpers::register_all(&mut engine);
    engine
}

/// A compiled recipe file with its declared metadata.
pub struct RhaiRecipe {
    path: PathBuf,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    name: String,
    version: String,
    user: Option<String>,
    channel: Option<String>,
    requires: Vec<RequirementRef>,
    build_requires: Vec<RequirementRef>,
    generators: Vec<String>,
}

impl RhaiRecipe {
    pub fn load(path: &Path, config: &KitchenConfig) -> Result<Self> {
        let script = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe: {}", path.display()))?;
        Self::from_source(&script, path, config)
    }

    /// Compile `script` as if it were read from `path`.
    pub fn from_source(script: &str, path: &Path, config: &KitchenConfig) -> Result<Self> {
        let engine = new_engine();
        let ast = engine
            .compile(script)
            .map_err(|e| anyhow!("Failed to compile recipe {}: {}", path.display(), e))?;

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| anyhow!("Failed to evaluate recipe {}: {}", path.display(), e))?;

        let name = string_var(&scope, "name")?
            .ok_or_else(|| anyhow!("recipe {} does not declare `name`", path.display()))?;
        let version = string_var(&scope, "version")?
            .ok_or_else(|| anyhow!("recipe {} does not declare `version`", path.display()))?;
        let user = string_var(&scope, "user")?;
        let channel = string_var(&scope, "channel")?;

        let requires = parse_requirements(&list_var(&scope, "requires")?, config)?;
        let build_requires = parse_requirements(&list_var(&scope, "build_requires")?, config)?;
        let generators = list_var(&scope, "generators")?;

        Ok(Self {
            path: path.to_path_buf(),
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            name,
            version,
            user,
            channel,
            requires,
            build_requires,
            generators,
        })
    }

    /// Name and version must match; user and channel only when declared.
    pub fn matches(&self, reference: &RequirementRef) -> bool {
        self.name == reference.name()
            && self.version == reference.version()
            && self.user.as_deref().is_none_or(|u| u == reference.user())
            && self.channel.as_deref().is_none_or(|c| c == reference.channel())
    }

    /// What the file declares, `_` standing in for undeclared parts.
    pub fn declared(&self) -> String {
        format!(
            "{}/{}@{}/{}",
            self.name,
            self.version,
            self.user.as_deref().unwrap_or("_"),
            self.channel.as_deref().unwrap_or("_")
        )
    }

    /// Reference of this recipe when built directly, undeclared parts
    /// taken from the configured defaults.
    pub fn reference(&self, config: &KitchenConfig) -> Result<RequirementRef> {
        Ok(RequirementRef::new(
            self.name.as_str(),
            self.version.as_str(),
            self.user.as_deref().unwrap_or(config.defaults.user.as_str()),
            self.channel.as_deref().unwrap_or(config.defaults.channel.as_str()),
        )?)
    }

    /// Turn into a graph node under `reference`.
    ///
    /// The recipe's directory is the source directory of the build.
    pub fn into_node(self, reference: &RequirementRef) -> RecipeNode {
        let source_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let hooks = ScriptHooks {
            path: self.path,
            engine: self.engine,
            ast: self.ast,
        };
        RecipeNode::new(reference.clone())
            .with_requires(self.requires)
            .with_build_requires(self.build_requires)
            .with_generators(self.generators)
            .with_source_dir(source_dir)
            .with_hooks(Arc::new(hooks))
    }
}

fn string_var(scope: &Scope, name: &str) -> Result<Option<String>> {
    let Some(value) = scope.get(name) else {
        return Ok(None);
    };
    value
        .clone()
        .into_string()
        .map(Some)
        .map_err(|t| anyhow!("`{}` must be a string, got {}", name, t))
}

fn list_var(scope: &Scope, name: &str) -> Result<Vec<String>> {
    let Some(value) = scope.get(name) else {
        return Ok(Vec::new());
    };
    let items: Array = value
        .clone()
        .try_cast::<Array>()
        .ok_or_else(|| anyhow!("`{}` must be an array of strings", name))?;
    items
        .into_iter()
        .map(|item| {
            item.into_string()
                .map_err(|t| anyhow!("`{}` entries must be strings, got {}", name, t))
        })
        .collect()
}

fn parse_requirements(items: &[String], config: &KitchenConfig) -> Result<Vec<RequirementRef>> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(RequirementRef::parse(item, &config.defaults)?);
    }
    Ok(out)
}

/// Hooks backed by functions in a compiled recipe.
struct ScriptHooks {
    path: PathBuf,
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

impl ScriptHooks {
    /// Arity of hook `name`, if defined with zero or one parameter.
    fn arity(&self, name: &str) -> Option<usize> {
        self.ast
            .iter_functions()
            .filter(|f| f.name == name && f.params.len() <= 1)
            .map(|f| f.params.len())
            .max()
    }

    fn call(&self, name: &str, ctx: &StageContext<'_>) -> Option<HookResult<Dynamic>> {
        let arity = self.arity(name)?;
        let _guard = ScopeGuard::enter(HookScope::from_stage(ctx));
        let mut scope = Scope::new();
        let result = if arity == 1 {
            self.engine
                .call_fn::<Dynamic>(&mut scope, &self.ast, name, (context_map(ctx),))
        } else {
            self.engine.call_fn::<Dynamic>(&mut scope, &self.ast, name, ())
        };
        Some(result.map_err(|e| diagnostic(&e)))
    }
}

impl StageHooks for ScriptHooks {
    fn configure(&self, ctx: &StageContext<'_>) -> Option<HookResult> {
        self.call("configure", ctx).map(|r| r.map(|_| ()))
    }

    fn build(&self, ctx: &StageContext<'_>) -> Option<HookResult> {
        self.call("build", ctx).map(|r| r.map(|_| ()))
    }

    fn package(&self, ctx: &StageContext<'_>) -> Option<HookResult<ExportedEnv>> {
        self.call("package", ctx).map(|r| {
            r.and_then(|value| {
                exports(value).map_err(|e| format!("{}: {}", self.path.display(), e))
            })
        })
    }

    fn test(&self, ctx: &StageContext<'_>) -> Option<HookResult> {
        self.call("test", ctx).map(|r| r.map(|_| ()))
    }
}

fn context_map(ctx: &StageContext<'_>) -> Map {
    let text = |value: String| Dynamic::from(value);
    let reference = &ctx.build.reference;
    let env: Map = ctx
        .process_env()
        .into_iter()
        .map(|(k, v)| (k.into(), text(v)))
        .collect();

    let mut map = Map::new();
    map.insert("name".into(), text(reference.name().to_string()));
    map.insert("version".into(), text(reference.version().to_string()));
    map.insert("user".into(), text(reference.user().to_string()));
    map.insert("channel".into(), text(reference.channel().to_string()));
    map.insert("reference".into(), text(reference.to_string()));
    map.insert("env".into(), Dynamic::from_map(env));
    map.insert("build_dir".into(), text(ctx.build_dir.to_string_lossy().to_string()));
    map.insert("source_dir".into(), text(ctx.source_dir.to_string_lossy().to_string()));
    map.insert("install_dir".into(), text(ctx.install_dir.to_string_lossy().to_string()));
    map.insert("build_type".into(), text(ctx.build_type.to_string()));
    map
}

/// `()` exports nothing; a map exports each entry as a string.
fn exports(value: Dynamic) -> Result<ExportedEnv, String> {
    if value.is_unit() {
        return Ok(ExportedEnv::new());
    }
    let map = value
        .try_cast::<Map>()
        .ok_or_else(|| "package() must return a map of exported variables".to_string())?;
    Ok(map
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

/// The thrown value for script errors, the full message otherwise.
fn diagnostic(err: &EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => diagnostic(inner),
        EvalAltResult::ErrorRuntime(value, pos) => {
            let mut msg = value.to_string();
            if !pos.is_none() {
                let _ = write!(msg, " ({})", pos);
            }
            msg
        }
        other => other.to_string(),
    }
}
