//! Recipe loading
//!
//! The resolver asks a [`RecipeLoader`] for the recipe of each requirement.
//! [`DirectoryLoader`] reads Rhai recipes from a recipes directory;
//! [`MemoryLoader`] serves recipes built in code.

use crate::config::KitchenConfig;
use crate::recipe::RecipeNode;
use crate::reference::RequirementRef;
use crate::script::RhaiRecipe;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

pub trait RecipeLoader: Send + Sync {
    /// The recipe for `reference`, or `None` if this loader has none.
    fn load(&self, reference: &RequirementRef) -> Result<Option<RecipeNode>>;
}

/// Recipes registered in code, keyed by reference.
#[derive(Debug, Default, Clone)]
pub struct MemoryLoader {
    recipes: HashMap<RequirementRef, RecipeNode>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: RecipeNode) {
        self.recipes.insert(node.reference.clone(), node);
    }

    pub fn with(mut self, node: RecipeNode) -> Self {
        self.insert(node);
        self
    }
}

impl RecipeLoader for MemoryLoader {
    fn load(&self, reference: &RequirementRef) -> Result<Option<RecipeNode>> {
        Ok(self.recipes.get(reference).cloned())
    }
}

/// Rhai recipes under one directory.
///
/// For `name/version@user/channel` the candidates are, in order:
/// `<dir>/<name>/<version>.rhai`, `<dir>/<name>/<name>.rhai`, `<dir>/<name>.rhai`.
/// A candidate only matches if its declared version (and user/channel, when
/// declared) equal the requested ones.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    recipes_path: PathBuf,
    config: KitchenConfig,
}

impl DirectoryLoader {
    pub fn new(recipes_path: impl Into<PathBuf>, config: KitchenConfig) -> Self {
        Self {
            recipes_path: recipes_path.into(),
            config,
        }
    }

    fn candidates(&self, reference: &RequirementRef) -> Vec<PathBuf> {
        let name = reference.name();
        vec![
            self.recipes_path
                .join(name)
                .join(format!("{}.rhai", reference.version())),
            self.recipes_path.join(name).join(format!("{}.rhai", name)),
            self.recipes_path.join(format!("{}.rhai", name)),
        ]
    }
}

impl RecipeLoader for DirectoryLoader {
    fn load(&self, reference: &RequirementRef) -> Result<Option<RecipeNode>> {
        for path in self.candidates(reference) {
            if !path.is_file() {
                continue;
            }
            let recipe = RhaiRecipe::load(&path, &self.config)
                .with_context(|| format!("Failed to load recipe {}", path.display()))?;
            if recipe.matches(reference) {
                debug!(reference = %reference, path = %path.display(), "loaded recipe");
                return Ok(Some(recipe.into_node(reference)));
            }
            debug!(
                reference = %reference,
                path = %path.display(),
                declared = %recipe.declared(),
                "recipe does not match requested reference"
            );
        }
        Ok(None)
    }
}
