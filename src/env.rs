//! Build environment synthesis
//!
//! Turns the published info of a recipe's dependencies into the
//! [`BuildContext`] its lifecycle runs with. Pure: returns data, writes
//! nothing.
//!
//! Merge policy: dependencies are applied in the order given (the graph's
//! dependency order, `build_requires` last) and a later export of the same
//! variable replaces an earlier one.

use crate::generators::{self, GeneratorInput};
use crate::recipe::RecipeNode;
use crate::reference::RequirementRef;
use crate::store::PackageInfo;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

/// A file the runner writes into the build directory before configuring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorFile {
    /// Relative to the build directory
    pub path: PathBuf,
    pub content: String,
}

/// Per-run environment of one recipe. Never mutated after synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub reference: RequirementRef,
    pub environment: BTreeMap<String, String>,
    pub generator_files: Vec<GeneratorFile>,
}

impl BuildContext {
    /// A context with no dependencies.
    pub fn empty(reference: RequirementRef) -> Self {
        Self {
            reference,
            environment: BTreeMap::new(),
            generator_files: Vec::new(),
        }
    }

    /// sha256 over the reference, environment and generator files.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.reference.to_string().as_bytes());
        hasher.update([0]);
        for (key, value) in &self.environment {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        for file in &self.generator_files {
            hasher.update(file.path.to_string_lossy().as_bytes());
            hasher.update([0]);
            hasher.update(file.content.as_bytes());
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("unknown generator '{name}' requested by {reference}")]
    UnknownGenerator {
        name: String,
        reference: RequirementRef,
    },
}

/// Computes build contexts.
#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    default_generators: Vec<String>,
}

impl Synthesizer {
    /// `default_generators` apply to recipes that declare none.
    pub fn new(default_generators: Vec<String>) -> Self {
        Self { default_generators }
    }

    /// Build the context for `node` from its resolved dependencies, given in
    /// dependency order.
    pub fn synthesize(
        &self,
        node: &RecipeNode,
        resolved_deps: &[PackageInfo],
    ) -> Result<BuildContext, SynthesisError> {
        let environment = merge_exports(resolved_deps);

        let names = if node.generators.is_empty() {
            &self.default_generators
        } else {
            &node.generators
        };

        let input = GeneratorInput {
            reference: &node.reference,
            dependencies: resolved_deps,
            environment: &environment,
        };

        let mut generator_files = Vec::new();
        for name in names {
            let generator =
                generators::lookup(name).ok_or_else(|| SynthesisError::UnknownGenerator {
                    name: name.clone(),
                    reference: node.reference.clone(),
                })?;
            generator_files.extend(generator.generate(&input));
        }

        Ok(BuildContext {
            reference: node.reference.clone(),
            environment,
            generator_files,
        })
    }
}

/// Last-wins merge of exported environments.
fn merge_exports(deps: &[PackageInfo]) -> BTreeMap<String, String> {
    let mut environment: BTreeMap<String, String> = BTreeMap::new();
    let mut origin: BTreeMap<&str, &RequirementRef> = BTreeMap::new();

    for info in deps {
        for (key, value) in &info.exported_env {
            if let Some(previous) = environment.get(key)
                && previous != value
            {
                warn!(
                    variable = key.as_str(),
                    overridden = %origin[key.as_str()],
                    by = %info.reference,
                    "exported variable overridden by a later dependency"
                );
            }
            environment.insert(key.clone(), value.clone());
            origin.insert(key.as_str(), &info.reference);
        }
    }

    environment
}
