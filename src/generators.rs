//! Generator files
//!
//! A generator turns the resolved dependency set into a file the build tool
//! understands. The synthesizer decides what goes in (dependency references,
//! install paths, exported variables); each generator only decides the
//! serialization.
//!
//! | name         | files                                   |
//! |--------------|-----------------------------------------|
//! | `cmake`      | `kitchenbuildinfo.cmake`                |
//! | `virtualenv` | `activate.sh`, `deactivate.sh`          |
//! | `json`       | `kitchenbuildinfo.json`                 |

use crate::env::GeneratorFile;
use crate::reference::RequirementRef;
use crate::store::PackageInfo;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Data handed to every generator.
pub struct GeneratorInput<'a> {
    pub reference: &'a RequirementRef,
    /// In dependency order
    pub dependencies: &'a [PackageInfo],
    /// Merged environment
    pub environment: &'a BTreeMap<String, String>,
}

pub trait Generator: Sync {
    fn name(&self) -> &'static str;
    fn generate(&self, input: &GeneratorInput<'_>) -> Vec<GeneratorFile>;
}

static GENERATORS: &[&dyn Generator] = &[&CmakeGenerator, &VirtualEnvGenerator, &JsonGenerator];

/// Find a generator by name.
pub fn lookup(name: &str) -> Option<&'static dyn Generator> {
    GENERATORS.iter().copied().find(|g| g.name() == name)
}

/// `KITCHEN_<NAME>`: uppercase, anything non-alphanumeric becomes `_`.
fn variable_prefix(name: &str) -> String {
    let mut out = String::from("KITCHEN_");
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out
}

/// One prefix per dependency. A name published under several user/channel
/// pairs gets `_<USER>_<CHANNEL>` appended so its variables stay apart.
fn dependency_prefixes(deps: &[PackageInfo]) -> Vec<String> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for dep in deps {
        *seen.entry(dep.reference.name()).or_default() += 1;
    }
    deps.iter()
        .map(|dep| {
            let reference = &dep.reference;
            if seen[reference.name()] > 1 {
                variable_prefix(&format!(
                    "{}_{}_{}",
                    reference.name(),
                    reference.user(),
                    reference.channel()
                ))
            } else {
                variable_prefix(reference.name())
            }
        })
        .collect()
}

fn cmake_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '$' => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub struct CmakeGenerator;

impl Generator for CmakeGenerator {
    fn name(&self) -> &'static str {
        "cmake"
    }

    fn generate(&self, input: &GeneratorInput<'_>) -> Vec<GeneratorFile> {
        let mut out = String::new();
        let _ = writeln!(out, "# Generated by kitchen for {}", input.reference);
        let _ = writeln!(out, "# Do not edit; regenerated on every configure.");
        let _ = writeln!(out);

        let names: Vec<&str> = input.dependencies.iter().map(|d| d.reference.name()).collect();
        let _ = writeln!(
            out,
            "set(KITCHEN_DEPENDENCIES {})",
            cmake_quote(&names.join(";"))
        );

        let prefixes = dependency_prefixes(input.dependencies);
        for (dep, prefix) in input.dependencies.iter().zip(&prefixes) {
            let root = dep.install_path.to_string_lossy();
            let include = format!("{}/include", root);
            let lib = format!("{}/lib", root);
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "set({}_REF {})",
                prefix,
                cmake_quote(&dep.reference.to_string())
            );
            let _ = writeln!(out, "set({}_ROOT {})", prefix, cmake_quote(&root));
            let _ = writeln!(out, "set({}_INCLUDE_DIRS {})", prefix, cmake_quote(&include));
            let _ = writeln!(out, "set({}_LIB_DIRS {})", prefix, cmake_quote(&lib));
        }

        if !input.dependencies.is_empty() {
            let roots: Vec<String> = input
                .dependencies
                .iter()
                .map(|d| cmake_quote(&d.install_path.to_string_lossy()))
                .collect();
            let _ = writeln!(out);
            let _ = writeln!(out, "list(PREPEND CMAKE_PREFIX_PATH {})", roots.join(" "));
        }

        if !input.environment.is_empty() {
            let _ = writeln!(out);
            for (key, value) in input.environment {
                let _ = writeln!(out, "set(ENV{{{}}} {})", key, cmake_quote(value));
            }
        }

        vec![GeneratorFile {
            path: PathBuf::from("kitchenbuildinfo.cmake"),
            content: out,
        }]
    }
}

pub struct VirtualEnvGenerator;

impl Generator for VirtualEnvGenerator {
    fn name(&self) -> &'static str {
        "virtualenv"
    }

    fn generate(&self, input: &GeneratorInput<'_>) -> Vec<GeneratorFile> {
        let mut activate = String::new();
        let mut deactivate = String::new();
        let _ = writeln!(activate, "# Generated by kitchen for {}", input.reference);
        let _ = writeln!(deactivate, "# Generated by kitchen for {}", input.reference);

        let mut bin_dirs: Vec<String> = input
            .dependencies
            .iter()
            .map(|d| d.install_path.join("bin"))
            .filter(|p| p.is_absolute())
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        bin_dirs.dedup();

        let mut variables: Vec<(String, String)> = input
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), shell_quote(v)))
            .collect();
        if !bin_dirs.is_empty() && !input.environment.contains_key("PATH") {
            variables.push((
                "PATH".to_string(),
                format!("{}\"${{PATH:+:$PATH}}\"", shell_quote(&bin_dirs.join(":"))),
            ));
        }

        for (key, value) in &variables {
            let saved = format!("_KITCHEN_OLD_{}", key);
            let _ = writeln!(
                activate,
                "if [ -n \"${{{key}+x}}\" ]; then {saved}=\"${key}\"; export {saved}; fi"
            );
            let _ = writeln!(activate, "{}={}; export {}", key, value, key);

            let _ = writeln!(
                deactivate,
                "if [ -n \"${{{saved}+x}}\" ]; then {key}=\"${saved}\"; export {key}; unset {saved}; else unset {key}; fi"
            );
        }

        vec![
            GeneratorFile {
                path: PathBuf::from("activate.sh"),
                content: activate,
            },
            GeneratorFile {
                path: PathBuf::from("deactivate.sh"),
                content: deactivate,
            },
        ]
    }
}

pub struct JsonGenerator;

#[derive(Serialize)]
struct JsonBuildInfo<'a> {
    reference: &'a RequirementRef,
    dependencies: Vec<JsonDependency<'a>>,
    environment: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct JsonDependency<'a> {
    reference: &'a RequirementRef,
    install_path: String,
    exported_env: &'a BTreeMap<String, String>,
}

impl Generator for JsonGenerator {
    fn name(&self) -> &'static str {
        "json"
    }

    fn generate(&self, input: &GeneratorInput<'_>) -> Vec<GeneratorFile> {
        let info = JsonBuildInfo {
            reference: input.reference,
            dependencies: input
                .dependencies
                .iter()
                .map(|d| JsonDependency {
                    reference: &d.reference,
                    install_path: d.install_path.to_string_lossy().to_string(),
                    exported_env: &d.exported_env,
                })
                .collect(),
            environment: input.environment,
        };
        // Plain strings and maps only; serialization cannot fail.
        let content = serde_json::to_string_pretty(&info).unwrap_or_default();
        vec![GeneratorFile {
            path: PathBuf::from("kitchenbuildinfo.json"),
            content,
        }]
    }
}
