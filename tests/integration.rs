//! Integration tests for the recipe lifecycle
//!
//! Rhai recipes are written to a temporary recipes directory and cooked
//! through the public API against an on-disk package store.

use kitchen_recipe::{
    DirectoryLoader, DiskStore, Goal, Kitchen, KitchenConfig, KitchenError, NodeOutcome,
    PackageStore, RecipeLoader, RequirementRef, ResolutionError, RhaiRecipe, Stage,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod common;

use common::{create_test_env, write_recipe};

fn reference(s: &str) -> RequirementRef {
    s.parse().unwrap()
}

fn kitchen(root: &Path, recipes_dir: &Path) -> (Kitchen, Arc<DiskStore>) {
    let config = KitchenConfig::rooted_at(root);
    let store = Arc::new(DiskStore::open(&config.store_dir).unwrap());
    let loader = Arc::new(DirectoryLoader::new(recipes_dir, config.clone()));
    let kitchen = Kitchen::new(config, store.clone(), loader).with_tool(common::shell_tool());
    (kitchen, store)
}

fn load(recipes_dir: &Path, name: &str, config: &KitchenConfig) -> kitchen_recipe::RecipeNode {
    let loader = DirectoryLoader::new(recipes_dir, config.clone());
    let reference = RequirementRef::parse(name, &config.defaults).unwrap();
    loader.load(&reference).unwrap().unwrap()
}

const ZLIB: &str = r#"
let name = "zlib";
let version = "1.3";

fn build(ctx) {
    write_file("libz.a", "zlib archive");
}

fn package(ctx) {
    copy("libz.a", ctx.install_dir + "/lib");
    #{ ZLIB_ROOT: ctx.install_dir }
}
"#;

const APP: &str = r##"
let name = "app";
let version = "1.0";
let requires = ["zlib/1.3"];
let generators = ["cmake", "json"];

fn configure(ctx) {
    let root = env("ZLIB_ROOT");
    if !exists(root + "/lib/libz.a") {
        throw "zlib not visible at " + root;
    }
    write_file("configured", root);
}

fn build(ctx) {
    write_file("example", "#!/bin/sh\ntest -f \"$ZLIB_ROOT/lib/libz.a\"\n");
    run("chmod +x example");
}

fn package(ctx) {
    copy("example", ctx.install_dir + "/bin");
    #{ APP_BIN: ctx.install_dir + "/bin/example" }
}

fn test(ctx) {
    run("./example");
}
"##;

// =============================================================================
// End-to-end cooking
// =============================================================================

#[test]
fn test_package_publishes_dependency_then_root() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(&recipes_dir, "zlib", ZLIB);
    write_recipe(&recipes_dir, "app", APP);

    let (kitchen, store) = kitchen(dir.path(), &recipes_dir);
    let root = load(&recipes_dir, "app/1.0", kitchen.config());
    let report = kitchen.package(root).unwrap();

    assert!(report.is_success(), "{:?}", report.nodes);
    let order: Vec<String> = report.nodes.iter().map(|n| n.reference.name().to_string()).collect();
    assert_eq!(order, vec!["zlib", "app"]);

    let zlib = store.get(&reference("zlib/1.3@local/testing")).unwrap();
    let zlib_root = store.install_path(&zlib.reference);
    assert_eq!(zlib.install_path, zlib_root);
    assert_eq!(zlib.exported_env["ZLIB_ROOT"], zlib_root.to_string_lossy());
    assert!(zlib_root.join("lib/libz.a").exists());
    assert!(zlib.context_digest.is_some());

    let app = store.get(&reference("app/1.0@local/testing")).unwrap();
    let app_bin = PathBuf::from(&app.exported_env["APP_BIN"]);
    assert!(app_bin.starts_with(&app.install_path));
    assert!(app_bin.exists());
}

#[test]
fn test_generators_written_into_build_dir() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(&recipes_dir, "zlib", ZLIB);
    write_recipe(&recipes_dir, "app", APP);

    let (kitchen, store) = kitchen(dir.path(), &recipes_dir);
    let root = load(&recipes_dir, "app/1.0", kitchen.config());
    assert!(kitchen.build(root).unwrap().is_success());

    let build_dir = kitchen.config().build_dir.join("app/1.0/local/testing");
    let cmake = std::fs::read_to_string(build_dir.join("kitchenbuildinfo.cmake")).unwrap();
    assert!(cmake.contains("set(KITCHEN_DEPENDENCIES \"zlib\")"), "{}", cmake);

    let zlib_root = store.install_path(&reference("zlib/1.3@local/testing"));
    let json = std::fs::read_to_string(build_dir.join("kitchenbuildinfo.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["environment"]["ZLIB_ROOT"], zlib_root.to_string_lossy().as_ref());

    let configured = std::fs::read_to_string(build_dir.join("configured")).unwrap();
    assert_eq!(configured, zlib_root.to_string_lossy());
}

#[test]
fn test_build_goal_does_not_publish_root() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(&recipes_dir, "zlib", ZLIB);
    write_recipe(&recipes_dir, "app", APP);

    let (kitchen, store) = kitchen(dir.path(), &recipes_dir);
    let root = load(&recipes_dir, "app/1.0", kitchen.config());
    assert!(kitchen.build(root).unwrap().is_success());

    assert!(store.find(&reference("zlib/1.3@local/testing")).unwrap().is_some());
    assert!(store.find(&reference("app/1.0@local/testing")).unwrap().is_none());
}

#[test]
fn test_test_goal_runs_example_from_build_dir() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(&recipes_dir, "zlib", ZLIB);
    write_recipe(&recipes_dir, "app", APP);

    let (kitchen, _store) = kitchen(dir.path(), &recipes_dir);
    let root = load(&recipes_dir, "app/1.0", kitchen.config());
    let report = kitchen.test(root).unwrap();
    assert!(report.is_success(), "{:?}", report.nodes);
}

#[test]
fn test_second_run_reuses_published_dependency() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(&recipes_dir, "zlib", ZLIB);
    write_recipe(&recipes_dir, "app", APP);

    let (kitchen, _store) = kitchen(dir.path(), &recipes_dir);
    let first = kitchen.package(load(&recipes_dir, "app/1.0", kitchen.config())).unwrap();
    assert!(first.is_success());

    let second = kitchen.package(load(&recipes_dir, "app/1.0", kitchen.config())).unwrap();
    assert!(second.is_success());
    for node in &second.nodes {
        assert_eq!(node.outcome, NodeOutcome::Reused, "{}", node.reference);
    }
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_failed_dependency_skips_dependent() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(
        &recipes_dir,
        "zlib",
        r#"
let name = "zlib";
let version = "1.3";
fn build(ctx) { run("echo compiling; exit 2"); }
"#,
    );
    write_recipe(&recipes_dir, "app", APP);

    let (kitchen, store) = kitchen(dir.path(), &recipes_dir);
    let report = kitchen.package(load(&recipes_dir, "app/1.0", kitchen.config())).unwrap();
    assert!(!report.is_success());

    let zlib = report.node(&reference("zlib/1.3@local/testing")).unwrap();
    match &zlib.outcome {
        NodeOutcome::Failed { stage, diagnostic } => {
            assert_eq!(*stage, Stage::Build);
            assert!(diagnostic.contains("exit code: Some(2)"), "{}", diagnostic);
        }
        other => panic!("expected failure, got {}", other),
    }

    let app = report.node(&reference("app/1.0@local/testing")).unwrap();
    assert!(matches!(app.outcome, NodeOutcome::Skipped { .. }));
    assert!(store.find(&app.reference).unwrap().is_none());
    assert!(!kitchen.config().build_dir.join("app/1.0/local/testing").exists());
}

#[test]
fn test_cycle_between_recipe_files() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(
        &recipes_dir,
        "a",
        r#"let name = "a"; let version = "1"; let requires = ["b/1"];"#,
    );
    write_recipe(
        &recipes_dir,
        "b",
        r#"let name = "b"; let version = "1"; let requires = ["a/1"];"#,
    );

    let (kitchen, _store) = kitchen(dir.path(), &recipes_dir);
    let err = kitchen.package(load(&recipes_dir, "a/1", kitchen.config())).unwrap_err();
    match err {
        KitchenError::Resolution(ResolutionError::CyclicDependency { path }) => {
            let names: Vec<&str> = path.iter().map(|r| r.name()).collect();
            assert_eq!(names, vec!["a", "b", "a"]);
        }
        other => panic!("expected cycle, got {}", other),
    }
    assert!(!kitchen.config().build_dir.exists());
}

#[test]
fn test_missing_recipe_is_resolution_error() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(&recipes_dir, "app", APP);

    let (kitchen, _store) = kitchen(dir.path(), &recipes_dir);
    let err = kitchen.build(load(&recipes_dir, "app/1.0", kitchen.config())).unwrap_err();
    assert!(matches!(
        err,
        KitchenError::Resolution(ResolutionError::RecipeNotFound { .. })
    ));
    assert!(err.to_string().contains("zlib/1.3@local/testing"), "{}", err);
}

#[test]
fn test_version_conflict_between_recipes() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(
        &recipes_dir,
        "root",
        r#"let name = "root"; let version = "1"; let requires = ["left/1", "right/1"];"#,
    );
    write_recipe(
        &recipes_dir,
        "left",
        r#"let name = "left"; let version = "1"; let requires = ["zlib/1.2"];"#,
    );
    write_recipe(
        &recipes_dir,
        "right",
        r#"let name = "right"; let version = "1"; let requires = ["zlib/1.3"];"#,
    );
    let versioned = recipes_dir.join("zlib");
    std::fs::create_dir_all(&versioned).unwrap();
    write_recipe(&versioned, "1.2", &ZLIB.replace("\"1.3\"", "\"1.2\""));
    write_recipe(&versioned, "1.3", ZLIB);

    let (kitchen, _store) = kitchen(dir.path(), &recipes_dir);
    let err = kitchen.resolve(load(&recipes_dir, "root/1", kitchen.config())).unwrap_err();
    match err {
        ResolutionError::VersionConflict { name, versions } => {
            assert_eq!(name, "zlib@local/testing");
            assert_eq!(versions.len(), 2);
        }
        other => panic!("expected conflict, got {}", other),
    }
}

// =============================================================================
// Recipe files
// =============================================================================

#[test]
fn test_recipe_file_as_root() {
    let (dir, recipes_dir) = create_test_env();
    let path = write_recipe(&recipes_dir, "zlib", ZLIB);

    let (kitchen, store) = kitchen(dir.path(), &recipes_dir);
    let script = RhaiRecipe::load(&path, kitchen.config()).unwrap();
    let root_ref = script.reference(kitchen.config()).unwrap();
    assert_eq!(root_ref.to_string(), "zlib/1.3@local/testing");

    let report = kitchen.run(script.into_node(&root_ref), Goal::Package).unwrap();
    assert!(report.is_success());
    assert!(store.find(&root_ref).unwrap().is_some());
}

#[test]
fn test_versioned_recipe_directory() {
    let (dir, recipes_dir) = create_test_env();
    let versioned = recipes_dir.join("zlib");
    std::fs::create_dir_all(&versioned).unwrap();
    write_recipe(&versioned, "1.3", ZLIB);
    write_recipe(&versioned, "1.2", &ZLIB.replace("\"1.3\"", "\"1.2\""));

    let config = KitchenConfig::rooted_at(dir.path());
    let node = load(&recipes_dir, "zlib/1.2", &config);
    assert_eq!(node.reference.version(), "1.2");
    let node = load(&recipes_dir, "zlib/1.3", &config);
    assert_eq!(node.reference.version(), "1.3");
}

#[test]
fn test_tool_fallback_when_hooks_missing() {
    let (dir, recipes_dir) = create_test_env();
    write_recipe(
        &recipes_dir,
        "plain",
        r#"
let name = "plain";
let version = "0.1";
fn package(ctx) {
    copy("tool.log", ctx.install_dir);
}
"#,
    );

    let (kitchen, store) = kitchen(dir.path(), &recipes_dir);
    let report = kitchen.package(load(&recipes_dir, "plain/0.1", kitchen.config())).unwrap();
    assert!(report.is_success(), "{:?}", report.nodes);

    let info = store.get(&reference("plain/0.1@local/testing")).unwrap();
    let log = std::fs::read_to_string(info.install_path.join("tool.log")).unwrap();
    assert_eq!(log, "configure\nbuild\n");
}
