//! Task-graph construction: dependency expansion, weak edges, groups.

mod common;

use common::Fixture;
use sail_config::SailConfig;
use sail_lib::engine::{DepKind, Engine, EngineBuilder, TaskNode};
use sail_repo::PackageGraph;
use sail_task_id::{TaskId, TaskName};

fn build_engine(fixture: &Fixture, tasks: &[&str]) -> Engine {
    let config = SailConfig::load(&fixture.root).unwrap();
    let workspace = sail_repo::discover_workspace(&fixture.root).unwrap();
    let package_graph = PackageGraph::build(&workspace.packages, |_, _| true).unwrap();
    let packages: Vec<String> = workspace.packages.keys().cloned().collect();
    EngineBuilder::new(&config, &workspace, &package_graph)
        .with_tasks(tasks.iter().map(|t| TaskName::from(*t).into_owned()))
        .with_packages(packages)
        .build()
        .unwrap()
}

fn strong_deps(engine: &Engine, id: &str) -> Vec<String> {
    let id = TaskId::try_from(id).unwrap();
    let mut deps: Vec<String> = engine
        .strong_dep_ids(&id)
        .iter()
        .map(ToString::to_string)
        .collect();
    deps.sort();
    deps
}

#[test]
fn test_diamond_levels_and_edges() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("base", &[]);
    fixture.add_copy_package("left", &["base"]);
    fixture.add_copy_package("right", &["base"]);
    fixture.add_copy_package("top", &["left", "right"]);

    let engine = build_engine(&fixture, &["build"]);
    assert_eq!(engine.len(), 4);
    assert_eq!(strong_deps(&engine, "top#build"), vec!["left#build", "right#build"]);
    assert_eq!(strong_deps(&engine, "left#build"), vec!["base#build"]);

    // Levels are offset by one for the root sentinel but preserve order.
    let level = |id: &str| engine.level(&TaskId::try_from(id).unwrap()).unwrap();
    assert_eq!(level("base#build"), level("left#build") - 1);
    assert_eq!(level("left#build"), level("right#build"));
    assert_eq!(level("top#build"), level("base#build") + 2);
}

#[test]
fn test_transitive_closure_scheduled_from_entry() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);
    fixture.add_copy_package("app", &["lib"]);
    fixture.add_copy_package("unrelated", &[]);

    let config = SailConfig::load(&fixture.root).unwrap();
    let workspace = sail_repo::discover_workspace(&fixture.root).unwrap();
    let package_graph = PackageGraph::build(&workspace.packages, |_, _| true).unwrap();
    let engine = EngineBuilder::new(&config, &workspace, &package_graph)
        .with_tasks([TaskName::from("build").into_owned()])
        .with_packages(vec!["app".to_string()])
        .build()
        .unwrap();

    let mut ids: Vec<String> = engine.task_ids().map(ToString::to_string).collect();
    ids.sort();
    assert_eq!(ids, vec!["app#build", "lib#build"]);
}

#[test]
fn test_same_package_and_qualified_dependencies() {
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "build": { "dependsOn": ["codegen", "tools#prepare"] },
                "codegen": {},
                "prepare": {}
            }
        }"#,
    );
    fixture.add_package_with_script("tools", "prepare", "echo prepare");
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "build": "echo build", "codegen": "echo codegen" }
        }"#,
    );

    let engine = build_engine(&fixture, &["build"]);
    assert_eq!(
        strong_deps(&engine, "web#build"),
        vec!["tools#prepare", "web#codegen"]
    );
}

#[test]
fn test_wildcard_depends_on_all_package_tasks() {
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "check": { "dependsOn": ["*"] },
                "build": {},
                "lint": {}
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "check": "echo c", "build": "echo b", "lint": "echo l" }
        }"#,
    );

    let engine = build_engine(&fixture, &["check"]);
    assert_eq!(
        strong_deps(&engine, "web#check"),
        vec!["web#build", "web#lint"]
    );
}

#[test]
fn test_group_task_fans_out_to_children() {
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "ci": { "script": false, "children": ["build", "lint"] },
                "build": {},
                "lint": {}
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "build": "echo b", "lint": "echo l" }
        }"#,
    );

    let engine = build_engine(&fixture, &["ci"]);
    assert_eq!(strong_deps(&engine, "web#ci"), vec!["web#build", "web#lint"]);
    let ci = TaskId::try_from("web#ci").unwrap();
    assert!(!engine.spec(&ci).unwrap().is_leaf());
}

#[test]
fn test_task_without_script_is_dropped_for_package() {
    let fixture = Fixture::with_build_config();
    fixture.add_copy_package("lib", &[]);
    // No build script here.
    fixture.add_package_with_script("scriptless", "other", "echo hi");

    let engine = build_engine(&fixture, &["build"]);
    let mut ids: Vec<String> = engine.task_ids().map(ToString::to_string).collect();
    ids.sort();
    assert_eq!(ids, vec!["lib#build"]);
}

#[test]
fn test_weak_after_edge_binds_only_when_scheduled() {
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "build": {},
                "test": { "after": ["build"] }
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "build": "echo b", "test": "echo t" }
        }"#,
    );

    // Both scheduled: the weak edge binds.
    let engine = build_engine(&fixture, &["build", "test"]);
    let test_id = TaskId::try_from("web#test").unwrap();
    let weak: Vec<&TaskNode> = engine
        .dependencies(&test_id, DepKind::Weak)
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(weak.len(), 1);
    // Weak edges do not schedule and do not propagate failure.
    assert!(strong_deps(&engine, "web#test").is_empty());

    // Only `test` scheduled: `build` is not pulled in by the weak hint.
    let engine = build_engine(&fixture, &["test"]);
    let mut ids: Vec<String> = engine.task_ids().map(ToString::to_string).collect();
    ids.sort();
    assert_eq!(ids, vec!["web#test"]);
}

#[test]
fn test_before_is_a_start_hint_not_an_edge() {
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "codegen": { "before": ["build"] },
                "build": {}
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "codegen": "echo c", "build": "echo b" }
        }"#,
    );

    let engine = build_engine(&fixture, &["build", "codegen"]);
    let build_id = TaskId::try_from("web#build").unwrap();
    let codegen_id = TaskId::try_from("web#codegen").unwrap();
    // `codegen before build` orders dispatch only: the hint is recorded,
    // but no edge of either kind exists, so build does not wait for
    // codegen to finish.
    assert!(engine.starts_before(&codegen_id, &build_id));
    assert!(!engine.starts_before(&build_id, &codegen_id));
    assert!(engine.dependencies(&build_id, DepKind::Weak).unwrap().is_empty());
    assert!(strong_deps(&engine, "web#build").is_empty());
    assert!(strong_deps(&engine, "web#codegen").is_empty());
}

#[test]
fn test_before_hint_with_strong_dependency_is_not_a_cycle() {
    // a dependsOn b plus a before b: the hard edge a -> b together with
    // an edge-modeled hint would be a cycle. The hint must instead be
    // recorded and, since b can never be ready while a waits on it,
    // effectively ignored.
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "a": { "dependsOn": ["b"], "before": ["b"] },
                "b": {}
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "a": "echo a", "b": "echo b" }
        }"#,
    );

    let engine = build_engine(&fixture, &["a"]);
    assert_eq!(strong_deps(&engine, "web#a"), vec!["web#b"]);
    let a = TaskId::try_from("web#a").unwrap();
    let b = TaskId::try_from("web#b").unwrap();
    assert!(engine.starts_before(&a, &b));
}

#[test]
fn test_task_level_cycle_detected() {
    let fixture = Fixture::new(
        r#"{
            "version": 1,
            "tasks": {
                "a": { "dependsOn": ["b"] },
                "b": { "dependsOn": ["a"] }
            }
        }"#,
    );
    common::write(
        &fixture.root.join("packages/web/package.json"),
        r#"{
            "name": "web",
            "version": "1.0.0",
            "scripts": { "a": "echo a", "b": "echo b" }
        }"#,
    );

    let config = SailConfig::load(&fixture.root).unwrap();
    let workspace = sail_repo::discover_workspace(&fixture.root).unwrap();
    let package_graph = PackageGraph::build(&workspace.packages, |_, _| true).unwrap();
    let err = EngineBuilder::new(&config, &workspace, &package_graph)
        .with_tasks([TaskName::from("a").into_owned()])
        .with_packages(vec!["web".to_string()])
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("Cyclic dependency"), "{err}");
}
