use super::*;
use crate::cache::Cache;
use crate::error::ErrorCategory;
use crate::executor::LocalExecutor;
use crate::evaluator::AttrEvaluator;
use crate::resolver::{DirResolver, MemoryResolver};
use crate::runner::{CheckContext, CheckRunner};
use crate::target::{Attr, Checker, CheckerKind, Component, ComputedValue, TargetType, Value};
use pretty_assertions::assert_eq;
use std::fs;
use tempfile::TempDir;

fn contracts(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, body) in files {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }
    dir
}

fn built(dir: &TempDir, roots: &[&str]) -> UniverseResult<Universe> {
    let opts = FindOptions::with_builtins().with_fallback(Arc::new(DirResolver::new(dir.path())));
    let roots: Vec<TargetRef> = roots.iter().map(|r| TargetRef::path(*r)).collect();
    let mut u = Universe::new();
    u.build(&roots, &opts, Path::new("/"))?;
    Ok(u)
}

fn generation(cache: &TempDir) -> GenerationContext {
    GenerationContext::new(
        Cache::open(cache.path()).unwrap(),
        Arc::new(LocalExecutor::new()),
    )
}

fn labels(u: &Universe, phases: &[Vec<NodeId>]) -> Vec<Vec<String>> {
    phases
        .iter()
        .map(|p| p.iter().map(|id| u.label(*id)).collect())
        .collect()
}

const QUERY: &str = r#"
[[component]]
name = "app"
deps = [":bin", ":lib64", ":libx"]
attrs = [":arch"]

[[attr]]
name = "arch"
class = "common://attrs:arch"
value = "arm64"

[[resource]]
name = "bin"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/usr/bin/app" }]
source = ":build"

[[resource]]
name = "lib64"
class = "common://resources:symlink"
attrs = [
    { class = "common://attrs:path", value = "/usr/lib64" },
    { class = "common://attrs:target", value = "/usr/lib" },
]
source = "common://generators:symlink"

[[resource]]
name = "libx"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/usr/lib/libx.so" }]
source = ":build"

[[build]]
name = "build"
steps = [{ kind = "write", to_path = "usr/bin/app", args = ["hi"] }]
"#;

#[test]
fn test_operations_before_build_fail() {
    let u = Universe::new();
    assert!(matches!(u.get("//p:app"), Err(UniverseError::NotBuilt)));
    assert!(matches!(
        u.plan(&TargetRef::path("//p:app"), TargetType::Build),
        Err(UniverseError::NotBuilt)
    ));
    assert!(matches!(
        u.find_by_path("/usr/bin/app", &RunnerEnv::host()),
        Err(UniverseError::NotBuilt)
    ));
}

#[test]
fn test_build_links_every_reachable_target() {
    let dir = contracts(&[("p.toml", QUERY)]);
    let u = built(&dir, &["//p:app"]).unwrap();

    let app = u.get("//p:app").unwrap();
    let deps = u.target(app).dependencies().unwrap();
    assert!(deps.iter().all(|d| d.id().is_some()));
    assert!(u.get("//p:build").is_ok());
    assert!(u.get("common://resources:file").is_ok());
    assert!(u.get("//p:nope").unwrap_err().is_not_exists());
}

#[test]
fn test_building_twice_adds_nothing() {
    let dir = contracts(&[("p.toml", QUERY)]);
    let opts = FindOptions::with_builtins().with_fallback(Arc::new(DirResolver::new(dir.path())));
    let mut u = Universe::new();
    u.build(&[TargetRef::path("//p:app")], &opts, Path::new("/")).unwrap();
    let nodes = u.len();
    let named = u.enumerated_targets().unwrap();

    u.build(&[TargetRef::path("//p:app")], &opts, Path::new("/")).unwrap();
    assert_eq!(u.len(), nodes);
    assert_eq!(u.enumerated_targets().unwrap(), named);
}

#[test]
fn test_missing_reference_is_not_found() {
    let dir = contracts(&[("p.toml", "[[component]]\nname = \"app\"\ndeps = [\":ghost\"]\n")]);
    let err = built(&dir, &["//p:app"]).err().unwrap();
    assert!(err.is_not_exists());
    assert_eq!(err.category(), ErrorCategory::NotFound);
    assert_eq!(err.context().unwrap().target.as_deref(), Some("//p:app"));
}

#[test]
fn test_invalid_edge_kind_fails_validation() {
    let src = r#"
[[component]]
name = "app"
deps = [":b"]

[[build]]
name = "b"
"#;
    let dir = contracts(&[("p.toml", src)]);
    let err = built(&dir, &["//p:app"]).err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(err.to_string().contains("dependencies must be resources or components"));
}

#[test]
fn test_query_attributes() {
    let dir = contracts(&[("p.toml", QUERY)]);
    let u = built(&dir, &["//p:app"]).unwrap();
    let env = RunnerEnv::host();

    assert_eq!(
        u.query_by_name("//p:bin", "path", &env).unwrap(),
        Some(Value::from("/usr/bin/app"))
    );
    assert_eq!(
        u.query_by_name("//p:app", "arch", &env).unwrap(),
        Some(Value::from("arm64"))
    );
    assert_eq!(u.query_by_name("//p:app", "mode", &env).unwrap(), None);
    assert_eq!(
        u.query_by_class("//p:lib64", common::TARGET_ATTR, &env).unwrap(),
        Some(Value::from("/usr/lib"))
    );
}

#[test]
fn test_find_by_path_follows_symlinked_parents() {
    let dir = contracts(&[("p.toml", QUERY)]);
    let u = built(&dir, &["//p:app"]).unwrap();
    let env = RunnerEnv::host();

    assert_eq!(
        u.find_by_path("/usr/bin//app/", &env).unwrap(),
        Some(u.get("//p:bin").unwrap())
    );
    assert_eq!(
        u.find_by_path("/usr/lib64/libx.so", &env).unwrap(),
        Some(u.get("//p:libx").unwrap())
    );
    assert_eq!(u.find_by_path("/usr/share/none", &env).unwrap(), None);

    let declared: Vec<String> = u.declared_paths().into_iter().map(|(p, _)| p).collect();
    assert_eq!(declared, vec!["/usr/bin/app", "/usr/lib/libx.so", "/usr/lib64"]);
}

#[test]
fn test_duplicate_declared_path_rejected() {
    let src = r#"
[[component]]
name = "app"
deps = [":a", ":b"]

[[resource]]
name = "a"
class = "common://resources:virtual"
attrs = [{ class = "common://attrs:path", value = "/etc/conf" }]

[[resource]]
name = "b"
class = "common://resources:virtual"
attrs = [{ class = "common://attrs:path", value = "/etc//conf" }]
"#;
    let dir = contracts(&[("p.toml", src)]);
    let err = built(&dir, &["//p:app"]).err().unwrap();
    assert!(err.to_string().contains("both declare path \"/etc/conf\""));
}

#[test]
fn test_inject_rejects_existing_path() {
    let dir = contracts(&[("p.toml", QUERY)]);
    let mut u = built(&dir, &["//p:app"]).unwrap();
    let dup = Target::Component(Component {
        path: "//p:app".into(),
        name: "app".into(),
        ..Default::default()
    });
    assert!(u.inject(dup).unwrap_err().to_string().contains("already exists"));

    let fresh = Target::Component(Component {
        path: "//p:extra".into(),
        name: "extra".into(),
        deps: vec![TargetRef::path("//p:bin")],
        ..Default::default()
    });
    let id = u.inject(fresh).unwrap();
    assert_eq!(u.get("//p:extra").unwrap(), id);
    assert_eq!(
        u.target(id).dependencies().unwrap()[0].id(),
        Some(u.get("//p:bin").unwrap())
    );
}

#[test]
fn test_inject_cannot_resolve_new_paths() {
    let dir = contracts(&[("p.toml", QUERY)]);
    let mut u = built(&dir, &["//p:app"]).unwrap();
    let t = Target::Component(Component {
        path: "//p:late".into(),
        name: "late".into(),
        deps: vec![TargetRef::path("//p:never_loaded")],
        ..Default::default()
    });
    assert!(u.inject(t).unwrap_err().is_not_exists());
}

const CYCLES: &str = r#"
[[component]]
name = "a"
deps = [":b"]

[[component]]
name = "b"
deps = [":a"]

[[resource]]
name = "ra"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/ra" }]
source = ":ga"

[[generator]]
name = "ga"
runner = "manifest"
inputs = [":rb"]

[[resource]]
name = "rb"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/rb" }]
source = ":gb"

[[generator]]
name = "gb"
runner = "manifest"
inputs = [":ra"]

[[generator]]
name = "gen"
runner = "manifest"
inputs = [":circ"]

[[component]]
name = "circ"
deps = [":c1"]

[[resource]]
name = "c1"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/c1" }]
source = ":gen"
"#;

#[test]
fn test_dependency_cycle_is_legal() {
    let dir = contracts(&[("p.toml", CYCLES)]);
    let mut u = built(&dir, &["//p:a"]).unwrap();
    let a = u.get("//p:a").unwrap();
    let b = u.get("//p:b").unwrap();
    assert_eq!(u.target(b).dependencies().unwrap()[0].id(), Some(a));

    let (out, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    u.generate(&generation(&cache), &TargetRef::path("//p:a"), out.path())
        .unwrap();
    u.check(&[TargetRef::path("//p:a")], out.path()).unwrap();
}

#[test]
fn test_input_cycle_is_circular_dependency() {
    let dir = contracts(&[("p.toml", CYCLES)]);
    let mut u = built(&dir, &["//p:ra"]).unwrap();
    let (out, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());

    let err = u
        .generate(&generation(&cache), &TargetRef::path("//p:ra"), out.path())
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::CircularDependency);
    let UniverseError::CircularDependency { message, chain } = err.root_cause() else {
        panic!("expected a circular dependency, got {}", err);
    };
    assert_eq!(
        message,
        "circular dependency: //p:ra -> //p:ga -> //p:rb -> //p:gb -> //p:ra"
    );
    assert!(chain.contains(&"//p:ra".to_string()));
    assert!(chain.contains(&"//p:rb".to_string()));
}

#[test]
fn test_dependency_back_into_an_input_owner_is_circular() {
    let dir = contracts(&[("p.toml", CYCLES)]);
    let mut u = built(&dir, &["//p:circ"]).unwrap();
    let (out, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());

    let err = u
        .generate(&generation(&cache), &TargetRef::path("//p:circ"), out.path())
        .unwrap_err();
    assert_eq!(
        err.root_cause().to_string(),
        "circular dependency: //p:circ -> //p:c1 -> //p:gen -> //p:circ"
    );
}

const PLAN: &str = r#"
[[component]]
name = "app"
deps = [":r2", ":r3"]

[[resource]]
name = "r1"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/r1" }]
source = ":b1"

[[resource]]
name = "r2"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/r2" }]
source = ":b2"

[[resource]]
name = "r3"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/r3" }]
source = ":b3"

[[build]]
name = "b1"
steps = [{ kind = "write", to_path = "r1", args = ["one"] }]

[[build]]
name = "b2"
patch_ins = { "/in" = ":r1" }
steps = [{ kind = "shell_cmd", args = ["cp in/r1 r2"] }]
output = { "r2" = "r2" }

[[build]]
name = "b3"
steps = [{ kind = "write", to_path = "r3", args = ["three"] }]
"#;

#[test]
fn test_plan_orders_builds_into_phases() {
    let dir = contracts(&[("p.toml", PLAN)]);
    let u = built(&dir, &["//p:app"]).unwrap();
    let phases = u.plan(&TargetRef::path("//p:app"), TargetType::Build).unwrap();
    assert_eq!(
        labels(&u, &phases),
        vec![
            vec!["//p:b1".to_string(), "//p:b3".to_string()],
            vec!["//p:b2".to_string()],
        ]
    );
}

#[test]
fn test_plan_by_resource() {
    let dir = contracts(&[("p.toml", PLAN)]);
    let u = built(&dir, &["//p:app"]).unwrap();
    let phases = u
        .plan(&TargetRef::path("//p:app"), TargetType::Resource)
        .unwrap();
    assert_eq!(
        labels(&u, &phases),
        vec![
            vec!["//p:r1".to_string(), "//p:r3".to_string()],
            vec!["//p:r2".to_string()],
        ]
    );
}

#[test]
fn test_plan_without_matches_is_empty() {
    let dir = contracts(&[("p.toml", PLAN)]);
    let u = built(&dir, &["//p:app"]).unwrap();
    let phases = u
        .plan(&TargetRef::path("//p:app"), TargetType::Sieve)
        .unwrap();
    assert!(phases.is_empty());
}

#[test]
fn test_plan_rejects_same_type_cycles() {
    let dir = contracts(&[("p.toml", CYCLES)]);
    let u = built(&dir, &["//p:a"]).unwrap();
    let err = u
        .plan(&TargetRef::path("//p:a"), TargetType::Component)
        .unwrap_err();
    match err {
        UniverseError::DependencyCycle { kind, members } => {
            assert_eq!(kind, TargetType::Component);
            assert_eq!(members, vec!["//p:a".to_string(), "//p:b".to_string()]);
        }
        other => panic!("expected a dependency cycle, got {}", other),
    }
}

#[test]
fn test_rollup_is_deterministic() {
    let one = contracts(&[("p.toml", PLAN)]);
    let two = contracts(&[("p.toml", PLAN)]);
    let env = RunnerEnv::host();

    let a = built(&one, &["//p:app"]).unwrap();
    let b = built(&two, &["//p:app"]).unwrap();
    for path in ["//p:b1", "//p:b2", "//p:r2", "//p:app"] {
        assert_eq!(
            a.target_rollup_hash(path, &env).unwrap(),
            b.target_rollup_hash(path, &env).unwrap(),
            "{}",
            path
        );
    }
}

#[test]
fn test_rollup_follows_inputs() {
    let env = RunnerEnv::host();
    let base = contracts(&[("p.toml", PLAN)]);
    let src = PLAN.replace("args = [\"one\"]", "args = [\"uno\"]");
    let changed = contracts(&[("p.toml", src.as_str())]);

    let a = built(&base, &["//p:app"]).unwrap();
    let b = built(&changed, &["//p:app"]).unwrap();
    assert_ne!(
        a.target_rollup_hash("//p:b1", &env).unwrap(),
        b.target_rollup_hash("//p:b1", &env).unwrap()
    );
    assert_ne!(
        a.target_rollup_hash("//p:b2", &env).unwrap(),
        b.target_rollup_hash("//p:b2", &env).unwrap()
    );
    assert_eq!(
        a.target_rollup_hash("//p:b3", &env).unwrap(),
        b.target_rollup_hash("//p:b3", &env).unwrap()
    );
}

#[test]
fn test_rollup_covers_attribute_values() {
    let env = RunnerEnv::host();
    let base = contracts(&[("p.toml", PLAN)]);
    let src = PLAN.replace("\"/r1\"", "\"/opt/r1\"");
    let moved = contracts(&[("p.toml", src.as_str())]);

    let a = built(&base, &["//p:app"]).unwrap();
    let b = built(&moved, &["//p:app"]).unwrap();
    assert_ne!(
        a.target_rollup_hash("//p:b2", &env).unwrap(),
        b.target_rollup_hash("//p:b2", &env).unwrap()
    );
}

#[test]
fn test_generators_are_not_reproducible() {
    let dir = contracts(&[("p.toml", QUERY)]);
    let u = built(&dir, &["//p:app"]).unwrap();
    let env = RunnerEnv::host();

    let err = u
        .target_rollup_hash("common://generators:symlink", &env)
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        UniverseError::NonReproducible(TargetType::Generator)
    ));
    // A generated resource hashes its generator by identity.
    assert!(u.target_rollup_hash("//p:lib64", &env).is_ok());
}

const CONSTRAINED: &str = r#"
[[component]]
name = "app"
deps = [{ path = ":lib", constraints = [{ class = "common://attrs:semver", op = ">=", value = "2.0.0" }] }]

[[component]]
name = "ok"
deps = [{ path = ":lib", constraints = [{ class = "common://attrs:semver", op = "<", value = "2.0.0" }] }]

[[component]]
name = "doomed"
checks = ["common://checks:always_fail"]

[[resource]]
name = "lib"
class = "common://resources:virtual"
attrs = [{ class = "common://attrs:semver", value = "1.2.0" }]
"#;

#[test]
fn test_failing_constraint_is_reported() {
    let dir = contracts(&[("p.toml", CONSTRAINED)]);
    let u = built(&dir, &["//p:app", "//p:ok", "//p:doomed"]).unwrap();
    let out = TempDir::new().unwrap();

    u.check(&[TargetRef::path("//p:ok")], out.path()).unwrap();

    let err = u.check(&[TargetRef::path("//p:app")], out.path()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::CheckerFailure);
    let failing = err.failing_constraint().unwrap();
    assert_eq!(
        (failing.left.as_str(), failing.op.as_str(), failing.right.as_str()),
        ("1.2.0", ">=", "2.0.0")
    );
    let ctx = err.context().unwrap();
    assert_eq!(ctx.target.as_deref(), Some("//p:lib"));
    assert_eq!(ctx.chain, vec!["//p:app".to_string()]);
}

#[test]
fn test_component_checker_failure_names_checker() {
    let dir = contracts(&[("p.toml", CONSTRAINED)]);
    let u = built(&dir, &["//p:doomed"]).unwrap();
    let out = TempDir::new().unwrap();

    let err = u.check(&[TargetRef::path("//p:doomed")], out.path()).unwrap_err();
    let ctx = err.context().unwrap();
    assert_eq!(ctx.target.as_deref(), Some("//p:doomed"));
    assert_eq!(ctx.action_target.as_deref(), Some("common://checks:always_fail"));
    assert_eq!(ctx.pos.as_ref().map(|p| p.line), Some(11));
}

#[test]
fn test_normalize_path() {
    assert_eq!(normalize_path("/usr//lib/./x/../y/"), "/usr/lib/y");
    assert_eq!(normalize_path("usr/bin"), "/usr/bin");
    assert_eq!(normalize_path("/"), "/");
}

const LAYERED_PACKAGES: &[(&str, &str)] = &[
    (
        "a.toml",
        "[[component]]\nname = \"app\"\ndeps = [\"//b:lib\"]\n",
    ),
    (
        "b.toml",
        r#"
[[resource]]
name = "lib"
class = "//c:shared"
attrs = [{ class = "common://attrs:path", value = "/usr/lib/libshared.so" }]
source = "//c:build"
"#,
    ),
    (
        "c.toml",
        r#"
[[resource_class]]
name = "shared"
checks = ["common://checks:file_present"]

[[attr_class]]
name = "flavour"

[[build]]
name = "build"
host_deps = ["common://toolchains:sh"]
steps = [{ kind = "write", to_path = "usr/lib/libshared.so", args = ["elf"] }]
"#,
    ),
];

#[test]
fn test_validation_sees_only_linked_edges() {
    let dir = contracts(LAYERED_PACKAGES);
    let u = built(&dir, &["//a:app"]).unwrap();

    for id in u.enumerated_targets().unwrap() {
        let mut target = u.target(id).clone();
        for edge in target.edges_mut() {
            assert!(edge.id().is_some(), "{} has unlinked edge {}", u.label(id), edge);
        }
    }
    let lib = u.get("//b:lib").unwrap();
    let class = u.target(lib).class().and_then(TargetRef::id).unwrap();
    assert_eq!(u.label(class), "//c:shared");
}

#[test]
fn test_validation_inspects_the_resolved_class() {
    let wrong = LAYERED_PACKAGES[1].1.replace("//c:shared", "//c:flavour");
    let files: Vec<(&str, &str)> = vec![
        LAYERED_PACKAGES[0],
        ("b.toml", wrong.as_str()),
        LAYERED_PACKAGES[2],
    ];
    let dir = contracts(&files);

    let err = built(&dir, &["//a:app"]).err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(
        err.to_string()
            .contains("resource class must be a resource_class, got attr_class"),
        "{}",
        err
    );
}

/// Records every checker call in order.
struct Recorder {
    name: &'static str,
    kind: CheckerKind,
    log: Arc<Mutex<Vec<String>>>,
}

impl CheckRunner for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> CheckerKind {
        self.kind
    }

    fn check_component(&self, ctx: &CheckContext<'_>, component: NodeId) -> UniverseResult<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {}", self.name, ctx.universe.label(component)));
        Ok(())
    }

    fn check_global(&self, _ctx: &CheckContext<'_>) -> UniverseResult<()> {
        self.log.lock().unwrap().push(self.name.to_string());
        Ok(())
    }
}

fn recording_checker(path: &str, kind: CheckerKind, log: &Arc<Mutex<Vec<String>>>) -> Target {
    let name = path.rsplit(':').next().unwrap();
    Target::Checker(Checker {
        path: path.into(),
        name: name.into(),
        pos: None,
        kind,
        runner: Arc::new(Recorder {
            name: if kind == CheckerKind::Global { "audit" } else { "seen" },
            kind,
            log: Arc::clone(log),
        }),
    })
}

#[test]
fn test_global_checker_runs_once_after_every_root() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut r = MemoryResolver::new();
    r.insert("//t:audit", recording_checker("//t:audit", CheckerKind::Global, &log))
        .insert("//t:seen", recording_checker("//t:seen", CheckerKind::EachComponent, &log));
    for name in ["one", "two"] {
        let path = format!("//t:{}", name);
        r.insert(
            path.clone(),
            Target::Component(Component {
                path,
                name: name.into(),
                checks: vec![TargetRef::path("//t:seen"), TargetRef::path("//t:audit")],
                ..Default::default()
            }),
        );
    }
    let opts = FindOptions::with_builtins().with_fallback(Arc::new(r));
    let roots = [TargetRef::path("//t:one"), TargetRef::path("//t:two")];
    let mut u = Universe::new();
    u.build(&roots, &opts, Path::new("/")).unwrap();

    let out = TempDir::new().unwrap();
    u.check(&roots, out.path()).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "seen //t:one".to_string(),
            "seen //t:two".to_string(),
            "audit".to_string(),
        ]
    );
}

const TOOLCHAIN: &str = r#"
[[toolchain]]
name = "cc"
binaries = { cc = "/usr/bin/cc", ld = "/usr/bin/ld" }

[[build]]
name = "compile"
host_deps = [":cc"]
steps = [{ kind = "shell_cmd", args = ["cc -o app app.c"] }]
"#;

#[test]
fn test_toolchain_binary_missing_from_base_fails_check() {
    let dir = contracts(&[("p.toml", TOOLCHAIN)]);
    let u = built(&dir, &["//p:cc"]).unwrap();
    let base = TempDir::new().unwrap();
    fs::create_dir_all(base.path().join("usr/bin")).unwrap();
    fs::write(base.path().join("usr/bin/ld"), "").unwrap();

    let err = u.check(&[TargetRef::path("//p:cc")], base.path()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::CheckerFailure);
    assert!(err.to_string().contains("toolchain component missing: cc"), "{}", err);
    assert_eq!(err.context().unwrap().target.as_deref(), Some("//p:cc"));

    fs::write(base.path().join("usr/bin/cc"), "").unwrap();
    u.check(&[TargetRef::path("//p:cc")], base.path()).unwrap();
}

#[test]
fn test_rollup_ignores_binary_mapping_order() {
    let env = RunnerEnv::host();
    let swapped = TOOLCHAIN.replace(
        "{ cc = \"/usr/bin/cc\", ld = \"/usr/bin/ld\" }",
        "{ ld = \"/usr/bin/ld\", cc = \"/usr/bin/cc\" }",
    );
    assert_ne!(swapped, TOOLCHAIN);
    let moved = TOOLCHAIN.replace("/usr/bin/ld", "/opt/bin/ld");

    let a = built(&contracts(&[("p.toml", TOOLCHAIN)]), &["//p:compile"]).unwrap();
    let b = built(&contracts(&[("p.toml", swapped.as_str())]), &["//p:compile"]).unwrap();
    let c = built(&contracts(&[("p.toml", moved.as_str())]), &["//p:compile"]).unwrap();
    for path in ["//p:cc", "//p:compile"] {
        assert_eq!(
            a.target_rollup_hash(path, &env).unwrap(),
            b.target_rollup_hash(path, &env).unwrap(),
            "{}",
            path
        );
        assert_ne!(
            a.target_rollup_hash(path, &env).unwrap(),
            c.target_rollup_hash(path, &env).unwrap(),
            "{}",
            path
        );
    }
}

const TWO_STEPS: &str = r#"
[[build]]
name = "b"
steps = [
    { kind = "write", to_path = "first", args = ["1"] },
    { kind = "write", to_path = "second", args = ["2"] },
]
"#;

#[test]
fn test_rollup_follows_step_order() {
    let env = RunnerEnv::host();
    let swapped = r#"
[[build]]
name = "b"
steps = [
    { kind = "write", to_path = "second", args = ["2"] },
    { kind = "write", to_path = "first", args = ["1"] },
]
"#;
    let a = built(&contracts(&[("p.toml", TWO_STEPS)]), &["//p:b"]).unwrap();
    let b = built(&contracts(&[("p.toml", swapped)]), &["//p:b"]).unwrap();
    assert_ne!(
        a.target_rollup_hash("//p:b", &env).unwrap(),
        b.target_rollup_hash("//p:b", &env).unwrap()
    );
}

/// Evaluates every computed value to the same literal.
struct Fixed;

impl AttrEvaluator for Fixed {
    fn evaluate(
        &self,
        _attr: &Attr,
        _owner: Option<&Target>,
        _computed: &ComputedValue,
        _env: &RunnerEnv,
    ) -> UniverseResult<Value> {
        Ok(Value::from("fixed"))
    }
}

/// Evaluates every computed value to the base directory it runs against.
struct BaseDir;

impl AttrEvaluator for BaseDir {
    fn evaluate(
        &self,
        _attr: &Attr,
        _owner: Option<&Target>,
        _computed: &ComputedValue,
        env: &RunnerEnv,
    ) -> UniverseResult<Value> {
        Ok(Value::from(env.dir.display().to_string().as_str()))
    }
}

fn built_with(dir: &TempDir, root: &str, evaluator: Arc<dyn AttrEvaluator>) -> Universe {
    let opts = FindOptions::with_builtins().with_fallback(Arc::new(DirResolver::new(dir.path())));
    let mut u = Universe::new().with_evaluator(evaluator);
    u.build(&[TargetRef::path(root)], &opts, Path::new("/"))
        .unwrap();
    u
}

const COMPUTED: &str = r#"
[[resource]]
name = "conf"
class = "common://resources:virtual"
attrs = [":flavour"]

[[attr]]
name = "flavour"
class = "common://attrs:arch"
computed = { file = "flavour.sh", func = "pick" }

[[build]]
name = "b"
patch_ins = { "/conf" = ":conf" }
steps = [{ kind = "write", to_path = "out", args = ["x"] }]
"#;

#[test]
fn test_rollup_covers_computation_descriptor() {
    let env = RunnerEnv::host();
    let hash = |src: &str| {
        let dir = contracts(&[("p.toml", src)]);
        built_with(&dir, "//p:b", Arc::new(Fixed))
            .target_rollup_hash("//p:conf", &env)
            .unwrap()
    };

    let base = hash(COMPUTED);
    assert_eq!(hash(COMPUTED), base);
    assert_ne!(hash(COMPUTED.replace("\"pick\"", "\"choose\"").as_str()), base);
    assert_ne!(hash(COMPUTED.replace("flavour.sh", "other.sh").as_str()), base);
    assert_ne!(hash(format!("\n\n{}", COMPUTED).as_str()), base);
}

#[test]
fn test_build_rollup_is_memoised_per_base() {
    let dir = contracts(&[("p.toml", COMPUTED)]);
    let u = built_with(&dir, "//p:b", Arc::new(BaseDir));
    let one = RunnerEnv::new("/srv/one");
    let two = RunnerEnv::new("/srv/two");

    let first = u.target_rollup_hash("//p:b", &one).unwrap();
    let second = u.target_rollup_hash("//p:b", &two).unwrap();
    assert_ne!(first, second);
    assert_eq!(u.target_rollup_hash("//p:b", &one).unwrap(), first);
}

fn patching_build(patch_ins: &str) -> String {
    format!(
        r#"
[[resource]]
name = "r1"
class = "common://resources:virtual"

[[resource]]
name = "r2"
class = "common://resources:virtual"
deps = [":r1"]

[[build]]
name = "b"
patch_ins = {}
steps = [{{ kind = "write", to_path = "out", args = ["x"] }}]
"#,
        patch_ins
    )
}

#[test]
fn test_rollup_separates_patch_in_entries() {
    let env = RunnerEnv::host();
    let two = patching_build(r#"{ "/a" = ":r1", "/b" = ":r2" }"#);
    let a = built(&contracts(&[("p.toml", two.as_str())]), &["//p:b"]).unwrap();
    let r1 = hex::encode_upper(a.target_rollup_hash("//p:r1", &env).unwrap());

    // One entry whose destination spells out the first entry's line.
    let one = patching_build(&format!(r#"{{ "/a: {}/b" = ":r2" }}"#, r1));
    let b = built(&contracts(&[("p.toml", one.as_str())]), &["//p:b"]).unwrap();
    assert_ne!(
        a.target_rollup_hash("//p:b", &env).unwrap(),
        b.target_rollup_hash("//p:b", &env).unwrap()
    );
}
