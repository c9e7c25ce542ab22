//! Generation integration tests
//!
//! Contracts on disk, a real cache and the local executor, end to end.

use ccr_universe::cache::Cache;
use ccr_universe::executor::{BuildEnv, BuildExecutor, LocalExecutor};
use ccr_universe::runner::{GenerateContext, GenerateRunner};
use ccr_universe::target::{Attr, AttrValue, Build, Generator, Resource, ResourceClass};
use ccr_universe::{
    common, DirResolver, FindOptions, GenerationContext, MemoryResolver, Target, TargetRef,
    Universe, UniverseResult, Value,
};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const ROOT: &str = r#"
[[component]]
name = "app"
deps = [":bin", ":conf_dir", ":conf", ":link"]

[[resource]]
name = "bin"
class = "common://resources:binary"
attrs = [
    { class = "common://attrs:path", value = "/usr/bin/app" },
    { class = "common://attrs:mode", value = "0755" },
]
source = ":build"

[[resource]]
name = "conf_dir"
class = "common://resources:dir"
attrs = [{ class = "common://attrs:path", value = "/etc/app" }]
source = "common://generators:dir"

[[resource]]
name = "conf"
class = "common://resources:json_file"
attrs = [{ class = "common://attrs:path", value = "/etc/app/config.json" }]
source = ":config"

[[file]]
name = "config"
path = "config.json"

[[resource]]
name = "link"
class = "common://resources:symlink"
attrs = [
    { class = "common://attrs:path", value = "/bin/app" },
    { class = "common://attrs:target", value = "/usr/bin/app" },
]
source = "common://generators:symlink"

[[build]]
name = "build"
host_deps = ["common://toolchains:sh"]
steps = [{ kind = "shell_cmd", args = ["mkdir -p usr/bin && printf 'echo hi\\n' > usr/bin/app"] }]
output = { "usr/bin/app" = "usr/bin/app" }
"#;

/// Counts builds that actually ran.
#[derive(Default)]
struct CountingExecutor {
    inner: LocalExecutor,
    builds: AtomicUsize,
}

impl BuildExecutor for CountingExecutor {
    fn new_env(&self, build: &Build, cache: &Cache) -> UniverseResult<Box<dyn BuildEnv>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.new_env(build, cache)
    }
}

fn write_contracts(root_toml: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("root.toml"), root_toml).unwrap();
    fs::write(dir.path().join("config.json"), "{\"name\": \"app\"}\n").unwrap();
    dir
}

fn load(contracts: &Path) -> Universe {
    let opts = FindOptions::with_builtins().with_fallback(Arc::new(DirResolver::new(contracts)));
    let mut u = Universe::new();
    u.build(&[TargetRef::path("//root:app")], &opts, Path::new("/"))
        .unwrap();
    u
}

#[cfg(unix)]
fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

#[cfg(unix)]
#[test]
fn test_generate_materializes_every_resource() {
    let contracts = write_contracts(ROOT);
    let (cache, out) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let mut u = load(contracts.path());
    let ctx = GenerationContext::new(Cache::open(cache.path()).unwrap(), Arc::new(LocalExecutor::new()));

    u.generate(&ctx, &TargetRef::path("//root:app"), out.path())
        .unwrap();

    let bin = out.path().join("usr/bin/app");
    assert_eq!(fs::read_to_string(&bin).unwrap(), "echo hi\n");
    assert_eq!(mode_of(&bin), 0o755);
    assert!(out.path().join("etc/app").is_dir());
    assert_eq!(
        fs::read_to_string(out.path().join("etc/app/config.json")).unwrap(),
        "{\"name\": \"app\"}\n"
    );
    assert_eq!(
        fs::read_link(out.path().join("bin/app")).unwrap(),
        Path::new("/usr/bin/app")
    );

    u.check(&[TargetRef::path("//root:app")], out.path()).unwrap();
}

#[cfg(unix)]
#[test]
fn test_second_generation_is_served_from_cache() {
    let contracts = write_contracts(ROOT);
    let cache = TempDir::new().unwrap();
    let (first, second) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let exec = Arc::new(CountingExecutor::default());
    let ctx = GenerationContext::new(Cache::open(cache.path()).unwrap(), exec.clone());

    let mut u = load(contracts.path());
    u.generate(&ctx, &TargetRef::path("//root:app"), first.path())
        .unwrap();
    assert_eq!(exec.builds.load(Ordering::SeqCst), 1);

    // A fresh universe over the same contracts hits the same cache entry.
    let mut again = load(contracts.path());
    again
        .generate(&ctx, &TargetRef::path("//root:app"), second.path())
        .unwrap();
    assert_eq!(exec.builds.load(Ordering::SeqCst), 1);

    let read = |dir: &TempDir| fs::read(dir.path().join("usr/bin/app")).unwrap();
    assert_eq!(read(&first), read(&second));

    let hash = again
        .target_rollup_hash("//root:build", &ccr_universe::runner::RunnerEnv::host())
        .unwrap();
    assert!(ctx.cache.is_hash_cached(&hash));
}

#[cfg(unix)]
#[test]
fn test_changed_step_rebuilds() {
    let cache = TempDir::new().unwrap();
    let exec = Arc::new(CountingExecutor::default());
    let ctx = GenerationContext::new(Cache::open(cache.path()).unwrap(), exec.clone());

    let original = write_contracts(ROOT);
    let out = TempDir::new().unwrap();
    load(original.path())
        .generate(&ctx, &TargetRef::path("//root:app"), out.path())
        .unwrap();

    let changed = write_contracts(&ROOT.replace("echo hi", "echo bye"));
    let out = TempDir::new().unwrap();
    load(changed.path())
        .generate(&ctx, &TargetRef::path("//root:app"), out.path())
        .unwrap();

    assert_eq!(exec.builds.load(Ordering::SeqCst), 2);
    assert_eq!(
        fs::read_to_string(out.path().join("usr/bin/app")).unwrap(),
        "echo bye\n"
    );
}

#[cfg(unix)]
#[test]
fn test_missing_build_output_is_reported() {
    let contracts = write_contracts(&ROOT.replace(
        "output = { \"usr/bin/app\" = \"usr/bin/app\" }",
        "output = { \"usr/bin/other\" = \"usr/bin/other\" }",
    ));
    let (cache, out) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let ctx = GenerationContext::new(Cache::open(cache.path()).unwrap(), Arc::new(LocalExecutor::new()));

    let err = load(contracts.path())
        .generate(&ctx, &TargetRef::path("//root:app"), out.path())
        .unwrap_err();
    assert_eq!(err.root_cause().to_string(), "file missing from build output");
    let wrapped = err.context().unwrap();
    assert_eq!(wrapped.target.as_deref(), Some("//root:bin"));
    assert_eq!(wrapped.action_target.as_deref(), Some("//root:build"));
}

/// Creates its resource's directory and injects one `//dyn:plugin`
/// instance per name beneath it.
struct Spawner(&'static [&'static str]);

impl GenerateRunner for Spawner {
    fn name(&self) -> &str {
        "spawner"
    }

    fn run(&self, ctx: &mut GenerateContext<'_>) -> UniverseResult<()> {
        let path = ctx.universe.determine_path(ctx.resource, ctx.env)?;
        fs::create_dir_all(ctx.env.fs_path(&path)).unwrap();
        for name in self.0 {
            ctx.inject(plugin(name, &format!("{}/{}", path, name)));
        }
        Ok(())
    }
}

fn path_attr(path: &str) -> TargetRef {
    TargetRef::inline(Target::Attr(Attr {
        path: String::new(),
        name: String::new(),
        pos: None,
        class: TargetRef::path(common::PATH_ATTR),
        value: AttrValue::Literal(Value::from(path)),
    }))
}

fn resource(path: &str, class: &str, attr_path: &str, source: &str) -> Target {
    Target::Resource(Resource {
        path: path.to_string(),
        name: path.rsplit(':').next().unwrap_or_default().to_string(),
        pos: None,
        class: TargetRef::path(class),
        deps: Vec::new(),
        details: vec![path_attr(attr_path)],
        source: Some(TargetRef::path(source)),
    })
}

fn plugin(name: &str, dir: &str) -> Target {
    resource(
        &format!("//dyn:plugin_{}", name),
        "//dyn:plugin",
        dir,
        "common://generators:dir",
    )
}

fn dynamic_contracts() -> MemoryResolver {
    let mut r = MemoryResolver::new();
    r.insert(
        "//dyn:app",
        Target::Component(ccr_universe::target::Component {
            path: "//dyn:app".into(),
            name: "app".into(),
            deps: vec![
                TargetRef::path("//dyn:etc"),
                TargetRef::path("//dyn:plugins"),
                TargetRef::path("//dyn:list"),
            ],
            ..Default::default()
        }),
    )
    .insert(
        "//dyn:plugin",
        Target::ResourceClass(ResourceClass {
            path: "//dyn:plugin".into(),
            name: "plugin".into(),
            pos: None,
            deps: Vec::new(),
            checks: vec![TargetRef::path("common://checks:dir_present")],
            populate: None,
        }),
    )
    .insert(
        "//dyn:etc",
        resource("//dyn:etc", common::DIR_CLASS, "/etc", "common://generators:dir"),
    )
    .insert(
        "//dyn:plugins",
        resource("//dyn:plugins", common::DIR_CLASS, "/plugins", "//dyn:spawn"),
    )
    .insert(
        "//dyn:spawn",
        Target::Generator(Generator {
            path: "//dyn:spawn".into(),
            name: "spawn".into(),
            pos: None,
            inputs: Vec::new(),
            runner: Arc::new(Spawner(&["alpha", "beta"])),
        }),
    )
    .insert(
        "//dyn:list",
        resource("//dyn:list", common::FILE_CLASS, "/plugins.list", "//dyn:manifest"),
    )
    .insert(
        "//dyn:manifest",
        Target::Generator(Generator {
            path: "//dyn:manifest".into(),
            name: "manifest".into(),
            pos: None,
            inputs: vec![TargetRef::path("//dyn:plugin")],
            runner: common::generate_runner("manifest").unwrap(),
        }),
    );
    r
}

#[test]
fn test_injected_targets_join_their_class() {
    let (cache, out) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let opts = FindOptions::with_builtins().with_fallback(Arc::new(dynamic_contracts()));
    let mut u = Universe::new();
    u.build(&[TargetRef::path("//dyn:app")], &opts, Path::new("/"))
        .unwrap();
    let class = u.get("//dyn:plugin").unwrap();
    assert!(u.class_instances(class).is_empty());

    let ctx = GenerationContext::new(Cache::open(cache.path()).unwrap(), Arc::new(LocalExecutor::new()));
    u.generate(&ctx, &TargetRef::path("//dyn:app"), out.path())
        .unwrap();

    assert_eq!(u.class_instances(class).len(), 2);
    assert!(out.path().join("plugins/alpha").is_dir());
    assert!(out.path().join("plugins/beta").is_dir());
    assert_eq!(
        fs::read_to_string(out.path().join("plugins.list")).unwrap(),
        "/plugins/alpha\n/plugins/beta\n"
    );
    assert!(u
        .find_by_path("/plugins/beta", &ccr_universe::runner::RunnerEnv::host())
        .unwrap()
        .is_some());
}

const PATCHED_FILE: &str = r#"
[[component]]
name = "app"
deps = [":packaged"]

[[resource]]
name = "packaged"
class = "common://resources:file"
attrs = [{ class = "common://attrs:path", value = "/usr/share/app/config.json" }]
source = ":package"

[[file]]
name = "config"
path = "config.json"

[[build]]
name = "package"
patch_ins = { "/src/app.json" = ":config" }
steps = [{ kind = "shell_cmd", args = ["cp src/app.json packaged.json"] }]
output = { "packaged.json" = "usr/share/app/config.json" }
"#;

#[cfg(unix)]
#[test]
fn test_file_source_patched_in_at_its_destination() {
    let contracts = write_contracts(PATCHED_FILE);
    let (cache, out) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let mut u = load(contracts.path());
    let ctx = GenerationContext::new(Cache::open(cache.path()).unwrap(), Arc::new(LocalExecutor::new()));

    u.generate(&ctx, &TargetRef::path("//root:app"), out.path())
        .unwrap();

    assert_eq!(
        fs::read_to_string(out.path().join("usr/share/app/config.json")).unwrap(),
        "{\"name\": \"app\"}\n"
    );
}
