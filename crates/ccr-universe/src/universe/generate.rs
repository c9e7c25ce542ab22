//! The generation traversal and the build driver.
//!
//! Generation walks a root in a fixed order: a node's inputs (in inputs
//! mode, where revisiting a node on the current chain is fatal), then the
//! instances of a class, then dependencies, then the node's source, and
//! finally materializes the node itself. Every node is generated at most
//! once per call.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::Universe;
use crate::cache::{Cache, Fileset};
use crate::error::{UniverseError, UniverseResult};
use crate::executor::{capture_outputs, run_steps, BuildEnv, BuildExecutor};
use crate::runner::{GenerateContext, InputSet, RunnerEnv};
use crate::target::{Build, NodeId, PseudoKind, Target, TargetRef};

/// Generators whose output may be injected into a build root.
const INJECTABLE_GENERATORS: [&str; 2] = ["dir", "symlink"];

/// The collaborators generation needs beyond the graph.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub cache: Cache,
    pub executor: Arc<dyn BuildExecutor>,
}

impl GenerationContext {
    pub fn new(cache: Cache, executor: Arc<dyn BuildExecutor>) -> Self {
        Self { cache, executor }
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum Mode {
    Deps,
    /// Beneath the inputs of the node at this position of the chain.
    Inputs(usize),
}

impl Mode {
    /// The mode for the inputs of the node at `position`. Nested input
    /// walks keep the outermost root.
    pub(super) fn for_inputs(self, position: usize) -> Mode {
        match self {
            Mode::Inputs(root) => Mode::Inputs(root),
            Mode::Deps => Mode::Inputs(position),
        }
    }
}

#[derive(Default)]
struct Traversal {
    generated: HashSet<NodeId>,
    host_checked: HashSet<NodeId>,
    chain: Vec<NodeId>,
}

impl Universe {
    /// Materialize `root` and everything it needs beneath `base`, then
    /// check the result.
    pub fn generate(
        &mut self,
        ctx: &GenerationContext,
        root: &TargetRef,
        base: &Path,
    ) -> UniverseResult<()> {
        self.ensure_built()?;
        let root = self.lookup_ref(root)?;
        std::fs::create_dir_all(base).map_err(|e| UniverseError::io(base, e))?;
        let env = RunnerEnv::new(base);

        let start = Instant::now();
        let mut st = Traversal::default();
        self.generate_node(ctx, &env, &mut st, root, Mode::Deps)?;
        info!(
            root = %self.label(root),
            generated = st.generated.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generation complete"
        );

        self.check_nodes(&[root], &env)
    }

    fn generate_node(
        &mut self,
        ctx: &GenerationContext,
        env: &RunnerEnv,
        st: &mut Traversal,
        id: NodeId,
        mode: Mode,
    ) -> UniverseResult<()> {
        if self.on_chain(&st.chain, id, mode)? || st.generated.contains(&id) {
            return Ok(());
        }

        st.chain.push(id);
        let result = self.generate_edges(ctx, env, st, id, mode);
        st.chain.pop();
        result?;

        // Classes stay unmarked so a later visit sees instances added since.
        if !self.target(id).is_class() {
            st.generated.insert(id);
        }
        Ok(())
    }

    fn generate_edges(
        &mut self,
        ctx: &GenerationContext,
        env: &RunnerEnv,
        st: &mut Traversal,
        id: NodeId,
        mode: Mode,
    ) -> UniverseResult<()> {
        debug!(node = %self.label(id), "generating");

        let input_mode = mode.for_inputs(st.chain.len() - 1);
        for input in self.traversal_inputs(id)? {
            self.generate_node(ctx, env, st, input, input_mode)
                .map_err(|e| e.with_target(self.label(id)))?;
        }

        if self.target(id).is_class() {
            let mut next = 0;
            while let Some(&instance) = self.class_instances(id).get(next) {
                next += 1;
                self.generate_node(ctx, env, st, instance, mode)
                    .map_err(|e| e.with_target(self.label(id)))?;
            }
            return Ok(());
        }

        if matches!(self.target(id), Target::Toolchain(_)) {
            return self
                .check_node(id, &RunnerEnv::host(), &mut st.host_checked)
                .map_err(|e| e.with_target(self.label(id)));
        }

        let deps = self.edge_ids(self.target(id).dependencies().unwrap_or_default())?;
        for dep in deps {
            self.generate_node(ctx, env, st, dep, mode)
                .map_err(|e| e.with_target(self.label(id)))?;
        }

        if let Target::Build(b) = self.target(id) {
            let host = RunnerEnv::host();
            for dep in self.edge_ids(&b.host_deps)? {
                self.check_node(dep, &host, &mut st.host_checked)
                    .map_err(|e| e.with_target(self.label(id)))?;
            }
            self.generate_build(ctx, id, env)?;
            return Ok(());
        }

        let Some(source) = self.target(id).source() else {
            return Ok(());
        };
        let source = self.lookup_ref(source)?;
        self.generate_node(ctx, env, st, source, mode)
            .map_err(|e| e.with_target(self.label(id)))?;

        if matches!(self.target(source), Target::Generator(_)) {
            self.run_generator(ctx, env, st, id, source, mode)
        } else {
            self.populate_resource(ctx, id, env, &env.dir)
                .map_err(|e| self.annotate(e, id))
        }
    }

    /// Run the generator `source` for `resource`, then link and generate
    /// any targets it created.
    fn run_generator(
        &mut self,
        ctx: &GenerationContext,
        env: &RunnerEnv,
        st: &mut Traversal,
        resource: NodeId,
        source: NodeId,
        mode: Mode,
    ) -> UniverseResult<()> {
        let injected = {
            let Target::Generator(g) = self.target(source) else {
                return Err(UniverseError::validation(format!(
                    "{} is not a generator",
                    self.label(source)
                )));
            };
            let inputs = self.input_set(&g.inputs)?;
            let mut gctx = GenerateContext::new(self, resource, &inputs, env);
            g.runner
                .run(&mut gctx)
                .map_err(|e| self.annotate(e.with_action_target(self.label(source)), resource))?;
            gctx.into_injected()
        };

        for target in injected {
            let id = self.inject(target)?;
            self.generate_node(ctx, env, st, id, mode)
                .map_err(|e| e.with_target(self.label(resource)))?;
        }
        Ok(())
    }

    /// Direct inputs plus the current instances of every class input.
    pub(crate) fn input_set(&self, inputs: &[TargetRef]) -> UniverseResult<InputSet> {
        let mut set = InputSet::default();
        for (i, input) in inputs.iter().enumerate() {
            let id = self.lookup_ref(input)?;
            match self.target(id) {
                Target::Resource(_) | Target::Component(_) => set.directs.push(id),
                Target::ResourceClass(_) => {
                    set.classed.insert(id, self.class_instances(id));
                }
                other => {
                    return Err(UniverseError::validation(format!(
                        "input[{}] references unsupported target type {}",
                        i,
                        other.target_type()
                    )))
                }
            }
        }
        Ok(set)
    }

    /// Edges walked in inputs mode: declared inputs, plus the root
    /// filesystem a build starts from.
    pub(super) fn traversal_inputs(&self, id: NodeId) -> UniverseResult<Vec<NodeId>> {
        let target = self.target(id);
        let mut out = Vec::new();
        for input in target.inputs().unwrap_or_default() {
            out.push(self.lookup_ref(input)?);
        }
        if let Target::Build(b) = target {
            if let Some(root) = &b.using_root {
                out.push(self.lookup_ref(root)?);
            }
        }
        Ok(out)
    }

    pub(super) fn edge_ids(&self, edges: &[TargetRef]) -> UniverseResult<Vec<NodeId>> {
        edges.iter().map(|r| self.lookup_ref(r)).collect()
    }

    /// Whether `id` is already being visited further up `chain`. Revisiting
    /// a chain node from beneath some inputs is a circular dependency;
    /// anywhere else it only states co-existence.
    pub(super) fn on_chain(&self, chain: &[NodeId], id: NodeId, mode: Mode) -> UniverseResult<bool> {
        match (chain.iter().position(|&n| n == id), mode) {
            (None, _) => Ok(false),
            (Some(at), Mode::Inputs(root)) => Err(self.circular(&chain[at.min(root)..], id)),
            (Some(_), Mode::Deps) => Ok(true),
        }
    }

    fn circular(&self, cycle: &[NodeId], id: NodeId) -> UniverseError {
        let chain: Vec<String> = cycle
            .iter()
            .copied()
            .chain(std::iter::once(id))
            .map(|n| self.label(n))
            .collect();
        UniverseError::CircularDependency {
            message: format!("circular dependency: {}", chain.join(" -> ")),
            chain,
        }
    }

    /// Make sure the output of build `id` is in the cache, running it if
    /// needed. Returns the build's rollup hash. Inputs of the build must
    /// already be generated.
    pub fn generate_build(
        &self,
        ctx: &GenerationContext,
        id: NodeId,
        env: &RunnerEnv,
    ) -> UniverseResult<Vec<u8>> {
        let Target::Build(b) = self.target(id) else {
            return Err(UniverseError::validation(format!(
                "{} is not a build",
                self.label(id)
            )));
        };
        let hash = self.rollup_hash(id, env).map_err(|e| self.annotate(e, id))?;
        let key = Cache::hash_string(&hash);
        if ctx.cache.is_hash_cached(&hash) {
            info!(build = %b.path, %key, "cache hit");
            return Ok(hash);
        }

        info!(build = %b.path, %key, "starting build");
        let mut build_env = ctx
            .executor
            .new_env(b, &ctx.cache)
            .map_err(|e| self.annotate(e, id))?;
        let outputs = self.run_build(ctx, b, build_env.as_mut(), env);
        let closed = build_env.close();
        let outputs = outputs.map_err(|e| self.annotate(e, id))?;
        closed.map_err(|e| self.annotate(e, id))?;

        ctx.cache.commit_fileset(&hash, &outputs)?;
        match ctx.cache.fileset(&hash) {
            Ok(_) => Ok(hash),
            Err(e) if e.is_cache_miss() => Err(self.annotate(
                UniverseError::generation(format!(
                    "build output {} missing from cache after commit",
                    key
                )),
                id,
            )),
            Err(e) => Err(self.annotate(e, id)),
        }
    }

    fn run_build(
        &self,
        ctx: &GenerationContext,
        b: &Build,
        build_env: &mut dyn BuildEnv,
        env: &RunnerEnv,
    ) -> UniverseResult<Fileset> {
        let root = build_env.root().to_path_buf();
        self.prepare_build_root(ctx, b, &root, env)?;
        run_steps(b, build_env)?;
        capture_outputs(&root, &b.output)
    }

    /// Lay down the starting filesystem: the `using_root` tree, then
    /// injections, then patch-ins.
    fn prepare_build_root(
        &self,
        ctx: &GenerationContext,
        b: &Build,
        root: &Path,
        env: &RunnerEnv,
    ) -> UniverseResult<()> {
        if let Some(base) = &b.using_root {
            let base = self.lookup_ref(base)?;
            self.fileset_for_source(ctx, base, env)?.write_to_dir(root)?;
        }

        let mut done = HashSet::new();
        for inj in &b.injections {
            let inj = self.lookup_ref(inj)?;
            debug!(build = %b.path, injection = %self.label(inj), "injecting");
            self.inject_into(ctx, inj, root, env, &mut done)
                .map_err(|e| e.with_action_target(self.label(inj)))?;
        }

        for (dest, patch) in &b.patch_ins {
            let patch = self.lookup_ref(patch)?;
            debug!(build = %b.path, patch = %self.label(patch), dest = %dest, "patching in");
            let dest = root.join(dest.trim_start_matches('/'));
            self.patch_into(ctx, patch, &dest, env)
                .map_err(|e| e.with_action_target(self.label(patch)))?;
        }
        Ok(())
    }

    fn inject_into(
        &self,
        ctx: &GenerationContext,
        id: NodeId,
        root: &Path,
        env: &RunnerEnv,
        done: &mut HashSet<NodeId>,
    ) -> UniverseResult<()> {
        let target = self.target(id);
        if !matches!(target, Target::Component(_)) && !done.insert(id) {
            return Ok(());
        }
        match target {
            Target::Build(_) | Target::Sieve(_) => {
                self.fileset_for_source(ctx, id, env)?.write_to_dir(root)
            }
            Target::Pseudo(p) if p.kind == PseudoKind::Deb => {
                self.fileset_for_source(ctx, id, env)?.write_to_dir(root)
            }
            Target::Component(c) => {
                for dep in self.edge_ids(&c.deps)? {
                    self.inject_into(ctx, dep, root, env, done)?;
                }
                Ok(())
            }
            Target::Resource(_) => self.inject_resource(ctx, id, root, env),
            other => Err(UniverseError::generation(format!(
                "cannot inject {}; patch it in at a path instead",
                other
            ))),
        }
    }

    fn patch_into(
        &self,
        ctx: &GenerationContext,
        id: NodeId,
        dest: &Path,
        env: &RunnerEnv,
    ) -> UniverseResult<()> {
        match self.target(id) {
            Target::Component(c) => {
                for dep in self.edge_ids(&c.deps)? {
                    self.patch_into(ctx, dep, dest, env)?;
                }
                Ok(())
            }
            Target::Resource(_) => self.inject_resource(ctx, id, dest, env),
            Target::Pseudo(p) if p.kind == PseudoKind::File => {
                let files = self.fileset_for_source(ctx, id, env)?;
                let written = match files.files().next() {
                    Some(entry) => entry.write_to(dest, None),
                    None => Err(UniverseError::generation("file source is empty")),
                };
                written
            }
            Target::Build(_) | Target::Sieve(_) | Target::Pseudo(_) => {
                self.fileset_for_source(ctx, id, env)?.write_to_dir(dest)
            }
            other => Err(UniverseError::generation(format!(
                "cannot patch in {}",
                other
            ))),
        }
    }

    /// Populate a resource into a build root. Generated resources are only
    /// allowed for the directory and symlink generators.
    fn inject_resource(
        &self,
        ctx: &GenerationContext,
        id: NodeId,
        out: &Path,
        env: &RunnerEnv,
    ) -> UniverseResult<()> {
        let Some(source) = self.target(id).source() else {
            return Err(self.annotate(
                UniverseError::generation("cannot inject using virtual resource"),
                id,
            ));
        };
        let source = self.lookup_ref(source)?;
        let Target::Generator(g) = self.target(source) else {
            return self
                .populate_resource(ctx, id, env, out)
                .map_err(|e| self.annotate(e, id));
        };
        if !INJECTABLE_GENERATORS.contains(&g.runner.name()) {
            return Err(self.annotate(
                UniverseError::generation("cannot inject generator targets"),
                id,
            ));
        }

        let inputs = InputSet::default();
        let out_env = RunnerEnv::new(out);
        let mut gctx = GenerateContext::new(self, id, &inputs, &out_env);
        g.runner
            .run(&mut gctx)
            .map_err(|e| self.annotate(e.with_action_target(self.label(source)), id))?;
        let dropped = gctx.into_injected();
        if !dropped.is_empty() {
            warn!(resource = %self.label(id), count = dropped.len(), "targets created during injection were dropped");
        }
        Ok(())
    }
}
