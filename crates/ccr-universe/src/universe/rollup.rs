//! Rollup hashes: the content address of a node and everything reproducible
//! beneath it.

use sha2::{Digest, Sha256};

use super::Universe;
use crate::error::{UniverseError, UniverseResult};
use crate::runner::RunnerEnv;
use crate::target::{AttrValue, NodeId, Target, TargetRef, Value};

/// Bump to invalidate every cached build output.
pub const BUILD_CACHE_VERSION: u32 = 1;

fn put(h: &mut Sha256, s: impl AsRef<str>) {
    h.update(s.as_ref().as_bytes());
}

fn typed(v: &Value) -> String {
    format!("{}:{}", v.type_name(), v)
}

impl Universe {
    /// Rollup hash of `id`. Build hashes are memoised per base directory
    /// for the lifetime of the universe.
    pub fn rollup_hash(&self, id: NodeId, env: &RunnerEnv) -> UniverseResult<Vec<u8>> {
        let is_build = matches!(self.target(id), Target::Build(_));
        let key = (id, env.dir.clone());
        if is_build {
            if let Some(h) = self
                .rollup_memo
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&key)
            {
                return Ok(h.clone());
            }
        }
        let mut stack = Vec::new();
        let h = self.hash_node(id, env, &mut stack)?;
        if is_build {
            self.rollup_memo
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key, h.clone());
        }
        Ok(h)
    }

    pub fn target_rollup_hash(&self, path: &str, env: &RunnerEnv) -> UniverseResult<Vec<u8>> {
        let id = self.get(path)?;
        self.rollup_hash(id, env)
    }

    fn hash_ref(&self, r: &TargetRef, env: &RunnerEnv, stack: &mut Vec<NodeId>) -> UniverseResult<Vec<u8>> {
        let id = self.lookup_ref(r)?;
        self.hash_node(id, env, stack)
    }

    fn hash_node(&self, id: NodeId, env: &RunnerEnv, stack: &mut Vec<NodeId>) -> UniverseResult<Vec<u8>> {
        if stack.contains(&id) {
            let mut h = Sha256::new();
            put(&mut h, format!("cycle: {}\n", self.label(id)));
            return Ok(h.finalize().to_vec());
        }
        let target = self.target(id);
        if !target.target_type().is_reproducible() {
            return Err(self.annotate(UniverseError::NonReproducible(target.target_type()), id));
        }
        stack.push(id);
        let result = self.hash_kind(id, target, env, stack);
        stack.pop();
        result
    }

    fn hash_kind(
        &self,
        id: NodeId,
        target: &Target,
        env: &RunnerEnv,
        stack: &mut Vec<NodeId>,
    ) -> UniverseResult<Vec<u8>> {
        let mut h = Sha256::new();
        match target {
            Target::Build(b) => {
                put(&mut h, format!("{}-build: {:?}\n{:?}\n", BUILD_CACHE_VERSION, b.path, b.name));
                for dep in &b.host_deps {
                    h.update(self.hash_ref(dep, env, stack)?);
                }
                for step in &b.steps {
                    h.update(step.rollup_hash());
                }
                if !b.patch_ins.is_empty() {
                    put(&mut h, "Input patches:\n");
                    for (dest, patch) in &b.patch_ins {
                        let ph = self.hash_ref(patch, env, stack)?;
                        put(&mut h, format!("{}: {}\n", dest, hex::encode_upper(ph)));
                    }
                }
                h.update(b.output.rollup_hash());
                for inj in &b.injections {
                    h.update(self.hash_ref(inj, env, stack)?);
                }
                let mut vars: Vec<_> = b.env.iter().collect();
                vars.sort();
                for (k, v) in vars {
                    put(&mut h, format!("Env[{}] = {:?}\n", k, v));
                }
                if let Some(root) = &b.using_root {
                    put(&mut h, "Using root:\n");
                    h.update(self.hash_ref(root, env, stack)?);
                }
                put(&mut h, format!("rootfs: {}\n", b.produces_rootfs));
            }
            Target::Sieve(s) => {
                put(&mut h, format!("Sieve: {:?}\n{}\n", s.name, s.add_prefix));
                for input in &s.inputs {
                    h.update(self.hash_ref(input, env, stack)?);
                }
                for ex in &s.exclude_globs {
                    put(&mut h, format!("Ex pattern: {}\n", ex));
                }
                for inc in &s.include_globs {
                    put(&mut h, format!("Inc pattern: {}\n", inc));
                }
                if let Some(renames) = &s.renames {
                    h.update(renames.rollup_hash());
                }
            }
            Target::Pseudo(p) => {
                put(&mut h, format!("{:?}\n{:?}\n{:?}\n", p.kind, p.name, p.path));
                put(&mut h, format!("{:?}\n{:?}\n{:?}\n", p.file, p.url, p.sha256));
                put(&mut h, format!("{}\n", p.host));
                self.hash_attrs(&mut h, id, &p.details, env)?;
            }
            Target::Resource(r) => {
                put(&mut h, format!("resource: {:?}\n{:?}\n", r.path, r.name));
                if let Some(class) = r.class.id() {
                    put(&mut h, format!("class: {}\n", self.label(class)));
                }
                self.hash_attrs(&mut h, id, &r.details, env)?;
                for dep in &r.deps {
                    h.update(self.hash_ref(dep, env, stack)?);
                }
                if let Some(src) = &r.source {
                    let src_id = self.lookup_ref(src)?;
                    match self.target(src_id) {
                        Target::Generator(g) => {
                            put(&mut h, format!("generator: {} ({})\n", self.label(src_id), g.runner.name()))
                        }
                        _ => h.update(self.hash_node(src_id, env, stack)?),
                    }
                }
            }
            Target::Component(c) => {
                put(&mut h, format!("component: {:?}\n{:?}\n", c.path, c.name));
                self.hash_attrs(&mut h, id, &c.details, env)?;
                for dep in &c.deps {
                    h.update(self.hash_ref(dep, env, stack)?);
                }
            }
            Target::ResourceClass(rc) => {
                put(&mut h, format!("resource_class: {:?}\n{:?}\n", rc.path, rc.name));
                for dep in &rc.deps {
                    h.update(self.hash_ref(dep, env, stack)?);
                }
            }
            Target::Toolchain(t) => {
                put(&mut h, format!("toolchain: {:?}\n{:?}\n", t.path, t.name));
                let mut bins: Vec<_> = t.binary_mappings.iter().collect();
                bins.sort();
                for (name, path) in bins {
                    put(&mut h, format!("bin[{:?}] = {:?}\n", name, path));
                }
                self.hash_attrs(&mut h, id, &t.details, env)?;
                for dep in &t.deps {
                    h.update(self.hash_ref(dep, env, stack)?);
                }
            }
            Target::Attr(_) => self.hash_attr(&mut h, id, None, env)?,
            Target::AttrClass(_) | Target::Checker(_) | Target::Generator(_) => {
                return Err(UniverseError::NonReproducible(target.target_type()));
            }
        }
        Ok(h.finalize().to_vec())
    }

    fn hash_attrs(
        &self,
        h: &mut Sha256,
        owner: NodeId,
        attrs: &[TargetRef],
        env: &RunnerEnv,
    ) -> UniverseResult<()> {
        for attr in attrs {
            let attr = self.lookup_ref(attr)?;
            self.hash_attr(h, attr, Some(owner), env)?;
        }
        Ok(())
    }

    /// Name, class, computation descriptor and evaluated value of an attr.
    fn hash_attr(
        &self,
        h: &mut Sha256,
        attr: NodeId,
        owner: Option<NodeId>,
        env: &RunnerEnv,
    ) -> UniverseResult<()> {
        let Target::Attr(a) = self.target(attr) else {
            return Err(UniverseError::validation(format!(
                "{} is not an attr",
                self.label(attr)
            )));
        };
        let class = a.class.id().map(|c| self.label(c)).unwrap_or_default();
        put(h, format!("{:?}\n{:?}\n{:?}\n", a.name, a.path, class));
        if let AttrValue::Computed(cv) = &a.value {
            let pos = cv
                .pos
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default();
            put(
                h,
                format!(
                    "computed params: file = {:?} func = {:?} inline = {:?} at {:?}",
                    cv.file, cv.func, cv.inline, pos
                ),
            );
        }
        let value = self.attr_value(attr, owner, env)?;
        put(h, typed(&value));
        Ok(())
    }
}
