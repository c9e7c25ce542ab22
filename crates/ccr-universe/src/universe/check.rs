//! The checking traversal.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use super::Universe;
use crate::error::{FailingConstraint, UniverseError, UniverseResult};
use crate::runner::{CheckContext, RunnerEnv};
use crate::target::{CheckerKind, NodeId, Target, TargetRef};

impl Universe {
    /// Run every checker reachable from `roots` against the filesystem at
    /// `base`, then every global checker once.
    pub fn check(&self, roots: &[TargetRef], base: &Path) -> UniverseResult<()> {
        self.ensure_built()?;
        let env = RunnerEnv::new(base);
        let ids = roots
            .iter()
            .map(|r| self.lookup_ref(r))
            .collect::<UniverseResult<Vec<_>>>()?;
        self.check_nodes(&ids, &env)
    }

    pub(crate) fn check_nodes(&self, roots: &[NodeId], env: &RunnerEnv) -> UniverseResult<()> {
        let mut checked = HashSet::new();
        for &root in roots {
            self.check_node(root, env, &mut checked)?;
        }
        self.run_global_checkers(env)
    }

    pub(crate) fn run_global_checkers(&self, env: &RunnerEnv) -> UniverseResult<()> {
        let ctx = CheckContext {
            universe: self,
            env,
        };
        for &checker in self.global_checkers() {
            let Target::Checker(c) = self.target(checker) else {
                continue;
            };
            debug!(checker = %self.label(checker), "running global checker");
            c.runner
                .check_global(&ctx)
                .map_err(|e| e.with_action_target(self.label(checker)))?;
        }
        Ok(())
    }

    pub(super) fn check_node(
        &self,
        id: NodeId,
        env: &RunnerEnv,
        checked: &mut HashSet<NodeId>,
    ) -> UniverseResult<()> {
        if !checked.insert(id) {
            return Ok(());
        }
        let target = self.target(id);
        debug!(node = %self.label(id), "checking");

        for dep in target.dependencies().unwrap_or_default() {
            self.check_ref_constraints(dep, env)
                .map_err(|e| e.with_target(self.label(id)))?;
            let dep = self.lookup_ref(dep)?;
            self.check_node(dep, env, checked)
                .map_err(|e| e.with_target(self.label(id)))?;
        }
        for dep in target.host_dependencies().unwrap_or_default() {
            self.check_ref_constraints(dep, env)
                .map_err(|e| e.with_target(self.label(id)))?;
        }
        if let Target::Generator(g) = target {
            for input in &g.inputs {
                self.check_ref_constraints(input, env)
                    .map_err(|e| e.with_target(self.label(id)))?;
            }
        }

        for attr in target.attributes().unwrap_or_default() {
            let attr = self.lookup_ref(attr)?;
            self.check_node(attr, env, checked)
                .map_err(|e| e.with_target(self.label(id)))?;
        }

        let ctx = CheckContext {
            universe: self,
            env,
        };

        if let Some(class) = target.class().and_then(TargetRef::id) {
            let class_target = self.target(class);
            let kind = match class_target {
                Target::ResourceClass(_) => CheckerKind::EachResource,
                Target::AttrClass(_) => CheckerKind::EachAttr,
                other => {
                    return Err(self.annotate(
                        UniverseError::validation(format!(
                            "cannot check against class target {}",
                            other.target_type()
                        )),
                        id,
                    ))
                }
            };
            for checker in class_target.checkers().unwrap_or_default() {
                self.run_checker(&ctx, checker, kind, id)
                    .map_err(|e| self.annotate(e, id))?;
            }
        }

        if !target.is_class() {
            if let Target::Component(c) = target {
                for checker in &c.checks {
                    self.run_checker(&ctx, checker, CheckerKind::EachComponent, id)
                        .map_err(|e| self.annotate(e, id))?;
                }
            }
            if let Some(src) = target.source() {
                let src = self.lookup_ref(src)?;
                match self.target(src) {
                    Target::Generator(_) | Target::Build(_) | Target::Sieve(_) | Target::Pseudo(_) => {}
                    other => {
                        return Err(self.annotate(
                            UniverseError::validation(format!(
                                "cannot check against source of type {}",
                                other.target_type()
                            )),
                            id,
                        ))
                    }
                }
                self.check_node(src, env, checked)
                    .map_err(|e| e.with_target(self.label(src)))?;
            }
        }

        if let Target::Toolchain(tc) = target {
            let mut bins: Vec<_> = tc.binary_mappings.iter().collect();
            bins.sort();
            for (name, path) in bins {
                let fs_path = env.fs_path(path);
                if std::fs::symlink_metadata(&fs_path).is_err() {
                    return Err(UniverseError::check_failed(format!(
                        "toolchain component missing: {}",
                        name
                    ))
                    .with_path(fs_path)
                    .with_target(self.label(id)));
                }
            }
        }
        Ok(())
    }

    /// Run one checker edge against `subject`. Global checkers are skipped
    /// here; they run once at the end.
    fn run_checker(
        &self,
        ctx: &CheckContext<'_>,
        checker: &TargetRef,
        kind: CheckerKind,
        subject: NodeId,
    ) -> UniverseResult<()> {
        let checker_id = self.lookup_ref(checker)?;
        let Target::Checker(c) = self.target(checker_id) else {
            return Err(UniverseError::validation(format!(
                "{} is not a checker",
                self.label(checker_id)
            )));
        };
        if c.kind == CheckerKind::Global {
            return Ok(());
        }
        if c.kind != kind {
            warn!(checker = %self.label(checker_id), expected = %kind, "checker kind mismatch");
        }
        self.runtime_info(subject, &c.runner.populators(), ctx)
            .map_err(|e| e.with_action_target(self.label(checker_id)))?;
        let result = match kind {
            CheckerKind::EachResource => c.runner.check_resource(ctx, subject),
            CheckerKind::EachAttr => c.runner.check_attr(ctx, subject),
            CheckerKind::EachComponent => c.runner.check_component(ctx, subject),
            CheckerKind::Global => c.runner.check_global(ctx),
        };
        result.map_err(|e| e.with_action_target(self.label(checker_id)))
    }

    /// Evaluate the constraints carried by an edge against the attributes
    /// of the target it points to.
    pub(crate) fn check_ref_constraints(&self, r: &TargetRef, env: &RunnerEnv) -> UniverseResult<()> {
        if r.constraints.is_empty() {
            return Ok(());
        }
        let target = self.lookup_ref(r)?;
        for c in &r.constraints {
            let class = c.class.id().ok_or_else(|| {
                UniverseError::resolve(c.class.to_string(), "constraint class is not resolved")
            })?;
            let class_path = self.target(class).global_path().ok_or_else(|| {
                UniverseError::resolve(c.class.to_string(), "constraint class must be named")
            })?;
            let left = self
                .attr_node_of_class(target, class_path)
                .map(|attr| self.attr_value(attr, Some(target), env))
                .transpose()?
                .ok_or_else(|| {
                    UniverseError::check_failed(format!(
                        "{} has no attribute of class {}",
                        self.label(target),
                        class_path
                    ))
                    .with_target(self.label(target))
                })?;
            if !c.op.evaluate(&left, &c.value)? {
                let failing = FailingConstraint {
                    left: left.to_string(),
                    op: c.op.as_str().to_string(),
                    right: c.value.to_string(),
                };
                return Err(UniverseError::CheckFailed {
                    message: format!(
                        "constraint on {} failed: {} {}",
                        self.label(target),
                        class_path,
                        failing
                    ),
                    constraint: Some(failing),
                }
                .with_target(self.label(target)));
            }
        }
        Ok(())
    }
}
