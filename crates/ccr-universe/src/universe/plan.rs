//! Dependency-order planning.
//!
//! A plan splits every target of one type reachable from a root into
//! phases. Each node in phase `k` only depends on same-type nodes from
//! earlier phases, so the members of a phase can be generated
//! concurrently.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::debug;

use super::generate::Mode;
use super::Universe;
use crate::error::{UniverseError, UniverseResult};
use crate::target::{NodeId, TargetRef, TargetType};

/// Every edge walked from the root, in the same order generation walks
/// them.
#[derive(Default)]
struct Collection {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    visited: HashSet<NodeId>,
    chain: Vec<NodeId>,
}

impl Collection {
    fn node(&mut self, id: NodeId) -> NodeIndex {
        *self
            .index
            .entry(id)
            .or_insert_with(|| self.graph.add_node(id))
    }

    fn edge(&mut self, from: NodeId, to: NodeId) {
        let (a, b) = (self.node(from), self.node(to));
        self.graph.update_edge(a, b, ());
    }
}

type SameTypeDeps = BTreeMap<NodeId, BTreeSet<NodeId>>;

impl Universe {
    /// Phases of the targets of type `tt` beneath `root`, each phase sorted
    /// by the targets' display form.
    pub fn plan(&self, root: &TargetRef, tt: TargetType) -> UniverseResult<Vec<Vec<NodeId>>> {
        self.ensure_built()?;
        let root = self.lookup_ref(root)?;

        let mut c = Collection::default();
        c.node(root);
        self.collect(&mut c, root, Mode::Deps)?;

        let deps = self.same_type_deps(&c, tt);
        self.reject_cycles(&deps, tt)?;
        let phases = self.extract_phases(deps)?;
        debug!(root = %self.label(root), kind = %tt, phases = phases.len(), "plan computed");
        Ok(phases)
    }

    fn collect(&self, c: &mut Collection, id: NodeId, mode: Mode) -> UniverseResult<()> {
        if self.on_chain(&c.chain, id, mode)? || c.visited.contains(&id) {
            return Ok(());
        }
        c.chain.push(id);
        let result = self.collect_edges(c, id, mode);
        c.chain.pop();
        result?;
        if !self.target(id).is_class() {
            c.visited.insert(id);
        }
        Ok(())
    }

    fn collect_edges(&self, c: &mut Collection, id: NodeId, mode: Mode) -> UniverseResult<()> {
        let input_mode = mode.for_inputs(c.chain.len() - 1);
        for input in self.traversal_inputs(id)? {
            c.edge(id, input);
            self.collect(c, input, input_mode)
                .map_err(|e| e.with_target(self.label(id)))?;
        }

        let target = self.target(id);
        let mut children = Vec::new();
        if target.is_class() {
            children.extend(self.class_instances(id));
        }
        children.extend(self.edge_ids(target.dependencies().unwrap_or_default())?);
        if let Some(src) = target.source() {
            children.push(self.lookup_ref(src)?);
        }
        for child in children {
            c.edge(id, child);
            self.collect(c, child, mode)
                .map_err(|e| e.with_target(self.label(id)))?;
        }
        Ok(())
    }

    /// For every collected node of type `tt`, the nearest nodes of the same
    /// type beneath it. Paths through other kinds are followed; paths stop
    /// at the first same-type node.
    fn same_type_deps(&self, c: &Collection, tt: TargetType) -> SameTypeDeps {
        let is_tt = |idx: NodeIndex| self.target(c.graph[idx]).target_type() == tt;
        let mut out = SameTypeDeps::new();
        for idx in c.graph.node_indices().filter(|&i| is_tt(i)) {
            let mut found = BTreeSet::new();
            let mut seen = HashSet::new();
            let mut stack: Vec<NodeIndex> =
                c.graph.neighbors_directed(idx, Direction::Outgoing).collect();
            while let Some(next) = stack.pop() {
                if !seen.insert(next) {
                    continue;
                }
                if is_tt(next) {
                    found.insert(c.graph[next]);
                } else {
                    stack.extend(c.graph.neighbors_directed(next, Direction::Outgoing));
                }
            }
            out.insert(c.graph[idx], found);
        }
        out
    }

    fn reject_cycles(&self, deps: &SameTypeDeps, tt: TargetType) -> UniverseResult<()> {
        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let index: HashMap<NodeId, NodeIndex> =
            deps.keys().map(|&id| (id, graph.add_node(id))).collect();
        for (from, tos) in deps {
            for to in tos {
                graph.add_edge(index[from], index[to], ());
            }
        }

        for scc in tarjan_scc(&graph) {
            let first = graph[scc[0]];
            let self_loop = scc.len() == 1 && deps[&first].contains(&first);
            if scc.len() > 1 || self_loop {
                let mut members: Vec<String> = scc.iter().map(|&i| self.label(graph[i])).collect();
                members.sort();
                return Err(UniverseError::DependencyCycle { kind: tt, members });
            }
        }
        Ok(())
    }

    fn extract_phases(&self, deps: SameTypeDeps) -> UniverseResult<Vec<Vec<NodeId>>> {
        let mut pending: BTreeSet<NodeId> = deps.keys().copied().collect();
        let mut emitted: HashSet<NodeId> = HashSet::new();
        let max_iterations = pending.len() + 1;
        let mut phases = Vec::new();

        let mut iterations = 0;
        while !pending.is_empty() {
            iterations += 1;
            if iterations > max_iterations {
                return Err(UniverseError::SchedulerStall {
                    iterations: max_iterations,
                    pending: pending.len(),
                });
            }
            let mut ready: Vec<NodeId> = pending
                .iter()
                .copied()
                .filter(|n| deps[n].iter().all(|d| emitted.contains(d)))
                .collect();
            if ready.is_empty() {
                continue;
            }
            ready.sort_by_cached_key(|n| self.target(*n).to_string());
            for n in &ready {
                pending.remove(n);
                emitted.insert(*n);
            }
            phases.push(ready);
        }
        Ok(phases)
    }
}
