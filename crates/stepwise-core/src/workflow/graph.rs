//! Transition graph analysis: reachability and unguarded cycles.
//!
//! Uses `petgraph` to model a definition as a directed graph with one node per
//! step and one edge per transition. Only transitions whose endpoints both
//! exist become edges; dangling references are reported by the validator.
//! Results are returned in step declaration order so validation output is
//! stable.

use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use stepwise_types::definition::{StepType, WorkflowDefinition};

/// Directed step graph of one definition.
pub struct TransitionGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    nodes: HashMap<&'a str, NodeIndex>,
    /// Declaration index per step, used to order results.
    order: HashMap<&'a str, usize>,
    loop_steps: HashSet<&'a str>,
}

impl<'a> TransitionGraph<'a> {
    /// Build the graph. Duplicate step IDs map to their first declaration.
    pub fn build(def: &'a WorkflowDefinition) -> Self {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut nodes = HashMap::new();
        let mut order = HashMap::new();
        let mut loop_steps = HashSet::new();

        for (i, step) in def.steps.iter().enumerate() {
            if nodes.contains_key(step.id.as_str()) {
                continue;
            }
            nodes.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
            order.insert(step.id.as_str(), i);
            if step.step_type == StepType::Loop {
                loop_steps.insert(step.id.as_str());
            }
        }

        for t in &def.transitions {
            let (Some(&from), Some(&to)) = (
                nodes.get(t.from_step_id.as_str()),
                nodes.get(t.to_step_id.as_str()),
            ) else {
                continue;
            };
            graph.add_edge(from, to, ());
        }

        Self {
            graph,
            nodes,
            order,
            loop_steps,
        }
    }

    /// Steps reachable from `start` (inclusive). Empty when `start` is unknown.
    pub fn reachable_from(&self, start: &str) -> HashSet<&'a str> {
        let mut seen = HashSet::new();
        let Some(&root) = self.nodes.get(start) else {
            return seen;
        };
        let mut bfs = Bfs::new(&self.graph, root);
        while let Some(node) = bfs.next(&self.graph) {
            seen.insert(self.graph[node]);
        }
        seen
    }

    /// Cycles that pass through no Loop step. Each cycle is the step IDs of
    /// one strongly connected component in declaration order; components are
    /// ordered by their first step.
    pub fn unguarded_cycles(&self) -> Vec<Vec<&'a str>> {
        let mut cycles: Vec<Vec<&str>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || self.graph.contains_edge(component[0], component[0])
            })
            .map(|component| component.into_iter().map(|n| self.graph[n]).collect::<Vec<_>>())
            .filter(|ids| !ids.iter().any(|id| self.loop_steps.contains(id)))
            .collect();

        for cycle in &mut cycles {
            cycle.sort_by_key(|id| self.order.get(id).copied().unwrap_or(usize::MAX));
        }
        cycles.sort_by_key(|cycle| {
            cycle
                .first()
                .and_then(|id| self.order.get(id).copied())
                .unwrap_or(usize::MAX)
        });
        cycles
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
