//! The stage graph: who produces what, who consumes it, in what order.
//!
//! Edges run from producing stage to consuming stage, discovered by
//! matching dependency paths against output paths (a dependency inside a
//! produced directory matches, and vice versa). Construction rejects
//! overlapping outputs and cycles up front, before anything executes.

use std::collections::BTreeSet;

use color_eyre::Result;
use derive_more::{Display, Error};
use petgraph::{
    Direction,
    algo::{tarjan_scc, toposort},
    graph::{DiGraph, NodeIndex},
};
use tracing::{instrument, trace};

use crate::pipeline::stage::Stage;

/// Two stages declare the same output, or one output sits inside another.
#[derive(Clone, Debug, Display, Error)]
#[display(
    "overlapping outputs: '{first_path}' of stage '{first}' and '{second_path}' of stage '{second}'"
)]
pub struct OverlappingOutputs {
    pub first: String,
    pub first_path: String,
    pub second: String,
    pub second_path: String,
}

/// The dependency graph contains a cycle.
#[derive(Clone, Debug, Display, Error)]
#[display("stages form a cycle: {}", stages.join(" -> "))]
pub struct CyclicGraph {
    pub stages: Vec<String>,
}

/// A requested stage does not exist.
#[derive(Clone, Debug, Display, Error)]
#[display("unknown stage: '{name}'")]
pub struct UnknownStage {
    pub name: String,
}

/// The validated DAG over a set of stages.
#[derive(Debug)]
pub struct StageGraph {
    graph: DiGraph<Stage, ()>,
    /// Topological order, producers first.
    order: Vec<NodeIndex>,
}

impl StageGraph {
    /// Build and validate the graph.
    #[instrument(name = "StageGraph::build", skip(stages), fields(count = stages.len()))]
    pub fn build(stages: Vec<Stage>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = stages.into_iter().map(|s| graph.add_node(s)).collect();

        // Overlap check: no two outputs may be equal or in ancestor
        // relation. Sorting by path components makes any such pair
        // adjacent.
        let mut outs: Vec<(NodeIndex, usize)> = Vec::new();
        for &node in &nodes {
            for (i, _) in graph[node].outs.iter().enumerate() {
                outs.push((node, i));
            }
        }
        outs.sort_by(|a, b| {
            let pa = &graph[a.0].outs[a.1].path;
            let pb = &graph[b.0].outs[b.1].path;
            pa.cmp(pb)
        });
        for pair in outs.windows(2) {
            let [(node_a, i), (node_b, j)] = pair else {
                unreachable!("windows(2) always yields two")
            };
            let a = &graph[*node_a].outs[*i];
            let b = &graph[*node_b].outs[*j];
            if b.path.contains_or_equals(&a.path) {
                return Err(OverlappingOutputs {
                    first: graph[*node_a].addr.to_string(),
                    first_path: a.path.to_posix(),
                    second: graph[*node_b].addr.to_string(),
                    second_path: b.path.to_posix(),
                }
                .into());
            }
        }

        // Edges: dep resolves to a provider when either path contains the
        // other (a dep may reach into a produced directory, and a produced
        // file may satisfy a directory dep).
        for &consumer in &nodes {
            let mut providers = BTreeSet::new();
            for dep in &graph[consumer].deps {
                for &producer in &nodes {
                    if producer == consumer {
                        continue;
                    }
                    let provides = graph[producer].outs.iter().any(|out| {
                        dep.path.contains_or_equals(&out.path)
                            || out.path.contains_or_equals(&dep.path)
                    });
                    if provides {
                        providers.insert(producer);
                    }
                }
            }
            for producer in providers {
                graph.add_edge(producer, consumer, ());
                trace!(
                    producer = %graph[producer].addr,
                    consumer = %graph[consumer].addr,
                    "edge"
                );
            }
        }

        let order = toposort(&graph, None).map_err(|_| {
            // Recover a readable cycle from the strongly connected
            // components; tarjan reports members in reverse topological
            // order.
            let cycle = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.len() > 1)
                .unwrap_or_default();
            let mut stages: Vec<String> = cycle
                .iter()
                .map(|&node| graph[node].addr.to_string())
                .collect();
            if let Some(first) = stages.first().cloned() {
                stages.push(first);
            }
            CyclicGraph { stages }
        })?;

        Ok(Self { graph, order })
    }

    /// Every stage in topological order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.order.iter().map(|&node| &self.graph[node])
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// The stages to consider for `targets`, in topological order: the
    /// targets themselves plus everything upstream of them. No targets
    /// means the whole graph.
    ///
    /// A target matches a stage by full address, bare name, or source
    /// file.
    pub fn plan_for(&self, targets: &[String]) -> Result<Vec<&Stage>> {
        if targets.is_empty() {
            return Ok(self.stages().collect());
        }

        let mut wanted: BTreeSet<NodeIndex> = BTreeSet::new();
        for target in targets {
            let matched: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|&node| {
                    let stage = &self.graph[node];
                    stage.addr.to_string() == *target
                        || stage.addr.name() == *target
                        || stage.addr.file().to_posix() == *target
                })
                .collect();
            if matched.is_empty() {
                return Err(UnknownStage {
                    name: target.clone(),
                }
                .into());
            }
            // Walk upstream: everything a target depends on runs first.
            let mut frontier = matched;
            while let Some(node) = frontier.pop() {
                if !wanted.insert(node) {
                    continue;
                }
                frontier.extend(self.graph.neighbors_directed(node, Direction::Incoming));
            }
        }

        Ok(self
            .order
            .iter()
            .filter(|node| wanted.contains(*node))
            .map(|&node| &self.graph[node])
            .collect())
    }
}
