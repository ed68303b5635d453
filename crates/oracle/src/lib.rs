//! # The Oracle: Call-Graph Ordering
//!
//! Orders the functions of one scope (a class body or a module) so that every function
//! appears after the functions it calls. Downstream summarization relies on this
//! "referenced before referencing" presentation.

use common::{CallRef, FunctionOutline};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Scope in which call names are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Methods of one class: `self.m()`, `cls.m()` and bare `m()` resolve.
    Class,
    /// Module-level functions: only bare `f()` resolves.
    Procedural,
}

impl ScopeKind {
    fn resolves(&self, call: &CallRef) -> bool {
        match self {
            Self::Class => matches!(call.receiver.as_deref(), None | Some("self") | Some("cls")),
            Self::Procedural => call.receiver.is_none(),
        }
    }
}

pub struct CallOrder;

impl CallOrder {
    /// Sorts `functions` so that callees precede their callers.
    ///
    /// # Algorithm
    /// 1. **Graph**: one node per function; for every resolvable call to another function
    ///    of the same scope, an edge `called → caller`. Self-calls add no edge.
    /// 2. **Kahn**: seed a queue with all zero in-degree nodes in input order, pop,
    ///    append, and release neighbours whose in-degree drops to zero.
    /// 3. **Cycle**: if fewer nodes were emitted than exist, the input is returned
    ///    untouched. A partial order is never returned.
    pub fn sort(functions: Vec<FunctionOutline>, scope: ScopeKind) -> Vec<FunctionOutline> {
        let Some(order) = Self::dependency_order(&functions, scope) else {
            debug!(
                count = functions.len(),
                "call cycle detected, keeping original order"
            );
            return functions;
        };

        let mut slots: Vec<Option<FunctionOutline>> = functions.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }

    /// Returns input indices in dependency order, or `None` when the calls form a cycle.
    pub fn dependency_order(functions: &[FunctionOutline], scope: ScopeKind) -> Option<Vec<usize>> {
        let graph = dependency_graph(functions, scope);

        let mut in_degree: Vec<usize> = graph
            .node_indices()
            .map(|n| graph.edges_directed(n, Direction::Incoming).count())
            .collect();

        let mut queue: VecDeque<NodeIndex> = graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(graph.node_count());
        while let Some(node) = queue.pop_front() {
            sorted.push(graph[node]);

            // petgraph yields neighbours newest-edge first; release them in input order.
            let mut callers: Vec<NodeIndex> =
                graph.neighbors_directed(node, Direction::Outgoing).collect();
            callers.sort_by_key(|n| n.index());

            for caller in callers {
                let slot = &mut in_degree[caller.index()];
                *slot -= 1;
                if *slot == 0 {
                    queue.push_back(caller);
                }
            }
        }

        (sorted.len() == graph.node_count()).then_some(sorted)
    }
}

/// Builds the ephemeral `called → caller` graph. Node weights are input indices.
///
/// Names are unique within a scope; if a name repeats, calls bind to its first definition.
fn dependency_graph(functions: &[FunctionOutline], scope: ScopeKind) -> DiGraph<usize, ()> {
    let mut graph = DiGraph::with_capacity(functions.len(), 0);
    let nodes: Vec<NodeIndex> = (0..functions.len()).map(|i| graph.add_node(i)).collect();

    let mut by_name: HashMap<&str, NodeIndex> = HashMap::with_capacity(functions.len());
    for (func, &node) in functions.iter().zip(&nodes) {
        by_name.entry(func.name.as_str()).or_insert(node);
    }

    for (func, &caller) in functions.iter().zip(&nodes) {
        for call in func.calls.iter().filter(|c| scope.resolves(c)) {
            if call.name == func.name {
                continue;
            }
            if let Some(&called) = by_name.get(call.name.as_str()) {
                // update_edge keeps repeated calls from inflating in-degrees.
                graph.update_edge(called, caller, ());
            }
        }
    }

    graph
}
