//! The monotone fixpoint iterator.
//!
//! # Algorithm
//!
//! Nodes are visited in Bourdoncle's weak topological order. A plain vertex is evaluated
//! once per visit of its enclosing component; a component is iterated until the entry
//! state of its head stops growing:
//!
//! 1. compute the head's entry state from its incoming edges;
//! 2. apply the node transfer to the head, then analyze the component body in order;
//! 3. recompute the head's entry state; if it is below the previous one the component is
//!    stable, otherwise extrapolate (join, or widen for infinite-height domains) and
//!    repeat.
//!
//! The entry state of a node is the join, over its incoming edges, of the edge transfer
//! applied to the source's states. The edge transfer sees both the source's entry and exit
//! state, so analyses can model exceptional edges that leave a block before its end.
//!
//! Nodes unreachable from the graph entry are never visited and keep `bottom` states.

use std::{collections::HashMap, fmt::Debug, hash::Hash};

use crate::{
    analysis::AbstractDomain,
    utils::graph::{Successors, WeakTopologicalOrder, WtoComponent},
};

/// Number of plain joins at a loop head before widening kicks in.
const WIDENING_DELAY: usize = 2;

/// The graph interface of the iterator.
pub trait FixpointGraph {
    /// Node identifier.
    type Node: Copy + Eq + Hash + Ord + Debug;
    /// Edge identifier.
    type Edge: Copy + Debug;

    /// The node where the analysis starts.
    fn entry(&self) -> Self::Node;

    /// Incoming edges of `node`.
    fn predecessors(&self, node: Self::Node) -> Vec<Self::Edge>;

    /// Outgoing edges of `node`.
    fn successors(&self, node: Self::Node) -> Vec<Self::Edge>;

    /// Source node of `edge`.
    fn source(&self, edge: Self::Edge) -> Self::Node;

    /// Target node of `edge`.
    fn target(&self, edge: Self::Edge) -> Self::Node;
}

/// Transfer functions of an analysis.
pub trait FixpointAnalysis<G: FixpointGraph> {
    /// The abstract domain.
    type Domain: AbstractDomain;

    /// Applies the node's effect to `state`, turning its entry state into its exit state.
    fn analyze_node(&self, graph: &G, node: G::Node, state: &mut Self::Domain);

    /// The state flowing along `edge`, given the source's entry and exit states.
    ///
    /// The default passes the exit state through unchanged.
    fn analyze_edge(
        &self,
        graph: &G,
        edge: G::Edge,
        entry: &Self::Domain,
        exit: &Self::Domain,
    ) -> Self::Domain {
        let _ = (graph, edge, entry);
        exit.clone()
    }
}

impl<G: FixpointGraph, A: FixpointAnalysis<G>> FixpointAnalysis<G> for &A {
    type Domain = A::Domain;

    fn analyze_node(&self, graph: &G, node: G::Node, state: &mut Self::Domain) {
        (**self).analyze_node(graph, node, state);
    }

    fn analyze_edge(
        &self,
        graph: &G,
        edge: G::Edge,
        entry: &Self::Domain,
        exit: &Self::Domain,
    ) -> Self::Domain {
        (**self).analyze_edge(graph, edge, entry, exit)
    }
}

struct NodeSuccessors<'g, G>(&'g G);

impl<G: FixpointGraph> Successors for NodeSuccessors<'_, G> {
    type Node = G::Node;

    fn successors(&self, node: G::Node) -> Vec<G::Node> {
        let mut out: Vec<G::Node> = Vec::new();
        for e in self.0.successors(node) {
            let t = self.0.target(e);
            if !out.contains(&t) {
                out.push(t);
            }
        }
        out
    }
}

/// Runs an analysis to its fixpoint and keeps the per-node states.
pub struct MonotonicFixpointIterator<'g, G: FixpointGraph, A: FixpointAnalysis<G>> {
    graph: &'g G,
    analysis: A,
    wto: WeakTopologicalOrder<G::Node>,
    entry_states: HashMap<G::Node, A::Domain>,
    exit_states: HashMap<G::Node, A::Domain>,
    evaluations: usize,
}

impl<'g, G: FixpointGraph, A: FixpointAnalysis<G>> MonotonicFixpointIterator<'g, G, A> {
    /// Prepares an iterator; the weak topological order is computed here.
    #[must_use]
    pub fn new(graph: &'g G, analysis: A) -> Self {
        let wto = WeakTopologicalOrder::new(&NodeSuccessors(graph), graph.entry());
        Self {
            graph,
            analysis,
            wto,
            entry_states: HashMap::new(),
            exit_states: HashMap::new(),
            evaluations: 0,
        }
    }

    /// Iterates to the fixpoint, starting from `init` at the graph entry.
    pub fn run(&mut self, init: A::Domain) {
        self.entry_states.clear();
        self.exit_states.clear();
        let components = self.wto.components().to_vec();
        for c in &components {
            self.analyze_component(c, &init);
        }
    }

    /// The analysis.
    pub fn analysis(&self) -> &A {
        &self.analysis
    }

    /// The graph.
    pub fn graph(&self) -> &G {
        self.graph
    }

    /// The state on entry of `node`; `bottom` if the node was never reached.
    #[must_use]
    pub fn entry_state_at(&self, node: G::Node) -> A::Domain {
        self.entry_states
            .get(&node)
            .cloned()
            .unwrap_or_else(A::Domain::bottom)
    }

    /// The state on exit of `node`; `bottom` if the node was never reached.
    #[must_use]
    pub fn exit_state_at(&self, node: G::Node) -> A::Domain {
        self.exit_states
            .get(&node)
            .cloned()
            .unwrap_or_else(A::Domain::bottom)
    }

    /// Number of node transfers applied by the last run.
    #[must_use]
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    fn compute_entry(&self, node: G::Node, init: &A::Domain) -> A::Domain {
        let mut state = if node == self.graph.entry() {
            init.clone()
        } else {
            A::Domain::bottom()
        };
        for e in self.graph.predecessors(node) {
            let src = self.graph.source(e);
            let (Some(entry), Some(exit)) = (self.entry_states.get(&src), self.exit_states.get(&src))
            else {
                continue;
            };
            let flowing = self.analysis.analyze_edge(self.graph, e, entry, exit);
            state.join_with(&flowing);
        }
        state
    }

    fn transfer(&mut self, node: G::Node) {
        let mut state = self.entry_state_at(node);
        self.analysis.analyze_node(self.graph, node, &mut state);
        self.exit_states.insert(node, state);
        self.evaluations += 1;
    }

    fn analyze_component(&mut self, component: &WtoComponent<G::Node>, init: &A::Domain) {
        match component {
            WtoComponent::Vertex(node) => {
                let entry = self.compute_entry(*node, init);
                self.entry_states.insert(*node, entry);
                self.transfer(*node);
            }
            WtoComponent::Component { head, body } => {
                let entry = self.compute_entry(*head, init);
                self.entry_states.insert(*head, entry);
                let mut iteration = 0;
                loop {
                    self.transfer(*head);
                    for c in body {
                        self.analyze_component(c, init);
                    }
                    let new_entry = self.compute_entry(*head, init);
                    let old_entry = self.entry_state_at(*head);
                    if new_entry.leq(&old_entry) {
                        break;
                    }
                    let mut next = old_entry;
                    if !A::Domain::FINITE_HEIGHT && iteration >= WIDENING_DELAY {
                        next.widen_with(&new_entry);
                    } else {
                        next.join_with(&new_entry);
                    }
                    self.entry_states.insert(*head, next);
                    iteration += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ConstantDomain;

    /// A small graph given by an edge list.
    struct EdgeGraph {
        edges: Vec<(u32, u32)>,
    }

    impl FixpointGraph for EdgeGraph {
        type Node = u32;
        type Edge = usize;

        fn entry(&self) -> u32 {
            0
        }

        fn predecessors(&self, node: u32) -> Vec<usize> {
            (0..self.edges.len())
                .filter(|&i| self.edges[i].1 == node)
                .collect()
        }

        fn successors(&self, node: u32) -> Vec<usize> {
            (0..self.edges.len())
                .filter(|&i| self.edges[i].0 == node)
                .collect()
        }

        fn source(&self, edge: usize) -> u32 {
            self.edges[edge].0
        }

        fn target(&self, edge: usize) -> u32 {
            self.edges[edge].1
        }
    }

    /// Interval-free counter domain: `Bottom`, a bounded count, or `Top`.
    #[derive(Debug, Clone, PartialEq)]
    enum Count {
        Bottom,
        AtMost(u32),
        Top,
    }

    impl AbstractDomain for Count {
        const FINITE_HEIGHT: bool = false;

        fn bottom() -> Self {
            Count::Bottom
        }
        fn top() -> Self {
            Count::Top
        }
        fn is_bottom(&self) -> bool {
            *self == Count::Bottom
        }
        fn is_top(&self) -> bool {
            *self == Count::Top
        }
        fn leq(&self, other: &Self) -> bool {
            match (self, other) {
                (Count::Bottom, _) | (_, Count::Top) => true,
                (Count::AtMost(a), Count::AtMost(b)) => a <= b,
                _ => false,
            }
        }
        fn join_with(&mut self, other: &Self) {
            *self = match (&*self, other) {
                (Count::Bottom, x) | (x, Count::Bottom) => x.clone(),
                (Count::AtMost(a), Count::AtMost(b)) => Count::AtMost(*a.max(b)),
                _ => Count::Top,
            };
        }
        fn widen_with(&mut self, other: &Self) {
            if !other.leq(self) {
                *self = Count::Top;
            }
        }
    }

    struct Increment;

    impl FixpointAnalysis<EdgeGraph> for Increment {
        type Domain = Count;

        fn analyze_node(&self, _: &EdgeGraph, node: u32, state: &mut Count) {
            if node == 1 {
                if let Count::AtMost(n) = state {
                    *n += 1;
                }
            }
        }
    }

    #[test]
    fn test_loop_widens() {
        // 0 -> 1 -> 1 (self loop), 1 -> 2
        let graph = EdgeGraph {
            edges: vec![(0, 1), (1, 1), (1, 2)],
        };
        let mut fp = MonotonicFixpointIterator::new(&graph, Increment);
        fp.run(Count::AtMost(0));
        assert_eq!(fp.entry_state_at(2), Count::Top);
        assert_eq!(fp.entry_state_at(0), Count::AtMost(0));
    }

    struct Propagate;

    impl FixpointAnalysis<EdgeGraph> for Propagate {
        type Domain = ConstantDomain<u32>;

        fn analyze_node(&self, _: &EdgeGraph, node: u32, state: &mut ConstantDomain<u32>) {
            if node == 1 {
                *state = ConstantDomain::Value(1);
            } else if node == 2 {
                *state = ConstantDomain::Value(2);
            }
        }
    }

    #[test]
    fn test_diamond_join_and_unreachable() {
        // 0 -> {1, 2} -> 3; 4 is unreachable.
        let graph = EdgeGraph {
            edges: vec![(0, 1), (0, 2), (1, 3), (2, 3), (4, 3)],
        };
        let mut fp = MonotonicFixpointIterator::new(&graph, Propagate);
        fp.run(ConstantDomain::Value(0));
        assert_eq!(fp.exit_state_at(1), ConstantDomain::Value(1));
        assert!(fp.entry_state_at(3).is_top());
        assert!(fp.entry_state_at(4).is_bottom());
        assert_eq!(fp.evaluations(), 4);
    }
}
