//! Graph traversal orders used by the CFG and the fixpoint iterator.
//!
//! The algorithms here are generic over a [`Successors`] view so they can run on the editable
//! CFG, on its reversed view for backward analyses, and on small test graphs alike.
//!
//! # Algorithms
//!
//! - [`postorder`] / [`reverse_postorder`] - iterative depth-first orders
//! - [`WeakTopologicalOrder`] - Bourdoncle's hierarchical decomposition into nested strongly
//!   connected components, which drives chaotic iteration with widening at component heads

use std::{collections::HashMap, fmt::Debug, hash::Hash};

/// A graph that can enumerate the successors of a node.
pub trait Successors {
    /// Node identifier.
    type Node: Copy + Eq + Hash + Ord + Debug;

    /// Returns the successors of `node`, in edge order.
    fn successors(&self, node: Self::Node) -> Vec<Self::Node>;
}

/// Computes the postorder of all nodes reachable from `start`.
///
/// Successors are visited in edge order, so the result is deterministic for a given graph.
#[allow(clippy::items_after_statements)]
pub fn postorder<G: Successors>(graph: &G, start: G::Node) -> Vec<G::Node> {
    #[derive(Clone, Copy)]
    enum State {
        Enter,
        Exit,
    }

    let mut visited = std::collections::HashSet::new();
    let mut result = Vec::new();
    let mut stack = vec![(start, State::Enter)];

    while let Some((node, state)) = stack.pop() {
        match state {
            State::Enter => {
                if !visited.insert(node) {
                    continue;
                }
                stack.push((node, State::Exit));
                for succ in graph.successors(node).into_iter().rev() {
                    if !visited.contains(&succ) {
                        stack.push((succ, State::Enter));
                    }
                }
            }
            State::Exit => result.push(node),
        }
    }

    result
}

/// Computes the reverse postorder of all nodes reachable from `start`.
///
/// In a DAG every node comes before its successors, which is the preferred order for
/// forward analyses and for block layout.
pub fn reverse_postorder<G: Successors>(graph: &G, start: G::Node) -> Vec<G::Node> {
    let mut result = postorder(graph, start);
    result.reverse();
    result
}

/// An element of a weak topological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WtoComponent<N> {
    /// A node that is not the head of a loop.
    Vertex(N),
    /// A strongly connected component: its head and the nested order of its body.
    Component {
        /// The loop head; widening is applied here.
        head: N,
        /// The remaining nodes of the component, recursively decomposed.
        body: Vec<WtoComponent<N>>,
    },
}

impl<N: Copy> WtoComponent<N> {
    /// The first node visited when this component is iterated.
    pub fn head(&self) -> N {
        match self {
            WtoComponent::Vertex(n) | WtoComponent::Component { head: n, .. } => *n,
        }
    }
}

/// Bourdoncle's weak topological order of the nodes reachable from an entry.
///
/// Iterating the components in order and stabilizing each nested component before moving
/// on reaches the same fixpoint as a worklist, with far fewer re-evaluations on reducible
/// graphs.
#[derive(Debug, Clone)]
pub struct WeakTopologicalOrder<N> {
    components: Vec<WtoComponent<N>>,
}

impl<N: Copy + Eq + Hash + Ord + Debug> WeakTopologicalOrder<N> {
    /// Builds the order for all nodes reachable from `entry`.
    pub fn new<G: Successors<Node = N>>(graph: &G, entry: N) -> Self {
        let mut builder = WtoBuilder {
            graph,
            dfn: HashMap::new(),
            stack: Vec::new(),
            num: 0,
        };
        let mut components = Vec::new();
        builder.visit(entry, &mut components);
        components.reverse();
        Self { components }
    }

    /// The top-level components, in iteration order.
    #[must_use]
    pub fn components(&self) -> &[WtoComponent<N>] {
        &self.components
    }

    /// Flattens the order into a node sequence (heads before their bodies).
    #[must_use]
    pub fn nodes(&self) -> Vec<N> {
        fn walk<N: Copy>(comps: &[WtoComponent<N>], out: &mut Vec<N>) {
            for c in comps {
                match c {
                    WtoComponent::Vertex(n) => out.push(*n),
                    WtoComponent::Component { head, body } => {
                        out.push(*head);
                        walk(body, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.components, &mut out);
        out
    }
}

const DONE: u32 = u32::MAX;

struct WtoBuilder<'g, G: Successors> {
    graph: &'g G,
    dfn: HashMap<G::Node, u32>,
    stack: Vec<G::Node>,
    num: u32,
}

impl<G: Successors> WtoBuilder<'_, G> {
    fn dfn(&self, n: G::Node) -> u32 {
        self.dfn.get(&n).copied().unwrap_or(0)
    }

    // Components are pushed in reverse; callers reverse each finished partition.
    fn visit(&mut self, vertex: G::Node, partition: &mut Vec<WtoComponent<G::Node>>) -> u32 {
        self.stack.push(vertex);
        self.num += 1;
        self.dfn.insert(vertex, self.num);
        let mut head = self.num;
        let mut is_loop = false;

        for succ in self.graph.successors(vertex) {
            let min = match self.dfn(succ) {
                0 => self.visit(succ, partition),
                d => d,
            };
            if min <= head {
                head = min;
                is_loop = true;
            }
        }

        if head == self.dfn(vertex) {
            self.dfn.insert(vertex, DONE);
            let mut element = self.stack.pop();
            if is_loop {
                while let Some(e) = element {
                    if e == vertex {
                        break;
                    }
                    self.dfn.insert(e, 0);
                    element = self.stack.pop();
                }
                let component = self.component(vertex);
                partition.push(component);
            } else {
                partition.push(WtoComponent::Vertex(vertex));
            }
        }
        head
    }

    fn component(&mut self, vertex: G::Node) -> WtoComponent<G::Node> {
        let mut body = Vec::new();
        for succ in self.graph.successors(vertex) {
            if self.dfn(succ) == 0 {
                self.visit(succ, &mut body);
            }
        }
        body.reverse();
        WtoComponent::Component { head: vertex, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestGraph(Vec<Vec<u32>>);

    impl Successors for TestGraph {
        type Node = u32;

        fn successors(&self, node: u32) -> Vec<u32> {
            self.0[node as usize].clone()
        }
    }

    #[test]
    fn test_reverse_postorder_diamond() {
        let g = TestGraph(vec![vec![1, 2], vec![3], vec![3], vec![]]);
        assert_eq!(reverse_postorder(&g, 0), vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_postorder_skips_unreachable() {
        let g = TestGraph(vec![vec![1], vec![], vec![1]]);
        assert_eq!(postorder(&g, 0), vec![1, 0]);
    }

    #[test]
    fn test_wto_linear() {
        let g = TestGraph(vec![vec![1], vec![2], vec![]]);
        let wto = WeakTopologicalOrder::new(&g, 0);
        assert_eq!(
            wto.components(),
            &[
                WtoComponent::Vertex(0),
                WtoComponent::Vertex(1),
                WtoComponent::Vertex(2)
            ]
        );
    }

    #[test]
    fn test_wto_loop() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let g = TestGraph(vec![vec![1], vec![2], vec![1, 3], vec![]]);
        let wto = WeakTopologicalOrder::new(&g, 0);
        assert_eq!(
            wto.components(),
            &[
                WtoComponent::Vertex(0),
                WtoComponent::Component {
                    head: 1,
                    body: vec![WtoComponent::Vertex(2)]
                },
                WtoComponent::Vertex(3)
            ]
        );
        assert_eq!(wto.nodes(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_wto_nested_loops() {
        // 0 -> 1 -> 2 -> 2 (self loop), 2 -> 1, 1 -> 3
        let g = TestGraph(vec![vec![1], vec![2, 3], vec![2, 1], vec![]]);
        let wto = WeakTopologicalOrder::new(&g, 0);
        assert_eq!(
            wto.components(),
            &[
                WtoComponent::Vertex(0),
                WtoComponent::Component {
                    head: 1,
                    body: vec![WtoComponent::Component {
                        head: 2,
                        body: vec![]
                    }]
                },
                WtoComponent::Vertex(3)
            ]
        );
    }
}
