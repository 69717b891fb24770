//! Directed graphs over chunks and their acyclic projections.
//!
//! Chunk ids are handed out in address order, so iterating a [`ChunkGraph`]
//! visits its chunks by ascending start address.

use crate::chunk::{ChunkArena, ChunkId, Direction, XRefKind};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkGraph {
    vertices: BTreeSet<ChunkId>,
    successors: BTreeMap<ChunkId, BTreeMap<ChunkId, XRefKind>>,
    predecessors: BTreeMap<ChunkId, BTreeSet<ChunkId>>,
}

impl ChunkGraph {
    pub fn add_vertex(&mut self, vertex: ChunkId) {
        self.vertices.insert(vertex);
    }

    /// Add `from -> to`. Self edges are dropped; the first kind seen between
    /// two vertices is kept.
    pub fn add_edge(&mut self, from: ChunkId, to: ChunkId, kind: XRefKind) {
        if from == to {
            return;
        }
        self.vertices.insert(from);
        self.vertices.insert(to);
        self.successors.entry(from).or_default().entry(to).or_insert(kind);
        self.predecessors.entry(to).or_default().insert(from);
    }

    /// Graph over `vertices` (live chunk ids) with every cross reference
    /// between them.
    pub fn from_arena(arena: &ChunkArena, vertices: impl IntoIterator<Item = ChunkId>) -> Self {
        let mut graph = Self::default();
        for vertex in vertices {
            graph.add_vertex(arena.representative(vertex));
        }
        let members: Vec<_> = graph.vertices.iter().copied().collect();
        for vertex in members {
            for (other, kind, direction) in arena.neighbours(vertex) {
                if direction == Direction::From && graph.vertices.contains(&other) {
                    graph.add_edge(vertex, other, kind);
                }
            }
        }
        graph
    }

    /// Weakly connected components of every live chunk.
    pub fn components(arena: &ChunkArena) -> Vec<Self> {
        let mut seen = BTreeSet::new();
        let mut components = Vec::new();

        for start in arena.ids().filter(|&id| !arena.is_merged(id)) {
            if !seen.insert(start) {
                continue;
            }
            let mut members = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(vertex) = queue.pop_front() {
                for (other, _, _) in arena.neighbours(vertex) {
                    if seen.insert(other) {
                        members.push(other);
                        queue.push_back(other);
                    }
                }
            }
            components.push(Self::from_arena(arena, members));
        }
        components
    }

    /// The subgraph over `subset`, keeping only edges inside it.
    pub fn induced(&self, subset: &BTreeSet<ChunkId>) -> Self {
        let mut graph = Self::default();
        for &vertex in self.vertices.intersection(subset) {
            graph.add_vertex(vertex);
            for (&to, &kind) in self.successors(vertex) {
                if subset.contains(&to) {
                    graph.add_edge(vertex, to, kind);
                }
            }
        }
        graph
    }

    pub fn vertices(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.vertices.iter().copied()
    }

    pub fn vertex_set(&self) -> &BTreeSet<ChunkId> {
        &self.vertices
    }

    pub fn contains(&self, vertex: ChunkId) -> bool {
        self.vertices.contains(&vertex)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn successors(&self, vertex: ChunkId) -> impl Iterator<Item = (&ChunkId, &XRefKind)> {
        self.successors.get(&vertex).into_iter().flatten()
    }

    pub fn predecessors(&self, vertex: ChunkId) -> impl Iterator<Item = ChunkId> + '_ {
        self.predecessors.get(&vertex).into_iter().flatten().copied()
    }

    /// Vertices referring to or referred to by `vertex`, in address order.
    pub fn neighbours(&self, vertex: ChunkId) -> BTreeSet<ChunkId> {
        self.successors(vertex)
            .map(|(&to, _)| to)
            .chain(self.predecessors(vertex))
            .collect()
    }
}

/// A [`ChunkGraph`] with its cycles broken and vertices in topological order.
#[derive(Debug, Clone)]
pub struct Dag {
    order: Vec<ChunkId>,
    parents: BTreeMap<ChunkId, BTreeSet<ChunkId>>,
    children: BTreeMap<ChunkId, BTreeSet<ChunkId>>,
}

impl Dag {
    /// Break cycles by depth-first search from the vertices in `preference`
    /// order (any vertex missing from it follows in address order), then sort
    /// topologically, picking the most preferred ready vertex at each step.
    pub fn new(graph: &ChunkGraph, preference: &[ChunkId]) -> Self {
        let mut rank: BTreeMap<ChunkId, usize> = BTreeMap::new();
        for &vertex in preference.iter().chain(graph.vertex_set()) {
            if graph.contains(vertex) {
                let next = rank.len();
                rank.entry(vertex).or_insert(next);
            }
        }
        let mut by_rank: Vec<ChunkId> = rank.keys().copied().collect();
        by_rank.sort_by_key(|v| rank[v]);

        let mut parents: BTreeMap<ChunkId, BTreeSet<ChunkId>> =
            graph.vertices().map(|v| (v, BTreeSet::new())).collect();
        let mut children = parents.clone();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }
        let mut marks: BTreeMap<ChunkId, Mark> = graph.vertices().map(|v| (v, Mark::New)).collect();

        for &root in &by_rank {
            if marks[&root] != Mark::New {
                continue;
            }
            marks.insert(root, Mark::Active);
            let mut stack = vec![(root, graph.successors(root).map(|(&to, _)| to).collect::<Vec<_>>(), 0)];
            while let Some((vertex, successors, next)) = stack.last_mut() {
                let vertex = *vertex;
                let Some(&to) = successors.get(*next) else {
                    marks.insert(vertex, Mark::Done);
                    stack.pop();
                    continue;
                };
                *next += 1;
                match marks[&to] {
                    // Back edge.
                    Mark::Active => {}
                    Mark::Done => {
                        children.entry(vertex).or_default().insert(to);
                        parents.entry(to).or_default().insert(vertex);
                    }
                    Mark::New => {
                        children.entry(vertex).or_default().insert(to);
                        parents.entry(to).or_default().insert(vertex);
                        marks.insert(to, Mark::Active);
                        let successors = graph.successors(to).map(|(&t, _)| t).collect();
                        stack.push((to, successors, 0));
                    }
                }
            }
        }

        let mut pending: BTreeMap<ChunkId, usize> =
            parents.iter().map(|(&v, p)| (v, p.len())).collect();
        let mut ready: BinaryHeap<Reverse<(usize, ChunkId)>> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&v, _)| Reverse((rank[&v], v)))
            .collect();
        let mut order = Vec::with_capacity(graph.len());
        while let Some(Reverse((_, vertex))) = ready.pop() {
            order.push(vertex);
            for &child in &children[&vertex] {
                if let Some(count) = pending.get_mut(&child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse((rank[&child], child)));
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), graph.len());

        Self {
            order,
            parents,
            children,
        }
    }

    pub fn order(&self) -> &[ChunkId] {
        &self.order
    }

    pub fn parents(&self, vertex: ChunkId) -> impl Iterator<Item = ChunkId> + '_ {
        self.parents.get(&vertex).into_iter().flatten().copied()
    }

    pub fn children(&self, vertex: ChunkId) -> impl Iterator<Item = ChunkId> + '_ {
        self.children.get(&vertex).into_iter().flatten().copied()
    }

    pub fn parent_count(&self, vertex: ChunkId) -> usize {
        self.parents.get(&vertex).map_or(0, BTreeSet::len)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::graph;
    use super::*;
    use crate::chunk::testing::commit;
    use crate::discovery::testing::discovery;
    use crate::evidence::ModuleEvidence;
    use crate::image::testing::image_with;
    use crate::resolver::NoReturnSet;

    #[test]
    fn test_cycle_broken_from_preferred_vertex() {
        // 0 -> 1 -> 2 -> 0
        let (ids, g) = graph(3, &[(0, 1), (1, 2), (2, 0)]);

        let dag = Dag::new(&g, &[ids[0]]);
        assert_eq!(dag.order(), ids);
        assert_eq!(dag.parent_count(ids[0]), 0);

        let dag = Dag::new(&g, &[ids[1]]);
        assert_eq!(dag.order(), [ids[1], ids[2], ids[0]]);
        assert_eq!(dag.parents(ids[1]).count(), 0);
        assert_eq!(dag.children(ids[0]).count(), 0);
    }

    #[test]
    fn test_ready_vertices_follow_preference() {
        // 0 -> 2, 1 -> 2, 3 isolated
        let (ids, g) = graph(4, &[(0, 2), (1, 2)]);
        let dag = Dag::new(&g, &[ids[3], ids[1]]);
        assert_eq!(dag.order(), [ids[3], ids[1], ids[0], ids[2]]);
        assert_eq!(dag.parent_count(ids[2]), 2);
    }

    #[test]
    fn test_induced_drops_outside_edges() {
        let (ids, g) = graph(3, &[(0, 1), (1, 2), (2, 1)]);
        let subset = BTreeSet::from([ids[1], ids[2]]);
        let sub = g.induced(&subset);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.predecessors(ids[1]).collect::<Vec<_>>(), [ids[2]]);
        assert_eq!(sub.neighbours(ids[2]), BTreeSet::from([ids[1]]));
        assert!(!sub.contains(ids[0]));
    }

    #[test]
    fn test_components_from_arena() {
        // 0x1000: jmp 0x1010     0x1010: ret     0x1020: ret
        let image = image_with(
            &[(0x1000, &[0xeb, 0x0e]), (0x1010, &[0xc3]), (0x1020, &[0xc3])],
            &[],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        commit(&mut ctx, &image, &[(0x1000, 2), (0x1010, 1), (0x1020, 1)], &[]);
        let arena = ChunkArena::build(&ctx);

        let components = ChunkGraph::components(&arena);
        let sizes: Vec<_> = components.iter().map(ChunkGraph::len).collect();
        assert_eq!(sizes, [2, 1]);

        let first = &components[0];
        let a = arena.chunk_at(0x1000).unwrap();
        let b = arena.chunk_at(0x1010).unwrap();
        assert_eq!(
            first.successors(a).collect::<Vec<_>>(),
            [(&b, &XRefKind::UnconditionalBranch)]
        );
    }
}
