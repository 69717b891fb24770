//! Splitting chunk graphs that hold more than one function.
//!
//! Every pass uses the same algorithm: a predicate marks some vertices as
//! roots, cycles are broken from the roots, and each remaining vertex is
//! claimed by one of its parents. Claimed sets are kept in a union-find keyed
//! by vertex, so a set that later absorbs another is never copied.

use crate::candidate::{FoundBy, FoundBySubType};
use crate::chunk::{ChunkArena, ChunkId};
use crate::discovery::Discovery;
use crate::evidence::SymbolKind;
use crate::graph::{ChunkGraph, Dag};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Disjoint sets of vertices, each remembering the root that owns it.
struct Claims {
    parent: BTreeMap<ChunkId, ChunkId>,
    owner: BTreeMap<ChunkId, ChunkId>,
}

impl Claims {
    fn new(graph: &ChunkGraph, roots: &BTreeSet<ChunkId>) -> Self {
        Self {
            parent: graph.vertices().map(|v| (v, v)).collect(),
            owner: roots.iter().map(|&r| (r, r)).collect(),
        }
    }

    fn find(&mut self, vertex: ChunkId) -> ChunkId {
        let mut root = vertex;
        while self.parent[&root] != root {
            root = self.parent[&root];
        }
        let mut current = vertex;
        while current != root {
            let next = self.parent[&current];
            self.parent.insert(current, root);
            current = next;
        }
        root
    }

    fn owner(&mut self, vertex: ChunkId) -> Option<ChunkId> {
        let set = self.find(vertex);
        self.owner.get(&set).copied()
    }

    /// Merge the sets of `a` and `b` unless that would put two roots in one
    /// set.
    fn union(&mut self, a: ChunkId, b: ChunkId) -> bool {
        let (a, b) = (self.find(a), self.find(b));
        if a == b {
            return true;
        }
        let owner = match (self.owner.get(&a).copied(), self.owner.get(&b).copied()) {
            (Some(_), Some(_)) => return false,
            (owner, None) | (None, owner) => owner,
        };
        // The lower vertex represents the set.
        let (keep, merge) = if a < b { (a, b) } else { (b, a) };
        self.parent.insert(merge, keep);
        self.owner.remove(&merge);
        if let Some(owner) = owner {
            self.owner.insert(keep, owner);
        }
        true
    }
}

/// Split `graph` so that no output graph holds more than one vertex for
/// which `is_root` holds. Every input vertex ends up in exactly one output.
pub fn split(graph: &ChunkGraph, mut is_root: impl FnMut(ChunkId) -> bool) -> Vec<ChunkGraph> {
    let roots: BTreeSet<ChunkId> = graph.vertices().filter(|&v| is_root(v)).collect();
    if roots.len() < 2 {
        return vec![graph.clone()];
    }
    if roots.len() == graph.len() {
        return graph
            .vertices()
            .map(|v| graph.induced(&BTreeSet::from([v])))
            .collect();
    }

    let preference: Vec<_> = roots.iter().copied().collect();
    let dag = Dag::new(graph, &preference);
    let mut claims = Claims::new(graph, &roots);
    let mut pseudo_roots = Vec::new();

    for &vertex in dag.order() {
        if roots.contains(&vertex) {
            continue;
        }
        let parents: Vec<ChunkId> = dag.parents(vertex).collect();
        let claimant = match parents.as_slice() {
            [] => {
                pseudo_roots.push(vertex);
                continue;
            }
            [parent] => *parent,
            _ => nearest(vertex, parents.iter().copied()),
        };
        if !claims.union(claimant, vertex) {
            // The vertex already heads a set of its own, which only happens
            // when it was merged with a root through another path.
            trace!(target: "fnbound::splitter", vertex = ?vertex, claimant = ?claimant, "Claim refused");
        }
    }

    // Vertices nothing points at (after cycles were broken) join their
    // neighbours, nearest preceding first. A set that already belongs to a
    // root never changes hands.
    pseudo_roots.sort_unstable();
    for vertex in pseudo_roots {
        let neighbours = graph.neighbours(vertex);
        let preceding = neighbours.range(..vertex).rev();
        let following = neighbours.range(vertex..);
        for &other in preceding.chain(following) {
            if claims.owner(vertex).is_some() && claims.owner(other).is_some() {
                continue;
            }
            claims.union(vertex, other);
        }
    }

    let mut groups: BTreeMap<ChunkId, BTreeSet<ChunkId>> = BTreeMap::new();
    for vertex in graph.vertices() {
        let set = claims.find(vertex);
        groups.entry(set).or_default().insert(vertex);
    }
    let graphs: Vec<_> = groups.values().map(|group| graph.induced(group)).collect();

    debug_assert_eq!(graphs.iter().map(ChunkGraph::len).sum::<usize>(), graph.len());
    debug_assert_eq!(
        graphs
            .iter()
            .flat_map(ChunkGraph::vertices)
            .collect::<BTreeSet<_>>()
            .len(),
        graph.len()
    );
    graphs
}

/// The parent starting closest before `vertex`, else the closest after it.
fn nearest(vertex: ChunkId, parents: impl Iterator<Item = ChunkId> + Clone) -> ChunkId {
    parents
        .clone()
        .filter(|&p| p < vertex)
        .max()
        .or_else(|| parents.filter(|&p| p > vertex).min())
        .unwrap_or(vertex)
}

/// Run the three splitting passes over one connected component: by call
/// targets, by function symbols, then by remaining root candidates.
pub fn split_component(ctx: &Discovery, arena: &ChunkArena, graph: ChunkGraph) -> Vec<ChunkGraph> {
    if graph.len() < 2 {
        return vec![graph];
    }

    let passes: [(&str, &dyn Fn(ChunkId) -> bool); 3] = [
        ("callees", &|v| is_callee(ctx, arena, v)),
        ("symbols", &|v| is_function_symbol(ctx, arena, v)),
        ("roots", &|v| is_root(ctx, arena, v)),
    ];

    let mut graphs = vec![graph];
    for (name, predicate) in passes {
        let before = graphs.len();
        graphs = graphs
            .iter()
            .flat_map(|g| split(g, predicate))
            .collect();
        if graphs.len() != before {
            debug!(
                target: "fnbound::splitter",
                pass = name,
                before,
                after = graphs.len(),
                "Split component"
            );
        }
    }
    graphs
}

fn start(arena: &ChunkArena, vertex: ChunkId) -> u64 {
    arena.get(vertex).start()
}

pub(crate) fn is_callee(ctx: &Discovery, arena: &ChunkArena, vertex: ChunkId) -> bool {
    ctx.known_call_targets.contains(&start(arena, vertex))
}

pub(crate) fn is_function_symbol(ctx: &Discovery, arena: &ChunkArena, vertex: ChunkId) -> bool {
    let Some(candidate) = arena.get(vertex).candidate().and_then(|a| ctx.candidate(a)) else {
        return false;
    };
    if candidate.sub_type.contains(FoundBySubType::SCOPE_RECORD_HANDLER) {
        return false;
    }
    candidate
        .symbol
        .and_then(|index| ctx.evidence.symbols.get(index))
        .is_some_and(|symbol| symbol.kind == SymbolKind::Function)
}

pub(crate) fn is_root(ctx: &Discovery, arena: &ChunkArena, vertex: ChunkId) -> bool {
    let address = start(arena, vertex);
    let Some(candidate) = arena.get(vertex).candidate().and_then(|a| ctx.candidate(a)) else {
        return false;
    };
    candidate.found_by != FoundBy::RUNTIME_FUNCTION
        && candidate.found_by != FoundBy::CONFIG
        && !ctx.known_jump_targets.contains(&address)
        && !ctx.unwind_map.contains_key(&address)
}
