//! Turns split chunk graphs into functions.

use crate::candidate::{FoundBy, FoundBySubType};
use crate::chunk::{ChunkArena, ChunkId, XRef};
use crate::discovery::Discovery;
use crate::graph::{ChunkGraph, Dag};
use crate::splitter::{split, split_component};
use iced_x86::Instruction;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// A contiguous run of a function's instructions.
#[derive(Debug, Clone)]
pub struct CodeRegion {
    /// Entry point of the owning function.
    pub function: u64,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    /// Candidate starting this region, if any.
    pub candidate: Option<u64>,
    pub instructions: Vec<Instruction>,
    pub xrefs: Vec<XRef>,
}

impl CodeRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// An assembled function: its entry region first, then the rest by address.
#[derive(Debug, Clone)]
pub struct Function {
    pub entry: u64,
    pub regions: Vec<CodeRegion>,
}

/// Split every connected component of `arena` and assemble the pieces.
pub fn assemble(ctx: &Discovery, arena: &mut ChunkArena) -> Vec<Function> {
    let mut functions = Vec::new();
    for component in ChunkGraph::components(arena) {
        for graph in split_component(ctx, arena, component) {
            make_function(ctx, arena, graph, &mut functions);
        }
    }
    functions.sort_by_key(|f| f.entry);
    info!(target: "fnbound::assembler", functions = functions.len(), "Assembled functions");
    functions
}

/// Build one function from `graph`, or several if merging leaves more than
/// one chunk backed by its own symbol or export.
pub fn make_function(ctx: &Discovery, arena: &mut ChunkArena, graph: ChunkGraph, out: &mut Vec<Function>) {
    if graph.is_empty() {
        return;
    }

    let mut preference: Vec<ChunkId> = graph.vertices().collect();
    preference.sort_by_key(|&v| {
        let candidate = arena.get(v).candidate().and_then(|a| ctx.candidate(a));
        (
            candidate.is_none_or(|c| c.sub_type.contains(FoundBySubType::SCOPE_RECORD_HANDLER)),
            candidate.is_none_or(|c| c.is_call_only()),
            v,
        )
    });
    let dag = Dag::new(&graph, &preference);
    let entry = dag
        .order()
        .iter()
        .copied()
        .find(|&v| {
            arena
                .get(v)
                .candidate()
                .and_then(|a| ctx.candidate(a))
                .is_some_and(|c| !c.is_call_only())
        })
        .unwrap_or(dag.order()[0]);
    let entry_address = arena.get(entry).start();

    let survivors = merge_adjacent(arena, &graph);

    let qualifying: BTreeSet<ChunkId> = survivors
        .iter()
        .copied()
        .filter(|&v| {
            arena
                .get(v)
                .candidate()
                .and_then(|a| ctx.candidate(a))
                .is_some_and(|c| c.has_symbol_or_export() && !c.found_by.contains(FoundBy::UNWIND_INFO))
        })
        .collect();
    if qualifying.len() > 1 {
        let merged = ChunkGraph::from_arena(arena, survivors.iter().copied());
        let parts = split(&merged, |v| qualifying.contains(&v));
        if parts.len() > 1 {
            debug!(
                target: "fnbound::assembler",
                entry = format!("0x{:x}", entry_address),
                parts = parts.len(),
                "Re-splitting function with several symbols"
            );
            for part in parts {
                make_function(ctx, arena, part, out);
            }
            return;
        }
    }

    let entry = arena.representative(entry);
    let mut ordered: Vec<ChunkId> = survivors.into_iter().filter(|&v| v != entry).collect();
    ordered.sort_by_key(|&v| arena.get(v).start());
    ordered.insert(0, entry);

    let mut regions = Vec::new();
    for vertex in ordered {
        subdivide(ctx, arena, vertex, entry_address, &mut regions);
    }
    debug!(
        target: "fnbound::assembler",
        entry = format!("0x{:x}", entry_address),
        regions = regions.len(),
        "Function"
    );
    out.push(Function {
        entry: entry_address,
        regions,
    });
}

/// Absorb chunks of `graph` that start exactly where another one ends.
/// Returns the surviving representatives.
fn merge_adjacent(arena: &mut ChunkArena, graph: &ChunkGraph) -> Vec<ChunkId> {
    let members: Vec<ChunkId> = graph.vertices().map(|v| arena.find(v)).collect();
    let by_start: BTreeMap<u64, ChunkId> = members.iter().map(|&v| (arena.get(v).start(), v)).collect();
    let ends: BTreeMap<ChunkId, u64> = members.iter().map(|&v| (v, arena.get(v).end())).collect();

    let mut survivors = Vec::new();
    for &vertex in by_start.values() {
        if arena.is_merged(vertex) {
            continue;
        }
        let mut end = ends[&vertex];
        while let Some(&next) = by_start.get(&end) {
            if next == vertex || !arena.absorb(vertex, next) {
                break;
            }
            end = ends[&next];
        }
        survivors.push(vertex);
    }
    survivors
}

/// Emit the chunk `vertex` as regions, cut at every symbol or export inside it.
fn subdivide(ctx: &Discovery, arena: &ChunkArena, vertex: ChunkId, function: u64, out: &mut Vec<CodeRegion>) {
    let chunk = arena.get(vertex);
    let instructions = chunk.instructions();
    let mut cuts: Vec<usize> = instructions
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, i)| ctx.candidate(i.ip()).is_some_and(|c| c.has_symbol_or_export()))
        .map(|(index, _)| index)
        .collect();
    cuts.insert(0, 0);
    cuts.push(instructions.len());

    for window in cuts.windows(2) {
        let slice = &instructions[window[0]..window[1]];
        let (Some(first), Some(last)) = (slice.first(), slice.last()) else {
            continue;
        };
        let (start, end) = (first.ip(), last.next_ip());
        out.push(CodeRegion {
            function,
            start,
            end,
            candidate: ctx.candidates.contains_key(&start).then_some(start),
            instructions: slice.to_vec(),
            xrefs: chunk
                .xrefs()
                .iter()
                .filter(|x| x.instruction >= start && x.instruction < end)
                .copied()
                .collect(),
        });
    }
}
