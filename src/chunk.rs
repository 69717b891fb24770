//! Chunks: straight-line runs of committed instructions, linked by the
//! cross references between them.
//!
//! Chunks live in a [`ChunkArena`] and are addressed by [`ChunkId`]. Merging
//! never deletes a chunk; the absorbed chunk is redirected to its absorber
//! through a union-find parent link, so stale ids stay valid.

use crate::decoder::{branch_target, is_jump, is_terminator};
use crate::discovery::Discovery;
use iced_x86::{FlowControl, Instruction};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(usize);

impl ChunkId {
    #[cfg(test)]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum XRefKind {
    ConditionalBranch,
    UnconditionalBranch,
    IndirectBranch,
    JumpTable,
    UnwindInfo,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// The instruction refers to the other one.
    From,
    /// The other instruction refers to this one.
    To,
}

/// One end of a cross reference between instructions of different chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct XRef {
    /// Instruction on this side.
    pub instruction: u64,
    /// Instruction on the other side.
    pub other: u64,
    pub kind: XRefKind,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    instructions: Vec<Instruction>,
    /// Function candidate starting at the chunk's first instruction.
    candidate: Option<u64>,
    xrefs: Vec<XRef>,
}

impl Chunk {
    pub fn start(&self) -> u64 {
        self.instructions.first().map_or(0, Instruction::ip)
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.instructions.last().map_or(0, Instruction::next_ip)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start() && address < self.end()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn candidate(&self) -> Option<u64> {
        self.candidate
    }

    pub fn xrefs(&self) -> &[XRef] {
        &self.xrefs
    }
}

#[derive(Debug, Default)]
pub struct ChunkArena {
    chunks: Vec<Chunk>,
    merged_into: Vec<ChunkId>,
    /// Chunk each instruction was originally placed in.
    owner: FxHashMap<u64, ChunkId>,
    by_start: BTreeMap<u64, ChunkId>,
}

impl ChunkArena {
    /// Slice every committed instruction into chunks and resolve the
    /// references between them.
    pub fn build(ctx: &Discovery) -> Self {
        let mut arena = Self::default();
        let mut current: Vec<Instruction> = Vec::new();
        let mut instructions = ctx.discovered.values().peekable();

        while let Some(instruction) = instructions.next() {
            current.push(*instruction);
            let ends = match instructions.peek() {
                Some(next) => splits_before(ctx, instruction, next),
                None => true,
            };
            if ends {
                arena.push(std::mem::take(&mut current), ctx);
            }
        }

        for index in 0..arena.chunks.len() {
            arena.resolve_references(ChunkId(index), ctx);
        }

        info!(
            target: "fnbound::chunks",
            chunks = arena.chunks.len(),
            instructions = arena.owner.len(),
            "Built chunks"
        );
        arena
    }

    fn push(&mut self, instructions: Vec<Instruction>, ctx: &Discovery) -> ChunkId {
        let id = ChunkId(self.chunks.len());
        for instruction in &instructions {
            self.owner.insert(instruction.ip(), id);
        }
        let start = instructions.first().map_or(0, Instruction::ip);
        let candidate = ctx.candidates.contains_key(&start).then_some(start);
        self.chunks.push(Chunk {
            instructions,
            candidate,
            xrefs: Vec::new(),
        });
        self.merged_into.push(id);
        self.by_start.insert(start, id);
        id
    }

    fn resolve_references(&mut self, id: ChunkId, ctx: &Discovery) {
        let mut refs = Vec::new();
        for instruction in &self.chunks[id.0].instructions {
            let ip = instruction.ip();
            if is_jump(instruction) {
                if let Some(target) = branch_target(instruction) {
                    if self.owner.contains_key(&target) {
                        refs.push((ip, target, branch_kind(instruction)));
                    }
                } else if let Some(table) = ctx.jump_tables.get(&ip) {
                    refs.extend(
                        table
                            .targets
                            .iter()
                            .filter(|t| self.owner.contains_key(t))
                            .map(|&t| (ip, t, XRefKind::JumpTable)),
                    );
                }
            }

            if let Some(records) = ctx.unwind_map.get(&ip) {
                let mut targets: Vec<u64> = records
                    .iter()
                    .flat_map(|r| r.targets())
                    .filter(|&t| t != ip && self.owner.contains_key(&t))
                    .collect();
                targets.sort_unstable();
                targets.dedup();
                refs.extend(targets.into_iter().map(|t| (ip, t, XRefKind::UnwindInfo)));
            }
        }

        for (from, to, kind) in refs {
            let target = self.owner[&to];
            if target == id {
                continue;
            }
            self.chunks[id.0].xrefs.push(XRef {
                instruction: from,
                other: to,
                kind,
                direction: Direction::From,
            });
            self.chunks[target.0].xrefs.push(XRef {
                instruction: to,
                other: from,
                kind,
                direction: Direction::To,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        (0..self.chunks.len()).map(ChunkId)
    }

    pub fn get(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id.0]
    }

    /// The chunk `id` was merged into, compressing the path on the way.
    pub fn find(&mut self, id: ChunkId) -> ChunkId {
        let root = self.representative(id);
        let mut current = id;
        while current != root {
            let next = self.merged_into[current.0];
            self.merged_into[current.0] = root;
            current = next;
        }
        root
    }

    /// Like [`find`](Self::find) without path compression.
    pub fn representative(&self, mut id: ChunkId) -> ChunkId {
        while self.merged_into[id.0] != id {
            id = self.merged_into[id.0];
        }
        id
    }

    pub fn is_merged(&self, id: ChunkId) -> bool {
        self.merged_into[id.0] != id
    }

    /// The live chunk holding the instruction at `address`.
    pub fn chunk_of(&self, address: u64) -> Option<ChunkId> {
        self.owner.get(&address).map(|&id| self.representative(id))
    }

    /// The chunk originally starting at `address`.
    pub fn chunk_at(&self, address: u64) -> Option<ChunkId> {
        self.by_start.get(&address).copied()
    }

    /// Append `other`'s instructions to `into`. The two must be byte adjacent.
    /// Returns false when both already are the same chunk.
    pub fn absorb(&mut self, into: ChunkId, other: ChunkId) -> bool {
        let into = self.find(into);
        let other = self.find(other);
        if into == other {
            return false;
        }
        debug_assert_eq!(self.chunks[into.0].end(), self.chunks[other.0].start());

        let moved = std::mem::take(&mut self.chunks[other.0].instructions);
        let xrefs = std::mem::take(&mut self.chunks[other.0].xrefs);
        let chunk = &mut self.chunks[into.0];
        chunk.instructions.extend(moved);
        chunk.xrefs.extend(xrefs);
        self.merged_into[other.0] = into;
        true
    }

    /// Chunks referenced by or referring to `id`, by live representative, with
    /// self references removed.
    pub fn neighbours(&self, id: ChunkId) -> impl Iterator<Item = (ChunkId, XRefKind, Direction)> + '_ {
        let id = self.representative(id);
        self.chunks[id.0].xrefs.iter().filter_map(move |xref| {
            let other = self.chunk_of(xref.other)?;
            (other != id).then_some((other, xref.kind, xref.direction))
        })
    }
}

fn branch_kind(instruction: &Instruction) -> XRefKind {
    match instruction.flow_control() {
        FlowControl::ConditionalBranch => XRefKind::ConditionalBranch,
        FlowControl::UnconditionalBranch => XRefKind::UnconditionalBranch,
        _ => XRefKind::IndirectBranch,
    }
}

/// Whether a chunk boundary falls between two consecutive committed instructions.
fn splits_before(ctx: &Discovery, instruction: &Instruction, next: &Instruction) -> bool {
    if is_terminator(instruction) || instruction.next_ip() != next.ip() {
        return true;
    }
    // Code after an interrupt that something else jumps to is not a
    // continuation of the interrupt.
    instruction.flow_control() == FlowControl::Interrupt
        && ctx.known_jump_targets.contains(&next.ip())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::candidate::{FoundBy, TrustLevel};
    use crate::decoder::decode_linear;
    use crate::image::Image;

    /// Commit the code at each `(address, len)` as discovered and mark the
    /// given addresses as function candidates.
    pub fn commit(ctx: &mut Discovery, image: &Image, code: &[(u64, usize)], candidates: &[u64]) {
        for &(address, len) in code {
            for instruction in decode_linear(image, address, len) {
                if let Some(target) = branch_target(&instruction) {
                    if is_jump(&instruction) {
                        ctx.known_jump_targets.insert(target);
                    }
                }
                ctx.discovered.insert(instruction.ip(), instruction);
            }
        }
        for &address in candidates {
            ctx.add_candidate(address, FoundBy::SYMBOL, TrustLevel::Trusted)
                .unwrap();
        }
    }
}
