//! Final address-space tiling: every byte of the image ends up in exactly one
//! header, code, data, jump table, XFG hash or junk range.

use crate::assembler::{CodeRegion, Function};
use crate::candidate::{Candidate, DataItem, FoundBy};
use crate::chunk::{Direction, XRef, XRefKind};
use crate::decoder::{decode_linear, is_call, operand_address};
use crate::discovery::Discovery;
use crate::error::Result;
use iced_x86::{Code, FlowControl, Instruction};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const XFG_HASH_LEN: u64 = 8;
const POINTER_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RangeKind {
    Header,
    Code,
    Data,
    JumpTable,
    Xfg,
    Junk,
}

/// A data item, possibly holding smaller items that lie inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRange {
    pub start: u64,
    pub end: u64,
    pub found_by: FoundBy,
    pub symbol: Option<usize>,
    pub children: Vec<DataRange>,
}

#[derive(Debug, Clone)]
pub enum MetadataRange {
    Header { start: u64, end: u64 },
    Code(CodeRegion),
    Data(DataRange),
    JumpTable { start: u64, end: u64, jump: u64 },
    Xfg { start: u64, end: u64, function: u64 },
    Junk { start: u64, end: u64 },
}

impl MetadataRange {
    pub fn start(&self) -> u64 {
        match self {
            Self::Header { start, .. }
            | Self::JumpTable { start, .. }
            | Self::Xfg { start, .. }
            | Self::Junk { start, .. } => *start,
            Self::Code(region) => region.start,
            Self::Data(data) => data.start,
        }
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        match self {
            Self::Header { end, .. }
            | Self::JumpTable { end, .. }
            | Self::Xfg { end, .. }
            | Self::Junk { end, .. } => *end,
            Self::Code(region) => region.end,
            Self::Data(data) => data.end,
        }
    }

    pub fn kind(&self) -> RangeKind {
        match self {
            Self::Header { .. } => RangeKind::Header,
            Self::Code(_) => RangeKind::Code,
            Self::Data(_) => RangeKind::Data,
            Self::JumpTable { .. } => RangeKind::JumpTable,
            Self::Xfg { .. } => RangeKind::Xfg,
            Self::Junk { .. } => RangeKind::Junk,
        }
    }

    pub fn as_code(&self) -> Option<&CodeRegion> {
        match self {
            Self::Code(region) => Some(region),
            _ => None,
        }
    }

    fn set_end(&mut self, new_end: u64) {
        match self {
            Self::Header { end, .. }
            | Self::JumpTable { end, .. }
            | Self::Xfg { end, .. }
            | Self::Junk { end, .. } => *end = new_end,
            Self::Code(region) => region.end = new_end,
            Self::Data(data) => {
                data.end = new_end;
                data.children.retain(|child| child.start < new_end);
            }
        }
    }

    /// Sort rank among ranges starting at the same address.
    fn rank(&self) -> u8 {
        match self {
            Self::Header { .. } => 0,
            Self::Code(_) => 1,
            Self::JumpTable { .. } => 2,
            Self::Xfg { .. } => 3,
            Self::Data(_) => 4,
            Self::Junk { .. } => 5,
        }
    }
}

/// Tile the image with `functions` and the data items known to `ctx`, then
/// try to turn junk next to code back into code.
pub fn build_ranges(ctx: &mut Discovery, functions: Vec<Function>) -> Result<Vec<MetadataRange>> {
    let mut items = vec![MetadataRange::Header {
        start: ctx.image.base(),
        end: ctx.image.header_end(),
    }];
    items.extend(
        functions
            .into_iter()
            .flat_map(|f| f.regions)
            .map(MetadataRange::Code),
    );
    items.extend(data_ranges(ctx));
    items.sort_by_key(|item| (item.start(), item.rank()));

    let mut ranges = tile(items, ctx.image.base(), ctx.image.end());
    attach_call_xrefs(&mut ranges);
    salvage_between_regions(ctx, &mut ranges);
    salvage_after_calls(ctx, &mut ranges)?;

    info!(
        target: "fnbound::ranges",
        ranges = ranges.len(),
        code = ranges.iter().filter(|r| r.kind() == RangeKind::Code).count(),
        junk = ranges.iter().filter(|r| r.kind() == RangeKind::Junk).count(),
        "Tiled image"
    );
    Ok(ranges)
}

fn data_ranges(ctx: &Discovery) -> Vec<MetadataRange> {
    ctx.data
        .iter()
        .filter_map(|(&address, item)| match item {
            DataItem::Candidate(candidate) => Some(MetadataRange::Data(DataRange {
                start: address,
                end: address + data_len(ctx, candidate),
                found_by: candidate.found_by,
                symbol: candidate.symbol,
                children: Vec::new(),
            })),
            DataItem::JumpTable { jump } => {
                let table = ctx.jump_tables.get(jump)?;
                Some(MetadataRange::JumpTable {
                    start: address,
                    end: table.end().max(address + 1),
                    jump: *jump,
                })
            }
            DataItem::Xfg { function } => Some(MetadataRange::Xfg {
                start: address,
                end: address + XFG_HASH_LEN,
                function: *function,
            }),
        })
        .collect()
}

fn data_len(ctx: &Discovery, candidate: &Candidate) -> u64 {
    if candidate.found_by.contains(FoundBy::EXTERNAL_JMP) {
        return POINTER_LEN;
    }
    if let Some(symbol) = candidate.symbol.and_then(|i| ctx.evidence.symbols.get(i)) {
        return symbol.length.max(1);
    }
    if candidate.found_by.contains(FoundBy::CONFIG) {
        return POINTER_LEN;
    }
    1
}

/// Lay sorted `items` end to end over `[base, end)`, filling gaps with junk.
fn tile(items: Vec<MetadataRange>, base: u64, end: u64) -> Vec<MetadataRange> {
    let mut ranges: Vec<MetadataRange> = Vec::with_capacity(items.len() * 2);
    let mut cursor = base;

    for mut item in items {
        if item.start() >= end || item.end() <= item.start() {
            warn!(
                target: "fnbound::ranges",
                start = format!("0x{:x}", item.start()),
                kind = ?item.kind(),
                "Dropping empty or out of image range"
            );
            continue;
        }
        if item.end() > end {
            item.set_end(end);
        }

        if item.start() < cursor {
            match (ranges.last_mut(), item) {
                (Some(MetadataRange::Data(outer)), MetadataRange::Data(inner)) if inner.end <= outer.end => {
                    outer.children.push(inner);
                    continue;
                }
                (Some(previous), MetadataRange::Code(region))
                    if !matches!(previous, MetadataRange::Code(_) | MetadataRange::Header { .. }) =>
                {
                    warn!(
                        target: "fnbound::ranges",
                        kind = ?previous.kind(),
                        start = format!("0x{:x}", previous.start()),
                        code = format!("0x{:x}", region.start),
                        "Code truncates preceding range"
                    );
                    if previous.start() < region.start {
                        previous.set_end(region.start);
                    } else {
                        ranges.pop();
                    }
                    cursor = ranges.last().map_or(base, MetadataRange::end);
                    item = MetadataRange::Code(region);
                }
                (_, item) => {
                    warn!(
                        target: "fnbound::ranges",
                        kind = ?item.kind(),
                        start = format!("0x{:x}", item.start()),
                        end = format!("0x{:x}", item.end()),
                        "Dropping overlapping range"
                    );
                    continue;
                }
            }
        }

        if item.start() > cursor {
            ranges.push(MetadataRange::Junk {
                start: cursor,
                end: item.start(),
            });
        }
        cursor = item.end();
        ranges.push(item);
    }

    if cursor < end {
        ranges.push(MetadataRange::Junk { start: cursor, end });
    }
    ranges
}

/// Link each call whose operand lands on the start of a range.
fn attach_call_xrefs(ranges: &mut [MetadataRange]) {
    let by_start: BTreeMap<u64, usize> = ranges
        .iter()
        .enumerate()
        .map(|(index, range)| (range.start(), index))
        .collect();

    let mut links = Vec::new();
    for (index, range) in ranges.iter().enumerate() {
        let Some(region) = range.as_code() else {
            continue;
        };
        for instruction in region.instructions.iter().filter(|i| is_call(i)) {
            let Some(target) = operand_address(instruction) else {
                continue;
            };
            if let Some(&other) = by_start.get(&target) {
                links.push((index, instruction.ip(), other, target));
            }
        }
    }

    for (index, from, other, target) in links {
        if let MetadataRange::Code(region) = &mut ranges[index] {
            region.xrefs.push(XRef {
                instruction: from,
                other: target,
                kind: XRefKind::Call,
                direction: Direction::From,
            });
        }
        if let MetadataRange::Code(region) = &mut ranges[other] {
            region.xrefs.push(XRef {
                instruction: target,
                other: from,
                kind: XRefKind::Call,
                direction: Direction::To,
            });
        }
    }
}

/// Junk sitting between two regions of the same function that decodes
/// cleanly end to end is folded into the preceding region.
fn salvage_between_regions(ctx: &Discovery, ranges: &mut Vec<MetadataRange>) {
    let mut index = 1;
    while index + 1 < ranges.len() {
        let (MetadataRange::Code(previous), MetadataRange::Junk { start, end }, MetadataRange::Code(next)) =
            (&ranges[index - 1], &ranges[index], &ranges[index + 1])
        else {
            index += 1;
            continue;
        };
        let (start, end) = (*start, *end);
        if previous.function != next.function || ends_flow(previous) {
            index += 1;
            continue;
        }
        let bytes = ctx.image.read(start, (end - start) as usize).unwrap_or_default();
        if bytes.first() == Some(&0xcc) || bytes == [0x90] {
            index += 1;
            continue;
        }
        let Some(instructions) = decode_exactly(ctx, start, end) else {
            index += 1;
            continue;
        };

        debug!(
            target: "fnbound::ranges",
            start = format!("0x{:x}", start),
            end = format!("0x{:x}", end),
            "Junk between regions salvaged"
        );
        let merge_next = next.candidate.is_none() && next.start != next.function;
        ranges.remove(index);
        let next = if merge_next {
            match ranges.remove(index) {
                MetadataRange::Code(next) => Some(next),
                _ => None,
            }
        } else {
            None
        };
        if let MetadataRange::Code(previous) = &mut ranges[index - 1] {
            previous.instructions.extend(instructions);
            previous.end = end;
            if let Some(next) = next {
                previous.instructions.extend(next.instructions);
                previous.xrefs.extend(next.xrefs);
                previous.end = next.end;
            }
        }
    }
}

/// Junk right after a call that does not return, or after a fail-fast
/// interrupt, is walked as code and folded into the preceding region.
fn salvage_after_calls(ctx: &mut Discovery, ranges: &mut Vec<MetadataRange>) -> Result<()> {
    let mut index = 1;
    while index < ranges.len() {
        let (MetadataRange::Code(previous), MetadataRange::Junk { start, end }) = (&ranges[index - 1], &ranges[index])
        else {
            index += 1;
            continue;
        };
        let (start, end) = (*start, *end);
        let Some(last) = previous.instructions.last() else {
            index += 1;
            continue;
        };
        let bytes = ctx.image.read(start, (end - start) as usize).unwrap_or_default();
        if !is_salvageable_after(last, bytes) {
            index += 1;
            continue;
        }

        let walked = ctx.walk_detached(start)?;
        let region = match walked.regions.as_slice() {
            [region] if walked.is_success() && region.start == start && region.end() <= end => region,
            _ => {
                index += 1;
                continue;
            }
        };

        debug!(
            target: "fnbound::ranges",
            start = format!("0x{:x}", start),
            end = format!("0x{:x}", region.end()),
            junk_end = format!("0x{:x}", end),
            "Junk after call salvaged"
        );
        let salvaged_end = region.end();
        let instructions = region.instructions.clone();
        if let MetadataRange::Code(previous) = &mut ranges[index - 1] {
            previous.instructions.extend(instructions);
            previous.end = salvaged_end;
        }
        if salvaged_end == end {
            ranges.remove(index);
        } else {
            ranges[index] = MetadataRange::Junk {
                start: salvaged_end,
                end,
            };
            index += 1;
        }
    }
    Ok(())
}

fn is_salvageable_after(last: &Instruction, junk: &[u8]) -> bool {
    match junk {
        [] | [0xcc, ..] => return false,
        _ if junk.iter().all(|&b| b == 0x90 || b == 0xcc) => return false,
        [0x90, 0xcc, _, ..] => return false,
        _ => {}
    }
    if is_call(last) {
        return true;
    }
    if last.code() == Code::Int_imm8 && last.immediate8() == 0x29 {
        return matches!(junk, [0x90 | 0xe9, second, ..] if *second != 0xcc);
    }
    false
}

/// The region ends in a jump or return, so nothing falls through into what follows.
fn ends_flow(region: &CodeRegion) -> bool {
    region.instructions.last().is_some_and(|last| {
        matches!(
            last.flow_control(),
            FlowControl::UnconditionalBranch | FlowControl::Return
        )
    })
}

/// Decode `[start, end)` if it is valid instructions ending exactly at `end`.
fn decode_exactly(ctx: &Discovery, start: u64, end: u64) -> Option<Vec<Instruction>> {
    let instructions = decode_linear(ctx.image, start, (end - start) as usize);
    let valid = !instructions.is_empty()
        && instructions.iter().all(|i| !i.is_invalid())
        && instructions.last().map(Instruction::next_ip) == Some(end);
    valid.then_some(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::TrustLevel;
    use crate::chunk::testing::commit;
    use crate::chunk::ChunkArena;
    use crate::discovery::testing::discovery;
    use crate::evidence::{ModuleEvidence, Symbol, SymbolKind};
    use crate::image::testing::image_with;
    use crate::resolver::NoReturnSet;

    fn assert_tiles(ranges: &[MetadataRange], base: u64, end: u64) {
        let mut cursor = base;
        for range in ranges {
            assert_eq!(range.start(), cursor, "gap or overlap at 0x{:x}", cursor);
            assert!(range.end() > range.start());
            cursor = range.end();
        }
        assert_eq!(cursor, end);
    }

    fn region(function: u64, start: u64, instructions: Vec<Instruction>) -> CodeRegion {
        CodeRegion {
            function,
            start,
            end: instructions.last().map_or(start, Instruction::next_ip),
            candidate: None,
            instructions,
            xrefs: Vec::new(),
        }
    }

    fn kinds(ranges: &[MetadataRange]) -> Vec<(RangeKind, u64, u64)> {
        ranges.iter().map(|r| (r.kind(), r.start(), r.end())).collect()
    }

    #[test]
    fn test_tiles_whole_image() {
        // 0x1000: call 0x1010; ret     0x1010: ret
        let image = image_with(
            &[(0x1000, &[0xe8, 0x0b, 0x00, 0x00, 0x00, 0xc3]), (0x1010, &[0xc3])],
            &[],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        commit(&mut ctx, &image, &[(0x1000, 6), (0x1010, 1)], &[0x1000, 0x1010]);
        ctx.add_data_candidate(0x8010, FoundBy::CONFIG, TrustLevel::Trusted);
        ctx.add_data_candidate(0x8100, FoundBy::RVA, TrustLevel::Untrusted);

        let mut arena = ChunkArena::build(&ctx);
        let functions = crate::assembler::assemble(&ctx, &mut arena);
        let ranges = build_ranges(&mut ctx, functions).unwrap();

        assert_tiles(&ranges, 0, 0x9000);
        assert_eq!(
            kinds(&ranges),
            [
                (RangeKind::Header, 0, 0x400),
                (RangeKind::Junk, 0x400, 0x1000),
                (RangeKind::Code, 0x1000, 0x1006),
                (RangeKind::Junk, 0x1006, 0x1010),
                (RangeKind::Code, 0x1010, 0x1011),
                (RangeKind::Junk, 0x1011, 0x8010),
                (RangeKind::Data, 0x8010, 0x8018),
                (RangeKind::Junk, 0x8018, 0x8100),
                (RangeKind::Data, 0x8100, 0x8101),
                (RangeKind::Junk, 0x8101, 0x9000),
            ]
        );

        let caller = ranges[2].as_code().unwrap();
        assert!(caller.xrefs.iter().any(|x| x.kind == XRefKind::Call && x.other == 0x1010));
        let callee = ranges[4].as_code().unwrap();
        assert!(callee
            .xrefs
            .iter()
            .any(|x| x.kind == XRefKind::Call && x.direction == Direction::To));
    }

    #[test]
    fn test_nested_data_and_truncation() {
        let image = image_with(&[(0x1004, &[0xc3])], &[]);
        let evidence = ModuleEvidence {
            symbols: vec![Symbol {
                address: 0x8000,
                name: "table".into(),
                undecorated: None,
                length: 0x20,
                kind: SymbolKind::Data,
                no_return: false,
            }],
            ..Default::default()
        };
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.add_data_candidate(0x8000, FoundBy::SYMBOL, TrustLevel::Trusted);
        if let Some(DataItem::Candidate(candidate)) = ctx.data.get_mut(&0x8000) {
            candidate.symbol = Some(0);
        }
        ctx.add_data_candidate(0x8008, FoundBy::RVA, TrustLevel::Untrusted);
        // A pointer-sized config item in code that is really code.
        ctx.add_data_candidate(0x1000, FoundBy::CONFIG, TrustLevel::Trusted);

        let function = Function {
            entry: 0x1004,
            regions: vec![region(0x1004, 0x1004, decode_linear(&image, 0x1004, 1))],
        };
        let ranges = build_ranges(&mut ctx, vec![function]).unwrap();
        assert_tiles(&ranges, 0, 0x9000);

        let data: Vec<_> = ranges
            .iter()
            .filter_map(|r| match r {
                MetadataRange::Data(d) => Some((d.start, d.end, d.children.len())),
                _ => None,
            })
            .collect();
        assert_eq!(data, [(0x1000, 0x1004, 0), (0x8000, 0x8020, 1)]);
    }

    #[test]
    fn test_junk_between_regions_folds_in() {
        // 0x1000: jne 0x1010     0x1002: nop x14     0x1010: ret
        let mut code = vec![0x75, 0x0e];
        code.extend([0x90; 14]);
        code.push(0xc3);
        let image = image_with(&[(0x1000, &code)], &[]);
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let function = Function {
            entry: 0x1000,
            regions: vec![
                region(0x1000, 0x1000, decode_linear(&image, 0x1000, 2)),
                region(0x1000, 0x1010, decode_linear(&image, 0x1010, 1)),
            ],
        };
        let ranges = build_ranges(&mut ctx, vec![function]).unwrap();
        assert_tiles(&ranges, 0, 0x9000);

        let code = ranges[2].as_code().unwrap();
        assert_eq!((code.start, code.end), (0x1000, 0x1011));
        assert_eq!(code.instructions.len(), 16);
        assert_eq!(ranges[3].kind(), RangeKind::Junk);
    }

    #[test]
    fn test_junk_after_jump_is_kept() {
        // 0x1000: jmp 0x1010     0x1002: nop x14     0x1010: ret
        let mut code = vec![0xeb, 0x0e];
        code.extend([0x90; 14]);
        code.push(0xc3);
        let image = image_with(&[(0x1000, &code)], &[]);
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let function = Function {
            entry: 0x1000,
            regions: vec![
                region(0x1000, 0x1000, decode_linear(&image, 0x1000, 2)),
                region(0x1000, 0x1010, decode_linear(&image, 0x1010, 1)),
            ],
        };
        let ranges = build_ranges(&mut ctx, vec![function]).unwrap();
        assert_eq!(
            kinds(&ranges)[2..5],
            [
                (RangeKind::Code, 0x1000, 0x1002),
                (RangeKind::Junk, 0x1002, 0x1010),
                (RangeKind::Code, 0x1010, 0x1011),
            ]
        );
    }

    #[test]
    fn test_junk_after_call_is_walked() {
        // 0x1000: call 0x1020     0x1005: xor eax, eax; ret     0x1020: ret
        let image = image_with(
            &[
                (0x1000, &[0xe8, 0x1b, 0x00, 0x00, 0x00, 0x31, 0xc0, 0xc3]),
                (0x1020, &[0xc3]),
            ],
            &[],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let functions = vec![
            Function {
                entry: 0x1000,
                regions: vec![region(0x1000, 0x1000, decode_linear(&image, 0x1000, 5))],
            },
            Function {
                entry: 0x1020,
                regions: vec![region(0x1020, 0x1020, decode_linear(&image, 0x1020, 1))],
            },
        ];
        let ranges = build_ranges(&mut ctx, functions).unwrap();
        assert_tiles(&ranges, 0, 0x9000);
        assert_eq!(
            kinds(&ranges)[2..5],
            [
                (RangeKind::Code, 0x1000, 0x1008),
                (RangeKind::Junk, 0x1008, 0x1020),
                (RangeKind::Code, 0x1020, 0x1021),
            ]
        );
        assert!(ctx.deferred_seen.is_empty());
    }

    #[test]
    fn test_salvage_rules_after_interrupt() {
        let image = image_with(&[(0x1000, &[0xcd, 0x29])], &[]);
        let fail_fast = decode_linear(&image, 0x1000, 2).remove(0);
        assert!(is_salvageable_after(&fail_fast, &[0x90, 0x48]));
        assert!(is_salvageable_after(&fail_fast, &[0xe9, 0x00, 0x00]));
        assert!(!is_salvageable_after(&fail_fast, &[0x48, 0x89]));
        assert!(!is_salvageable_after(&fail_fast, &[0x90]));
        assert!(!is_salvageable_after(&fail_fast, &[0x90, 0xcc, 0x48]));
        assert!(!is_salvageable_after(&fail_fast, &[0xcc, 0x48]));
        assert!(!is_salvageable_after(&fail_fast, &[0x90, 0x90, 0xcc]));
    }
}
