//! Forward instruction walker that turns a candidate address into a set of
//! contiguous code regions, repairing itself when it runs into bytes that turn
//! out not to be code.

use crate::decoder::{branch_target, is_call, is_int3, is_nop};
use crate::discovery::Discovery;
use crate::error::{AnalysisError, FunctionError, Result};
use iced_x86::{FlowControl, Instruction, Mnemonic, OpKind};
use rustc_hash::FxHashSet;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

const FAIL_FAST: u8 = 0x29;
const ASSERTION_FAILURE: u8 = 0x2c;
const DEBUGGER_PROMPT: u8 = 0x2d;
const SYSCALL: u8 = 0x2e;

/// A gapless run of instructions produced by one forward walk.
#[derive(Debug, Clone)]
pub struct Region {
    pub start: u64,
    pub instructions: Vec<Instruction>,
    /// Jump targets this region was the first to reference, mapped to the
    /// address of the referencing instruction.
    refs: BTreeMap<u64, u64>,
}

impl Region {
    fn new(start: u64) -> Self {
        Self {
            start,
            instructions: Vec::new(),
            refs: BTreeMap::new(),
        }
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.instructions
            .last()
            .map_or(self.start, Instruction::next_ip)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }

    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

/// The outcome of walking one function.
#[derive(Debug, Clone)]
pub struct RegionSet {
    pub address: u64,
    pub regions: Vec<Region>,
    pub error: Option<FunctionError>,
}

impl RegionSet {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.regions.iter().any(|r| r.contains(address))
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.regions.iter().flat_map(|r| r.instructions.iter())
    }
}

/// The instructions leading up to an indirect jump: the region containing the
/// jump, then each region that first jumped to the one before it.
#[derive(Debug, Clone, Copy)]
pub struct RegionPath<'w> {
    root_start: u64,
    root: &'w [Instruction],
    regions: &'w [Region],
}

impl<'w> RegionPath<'w> {
    pub fn new(root_start: u64, root: &'w [Instruction], regions: &'w [Region]) -> Self {
        Self {
            root_start,
            root,
            regions,
        }
    }

    pub fn root(&self) -> &'w [Instruction] {
        self.root
    }

    /// Ancestor regions, nearest first, each with the index of the jump that led onward.
    pub fn ancestors(&self) -> impl Iterator<Item = (&'w [Instruction], usize)> + 'w {
        let regions = self.regions;
        let mut current = self.root_start;
        let mut remaining = regions.len();
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            regions.iter().find_map(|region| {
                let jump = *region.refs.get(&current)?;
                let index = region.instructions.iter().position(|i| i.ip() == jump)?;
                current = region.start;
                Some((region.instructions.as_slice(), index))
            })
        })
    }
}

pub struct RegionWalker {
    function: u64,
    max_regions: usize,
    seen: FxHashSet<u64>,
    missing: BTreeSet<u64>,
    regions: Vec<Region>,
    error: Option<FunctionError>,
}

impl RegionWalker {
    pub fn new(function: u64, max_regions: usize) -> Self {
        Self {
            function,
            max_regions,
            seen: FxHashSet::default(),
            missing: BTreeSet::new(),
            regions: Vec::new(),
            error: None,
        }
    }

    pub fn run(mut self, ctx: &mut Discovery) -> Result<RegionSet> {
        if let Some(region) = self.walk_region(ctx, self.function)? {
            self.regions.push(region);
        }

        if !self.should_return_bad(ctx) {
            while let Some(&next) = self.missing.first() {
                if let Some(region) = self.walk_region(ctx, next)? {
                    self.regions.push(region);
                }
                self.missing.remove(&next);

                if self.should_return_bad(ctx) {
                    break;
                }

                if self.regions.len() > self.max_regions {
                    return Err(AnalysisError::RegionLimitExceeded {
                        address: self.function,
                        limit: self.max_regions,
                    });
                }
            }
        }

        if self.error.is_none() && self.regions.is_empty() {
            self.error = Some(FunctionError::EmptyChunk);
        }

        self.regions.sort_by_key(|r| r.start);

        if let Some(error) = self.error {
            debug!(
                target: "fnbound::walker",
                function = format!("0x{:x}", self.function),
                ?error,
                regions = self.regions.len(),
                "Bad function"
            );
        }

        Ok(RegionSet {
            address: self.function,
            regions: self.regions,
            error: self.error,
        })
    }

    /// A size-exceeded function is kept when it is backed by metadata that
    /// vouches for its start.
    fn should_return_bad(&mut self, ctx: &Discovery) -> bool {
        match self.error {
            None => false,
            Some(FunctionError::FunctionSizeThresholdReached)
                if ctx.allow_size_threshold(self.function) =>
            {
                self.error = None;
                false
            }
            Some(_) => true,
        }
    }

    fn walk_region(&mut self, ctx: &mut Discovery, start: u64) -> Result<Option<Region>> {
        let threshold = ctx.region_end_threshold(start);
        let mut region = Region::new(start);
        let mut allow_int3 = true;
        let mut last_int3 = None;
        let mut ip = start;

        loop {
            if !ctx.should_process(ip) {
                break;
            }

            let Some(instruction) = ctx.decode(ip) else {
                break;
            };

            if region.instructions.is_empty() && ctx.is_zero_fill(&instruction) {
                break;
            }

            if ip > threshold {
                self.hit_threshold(ctx, &mut region);
                break;
            }

            if instruction.is_invalid() {
                if self.repair_invalid(ctx, &mut region, last_int3) {
                    self.discard_instructions(ctx, &mut region);
                }
                break;
            }

            trace!(
                target: "fnbound::walker",
                addr = format!("0x{:x}", ip),
                instruction = %instruction,
                "Instruction"
            );

            let mut int3_allowed = false;
            if is_int3(&instruction) {
                last_int3 = Some(region.instructions.len());
                if allow_int3 || !self.looks_finished(ctx, &mut region) {
                    int3_allowed = true;
                } else {
                    break;
                }
            }
            allow_int3 = false;

            if !self.seen.insert(ip) {
                break;
            }

            ctx.claim(ip);
            region.instructions.push(instruction);
            self.resolve_jump_target(&mut region, ip);

            if self.is_non_returning_call(ctx, &instruction)? {
                break;
            }

            let end = match instruction.flow_control() {
                FlowControl::ConditionalBranch
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch => self.process_jump(ctx, &mut region, &instruction)?,
                FlowControl::Interrupt => {
                    !self.process_interrupt(ctx, start, &instruction, int3_allowed, &mut allow_int3)
                }
                FlowControl::Return => true,
                _ => false,
            };
            if end {
                break;
            }

            ip = instruction.next_ip();
        }

        if region.instructions.is_empty() {
            return Ok(None);
        }
        Ok(Some(region))
    }

    fn hit_threshold(&mut self, ctx: &mut Discovery, region: &mut Region) {
        let last_call = region.instructions.iter().rposition(is_call);
        match last_call {
            Some(index) if !ctx.allow_size_threshold(self.function) => {
                trace!(
                    target: "fnbound::walker",
                    region = format!("0x{:x}", region.start),
                    "Truncating after last call at size threshold"
                );
                self.remove_instructions(ctx, region, index + 1);
            }
            _ => self.error = Some(FunctionError::FunctionSizeThresholdReached),
        }
    }

    fn add_jump_target(&mut self, region: &mut Region, target: u64, jump: u64) {
        if !self.seen.contains(&target) {
            self.missing.insert(target);
            region.refs.insert(target, jump);
        }
    }

    fn resolve_jump_target(&mut self, region: &mut Region, address: u64) {
        if self.missing.remove(&address) {
            region.refs.remove(&address);
        }
    }

    /// Truncate the region at `index`, forgetting the removed instructions and
    /// any jump targets only they referenced.
    fn remove_instructions(&mut self, ctx: &mut Discovery, region: &mut Region, index: usize) {
        for target in self.truncate(ctx, &mut region.instructions, index) {
            self.resolve_jump_target(region, target);
        }
    }

    /// Returns the direct branch targets of the removed instructions.
    fn truncate(
        &mut self,
        ctx: &mut Discovery,
        instructions: &mut Vec<Instruction>,
        index: usize,
    ) -> Vec<u64> {
        if index >= instructions.len() {
            return Vec::new();
        }
        let mut targets = Vec::new();
        for instruction in instructions.drain(index..) {
            ctx.unsee(instruction.ip());
            let is_branch = matches!(
                instruction.flow_control(),
                FlowControl::ConditionalBranch
                    | FlowControl::UnconditionalBranch
                    | FlowControl::IndirectBranch
            );
            if let Some(target) = branch_target(&instruction).filter(|_| is_branch) {
                targets.push(target);
            }
        }
        targets
    }

    fn is_non_returning_call(&mut self, ctx: &mut Discovery, instruction: &Instruction) -> Result<bool> {
        if !is_call(instruction) {
            return Ok(false);
        }
        match branch_target(instruction) {
            Some(target) => Ok(!ctx.does_return(target, false)?),
            None => Ok(false),
        }
    }

    /// Returns whether the region ends here.
    fn process_jump(
        &mut self,
        ctx: &mut Discovery,
        region: &mut Region,
        instruction: &Instruction,
    ) -> Result<bool> {
        let unconditional = matches!(
            instruction.flow_control(),
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        );

        if let Some(target) = branch_target(instruction) {
            if unconditional {
                if ctx.does_return(target, true)? {
                    self.add_jump_target(region, target, instruction.ip());
                }
                return Ok(true);
            }
            self.add_jump_target(region, target, instruction.ip());
            return Ok(false);
        }

        if unconditional && instruction.op0_kind() == OpKind::Register {
            let path = RegionPath::new(region.start, &region.instructions, &self.regions);
            if let Some(targets) = ctx.jump_table(self.function, &path) {
                for target in targets {
                    self.add_jump_target(region, target, instruction.ip());
                }
            }
        }

        // Memory operands and untraceable registers are dead ends.
        Ok(unconditional)
    }

    /// Returns whether the walk may continue past the interrupt.
    fn process_interrupt(
        &mut self,
        ctx: &Discovery,
        region_start: u64,
        instruction: &Instruction,
        int3_allowed: bool,
        allow_int3: &mut bool,
    ) -> bool {
        if is_int3(instruction) {
            return int3_allowed && !ctx.is_int3_unwind_block(region_start);
        }

        if instruction.op_count() == 0 || instruction.op0_kind() != OpKind::Immediate8 {
            self.error = Some(FunctionError::UnknownInterrupt);
            return false;
        }

        match instruction.immediate8() {
            FAIL_FAST => false,
            ASSERTION_FAILURE | SYSCALL => true,
            DEBUGGER_PROMPT => {
                *allow_int3 = true;
                true
            }
            _ => {
                self.error = Some(FunctionError::UnknownInterrupt);
                false
            }
        }
    }

    /// Decide whether an int3 following the current instructions is padding
    /// after the end of the function. May drop trailing instructions that the
    /// int3 shows were not code after all.
    fn looks_finished(&mut self, ctx: &mut Discovery, region: &mut Region) -> bool {
        let Some(last) = region.last().copied() else {
            return false;
        };

        if last.flow_control() == FlowControl::ConditionalBranch {
            return false;
        }

        match last.mnemonic() {
            Mnemonic::Call => {
                branch_target(&last).is_some_and(|target| target == self.function)
            }
            Mnemonic::Int3 => {
                // Two in a row: the earlier int3 was padding, and so was a nop before it.
                self.pop_instruction(ctx, region);
                if region.last().is_some_and(is_nop) {
                    self.pop_instruction(ctx, region);
                }
                true
            }
            Mnemonic::Ret | Mnemonic::Retf | Mnemonic::Jmp => true,
            Mnemonic::Dec => {
                let Some(mut index) = region.instructions.iter().rposition(is_int3) else {
                    return false;
                };
                if index > 0 && is_nop(&region.instructions[index - 1]) {
                    index -= 1;
                }
                self.remove_instructions(ctx, region, index);
                true
            }
            _ => false,
        }
    }

    fn pop_instruction(&mut self, ctx: &mut Discovery, region: &mut Region) {
        if let Some(instruction) = region.instructions.pop() {
            ctx.unsee(instruction.ip());
        }
    }

    /// Returns true when the current region must be thrown away because an
    /// ancestor region was repaired instead.
    fn repair_invalid(
        &mut self,
        ctx: &mut Discovery,
        region: &mut Region,
        last_int3: Option<usize>,
    ) -> bool {
        if let Some(index) = last_int3 {
            self.remove_instructions(ctx, region, index);
            return false;
        }

        let nop_after_call = (1..region.instructions.len()).rev().find(|&i| {
            is_nop(&region.instructions[i]) && is_call(&region.instructions[i - 1])
        });
        if let Some(index) = nop_after_call {
            self.remove_instructions(ctx, region, index);
            return false;
        }

        if self.rewind_invalid_regions(ctx, region.start) {
            return true;
        }

        self.error = Some(FunctionError::InvalidInstruction);
        false
    }

    /// Walk up the chain of regions that led to `start`, truncating the first
    /// one containing an int3 at that int3.
    fn rewind_invalid_regions(&mut self, ctx: &mut Discovery, start: u64) -> bool {
        let snapshot = (self.regions.clone(), self.missing.clone());
        let mut pending = vec![start];
        let mut repaired = false;

        while let Some(current) = pending.pop() {
            let Some(index) = self
                .regions
                .iter()
                .position(|r| r.refs.contains_key(&current))
            else {
                continue;
            };

            let mut parent = self.regions.remove(index);

            match parent.instructions.iter().position(is_int3) {
                Some(int3) => {
                    for target in self.truncate(ctx, &mut parent.instructions, int3) {
                        if parent.refs.remove(&target).is_some() && !self.missing.remove(&target) {
                            self.discard_region_tree(ctx, target);
                        }
                    }
                    trace!(
                        target: "fnbound::walker",
                        region = format!("0x{:x}", parent.start),
                        "Rewound region to int3"
                    );
                    if !parent.instructions.is_empty() {
                        self.regions.push(parent);
                    }
                    repaired = true;
                }
                None => {
                    self.forget_children(ctx, &parent, current);
                    self.unsee_all(ctx, &parent.instructions);
                    pending.push(parent.start);
                }
            }
        }

        if !repaired || self.regions.is_empty() {
            (self.regions, self.missing) = snapshot;
            return false;
        }
        true
    }

    /// Drop the region starting at `start` and every region it led to.
    fn discard_region_tree(&mut self, ctx: &mut Discovery, start: u64) {
        let Some(index) = self.regions.iter().position(|r| r.start == start) else {
            return;
        };
        let region = self.regions.remove(index);
        self.forget_children(ctx, &region, u64::MAX);
        self.unsee_all(ctx, &region.instructions);
    }

    fn forget_children(&mut self, ctx: &mut Discovery, region: &Region, except: u64) {
        for &target in region.refs.keys() {
            if target != except && !self.missing.remove(&target) {
                self.discard_region_tree(ctx, target);
            }
        }
    }

    fn unsee_all(&mut self, ctx: &mut Discovery, instructions: &[Instruction]) {
        for instruction in instructions {
            ctx.unsee(instruction.ip());
            self.seen.remove(&instruction.ip());
        }
    }

    /// Throw away the region currently being walked.
    fn discard_instructions(&mut self, ctx: &mut Discovery, region: &mut Region) {
        let refs = std::mem::take(&mut region.refs);
        for target in refs.into_keys() {
            if !self.missing.remove(&target) {
                self.discard_region_tree(ctx, target);
            }
        }
        let instructions = std::mem::take(&mut region.instructions);
        self.unsee_all(ctx, &instructions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{DataItem, FoundBy, TrustLevel};
    use crate::discovery::testing::discovery;
    use crate::evidence::ModuleEvidence;
    use crate::image::testing::image_with;
    use crate::resolver::NoReturnSet;

    fn spans(set: &RegionSet) -> Vec<(u64, u64)> {
        set.regions.iter().map(|r| (r.start, r.end())).collect()
    }

    fn walk(code: &[u8]) -> RegionSet {
        let image = image_with(&[(0x1000, code)], &[]);
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap()
    }

    #[test]
    fn test_conditional_branch_opens_region() {
        // test ecx, ecx; je 0x1005; ret; ret
        let image = image_with(&[(0x1000, &[0x85, 0xc9, 0x74, 0x01, 0xc3, 0xc3])], &[]);
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1005), (0x1005, 0x1006)]);
    }

    #[test]
    fn test_garbage_after_int3_is_cut() {
        // 0x1000: call 0x1010; int3; (invalid)      0x1010: ret
        let image = image_with(
            &[(0x1000, &[0xe8, 0x0b, 0x00, 0x00, 0x00, 0xcc, 0x06]), (0x1010, &[0xc3])],
            &[],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1005)]);
        assert!(!ctx.deferred_seen.contains(&0x1005));
    }

    #[test]
    fn test_invalid_without_int3_is_bad() {
        // nop; (invalid)
        let image = image_with(&[(0x1000, &[0x90, 0x06])], &[]);
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert_eq!(set.error, Some(FunctionError::InvalidInstruction));
    }

    #[test]
    fn test_invalid_after_nop_following_call_rewinds_to_call() {
        // 0x1000: call 0x1010; nop; (invalid)      0x1010: ret
        let image = image_with(
            &[(0x1000, &[0xe8, 0x0b, 0x00, 0x00, 0x00, 0x90, 0x06]), (0x1010, &[0xc3])],
            &[],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1005)]);
        assert!(!ctx.deferred_seen.contains(&0x1005));
    }

    #[test]
    fn test_invalid_in_child_rewinds_parent_to_int3() {
        // 0x1000: xor eax, eax; int3; je 0x1010; ret      0x1010: nop; (invalid)
        let image = image_with(
            &[
                (0x1000, &[0x31, 0xc0, 0xcc, 0x74, 0x0b, 0xc3]),
                (0x1010, &[0x90, 0x06]),
            ],
            &[],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1002)]);
        for address in [0x1002, 0x1003, 0x1005, 0x1010] {
            assert!(!ctx.deferred_seen.contains(&address));
        }
    }

    #[test]
    fn test_second_int3_ends_at_first() {
        // xor eax, eax; int3; int3
        let set = walk(&[0x31, 0xc0, 0xcc, 0xcc]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1002)]);

        // xor eax, eax; nop; int3; int3
        let set = walk(&[0x31, 0xc0, 0x90, 0xcc, 0xcc]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1002)]);
    }

    #[test]
    fn test_dec_before_int3_rewinds_to_earlier_int3() {
        // xor eax, eax; int3; dec eax; int3
        let set = walk(&[0x31, 0xc0, 0xcc, 0xff, 0xc8, 0xcc]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1002)]);

        // xor eax, eax; nop; int3; dec eax; int3
        let set = walk(&[0x31, 0xc0, 0x90, 0xcc, 0xff, 0xc8, 0xcc]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1002)]);
    }

    #[test]
    fn test_known_interrupts() {
        // xor eax, eax; int 0x29
        let set = walk(&[0x31, 0xc0, 0xcd, 0x29, 0x90, 0xc3]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1004)]);

        // int 0x2c; ret
        let set = walk(&[0xcd, 0x2c, 0xc3]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1003)]);

        // int 0x2e; ret
        let set = walk(&[0xcd, 0x2e, 0xc3]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1003)]);

        // int 0x2d; int3; ret
        let set = walk(&[0xcd, 0x2d, 0xcc, 0xc3]);
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1004)]);
    }

    #[test]
    fn test_unknown_interrupt_is_bad() {
        // int 0x21; ret
        let set = walk(&[0xcd, 0x21, 0xc3]);
        assert_eq!(set.error, Some(FunctionError::UnknownInterrupt));
        assert_eq!(spans(&set), [(0x1000, 0x1002)]);
    }

    #[test]
    fn test_zero_fill_is_empty_chunk() {
        let set = walk(&[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(set.error, Some(FunctionError::EmptyChunk));
        assert!(set.regions.is_empty());
    }

    #[test]
    fn test_jump_table_targets_become_regions() {
        // cmp ecx, 2; ja 0x1040; lea r8, [0x1000]; mov ecx, [r8+rcx*4+0x8000]; add rcx, r8; jmp rcx
        const SWITCH: &[u8] = &[
            0x83, 0xf9, 0x02, 0x77, 0x3b, 0x4c, 0x8d, 0x05, 0xf4, 0xff, 0xff, 0xff, 0x41, 0x8b,
            0x8c, 0x88, 0x00, 0x80, 0x00, 0x00, 0x4c, 0x01, 0xc1, 0xff, 0xe1,
        ];
        let table: Vec<u8> = [0x20i32, 0x28, 0x30]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let image = image_with(
            &[
                (0x1000, SWITCH),
                (0x1020, &[0xc3]),
                (0x1028, &[0xc3]),
                (0x1030, &[0xc3]),
                (0x1040, &[0xc3]),
            ],
            &[(0x8000, &table[..])],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert!(set.is_success());
        assert_eq!(
            spans(&set),
            [
                (0x1000, 0x1019),
                (0x1020, 0x1021),
                (0x1028, 0x1029),
                (0x1030, 0x1031),
                (0x1040, 0x1041)
            ]
        );
        assert!(matches!(
            ctx.data_items().get(&0x8000),
            Some(DataItem::JumpTable { jump: 0x1017 })
        ));
    }

    #[test]
    fn test_size_threshold_tolerated_for_symbols() {
        // nop; nop; nop; ret with another symbol at 0x1002
        let image = image_with(&[(0x1000, &[0x90, 0x90, 0x90, 0xc3])], &[]);
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();

        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.symbol_addresses = vec![0x1002];
        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert_eq!(set.error, Some(FunctionError::FunctionSizeThresholdReached));

        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.symbol_addresses = vec![0x1002];
        ctx.add_candidate(0x1000, FoundBy::SYMBOL, TrustLevel::Trusted).unwrap();
        let set = RegionWalker::new(0x1000, 16).run(&mut ctx).unwrap();
        assert!(set.is_success());
        assert_eq!(spans(&set), [(0x1000, 0x1002)]);
    }

    #[test]
    fn test_region_limit_is_fatal() {
        // je 0x1004; je 0x1006; je 0x1008; ret ...
        let image = image_with(
            &[(0x1000, &[0x74, 0x02, 0x74, 0x02, 0x74, 0x02, 0xc3, 0xc3, 0xc3])],
            &[],
        );
        let evidence = ModuleEvidence::default();
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);

        let result = RegionWalker::new(0x1000, 0).run(&mut ctx);
        assert!(matches!(
            result,
            Err(AnalysisError::RegionLimitExceeded { address: 0x1000, limit: 0 })
        ));
    }
}
