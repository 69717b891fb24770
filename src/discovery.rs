//! Shared discovery state and the queue-draining loop.
//!
//! Every recursive entry (walker, return resolver, jump table cache) goes
//! through one [`Discovery`] value passed by `&mut`, so the recursion guard,
//! candidate map and claimed-instruction sets are explicit.

use crate::candidate::{Candidate, DataItem, DiscoveryResult, FoundBy, TrustLevel};
use crate::collector::EvidenceSources;
use crate::decoder::{
    decode_at, is_call, is_flow, is_jump, operand_address, referenced_values,
};
use crate::error::{AnalysisError, FunctionError, Result};
use crate::evidence::{ModuleEvidence, ScopeRecord};
use crate::image::Image;
use crate::jump_table::JumpTable;
use crate::progress::ProgressReporter;
use crate::resolver::NoReturnSet;
use crate::scheduler::{QueueKind, Scheduler};
use crate::walker::{RegionSet, RegionWalker};
use iced_x86::Instruction;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

/// A function whose walk failed, kept with whatever regions were found.
#[derive(Debug, Clone)]
pub struct BadFunction {
    pub address: u64,
    pub error: FunctionError,
    pub regions: Vec<(u64, u64)>,
}

pub struct Discovery<'a> {
    pub(crate) image: &'a Image,
    pub(crate) evidence: &'a ModuleEvidence,
    pub(crate) no_return: &'a NoReturnSet,
    pub(crate) sources: EvidenceSources,
    pub(crate) max_regions: usize,

    pub(crate) candidates: FxHashMap<u64, Candidate>,
    pub(crate) data: BTreeMap<u64, DataItem>,
    /// Addresses that must never become function candidates.
    pub(crate) ignored: FxHashSet<u64>,
    pub(crate) imports: FxHashSet<u64>,
    pub(crate) scheduler: Scheduler,
    /// Recursion guard of the return resolver.
    pub(crate) resolving: FxHashSet<u64>,

    pub(crate) discovered: BTreeMap<u64, Instruction>,
    /// Instructions walked during the current top-level item but not yet committed.
    pub(crate) deferred_seen: FxHashSet<u64>,
    /// Candidates whose instructions wait for the top-level item to succeed.
    pub(crate) deferred: Vec<u64>,
    pub(crate) code: FxHashMap<u64, RegionSet>,

    pub(crate) known_call_targets: FxHashSet<u64>,
    pub(crate) known_jump_targets: FxHashSet<u64>,
    pub(crate) unwind_map: FxHashMap<u64, Vec<ScopeRecord>>,
    pub(crate) jump_tables: FxHashMap<u64, JumpTable>,
    pub(crate) symbol_addresses: Vec<u64>,
}

impl<'a> Discovery<'a> {
    pub fn new(
        image: &'a Image,
        evidence: &'a ModuleEvidence,
        no_return: &'a NoReturnSet,
        sources: EvidenceSources,
        max_regions: usize,
    ) -> Self {
        Self {
            image,
            evidence,
            no_return,
            sources,
            max_regions,
            candidates: FxHashMap::default(),
            data: BTreeMap::new(),
            ignored: FxHashSet::default(),
            imports: FxHashSet::default(),
            scheduler: Scheduler::default(),
            resolving: FxHashSet::default(),
            discovered: BTreeMap::new(),
            deferred_seen: FxHashSet::default(),
            deferred: Vec::new(),
            code: FxHashMap::default(),
            known_call_targets: FxHashSet::default(),
            known_jump_targets: FxHashSet::default(),
            unwind_map: FxHashMap::default(),
            jump_tables: FxHashMap::default(),
            symbol_addresses: Vec::new(),
        }
    }

    pub fn candidate(&self, address: u64) -> Option<&Candidate> {
        self.candidates.get(&address)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    pub fn data_items(&self) -> &BTreeMap<u64, DataItem> {
        &self.data
    }

    pub fn discovered(&self) -> &BTreeMap<u64, Instruction> {
        &self.discovered
    }

    pub fn bad_functions(&self) -> Vec<BadFunction> {
        let mut bad: Vec<_> = self
            .code
            .values()
            .filter_map(|set| {
                Some(BadFunction {
                    address: set.address,
                    error: set.error?,
                    regions: set.regions.iter().map(|r| (r.start, r.end())).collect(),
                })
            })
            .collect();
        bad.sort_by_key(|b| b.address);
        bad
    }

    pub(crate) fn decode(&self, address: u64) -> Option<Instruction> {
        decode_at(self.image, address)
    }

    pub(crate) fn is_zero_fill(&self, instruction: &Instruction) -> bool {
        self.image
            .read(instruction.ip(), instruction.len().max(1))
            .is_some_and(|bytes| bytes.iter().all(|&b| b == 0))
    }

    /// Create a candidate, or OR new evidence into an existing one.
    ///
    /// Addresses outside executable sections become data candidates unless the
    /// evidence is trusted. Returns `None` when the address is already taken by
    /// a jump table or XFG hash.
    pub(crate) fn add_candidate(
        &mut self,
        address: u64,
        found_by: FoundBy,
        trust: TrustLevel,
    ) -> Result<Option<&mut Candidate>> {
        let is_data = match self.data.get(&address) {
            Some(DataItem::Candidate(_)) => true,
            Some(_) => return Ok(None),
            None => false,
        };

        if is_data && trust != TrustLevel::Trusted {
            let candidate = self.data.get_mut(&address).and_then(DataItem::candidate_mut);
            return Ok(candidate.map(|candidate| {
                candidate.found_by |= found_by;
                candidate.trust = candidate.trust.max(trust);
                candidate
            }));
        }

        let section = self.image.section_index(address);

        if !is_data
            && !self.candidates.contains_key(&address)
            && trust != TrustLevel::Trusted
            && !self.image.is_executable_or_unmapped(address)
        {
            let candidate = Candidate::new(address, found_by, trust, section);
            let item = self.data.entry(address).or_insert(DataItem::Candidate(candidate));
            return Ok(item.candidate_mut());
        }

        if self.imports.contains(&address) {
            return Err(AnalysisError::ImportIsFunctionCandidate { address });
        }

        // Trusted evidence reclaims a data candidate as code.
        let reclaimed = match is_data.then(|| self.data.remove(&address)).flatten() {
            Some(DataItem::Candidate(candidate)) => Some(candidate),
            _ => None,
        };

        let candidate = match self.candidates.entry(address) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                reclaimed.unwrap_or_else(|| Candidate::new(address, FoundBy::empty(), trust, section)),
            ),
        };
        candidate.found_by |= found_by;
        candidate.trust = candidate.trust.max(trust);
        let priority = candidate.priority();

        // Queues cannot update keys in place.
        self.scheduler.reprioritize(address, priority);
        Ok(self.candidates.get_mut(&address))
    }

    /// File a non-code item, OR'ing into an existing data candidate.
    pub(crate) fn add_data_candidate(&mut self, address: u64, found_by: FoundBy, trust: TrustLevel) {
        let section = self.image.section_index(address);
        match self.data.get_mut(&address) {
            Some(DataItem::Candidate(candidate)) => {
                candidate.found_by |= found_by;
                candidate.trust = candidate.trust.max(trust);
            }
            Some(_) => {}
            None => {
                self.data.insert(
                    address,
                    DataItem::Candidate(Candidate::new(address, found_by, trust, section)),
                );
            }
        }
    }

    /// Register the target of a call or jump seen in committed code.
    pub(crate) fn add_jump_or_call(
        &mut self,
        target: u64,
        found_by: FoundBy,
        trust: TrustLevel,
        caller: u64,
    ) -> Result<()> {
        if self.ignored.contains(&target) || !self.image.contains(target) {
            return Ok(());
        }

        if self.data.contains_key(&target) || !self.image.is_executable_or_unmapped(target) {
            self.add_data_candidate(target, found_by, TrustLevel::Untrusted);
            return Ok(());
        }

        self.scheduler.remove(target);
        let Some(candidate) = self.add_candidate(target, found_by, trust)? else {
            return Ok(());
        };
        candidate.caller.get_or_insert(caller);
        candidate.trust = TrustLevel::Trusted;

        if candidate.result == DiscoveryResult::None {
            let priority = candidate.priority();
            self.scheduler.push_current(target, priority);
        }
        Ok(())
    }

    /// OR call evidence into an existing candidate, moving it up its queue
    /// if it is still waiting.
    ///
    /// External jumps are not added this way: a jump into an unwind-only
    /// fragment must leave it a fragment of its parent.
    fn add_call_evidence(&mut self, target: u64) {
        let Some(candidate) = self.candidates.get_mut(&target) else {
            return;
        };
        if candidate.found_by.contains(FoundBy::CALL) {
            return;
        }
        candidate.found_by |= FoundBy::CALL;
        let priority = candidate.priority();
        trace!(
            target: "fnbound::scheduler",
            addr = format!("0x{:x}", target),
            found_by = ?candidate.found_by,
            "Call evidence"
        );
        self.scheduler.reprioritize(target, priority);
    }

    /// Drain one queue to completion.
    pub(crate) fn drain<P: ProgressReporter>(&mut self, kind: QueueKind, progress: &P) -> Result<()> {
        self.scheduler.set_current(kind);
        progress.initialize(self.scheduler.len(kind) as u64);

        while let Some(address) = self.scheduler.pop(kind) {
            progress.progress();
            self.process_queued(address)?;
        }

        info!(
            target: "fnbound::scheduler",
            queue = ?kind,
            discovered = self.discovered.len(),
            "Queue drained"
        );
        Ok(())
    }

    fn process_queued(&mut self, address: u64) -> Result<()> {
        let Some(candidate) = self.candidates.get_mut(&address) else {
            return Ok(());
        };
        if candidate.result != DiscoveryResult::None {
            return Ok(());
        }
        if self.discovered.contains_key(&address) {
            candidate.result = DiscoveryResult::Skipped;
            trace!(
                target: "fnbound::scheduler",
                addr = format!("0x{:x}", address),
                "Already claimed"
            );
            return Ok(());
        }
        let trust = candidate.trust;

        debug!(
            target: "fnbound::scheduler",
            addr = format!("0x{:x}", address),
            found_by = ?candidate.found_by,
            ?trust,
            "Processing candidate"
        );

        self.resolving.insert(address);
        let outcome = self.disassemble(address);
        self.deferred_seen.clear();

        let outcome = outcome.and_then(|success| {
            if success {
                self.commit_deferred(trust)
            } else {
                Ok(())
            }
        });

        self.deferred.clear();
        self.resolving.remove(&address);
        outcome
    }

    fn commit_deferred(&mut self, trust: TrustLevel) -> Result<()> {
        for item in std::mem::take(&mut self.deferred) {
            let Some(candidate) = self.candidates.get_mut(&item) else {
                continue;
            };
            if candidate.is_call_only() && !self.sources.contains(EvidenceSources::CALLS) {
                continue;
            }
            candidate.trust = trust;
            self.record_new_instructions(item)?;
        }
        Ok(())
    }

    /// Walk a candidate and store the result. Returns whether the walk succeeded.
    pub(crate) fn disassemble(&mut self, address: u64) -> Result<bool> {
        let regions = RegionWalker::new(address, self.max_regions).run(self)?;
        let success = regions.is_success();

        if let Some(error) = regions.error {
            warn!(
                target: "fnbound::scheduler",
                addr = format!("0x{:x}", address),
                %error,
                "Bad function"
            );
        }

        self.code.insert(address, regions);

        let trusted = match self.candidates.get_mut(&address) {
            Some(candidate) => {
                candidate.result = if success {
                    DiscoveryResult::Success
                } else {
                    DiscoveryResult::Failure
                };
                candidate.trust == TrustLevel::Trusted
            }
            None => false,
        };

        if success {
            if trusted {
                self.record_new_instructions(address)?;
            } else {
                self.deferred.push(address);
            }
        }
        Ok(success)
    }

    /// Commit a successful walk: claim its instructions and register every
    /// call and jump target as a candidate.
    pub(crate) fn record_new_instructions(&mut self, address: u64) -> Result<()> {
        let Some(set) = self.code.get(&address) else {
            return Ok(());
        };
        let instructions: Vec<Instruction> = set.instructions().copied().collect();
        let regions: Vec<(u64, u64)> = set.regions.iter().map(|r| (r.start, r.end())).collect();
        let trust = self
            .candidates
            .get(&address)
            .map_or(TrustLevel::Untrusted, |c| c.trust);

        for instruction in instructions {
            let ip = instruction.ip();
            if is_call(&instruction) {
                if let Some(target) = operand_address(&instruction) {
                    self.known_call_targets.insert(target);
                    if self.candidates.contains_key(&target) {
                        self.add_call_evidence(target);
                    } else {
                        self.add_jump_or_call(target, FoundBy::CALL, trust, ip)?;
                    }
                }
            } else if is_jump(&instruction) {
                match operand_address(&instruction) {
                    Some(target) => {
                        self.known_jump_targets.insert(target);
                        let internal = regions.iter().any(|&(s, e)| target >= s && target < e);
                        if !internal && !self.candidates.contains_key(&target) {
                            self.add_jump_or_call(
                                target,
                                FoundBy::EXTERNAL_JMP,
                                TrustLevel::SemiTrusted,
                                ip,
                            )?;
                        }
                    }
                    None => {
                        if let Some(table) = self.jump_tables.get(&ip) {
                            self.known_jump_targets.extend(table.targets.iter().copied());
                        }
                    }
                }
            }
            self.discovered.insert(ip, instruction);
        }
        Ok(())
    }

    /// Queue every unclaimed in-module address mentioned by a non-flow
    /// instruction as an untrusted candidate.
    pub(crate) fn discover_referenced_addresses(&mut self) -> Result<()> {
        let base = self.image.base();
        let found: BTreeSet<u64> = self
            .discovered
            .values()
            .filter(|i| !is_flow(i))
            .flat_map(referenced_values)
            .filter(|&value| {
                value != base
                    && self.image.contains(value)
                    && !self.discovered.contains_key(&value)
                    && !self.data.contains_key(&value)
                    && !self.ignored.contains(&value)
            })
            .collect();

        debug!(
            target: "fnbound::scheduler",
            count = found.len(),
            "Referenced addresses"
        );

        for address in found {
            let executable = self.image.is_executable_or_unmapped(address);
            let Some(candidate) = self.add_candidate(address, FoundBy::RVA, TrustLevel::Untrusted)?
            else {
                continue;
            };
            if executable && candidate.result == DiscoveryResult::None {
                let priority = candidate.priority();
                self.scheduler.push(QueueKind::Untrusted, address, priority);
            }
        }
        Ok(())
    }

    /// Walk an address outside of any queue, dropping whatever the walk
    /// claimed but did not commit.
    pub(crate) fn walk_detached(&mut self, address: u64) -> Result<RegionSet> {
        let result = RegionWalker::new(address, self.max_regions).run(self);
        self.deferred_seen.clear();
        self.deferred.clear();
        result
    }
}
