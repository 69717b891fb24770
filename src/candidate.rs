//! Address-keyed discovery evidence.

use bitflags::bitflags;

bitflags! {
    /// Independent sources of evidence that an address starts a function or a data item.
    ///
    /// Bits are ordered by how much they are believed: a higher bit outranks
    /// any combination of lower bits with the same popcount.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
    pub struct FoundBy: u32 {
        const IMPORT = 0x1;
        const RVA = 0x2;
        const XFG_PATTERN = 0x4;
        const PATTERN = 0x8;
        const CONFIG = 0x10;
        const EXTERNAL_JMP = 0x20;
        const CALL = 0x40;
        const EXPORT = 0x80;
        const SYMBOL = 0x100;
        const UNWIND_INFO = 0x200;
        const FHANDLER = 0x400;
        const RUNTIME_FUNCTION = 0x800;
    }
}

bitflags! {
    /// Refines which record of an evidence source produced the candidate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
    pub struct FoundBySubType: u32 {
        const SCOPE_RECORD_BEGIN = 0x1;
        const SCOPE_RECORD_END = 0x2;
        const SCOPE_RECORD_HANDLER = 0x4;
        const SCOPE_RECORD_JUMP_TARGET = 0x8;
        const GUARD_CF_FUNCTION_TABLE = 0x10;
        const GUARD_EH_CONTINUATION_TABLE = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum TrustLevel {
    Untrusted,
    SemiTrusted,
    Trusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum DiscoveryResult {
    #[default]
    None,
    Success,
    Failure,
    /// Another candidate already claimed the address.
    Skipped,
}

/// Queue ordering key: more independent sources first, then raw bit weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority {
    pub sources: u32,
    pub weight: u32,
}

impl From<FoundBy> for Priority {
    fn from(found_by: FoundBy) -> Self {
        Self {
            sources: found_by.bits().count_ones(),
            weight: found_by.bits(),
        }
    }
}

/// Evidence, trust and resolution state for one address.
///
/// Evidence is only ever OR'd in; the record is created once per address.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: u64,
    pub found_by: FoundBy,
    pub sub_type: FoundBySubType,
    pub trust: TrustLevel,
    pub result: DiscoveryResult,
    pub does_return: Option<bool>,
    pub section: Option<usize>,
    /// Index into `ModuleEvidence::symbols`.
    pub symbol: Option<usize>,
    /// Index into `ModuleEvidence::exports`.
    pub export: Option<usize>,
    /// Index into `ModuleEvidence::runtime_functions`.
    pub runtime_function: Option<usize>,
    /// Index into `ModuleEvidence::pattern_matches`.
    pub pattern: Option<usize>,
    /// Address of the instruction that first referenced this candidate.
    pub caller: Option<u64>,
}

impl Candidate {
    pub fn new(address: u64, found_by: FoundBy, trust: TrustLevel, section: Option<usize>) -> Self {
        Self {
            address,
            found_by,
            sub_type: FoundBySubType::empty(),
            trust,
            result: DiscoveryResult::None,
            does_return: None,
            section,
            symbol: None,
            export: None,
            runtime_function: None,
            pattern: None,
            caller: None,
        }
    }

    pub fn priority(&self) -> Priority {
        self.found_by.into()
    }

    /// Only discovered as the target of a call instruction.
    pub fn is_call_only(&self) -> bool {
        self.found_by == FoundBy::CALL
    }

    pub fn has_symbol_or_export(&self) -> bool {
        self.symbol.is_some() || self.export.is_some()
    }
}

/// A non-code item occupying bytes of the image.
#[derive(Debug, Clone)]
pub enum DataItem {
    Candidate(Candidate),
    /// A jump table used by the indirect jump at `jump`.
    JumpTable { jump: u64 },
    /// The 8-byte XFG type hash preceding `function`.
    Xfg { function: u64 },
}

impl DataItem {
    pub fn candidate(&self) -> Option<&Candidate> {
        match self {
            DataItem::Candidate(c) => Some(c),
            _ => None,
        }
    }

    pub fn candidate_mut(&mut self) -> Option<&mut Candidate> {
        match self {
            DataItem::Candidate(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_more_sources_outrank_heavier_bit() {
        let export_call = Priority::from(FoundBy::EXPORT | FoundBy::CALL);
        let runtime_function = Priority::from(FoundBy::RUNTIME_FUNCTION);
        assert!(export_call > runtime_function);
    }

    #[test]
    fn test_equal_sources_break_on_weight() {
        let a = Priority::from(FoundBy::SYMBOL | FoundBy::CALL);
        let b = Priority::from(FoundBy::EXPORT | FoundBy::PATTERN);
        assert_eq!(a.sources, b.sources);
        assert!(a > b);
    }

    #[test]
    fn test_call_only() {
        let mut candidate = Candidate::new(0x1000, FoundBy::CALL, TrustLevel::Untrusted, None);
        assert!(candidate.is_call_only());
        candidate.found_by |= FoundBy::EXPORT;
        assert!(!candidate.is_call_only());
    }
}
