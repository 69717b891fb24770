//! Answers "does the function at this address ever return", plus the other
//! questions the region walker asks about the world around it.

use crate::candidate::{DiscoveryResult, FoundBy, TrustLevel};
use crate::decoder::{is_nop, operand_address};
use crate::discovery::Discovery;
use crate::error::Result;
use crate::jump_table;
use crate::walker::RegionPath;
use iced_x86::{FlowControl, Mnemonic};
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

/// Names of functions known to never return to their caller.
const WELL_KNOWN_NO_RETURN: &[&str] = &[
    "exit",
    "xexit",
    "abort",
    "errx",
    "err",
    "std::terminate",
    "std::unexpected",
    "std::_Xlength_error",
    "?terminate@@YAXXZ",
    "?unexpected@@YAXXZ",
    "invoke_watson",
    "invalid_parameter_noinfo_noreturn",
    "longjmp",
    "longjmp_chk",
    "siglongjmp",
    "ExitProcess",
    "ExitThread",
    "assert",
    "wassert",
    "assert_fail",
    "stack_chk_fail",
    "stack_chk_fail_local",
    "stack_smash_handler",
    "report_gsfailure",
    "CxxThrowException",
    "AfxThrowMemoryException",
    "AfxThrowNotSupportedException",
    "AfxThrowInvalidArgException",
    "AfxThrowArchiveException",
    "AfxThrowFileException",
    "AfxThrowOleException",
    "com_raise_error",
    "com_issue_error",
    "StdThrow",
    "Unwind_Resume",
    "Unwind_SjLj_Resume",
    "Unwind_Resume_or_Rethrow",
    "Unwind_SjLj_Resume_or_Rethrow",
    "cxa_end_cleanup",
    "cxa_throw_bad_array_new_length",
    "cxa_bad_cast",
    "cxa_bad_typeid",
    "cxa_call_unexpected",
    "cxa_call_terminate",
    "cxa_deleted_virtual",
    "cxa_pure_virtual",
    "cxa_rethrow",
    "cxa_throw",
    "libc_fatal",
    "pthread_exit",
    "vbaError",
    "vbaErrorOverflow",
    "vbaStopExe",
    "vbaFailedFriend",
    "vbaEnd",
    "vbaFPException",
    "vbaGenerateBoundsError",
    "KeBugCheck",
    "KeBugCheck2",
    "KeBugCheckEx",
    "HalReturnToFirmware",
    "ExRaiseStatus",
    "Leave__4Useri",
    "go_runtime_error",
    "go_panic_msg",
    "std::__throw_logic_error",
    "std::__throw_bad_alloc",
    "std::__throw_bad_cast",
    "std::__throw_length_error",
    "std::__throw_out_of_range",
    "std::__throw_bad_function_call",
    "std::__throw_bad_weak_ptr",
    "std::__throw_system_error",
    "ZSt25__throw_bad_function_callv",
    "ZSt24__throw_out_of_range_fmtPKcz",
    "ZSt19__throw_logic_errorPKc",
    "ZSt17__throw_bad_allocv",
    "ZSt16__throw_bad_castv",
    "cxxabiv1::__cxa_rethrow",
    "cxxabiv1::__cxa_throw",
    "runtime_goexit",
    "runtime_goexit1",
    "assert_func",
    "android_log_assert",
    "CxxThrowException@8",
    "CxxFrameHandler3",
    "crtExitProcess",
    "ExRaiseAccessViolation",
    "ExRaiseDatatypeMisalignment",
    "FreeLibraryAndExitThread",
    "quick_exit",
    "RpcRaiseException",
    "terminate",
];

/// An immutable set of no-return function names, shared by reference.
///
/// Names match exactly or after stripping leading underscores, so `_exit` and
/// `__report_gsfailure` hit `exit` and `report_gsfailure`.
#[derive(Debug, Clone)]
pub struct NoReturnSet {
    names: FxHashSet<String>,
}

impl Default for NoReturnSet {
    fn default() -> Self {
        Self::new(WELL_KNOWN_NO_RETURN.iter().copied())
    }
}

impl NoReturnSet {
    pub fn new<'s>(names: impl IntoIterator<Item = &'s str>) -> Self {
        Self {
            names: names.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            names: FxHashSet::default(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name) || self.names.contains(name.trim_start_matches('_'))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Discovery<'_> {
    /// Whether control comes back from `address`.
    ///
    /// A jump to another known function ends the jumping region, so a jump
    /// reference only counts as returning when the target is known solely
    /// from an unwind entry (likely another piece of the same function) or
    /// is unknown.
    pub fn does_return(&mut self, address: u64, is_jump: bool) -> Result<bool> {
        if !self.resolving.insert(address) {
            return Ok(true);
        }
        let result = self.resolve_return(address, is_jump);
        self.resolving.remove(&address);
        result
    }

    fn resolve_return(&mut self, address: u64, is_jump: bool) -> Result<bool> {
        if let Some(candidate) = self.candidates.get(&address) {
            if is_jump && candidate.found_by != FoundBy::RUNTIME_FUNCTION {
                return Ok(false);
            }
            if let Some(cached) = candidate.does_return {
                return Ok(cached);
            }
        } else if is_jump {
            return Ok(true);
        } else {
            // Speculatively register the callee; its instructions wait for
            // the enclosing top-level item.
            let created = self
                .add_candidate(address, FoundBy::CALL, TrustLevel::Untrusted)?
                .is_some();
            if !created || !self.candidates.contains_key(&address) {
                return Ok(true);
            }
        }

        let result = self.resolve_candidate(address)?;
        if let Some(candidate) = self.candidates.get_mut(&address) {
            candidate.does_return = Some(result);
        }
        trace!(
            target: "fnbound::resolver",
            addr = format!("0x{:x}", address),
            returns = result,
            "Resolved"
        );
        Ok(result)
    }

    fn resolve_candidate(&mut self, address: u64) -> Result<bool> {
        let Some(candidate) = self.candidates.get(&address) else {
            return Ok(true);
        };

        if let Some(symbol) = candidate.symbol.and_then(|i| self.evidence.symbols.get(i)) {
            let named = self.no_return.contains(&symbol.name)
                || symbol
                    .undecorated
                    .as_deref()
                    .is_some_and(|name| self.no_return.contains(name));
            if named || symbol.no_return {
                debug!(
                    target: "fnbound::resolver",
                    symbol = %symbol.name,
                    "Known no-return function"
                );
                return Ok(false);
            }
        }

        if candidate.result == DiscoveryResult::None {
            self.disassemble(address)?;
            self.scheduler.remove(address);
        }

        Ok(self.instructions_return(address))
    }

    /// Judge a walked function by its final instruction.
    fn instructions_return(&self, address: u64) -> bool {
        // Skipped candidates have no code of their own. Calling into the
        // middle of another function is not a call that comes back.
        let Some(code) = self.code.get(&address) else {
            return false;
        };
        if !code.is_success() || code.regions.len() != 1 {
            return true;
        }
        let Some(last) = code.regions[0].last() else {
            return true;
        };

        if last.flow_control() == FlowControl::Interrupt {
            return false;
        }

        match last.mnemonic() {
            Mnemonic::Ret | Mnemonic::Jmp => true,
            // Trailing garbage decoding as a long nop.
            _ if is_nop(last) => false,
            Mnemonic::Call => {
                let Some(target) = operand_address(last) else {
                    return true;
                };
                let next = last.next_ip();
                if self.candidates.contains_key(&next) {
                    return true;
                }
                if !self.discovered.contains_key(&next) && !self.deferred_seen.contains(&next) {
                    return false;
                }
                self.candidates
                    .get(&target)
                    .is_some_and(|c| c.address != address && c.does_return == Some(true))
            }
            _ => true,
        }
    }

    /// Whether the walker may claim `address`.
    pub(crate) fn should_process(&self, address: u64) -> bool {
        !self.discovered.contains_key(&address) && !self.deferred_seen.contains(&address)
    }

    pub(crate) fn claim(&mut self, address: u64) {
        self.deferred_seen.insert(address);
    }

    pub(crate) fn unsee(&mut self, address: u64) {
        self.deferred_seen.remove(&address);
    }

    /// An unwind entry covering a single int3.
    pub(crate) fn is_int3_unwind_block(&self, region_start: u64) -> bool {
        self.candidates
            .get(&region_start)
            .and_then(|c| c.runtime_function)
            .and_then(|i| self.evidence.runtime_functions.get(i))
            .is_some_and(|rf| rf.len() == 1)
    }

    pub(crate) fn allow_size_threshold(&self, function: u64) -> bool {
        self.candidates.get(&function).is_some_and(|c| {
            c.found_by.intersects(
                FoundBy::SYMBOL | FoundBy::EXPORT | FoundBy::UNWIND_INFO | FoundBy::RUNTIME_FUNCTION,
            )
        })
    }

    /// Last address a region starting at `start` may occupy: just before the
    /// next known symbol, else the end of its section or of the image.
    pub(crate) fn region_end_threshold(&self, start: u64) -> u64 {
        let symbols = &self.symbol_addresses;
        let next = symbols.partition_point(|&a| a <= start);
        debug_assert_eq!(
            Some(next).filter(|&i| i < symbols.len()),
            symbols.iter().position(|&a| a > start),
            "binary search disagrees with linear scan"
        );
        if let Some(&symbol) = symbols.get(next) {
            return symbol - 1;
        }

        self.image
            .section_end(start)
            .unwrap_or_else(|| self.image.end())
            - 1
    }

    /// Recover (or reuse) the jump table behind the indirect jump ending `path`.
    pub(crate) fn jump_table(&mut self, function: u64, path: &RegionPath) -> Option<Vec<u64>> {
        let jump = path.root().last()?.ip();
        if let Some(table) = self.jump_tables.get(&jump) {
            return Some(table.targets.clone());
        }

        let table = jump_table::recover(self.image, function, path)?;
        debug!(
            target: "fnbound::jump_table",
            jump = format!("0x{:x}", jump),
            table = format!("0x{:x}", table.address),
            cases = table.targets.len(),
            "Recovered jump table"
        );
        let targets = table.targets.clone();
        self.data
            .insert(table.address, crate::candidate::DataItem::JumpTable { jump });
        self.jump_tables.insert(jump, table);
        Some(targets)
    }
}
