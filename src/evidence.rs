//! Typed records supplied by the container and symbol collaborators.
//!
//! Addresses are absolute virtual addresses unless a field says otherwise.

#[derive(Debug, Clone)]
pub struct Export {
    pub address: u64,
    pub name: Option<String>,
    pub ordinal: u32,
    /// Set when the export forwards to another module; `address` then points
    /// at the forwarder string.
    pub forwarder: Option<String>,
}

/// An import address table slot.
#[derive(Debug, Clone)]
pub struct Import {
    pub address: u64,
    pub module: String,
    pub name: Option<String>,
    pub delay_load: bool,
}

/// One record of a C-specific handler scope table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeRecord {
    pub begin: u64,
    pub end: u64,
    /// Absolute handler address, or the raw filter value 0/1 for
    /// `EXCEPTION_EXECUTE_HANDLER`-style filters.
    pub handler: u64,
    /// Zero when the record has no jump target.
    pub jump_target: u64,
}

impl ScopeRecord {
    pub fn has_handler(&self) -> bool {
        self.handler > 1
    }

    pub fn has_jump_target(&self) -> bool {
        self.jump_target != 0
    }

    /// Code addresses this record links to.
    pub fn targets(&self) -> impl Iterator<Item = u64> + '_ {
        [
            Some(self.begin),
            Some(self.end),
            self.has_handler().then_some(self.handler),
            self.has_jump_target().then_some(self.jump_target),
        ]
        .into_iter()
        .flatten()
    }
}

/// An entry of the exception directory.
#[derive(Debug, Clone)]
pub struct RuntimeFunction {
    pub begin: u64,
    /// Exclusive.
    pub end: u64,
    pub unwind_info: u64,
    /// Language-specific handler registered with `UNW_FLAG_EHANDLER`/`UNW_FLAG_UHANDLER`.
    pub handler: Option<u64>,
    pub scope_records: Vec<ScopeRecord>,
}

impl RuntimeFunction {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GuardFunction {
    pub address: u64,
    pub flags: u8,
}

impl GuardFunction {
    pub const FID_XFG: u8 = 0x08;

    pub fn has_xfg_hash(&self) -> bool {
        self.flags & Self::FID_XFG != 0
    }
}

/// Data items referenced from the load configuration directory.
///
/// Pointer fields hold the virtual address the field refers to, or zero.
#[derive(Debug, Clone, Default)]
pub struct LoadConfig {
    pub security_cookie: u64,
    pub guard_cf_check_function_pointer: u64,
    pub guard_cf_dispatch_function_pointer: u64,
    pub guard_cf_function_table: u64,
    pub guard_eh_continuation_table: u64,
    pub guard_memcpy_function_pointer: u64,
    pub guard_xfg_check_function_pointer: u64,
    pub guard_xfg_dispatch_function_pointer: u64,
    pub guard_xfg_table_dispatch_function_pointer: u64,
    pub guard_flags: u32,
    pub guard_cf_functions: Vec<GuardFunction>,
    pub guard_eh_continuations: Vec<u64>,
}

impl LoadConfig {
    pub fn data_pointers(&self) -> impl Iterator<Item = u64> + '_ {
        [
            self.guard_cf_check_function_pointer,
            self.guard_cf_dispatch_function_pointer,
            self.guard_cf_function_table,
            self.guard_eh_continuation_table,
            self.guard_memcpy_function_pointer,
            self.guard_xfg_check_function_pointer,
            self.guard_xfg_dispatch_function_pointer,
            self.guard_xfg_table_dispatch_function_pointer,
            self.security_cookie,
        ]
        .into_iter()
        .filter(|&address| address != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SymbolKind {
    /// A function symbol.
    Function,
    /// A public symbol flagged as code but not as a function.
    Code,
    Data,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub address: u64,
    pub name: String,
    pub undecorated: Option<String>,
    pub length: u64,
    pub kind: SymbolKind,
    pub no_return: bool,
}

impl Symbol {
    pub fn is_code(&self) -> bool {
        matches!(self.kind, SymbolKind::Function | SymbolKind::Code)
    }
}

#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub address: u64,
    pub pattern: String,
}

/// Everything known about a module before disassembly starts.
#[derive(Debug, Clone, Default)]
pub struct ModuleEvidence {
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub runtime_functions: Vec<RuntimeFunction>,
    pub load_config: Option<LoadConfig>,
    pub symbols: Vec<Symbol>,
    pub pattern_matches: Vec<PatternMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_record_targets_skip_filters() {
        let record = ScopeRecord {
            begin: 0x1000,
            end: 0x1020,
            handler: 1,
            jump_target: 0x1030,
        };
        assert_eq!(record.targets().collect::<Vec<_>>(), [0x1000, 0x1020, 0x1030]);
    }

    #[test]
    fn test_load_config_skips_absent_pointers() {
        let config = LoadConfig {
            security_cookie: 0x8000,
            guard_cf_check_function_pointer: 0x8008,
            ..Default::default()
        };
        assert_eq!(config.data_pointers().collect::<Vec<_>>(), [0x8008, 0x8000]);
    }
}
