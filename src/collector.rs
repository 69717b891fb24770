//! Seeds the discovery context from module metadata.

use crate::candidate::{DataItem, FoundBy, FoundBySubType, TrustLevel};
use crate::discovery::Discovery;
use crate::error::Result;
use crate::evidence::SymbolKind;
use crate::scheduler::QueueKind;
use bitflags::bitflags;
use tracing::{debug, info};

bitflags! {
    /// Which evidence sources are consulted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EvidenceSources: u32 {
        const EXPORTS = 0x01;
        const UNWIND_DATA = 0x02;
        const SYMBOLS = 0x04;
        const PATTERNS = 0x08;
        const CALLS = 0x10;
        const GUARD_CF_FUNCTION_TABLE = 0x20;
        const GUARD_EH_CONTINUATION_TABLE = 0x40;
        const REFERENCED_ADDRESSES = 0x80;
    }
}

impl Default for EvidenceSources {
    fn default() -> Self {
        Self::all()
    }
}

/// Size of the XFG type hash stored in front of a guarded function.
const XFG_HASH_SIZE: u64 = 8;

impl Discovery<'_> {
    /// Run every enabled collection pass, then queue all function candidates.
    pub fn collect_evidence(&mut self) -> Result<()> {
        self.collect_imports();
        self.collect_load_config()?;
        if self.sources.contains(EvidenceSources::EXPORTS) {
            self.collect_exports()?;
        }
        if self.sources.contains(EvidenceSources::UNWIND_DATA) {
            self.collect_unwind_data()?;
        }
        self.collect_symbols()?;
        if self.sources.contains(EvidenceSources::PATTERNS) {
            self.collect_patterns()?;
        }

        let mut queued = 0usize;
        let mut pending: Vec<_> = self
            .candidates
            .values()
            .map(|c| (c.address, c.priority(), QueueKind::for_trust(c.trust)))
            .collect();
        pending.sort_by_key(|&(address, ..)| address);
        for (address, priority, kind) in pending {
            self.scheduler.push(kind, address, priority);
            queued += 1;
        }

        info!(
            target: "fnbound::scheduler",
            candidates = queued,
            trusted = self.scheduler.len(QueueKind::Trusted),
            untrusted = self.scheduler.len(QueueKind::Untrusted),
            data = self.data.len(),
            "Collected evidence"
        );
        Ok(())
    }

    fn collect_imports(&mut self) {
        let evidence = self.evidence;
        for import in &evidence.imports {
            self.ignored.insert(import.address);
            self.imports.insert(import.address);
            if let Some(DataItem::Candidate(candidate)) = self.data.get_mut(&import.address) {
                candidate.found_by |= FoundBy::IMPORT;
            }
        }
    }

    fn collect_load_config(&mut self) -> Result<()> {
        let evidence = self.evidence;
        let Some(config) = &evidence.load_config else {
            return Ok(());
        };

        for pointer in config.data_pointers() {
            self.add_data_candidate(pointer, FoundBy::CONFIG, TrustLevel::Trusted);
            self.ignored.insert(pointer);
        }

        if self.sources.contains(EvidenceSources::GUARD_CF_FUNCTION_TABLE) {
            for function in &config.guard_cf_functions {
                if self.ignored.contains(&function.address) {
                    continue;
                }
                if let Some(candidate) =
                    self.add_candidate(function.address, FoundBy::CONFIG, TrustLevel::Trusted)?
                {
                    candidate.sub_type |= FoundBySubType::GUARD_CF_FUNCTION_TABLE;
                }
                if function.has_xfg_hash() {
                    let hash = function.address.wrapping_sub(XFG_HASH_SIZE);
                    self.data.entry(hash).or_insert(DataItem::Xfg {
                        function: function.address,
                    });
                }
            }
        }

        if self.sources.contains(EvidenceSources::GUARD_EH_CONTINUATION_TABLE) {
            for &address in &config.guard_eh_continuations {
                if self.ignored.contains(&address) {
                    continue;
                }
                if let Some(candidate) =
                    self.add_candidate(address, FoundBy::CONFIG, TrustLevel::Trusted)?
                {
                    candidate.sub_type |= FoundBySubType::GUARD_EH_CONTINUATION_TABLE;
                }
            }
        }
        Ok(())
    }

    fn collect_exports(&mut self) -> Result<()> {
        let evidence = self.evidence;
        for (index, export) in evidence.exports.iter().enumerate() {
            if export.forwarder.is_some() {
                self.ignored.insert(export.address);
                continue;
            }
            if self.ignored.contains(&export.address) {
                continue;
            }
            if let Some(candidate) =
                self.add_candidate(export.address, FoundBy::EXPORT, TrustLevel::SemiTrusted)?
            {
                candidate.export.get_or_insert(index);
            }
        }
        Ok(())
    }

    fn collect_unwind_data(&mut self) -> Result<()> {
        let evidence = self.evidence;
        for (index, function) in evidence.runtime_functions.iter().enumerate() {
            if let Some(candidate) =
                self.add_candidate(function.begin, FoundBy::RUNTIME_FUNCTION, TrustLevel::Trusted)?
            {
                candidate.runtime_function.get_or_insert(index);
            }

            if let Some(handler) = function.handler.filter(|h| !self.ignored.contains(h)) {
                self.add_candidate(handler, FoundBy::FHANDLER, TrustLevel::Trusted)?;
            }

            for record in &function.scope_records {
                let mut targets = vec![
                    (record.begin, FoundBySubType::SCOPE_RECORD_BEGIN),
                    (record.end, FoundBySubType::SCOPE_RECORD_END),
                ];
                if record.has_handler() {
                    targets.push((record.handler, FoundBySubType::SCOPE_RECORD_HANDLER));
                }
                if record.has_jump_target() {
                    targets.push((record.jump_target, FoundBySubType::SCOPE_RECORD_JUMP_TARGET));
                }

                for (address, sub_type) in targets {
                    self.unwind_map.entry(address).or_default().push(*record);
                    if self.ignored.contains(&address) {
                        continue;
                    }
                    if let Some(candidate) =
                        self.add_candidate(address, FoundBy::UNWIND_INFO, TrustLevel::Trusted)?
                    {
                        candidate.sub_type |= sub_type;
                    }
                }
            }
        }
        debug!(
            target: "fnbound::scheduler",
            runtime_functions = evidence.runtime_functions.len(),
            scope_addresses = self.unwind_map.len(),
            "Collected unwind data"
        );
        Ok(())
    }

    fn collect_symbols(&mut self) -> Result<()> {
        let evidence = self.evidence;
        let mut addresses: Vec<u64> = evidence.symbols.iter().map(|s| s.address).collect();
        addresses.sort_unstable();
        addresses.dedup();
        self.symbol_addresses = addresses;

        if !self.sources.contains(EvidenceSources::SYMBOLS) {
            return Ok(());
        }

        for (index, symbol) in evidence.symbols.iter().enumerate() {
            if self.ignored.contains(&symbol.address) {
                continue;
            }
            match symbol.kind {
                SymbolKind::Function | SymbolKind::Code => {
                    if let Some(candidate) =
                        self.add_candidate(symbol.address, FoundBy::SYMBOL, TrustLevel::Trusted)?
                    {
                        candidate.symbol.get_or_insert(index);
                    }
                }
                SymbolKind::Data => {
                    // Data symbols win over weaker code evidence at the same address.
                    let mut item = self
                        .candidates
                        .remove(&symbol.address)
                        .map(DataItem::Candidate);
                    if let Some(DataItem::Candidate(candidate)) = &mut item {
                        self.scheduler.remove(candidate.address);
                        candidate.found_by |= FoundBy::SYMBOL;
                        candidate.symbol = Some(index);
                    }
                    match item {
                        Some(item) if !self.data.contains_key(&symbol.address) => {
                            self.data.insert(symbol.address, item);
                        }
                        _ => {
                            self.add_data_candidate(
                                symbol.address,
                                FoundBy::SYMBOL,
                                TrustLevel::Trusted,
                            );
                            if let Some(candidate) = self
                                .data
                                .get_mut(&symbol.address)
                                .and_then(DataItem::candidate_mut)
                            {
                                candidate.symbol.get_or_insert(index);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn collect_patterns(&mut self) -> Result<()> {
        let evidence = self.evidence;
        for (index, found) in evidence.pattern_matches.iter().enumerate() {
            if self.ignored.contains(&found.address) {
                continue;
            }
            if let Some(candidate) =
                self.add_candidate(found.address, FoundBy::PATTERN, TrustLevel::Trusted)?
            {
                candidate.pattern.get_or_insert(index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::testing::discovery;
    use crate::evidence::{
        Export, GuardFunction, Import, LoadConfig, ModuleEvidence, RuntimeFunction, ScopeRecord,
        Symbol,
    };
    use crate::image::testing::image_with;
    use crate::resolver::NoReturnSet;

    fn symbol(address: u64, name: &str, kind: SymbolKind) -> Symbol {
        Symbol {
            address,
            name: name.into(),
            undecorated: None,
            length: 8,
            kind,
            no_return: false,
        }
    }

    #[test]
    fn test_sources_combine_into_one_candidate() {
        let image = image_with(&[], &[]);
        let evidence = ModuleEvidence {
            exports: vec![Export {
                address: 0x1000,
                name: Some("Start".into()),
                ordinal: 1,
                forwarder: None,
            }],
            runtime_functions: vec![RuntimeFunction {
                begin: 0x1000,
                end: 0x1010,
                unwind_info: 0x8100,
                handler: None,
                scope_records: Vec::new(),
            }],
            symbols: vec![symbol(0x1000, "Start", SymbolKind::Function)],
            ..Default::default()
        };
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.collect_evidence().unwrap();

        let candidate = ctx.candidate(0x1000).unwrap();
        assert_eq!(
            candidate.found_by,
            FoundBy::EXPORT | FoundBy::RUNTIME_FUNCTION | FoundBy::SYMBOL
        );
        assert_eq!(candidate.trust, TrustLevel::Trusted);
        assert_eq!(candidate.export, Some(0));
        assert_eq!(candidate.runtime_function, Some(0));
        assert_eq!(candidate.symbol, Some(0));
        assert_eq!(ctx.scheduler.len(QueueKind::Trusted), 1);
        assert_eq!(ctx.symbol_addresses, [0x1000]);
    }

    #[test]
    fn test_disabled_sources_are_skipped() {
        let image = image_with(&[], &[]);
        let evidence = ModuleEvidence {
            exports: vec![Export {
                address: 0x1000,
                name: None,
                ordinal: 1,
                forwarder: None,
            }],
            symbols: vec![symbol(0x1100, "helper", SymbolKind::Function)],
            ..Default::default()
        };
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.sources = EvidenceSources::all() - EvidenceSources::EXPORTS - EvidenceSources::SYMBOLS;
        ctx.collect_evidence().unwrap();

        assert!(ctx.candidate(0x1000).is_none());
        assert!(ctx.candidate(0x1100).is_none());
        // Symbols still bound walks even when they are not seeds.
        assert_eq!(ctx.symbol_addresses, [0x1100]);
    }

    #[test]
    fn test_scope_records_feed_unwind_map() {
        let image = image_with(&[], &[]);
        let record = ScopeRecord {
            begin: 0x1004,
            end: 0x1010,
            handler: 1,
            jump_target: 0x1020,
        };
        let evidence = ModuleEvidence {
            runtime_functions: vec![RuntimeFunction {
                begin: 0x1000,
                end: 0x1030,
                unwind_info: 0x8100,
                handler: Some(0x1800),
                scope_records: vec![record],
            }],
            ..Default::default()
        };
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.collect_evidence().unwrap();

        assert_eq!(ctx.candidate(0x1800).unwrap().found_by, FoundBy::FHANDLER);
        let jump = ctx.candidate(0x1020).unwrap();
        assert_eq!(jump.found_by, FoundBy::UNWIND_INFO);
        assert_eq!(jump.sub_type, FoundBySubType::SCOPE_RECORD_JUMP_TARGET);
        // A handler of 1 means "filter result", not an address.
        assert!(ctx.candidate(1).is_none());
        for address in [0x1004, 0x1010, 0x1020] {
            assert_eq!(ctx.unwind_map[&address], [record]);
        }
    }

    #[test]
    fn test_config_and_imports() {
        let image = image_with(&[], &[]);
        let evidence = ModuleEvidence {
            imports: vec![Import {
                address: 0x8100,
                module: "KERNEL32.dll".into(),
                name: Some("ExitProcess".into()),
                delay_load: false,
            }],
            exports: vec![Export {
                address: 0x8100,
                name: Some("Reexported".into()),
                ordinal: 1,
                forwarder: None,
            }],
            load_config: Some(LoadConfig {
                security_cookie: 0x8200,
                guard_cf_functions: vec![GuardFunction {
                    address: 0x1040,
                    flags: GuardFunction::FID_XFG,
                }],
                guard_eh_continuations: vec![0x1080],
                ..Default::default()
            }),
            ..Default::default()
        };
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.collect_evidence().unwrap();

        assert!(ctx.candidate(0x8100).is_none());
        let cookie = ctx.data_items()[&0x8200].candidate().unwrap();
        assert_eq!(cookie.found_by, FoundBy::CONFIG);
        assert!(ctx.ignored.contains(&0x8200));

        let guarded = ctx.candidate(0x1040).unwrap();
        assert_eq!(guarded.sub_type, FoundBySubType::GUARD_CF_FUNCTION_TABLE);
        assert!(matches!(
            ctx.data_items().get(&0x1038),
            Some(DataItem::Xfg { function: 0x1040 })
        ));
        assert_eq!(
            ctx.candidate(0x1080).unwrap().sub_type,
            FoundBySubType::GUARD_EH_CONTINUATION_TABLE
        );
    }

    #[test]
    fn test_data_symbol_demotes_candidate() {
        let image = image_with(&[], &[]);
        let evidence = ModuleEvidence {
            exports: vec![Export {
                address: 0x1200,
                name: Some("g_table".into()),
                ordinal: 1,
                forwarder: None,
            }],
            symbols: vec![symbol(0x1200, "g_table", SymbolKind::Data)],
            ..Default::default()
        };
        let no_return = NoReturnSet::default();
        let mut ctx = discovery(&image, &evidence, &no_return);
        ctx.collect_evidence().unwrap();

        assert!(ctx.candidate(0x1200).is_none());
        let data = ctx.data_items()[&0x1200].candidate().unwrap();
        assert_eq!(data.found_by, FoundBy::EXPORT | FoundBy::SYMBOL);
        assert_eq!(data.symbol, Some(0));
        assert_eq!(ctx.scheduler.len(QueueKind::Trusted), 0);
    }
}
