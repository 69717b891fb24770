//! Fnbound library for recovering function boundaries in PE x86-64 images
//!
//! Candidates are collected from module metadata, walked into code regions,
//! grouped into chunk graphs, split into functions and finally tiled into a
//! classified map of the whole image.

use anyhow::Context;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub mod assembler;
pub mod candidate;
pub mod chunk;
pub mod collector;
pub mod decoder;
pub mod discovery;
pub mod error;
pub mod evidence;
pub mod graph;
pub mod image;
pub mod jump_table;
pub mod pattern;
pub mod pdb_symbols;
pub mod pe_loader;
pub mod progress;
pub mod ranges;
pub mod resolver;
pub mod scheduler;
pub mod splitter;
pub mod walker;

// Re-export key types for convenience
pub use anyhow;
pub use assembler::CodeRegion;
pub use collector::EvidenceSources;
pub use discovery::BadFunction;
pub use error::{AnalysisError, FunctionError};
pub use evidence::ModuleEvidence;
pub use image::Image;
pub use ranges::{MetadataRange, RangeKind};
pub use resolver::NoReturnSet;

// Re-export progress types
pub use progress::{NoOpProgressReporter, ProgressReporter, default_progress_style};

use crate::chunk::ChunkArena;
use crate::discovery::Discovery;
use crate::pe_loader::PeLoader;
use crate::scheduler::QueueKind;

pub const DEFAULT_MAX_REGIONS: usize = 4000;

/// Options for analysis
pub struct AnalysisOptions<P: ProgressReporter = NoOpProgressReporter> {
    pub sources: EvidenceSources,
    pub no_return: Arc<NoReturnSet>,
    pub max_regions: usize,
    pub progress_reporter: P,
}

impl Default for AnalysisOptions<NoOpProgressReporter> {
    fn default() -> Self {
        Self {
            sources: EvidenceSources::default(),
            no_return: Arc::new(NoReturnSet::default()),
            max_regions: DEFAULT_MAX_REGIONS,
            progress_reporter: NoOpProgressReporter,
        }
    }
}

impl<P: ProgressReporter> AnalysisOptions<P> {
    pub fn with_progress_reporter<P2: ProgressReporter>(self, reporter: P2) -> AnalysisOptions<P2> {
        AnalysisOptions {
            sources: self.sources,
            no_return: self.no_return,
            max_regions: self.max_regions,
            progress_reporter: reporter,
        }
    }

    pub fn with_sources(mut self, sources: EvidenceSources) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_no_return(mut self, no_return: Arc<NoReturnSet>) -> Self {
        self.no_return = no_return;
        self
    }

    pub fn with_max_regions(mut self, max_regions: usize) -> Self {
        self.max_regions = max_regions;
        self
    }
}

/// A function as it appears in the final tiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub entry: u64,
    /// `[start, end)` of each code range, entry region first.
    pub regions: Vec<(u64, u64)>,
}

impl FunctionInfo {
    pub fn size(&self) -> u64 {
        self.regions.iter().map(|(start, end)| end - start).sum()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.regions.iter().any(|&(start, end)| (start..end).contains(&address))
    }
}

/// Result of module analysis
pub struct AnalysisResult {
    /// Disjoint, address-ordered ranges covering the whole image.
    pub ranges: Vec<MetadataRange>,
    pub functions: Vec<FunctionInfo>,
    pub bad_functions: Vec<BadFunction>,
}

impl AnalysisResult {
    fn new(ranges: Vec<MetadataRange>, bad_functions: Vec<BadFunction>) -> Self {
        let mut by_entry: BTreeMap<u64, Vec<(u64, u64)>> = BTreeMap::new();
        for region in ranges.iter().filter_map(MetadataRange::as_code) {
            by_entry
                .entry(region.function)
                .or_default()
                .push((region.start, region.end));
        }
        let functions = by_entry
            .into_iter()
            .map(|(entry, mut regions)| {
                // Entry region first, the rest by address.
                regions.sort_by_key(|&(start, _)| (start != entry, start));
                FunctionInfo { entry, regions }
            })
            .collect();

        Self {
            ranges,
            functions,
            bad_functions,
        }
    }

    /// The function owning the code at `address`.
    pub fn function_at(&self, address: u64) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.contains(address))
    }

    /// Code ranges of the function entered at `entry`.
    pub fn code_regions(&self, entry: u64) -> impl Iterator<Item = &CodeRegion> {
        self.ranges
            .iter()
            .filter_map(MetadataRange::as_code)
            .filter(move |region| region.function == entry)
    }

    /// The range holding `address`.
    pub fn range_at(&self, address: u64) -> Option<&MetadataRange> {
        let index = self.ranges.partition_point(|r| r.end() <= address);
        self.ranges.get(index).filter(|r| r.start() <= address)
    }
}

/// Recover every function of `image` from `evidence`.
pub fn analyze<P: ProgressReporter>(
    image: &Image,
    evidence: &ModuleEvidence,
    options: &AnalysisOptions<P>,
) -> error::Result<AnalysisResult> {
    let mut ctx = Discovery::new(
        image,
        evidence,
        &options.no_return,
        options.sources,
        options.max_regions,
    );
    ctx.collect_evidence()?;

    let trusted = options.progress_reporter.sub_progress("Trusted candidates".into());
    ctx.drain(QueueKind::Trusted, &trusted)?;
    trusted.finish();

    if options.sources.contains(EvidenceSources::REFERENCED_ADDRESSES) {
        ctx.discover_referenced_addresses()?;
    }

    let untrusted = options.progress_reporter.sub_progress("Untrusted candidates".into());
    ctx.drain(QueueKind::Untrusted, &untrusted)?;
    untrusted.finish();

    let assembling = options.progress_reporter.sub_progress("Assembling functions".into());
    assembling.initialize(2);
    let mut arena = ChunkArena::build(&ctx);
    let functions = assembler::assemble(&ctx, &mut arena);
    assembling.progress();
    let ranges = ranges::build_ranges(&mut ctx, functions)?;
    assembling.progress();
    assembling.finish();

    let result = AnalysisResult::new(ranges, ctx.bad_functions());
    info!(
        target: "fnbound::analysis",
        functions = result.functions.len(),
        bad_functions = result.bad_functions.len(),
        ranges = result.ranges.len(),
        "Analysis complete"
    );
    Ok(result)
}

/// High-level analyzer for a PE file and its optional PDB
pub struct ModuleAnalyzer {
    pe: PeLoader,
    image: Image,
    evidence: ModuleEvidence,
}

impl ModuleAnalyzer {
    /// Create analyzer for the given executable
    pub fn new<P: AsRef<Path>>(exe_path: P) -> anyhow::Result<Self> {
        Self::load(exe_path.as_ref(), None)
    }

    /// Create analyzer that also takes symbols from a PDB
    pub fn with_pdb<P1, P2>(exe_path: P1, pdb_path: P2) -> anyhow::Result<Self>
    where
        P1: AsRef<Path>,
        P2: AsRef<Path>,
    {
        Self::load(exe_path.as_ref(), Some(pdb_path.as_ref()))
    }

    fn load(exe_path: &Path, pdb_path: Option<&Path>) -> anyhow::Result<Self> {
        let pe = PeLoader::load(exe_path)?;
        let image = pe.image()?;
        let symbols = match pdb_path {
            Some(path) => pdb_symbols::load_symbols(path, pe.image_base())?,
            None => Vec::new(),
        };
        let mut evidence = pe.evidence(&image, symbols)?;
        evidence.pattern_matches = pattern::scan_image(&image, &pattern::default_patterns());
        Ok(Self { pe, image, evidence })
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn evidence(&self) -> &ModuleEvidence {
        &self.evidence
    }

    pub fn pe_loader(&self) -> &PeLoader {
        &self.pe
    }

    /// Analyze with default options
    pub fn analyze(&self) -> anyhow::Result<AnalysisResult> {
        self.analyze_with_options(&AnalysisOptions::default())
    }

    pub fn analyze_with_options<P: ProgressReporter>(
        &self,
        options: &AnalysisOptions<P>,
    ) -> anyhow::Result<AnalysisResult> {
        Ok(analyze(&self.image, &self.evidence, options)?)
    }
}

/// Analyze several executables in parallel. A PDB next to an executable
/// (same stem, `.pdb` extension) is picked up automatically.
pub fn analyze_files<P: ProgressReporter>(
    paths: &[PathBuf],
    options: &AnalysisOptions<P>,
) -> Vec<(PathBuf, anyhow::Result<(ModuleAnalyzer, AnalysisResult)>)> {
    let op = options.progress_reporter.sub_progress("Analyzing executables".into());
    op.initialize(paths.len() as u64);

    let results = paths
        .par_iter()
        .map(|path| {
            let result = (|| {
                let pdb = path.with_extension("pdb");
                let analyzer = if pdb.exists() {
                    ModuleAnalyzer::with_pdb(path, &pdb)
                } else {
                    ModuleAnalyzer::new(path)
                }
                .with_context(|| format!("Failed to load {}", path.display()))?;
                let result = analyzer.analyze_with_options(options)?;
                Ok((analyzer, result))
            })();
            op.progress();
            (path.clone(), result)
        })
        .collect();
    op.finish();
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{Symbol, SymbolKind};
    use crate::image::testing::image_with;

    fn function_symbol(address: u64, name: &str) -> Symbol {
        Symbol {
            address,
            name: name.into(),
            undecorated: None,
            length: 0,
            kind: SymbolKind::Function,
            no_return: false,
        }
    }

    fn assert_tiles(result: &AnalysisResult, end: u64) {
        let mut cursor = 0;
        for range in &result.ranges {
            assert_eq!(range.start(), cursor);
            cursor = range.end();
        }
        assert_eq!(cursor, end);
    }

    #[test]
    fn test_garbage_tail_after_no_return_call() {
        // 0x1000: call 0x1010; int3; <invalid> <invalid>
        // 0x1010: jmp qword ptr [0x8000]
        let image = image_with(
            &[
                (0x1000, &[0xe8, 0x0b, 0x00, 0x00, 0x00, 0xcc, 0x06, 0x06]),
                (0x1010, &[0xff, 0x25, 0xea, 0x6f, 0x00, 0x00]),
            ],
            &[],
        );
        let evidence = ModuleEvidence {
            symbols: vec![function_symbol(0x1000, "main"), function_symbol(0x1010, "exit")],
            ..Default::default()
        };

        let result = analyze(&image, &evidence, &AnalysisOptions::default()).unwrap();
        assert_tiles(&result, 0x9000);
        assert!(result.bad_functions.is_empty());
        assert_eq!(
            result.functions,
            [
                FunctionInfo {
                    entry: 0x1000,
                    regions: vec![(0x1000, 0x1005)],
                },
                FunctionInfo {
                    entry: 0x1010,
                    regions: vec![(0x1010, 0x1016)],
                },
            ]
        );
        let tail = result.range_at(0x1006).unwrap();
        assert_eq!(tail.kind(), RangeKind::Junk);
        assert_eq!(tail.start(), 0x1005);
        assert_eq!(result.function_at(0x1003).map(|f| f.entry), Some(0x1000));
    }

    #[test]
    fn test_callee_found_through_call() {
        // 0x1000: call 0x1010; ret     0x1010: xor eax, eax; ret
        let image = image_with(
            &[
                (0x1000, &[0xe8, 0x0b, 0x00, 0x00, 0x00, 0xc3]),
                (0x1010, &[0x31, 0xc0, 0xc3]),
            ],
            &[],
        );
        let evidence = ModuleEvidence {
            symbols: vec![function_symbol(0x1000, "main")],
            ..Default::default()
        };

        let result = analyze(&image, &evidence, &AnalysisOptions::default()).unwrap();
        assert_tiles(&result, 0x9000);
        let entries: Vec<_> = result.functions.iter().map(|f| f.entry).collect();
        assert_eq!(entries, [0x1000, 0x1010]);
        let caller = result.code_regions(0x1000).next().unwrap();
        assert!(caller.xrefs.iter().any(|x| x.other == 0x1010));
    }

    #[test]
    fn test_disabled_sources_find_nothing() {
        let image = image_with(&[(0x1000, &[0xc3])], &[]);
        let evidence = ModuleEvidence {
            symbols: vec![function_symbol(0x1000, "main")],
            ..Default::default()
        };
        let options = AnalysisOptions::default().with_sources(EvidenceSources::empty());

        let result = analyze(&image, &evidence, &options).unwrap();
        assert!(result.functions.is_empty());
        assert_tiles(&result, 0x9000);
    }
}
