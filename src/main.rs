use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fnbound::chunk::XRef;
use fnbound::progress::{IndicatifProgressBar, TracingProgress};
use fnbound::{
    AnalysisOptions, AnalysisResult, EvidenceSources, MetadataRange, ModuleAnalyzer, ModuleEvidence,
    ProgressReporter, RangeKind, analyze_files,
};
use iced_x86::{Formatter, NasmFormatter};
use indicatif::MultiProgress;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DebugFlag {
    /// Debug candidate scheduling
    Scheduler,
    /// Debug region walking
    Walker,
    /// Debug return resolution
    Resolver,
    /// Debug jump table recovery
    JumpTable,
    /// Debug chunk building
    Chunks,
    /// Debug function splitting
    Splitter,
    /// Debug function assembly
    Assembler,
    /// Debug range tiling and salvage
    Ranges,
    /// Debug PE and PDB loading
    Loader,
    /// Enable all debug output
    All,
}

impl DebugFlag {
    fn targets(self) -> &'static [&'static str] {
        match self {
            DebugFlag::Scheduler => &["fnbound::scheduler"],
            DebugFlag::Walker => &["fnbound::walker"],
            DebugFlag::Resolver => &["fnbound::resolver"],
            DebugFlag::JumpTable => &["fnbound::jump_table"],
            DebugFlag::Chunks => &["fnbound::chunks"],
            DebugFlag::Splitter => &["fnbound::splitter"],
            DebugFlag::Assembler => &["fnbound::assembler"],
            DebugFlag::Ranges => &["fnbound::ranges"],
            DebugFlag::Loader => &["fnbound::pe", "fnbound::pdb"],
            DebugFlag::All => &["fnbound"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Plain text output
    Text,
    /// JSON output
    Json,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug flags
    #[arg(short = 'D', long, value_enum, global = true)]
    debug: Vec<DebugFlag>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Analyze(CommandAnalyze),
    Function(CommandFunction),
    Ranges(CommandRanges),
}

/// Evidence sources and symbol input shared by all commands
#[derive(Args)]
struct SourceArgs {
    /// PDB file providing symbols (defaults to a .pdb next to the executable)
    #[arg(long)]
    pdb: Option<PathBuf>,

    /// Ignore the export directory
    #[arg(long)]
    no_exports: bool,

    /// Ignore unwind data from the exception directory
    #[arg(long)]
    no_unwind: bool,

    /// Ignore PDB symbols
    #[arg(long)]
    no_symbols: bool,

    /// Skip prologue pattern matching
    #[arg(long)]
    no_patterns: bool,

    /// Drop functions known only from call targets
    #[arg(long)]
    no_calls: bool,

    /// Ignore the CFG function table
    #[arg(long)]
    no_guard_cf: bool,

    /// Ignore the EH continuation table
    #[arg(long)]
    no_guard_eh: bool,

    /// Skip scanning code for referenced addresses
    #[arg(long)]
    no_rva: bool,
}

impl SourceArgs {
    fn evidence_sources(&self) -> EvidenceSources {
        let mut sources = EvidenceSources::all();
        for (disabled, flag) in [
            (self.no_exports, EvidenceSources::EXPORTS),
            (self.no_unwind, EvidenceSources::UNWIND_DATA),
            (self.no_symbols, EvidenceSources::SYMBOLS),
            (self.no_patterns, EvidenceSources::PATTERNS),
            (self.no_calls, EvidenceSources::CALLS),
            (self.no_guard_cf, EvidenceSources::GUARD_CF_FUNCTION_TABLE),
            (self.no_guard_eh, EvidenceSources::GUARD_EH_CONTINUATION_TABLE),
            (self.no_rva, EvidenceSources::REFERENCED_ADDRESSES),
        ] {
            sources.set(flag, !disabled);
        }
        sources
    }

    fn load(&self, file: &Path) -> Result<ModuleAnalyzer> {
        match &self.pdb {
            Some(pdb) => ModuleAnalyzer::with_pdb(file, pdb),
            None => {
                let sibling = file.with_extension("pdb");
                if sibling.exists() {
                    ModuleAnalyzer::with_pdb(file, sibling)
                } else {
                    ModuleAnalyzer::new(file)
                }
            }
        }
    }
}

/// Recover all functions of one or more PE files
#[derive(Parser)]
struct CommandAnalyze {
    /// Paths to PE files
    #[arg(required = true, num_args = 1..)]
    files: Vec<PathBuf>,

    #[command(flatten)]
    sources: SourceArgs,

    /// Output format
    #[arg(short = 'o', long, default_value_t = OutputFormat::Text, value_enum)]
    format: OutputFormat,
}

/// Show the regions, instructions and xrefs of one function
#[derive(Parser)]
struct CommandFunction {
    /// Path to the PE file
    file: PathBuf,

    /// Virtual address inside the function
    #[arg(value_parser = parse_hex)]
    address: u64,

    #[command(flatten)]
    sources: SourceArgs,
}

/// Print the classified tiling of the whole image
#[derive(Parser)]
struct CommandRanges {
    /// Path to the PE file
    file: PathBuf,

    #[command(flatten)]
    sources: SourceArgs,

    /// Output format
    #[arg(short = 'o', long, default_value_t = OutputFormat::Text, value_enum)]
    format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct FunctionSummary {
    address: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    regions: Vec<[String; 2]>,
}

#[derive(Debug, Serialize)]
struct BadFunctionSummary {
    address: String,
    error: fnbound::FunctionError,
    regions: Vec<[String; 2]>,
}

#[derive(Debug, Serialize)]
struct ModuleReport {
    file: String,
    functions: Vec<FunctionSummary>,
    bad_functions: Vec<BadFunctionSummary>,
    ranges: BTreeMap<String, RangeTotals>,
}

#[derive(Debug, Default, Serialize)]
struct RangeTotals {
    count: usize,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct RangeEntry {
    start: String,
    end: String,
    kind: RangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<String>,
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn hex(value: u64) -> String {
    format!("0x{value:x}")
}

fn hex_span((start, end): (u64, u64)) -> [String; 2] {
    [hex(start), hex(end)]
}

fn init_tracing(flags: &[DebugFlag]) -> Result<()> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    for target in flags.iter().flat_map(|f| f.targets()) {
        filter = filter.add_directive(format!("{target}=debug").parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.debug)?;

    match cli.command {
        Commands::Analyze(cmd) => command_analyze(cmd),
        Commands::Function(cmd) => command_function(cmd),
        Commands::Ranges(cmd) => command_ranges(cmd),
    }
}

/// Symbol and export names by address, symbols first.
fn names(evidence: &ModuleEvidence) -> BTreeMap<u64, String> {
    let mut names = BTreeMap::new();
    for symbol in &evidence.symbols {
        let name = symbol.undecorated.as_ref().unwrap_or(&symbol.name);
        if !name.is_empty() {
            names.entry(symbol.address).or_insert_with(|| name.clone());
        }
    }
    for export in &evidence.exports {
        if let Some(name) = &export.name {
            names.entry(export.address).or_insert_with(|| name.clone());
        }
    }
    names
}

fn report(file: &Path, evidence: &ModuleEvidence, result: &AnalysisResult) -> ModuleReport {
    let names = names(evidence);
    let mut ranges: BTreeMap<String, RangeTotals> = BTreeMap::new();
    for range in &result.ranges {
        let totals = ranges.entry(format!("{:?}", range.kind())).or_default();
        totals.count += 1;
        totals.bytes += range.end() - range.start();
    }

    ModuleReport {
        file: file.display().to_string(),
        functions: result
            .functions
            .iter()
            .map(|f| FunctionSummary {
                address: hex(f.entry),
                size: f.size(),
                name: names.get(&f.entry).cloned(),
                regions: f.regions.iter().copied().map(hex_span).collect(),
            })
            .collect(),
        bad_functions: result
            .bad_functions
            .iter()
            .map(|b| BadFunctionSummary {
                address: hex(b.address),
                error: b.error,
                regions: b.regions.iter().copied().map(hex_span).collect(),
            })
            .collect(),
        ranges,
    }
}

fn print_report(report: &ModuleReport) {
    println!(
        "{}: {} functions, {} bad functions",
        report.file,
        report.functions.len(),
        report.bad_functions.len()
    );
    for function in &report.functions {
        println!(
            "  {} size 0x{:x} regions {}{}",
            function.address,
            function.size,
            function.regions.len(),
            function
                .name
                .as_ref()
                .map(|n| format!(" {n}"))
                .unwrap_or_default()
        );
    }
    for bad in &report.bad_functions {
        println!("  bad {} ({}) regions {}", bad.address, bad.error, bad.regions.len());
    }
    for (kind, totals) in &report.ranges {
        println!("  {kind:<10} {:>8} ranges 0x{:x} bytes", totals.count, totals.bytes);
    }
}

fn command_analyze(cmd: CommandAnalyze) -> Result<()> {
    let options = AnalysisOptions::default().with_sources(cmd.sources.evidence_sources());
    if std::io::stderr().is_terminal() {
        let multi_progress = MultiProgress::new();
        let reporter = IndicatifProgressBar::new("fnbound", Some(multi_progress.clone()));
        let result = run_analyze(&cmd, &options.with_progress_reporter(reporter));
        multi_progress.clear()?;
        result
    } else {
        run_analyze(&cmd, &options.with_progress_reporter(TracingProgress::new("fnbound")))
    }
}

fn run_analyze<P: ProgressReporter>(cmd: &CommandAnalyze, options: &AnalysisOptions<P>) -> Result<()> {
    let mut reports = Vec::new();
    let mut failed = 0;

    if cmd.files.len() == 1 {
        let file = &cmd.files[0];
        let analyzer = cmd.sources.load(file)?;
        let result = analyzer.analyze_with_options(options)?;
        reports.push(report(file, analyzer.evidence(), &result));
    } else {
        if cmd.sources.pdb.is_some() {
            bail!("--pdb can only be used with a single file");
        }
        for (file, result) in analyze_files(&cmd.files, options) {
            match result {
                Ok((analyzer, result)) => reports.push(report(&file, analyzer.evidence(), &result)),
                Err(e) => {
                    eprintln!("Error processing {}: {:#}", file.display(), e);
                    failed += 1;
                }
            }
        }
    }

    match cmd.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Text => {
            for report in &reports {
                print_report(report);
            }
            if cmd.files.len() > 1 {
                println!("\nSummary:");
                println!("========");
                println!("Executables processed: {} succeeded, {failed} failed", reports.len());
            }
        }
    }
    Ok(())
}

fn command_function(CommandFunction { file, address, sources }: CommandFunction) -> Result<()> {
    let analyzer = sources.load(&file)?;
    let options = AnalysisOptions::default().with_sources(sources.evidence_sources());
    let result = analyzer.analyze_with_options(&options)?;

    let Some(function) = result.function_at(address) else {
        if let Some(bad) = result.bad_functions.iter().find(|b| b.address == address) {
            bail!("Function at 0x{address:x} failed: {}", bad.error);
        }
        bail!("No function contains 0x{address:x}");
    };

    let names = names(analyzer.evidence());
    println!(
        "Function at 0x{:x}{} (0x{:x} bytes):",
        function.entry,
        names.get(&function.entry).map(|n| format!(" {n}")).unwrap_or_default(),
        function.size()
    );

    let mut formatter = NasmFormatter::new();
    let mut text = String::new();
    for region in result.code_regions(function.entry) {
        println!("region 0x{:x}..0x{:x}", region.start, region.end);
        for instruction in &region.instructions {
            text.clear();
            formatter.format(instruction, &mut text);
            println!("  {:016x}  {text}", instruction.ip());
            for xref in region.xrefs.iter().filter(|x| x.instruction == instruction.ip()) {
                print_xref(xref);
            }
        }
    }
    Ok(())
}

fn print_xref(xref: &XRef) {
    println!("      {:?} {:?} 0x{:x}", xref.kind, xref.direction, xref.other);
}

fn command_ranges(CommandRanges { file, sources, format }: CommandRanges) -> Result<()> {
    let analyzer = sources.load(&file)?;
    let options = AnalysisOptions::default().with_sources(sources.evidence_sources());
    let result = analyzer.analyze_with_options(&options)?;

    let entries: Vec<RangeEntry> = result
        .ranges
        .iter()
        .map(|range| RangeEntry {
            start: hex(range.start()),
            end: hex(range.end()),
            kind: range.kind(),
            function: range.as_code().map(|r| hex(r.function)),
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => {
            for (range, entry) in result.ranges.iter().zip(&entries) {
                print!("{:>18} {:>18} {:?}", entry.start, entry.end, entry.kind);
                match range {
                    MetadataRange::Code(region) => print!(" function 0x{:x}", region.function),
                    MetadataRange::JumpTable { jump, .. } => print!(" jump 0x{jump:x}"),
                    MetadataRange::Xfg { function, .. } => print!(" function 0x{function:x}"),
                    _ => {}
                }
                println!();
            }
        }
    }
    Ok(())
}
