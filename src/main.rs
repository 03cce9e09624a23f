//! Command-line tools for cross-binary ARMv5 correlation.
//!
//! Three subcommands cover the common workflows: `search` finds
//! individual assembly or data segments in other binaries,
//! `correlate` maps a whole source region chunk by chunk, and `xmap`
//! matches symbols between xMAP-annotated binaries.

use anyhow::{bail, Context, Result};
use arm5_correlate::formatter;
use arm5_correlate::{
    correlate_files, correlate_symbols, search_segments, CorrelateOptions, MappedBinary,
    MaskOptions, SourceSegment, SymbolMatchOptions, SymbolTypes,
};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::path::PathBuf;
use std::process::ExitCode;

/// Correlate ARMv5 code and data across related binaries.
#[derive(Parser, Debug)]
#[command(name = "arm5-correlate")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find ARMv5 assembly or raw data from one binary within others
    Search(SearchArgs),
    /// Correlate a source region against targets chunk by chunk
    Correlate(CorrelateArgs),
    /// Correlate symbols across xMAP-annotated binaries
    Xmap(XmapArgs),
}

/// Output format options.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable report
    Human,
    /// JSON report
    Json,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Assembly instructions from the source to search for
    #[arg(
        short,
        long = "asm",
        num_args = 2,
        value_names = ["OFFSET", "LENGTH"],
        action = ArgAction::Append,
        value_parser = parse_int
    )]
    asm: Vec<usize>,

    /// Raw data from the source to search for
    #[arg(
        short,
        long = "data",
        num_args = 2,
        value_names = ["OFFSET", "LENGTH"],
        action = ArgAction::Append,
        value_parser = parse_int
    )]
    data: Vec<usize>,

    /// Include self-matches from the source file in search results
    #[arg(short = 's', long)]
    include_self_matches: bool,

    /// Allow mismatching offsets on ldr/str instructions
    #[arg(long)]
    ignore_ldr_str_offset: bool,

    /// Allow mismatching offsets on b instructions
    #[arg(long)]
    ignore_b_offset: bool,

    /// Output format
    #[arg(long, default_value = "human")]
    format: OutputFormat,

    /// Verbosity level
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Source binary file to take search segments from
    source: PathBuf,

    /// Target binary files to search (defaults to the source itself)
    targets: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct CorrelateArgs {
    /// Instruction chunk size controlling search granularity
    #[arg(short, long, default_value_t = 8)]
    chunk_size: usize,

    /// Tolerance of extra instructions when merging correlated
    /// segments
    #[arg(short, long, default_value_t = 16)]
    tolerance: usize,

    /// Offset into the source binary to start correlating from
    #[arg(short, long, default_value = "0", value_parser = parse_int)]
    offset: usize,

    /// Length of the source region to correlate (defaults to the rest
    /// of the file)
    #[arg(short, long, value_parser = parse_int)]
    length: Option<usize>,

    /// Require the offset of ldr/str instructions to match exactly
    #[arg(long)]
    strict_ldr_str_offset: bool,

    /// Require the offset of b instructions to match exactly
    #[arg(long)]
    strict_b_offset: bool,

    /// Output format
    #[arg(long, default_value = "human")]
    format: OutputFormat,

    /// Verbosity level
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Source binary file to take search segments from
    source: PathBuf,

    /// Target binary files to search
    #[arg(required = true)]
    targets: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct XmapArgs {
    /// Don't match veneer functions
    #[arg(short = 'V', long)]
    no_veneers: bool,

    /// Ignore data pools when matching function symbols (twice to
    /// keep all matches even when exact ones exist)
    #[arg(short = 'D', long, action = ArgAction::Count)]
    ignore_data_pools: u8,

    /// Ignore length when matching symbols
    #[arg(short = 'L', long)]
    ignore_length: bool,

    /// Allow mismatching offsets on ldr/str instructions
    #[arg(long)]
    ignore_ldr_str_offset: bool,

    /// Allow mismatching offsets on b instructions
    #[arg(long)]
    ignore_b_offset: bool,

    /// Minimum source symbol size in bytes
    #[arg(short = 'l', long, default_value_t = 8)]
    min_length: u32,

    /// Symbol types to match (a = ARM, t = Thumb, d = data)
    #[arg(short = 't', long = "type", default_value = "at")]
    types: String,

    /// Regex for source symbol names (full matches) to ignore
    #[arg(short, long)]
    ignore: Option<String>,

    /// Regex restricting which existing target symbol names (full
    /// matches) can be overridden
    #[arg(short = 'o', long)]
    override_filter: Option<String>,

    /// Shorthand for setting both --ignore and --override-filter
    #[arg(short, long)]
    filter: Option<String>,

    /// Include matches whose target symbol name equals the source name
    #[arg(short = 's', long)]
    include_self: bool,

    /// Output format
    #[arg(long, default_value = "human")]
    format: OutputFormat,

    /// Verbosity level
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Source binary file to take symbols from
    source_bin: PathBuf,

    /// Source xMAP file with known symbols
    source_map: PathBuf,

    /// Section within the source xMAP file to parse
    source_section: String,

    /// Target binary file to search for symbols in
    target_bin: PathBuf,

    /// Target xMAP file with known symbols
    target_map: Option<PathBuf>,

    /// Section within the target xMAP file (defaults to the source
    /// section)
    target_section: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let verbosity = match &cli.command {
        Command::Search(args) => args.verbose,
        Command::Correlate(args) => args.verbose,
        Command::Xmap(args) => args.verbose,
    };
    if verbosity >= 4 {
        tracing_subscriber::fmt()
            .with_env_filter("arm5_correlate=debug")
            .init();
    }

    let result = match cli.command {
        Command::Search(args) => run_search(args),
        Command::Correlate(args) => run_correlate(args),
        Command::Xmap(args) => run_xmap(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Parse an integer with an optional 0x/0o/0b radix prefix.
fn parse_int(value: &str) -> Result<usize, String> {
    let value = value.trim();
    let (digits, radix) = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = value.strip_prefix("0o").or_else(|| value.strip_prefix("0O")) {
        (oct, 8)
    } else if let Some(bin) = value.strip_prefix("0b").or_else(|| value.strip_prefix("0B")) {
        (bin, 2)
    } else {
        (value, 10)
    };
    usize::from_str_radix(digits, radix).map_err(|err| err.to_string())
}

fn display_names(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

fn run_search(args: SearchArgs) -> Result<()> {
    let mut segments = Vec::new();
    for pair in args.asm.chunks(2) {
        segments.push(SourceSegment::asm(pair[0], pair[1])?);
    }
    for pair in args.data.chunks(2) {
        segments.push(SourceSegment::data(pair[0], pair[1])?);
    }

    // With no targets, search the source file itself
    let targets = if args.targets.is_empty() {
        vec![args.source.clone()]
    } else {
        args.targets
    };

    let source = std::fs::read(&args.source)
        .with_context(|| format!("reading {}", args.source.display()))?;
    let mut buffers = Vec::with_capacity(targets.len());
    for target in &targets {
        buffers
            .push(std::fs::read(target).with_context(|| format!("reading {}", target.display()))?);
    }

    let mask = MaskOptions {
        ignore_ldr_str_offset: args.ignore_ldr_str_offset,
        ignore_b_offset: args.ignore_b_offset,
    };
    if args.verbose > 0 {
        for segment in &segments {
            println!("{segment} pattern: {}", segment.pattern(&source, mask)?);
        }
    }
    let mut results = search_segments(&source, &segments, &buffers, mask)?;

    if !args.include_self_matches {
        // The original segment within the source file is a guaranteed
        // match; omit it
        for (segment, segment_matches) in segments.iter().zip(&mut results) {
            for (target, matches) in targets.iter().zip(segment_matches.iter_mut()) {
                if *target == args.source {
                    matches.retain(|found| *found != segment.segment);
                }
            }
        }
    }

    let source_name = args.source.display().to_string();
    let target_names = display_names(&targets);
    match args.format {
        OutputFormat::Human => {
            print!(
                "{}",
                formatter::search_report(&source_name, &segments, &target_names, &results)
            );
        }
        OutputFormat::Json => {
            let dump = formatter::search_dump(&source_name, &segments, &target_names, &results);
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
    }
    Ok(())
}

fn run_correlate(args: CorrelateArgs) -> Result<()> {
    let options = CorrelateOptions {
        chunk_size: args.chunk_size,
        tolerance: args.tolerance,
        mask: MaskOptions {
            ignore_ldr_str_offset: !args.strict_ldr_str_offset,
            ignore_b_offset: !args.strict_b_offset,
        },
    };
    let outcome = correlate_files(&args.source, &args.targets, args.offset, args.length, &options)
        .with_context(|| format!("correlating {}", args.source.display()))?;

    let source_name = args.source.display().to_string();
    let target_names = display_names(&args.targets);
    match args.format {
        OutputFormat::Human => {
            println!("*** SOURCE FILE: {source_name} ***");
            if args.verbose > 0 {
                println!(
                    "{}",
                    formatter::chunk_report(&outcome.chunks, &target_names, args.verbose)
                );
                for (target, merged) in target_names.iter().zip(&outcome.merged) {
                    println!("{}", formatter::merged_report(target, merged, args.verbose));
                }
            }
            println!(
                "{}",
                formatter::selection_report(&outcome.selection, &target_names, args.verbose)
            );
            println!(
                "*** Source coverage: {:.2}% ***",
                formatter::coverage_percent(&outcome.selection, args.offset)
            );
        }
        OutputFormat::Json => {
            let dump = formatter::correlation_dump(
                &source_name,
                &target_names,
                &outcome.selection,
                args.offset,
            );
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
    }
    Ok(())
}

fn run_xmap(args: XmapArgs) -> Result<()> {
    // --filter is shorthand for both name filters
    let ignore = args.ignore.clone().or_else(|| args.filter.clone());
    let override_filter = args.override_filter.clone().or_else(|| args.filter.clone());

    let mut source_types = SymbolTypes::empty();
    for c in args.types.chars() {
        source_types |= match c.to_ascii_lowercase() {
            'a' => SymbolTypes::ARM,
            't' => SymbolTypes::THUMB,
            'd' => SymbolTypes::DATA,
            _ => bail!("unrecognized symbol type '{c}' (valid types: 'a', 't', 'd')"),
        };
    }

    let source =
        MappedBinary::load_with_xmap(&args.source_bin, &args.source_map, &args.source_section)
            .with_context(|| format!("loading {}", args.source_bin.display()))?;
    let target = match &args.target_map {
        Some(map) => {
            let section = args
                .target_section
                .as_deref()
                .unwrap_or(&args.source_section);
            MappedBinary::load_with_xmap(&args.target_bin, map, section)
        }
        None => MappedBinary::load(&args.target_bin),
    }
    .with_context(|| format!("loading {}", args.target_bin.display()))?;
    if args.verbose > 0 {
        println!("Source: {source}");
        println!("Target: {target}");
    }

    let options = SymbolMatchOptions {
        no_veneers: args.no_veneers,
        match_data_pools: args.ignore_data_pools == 0,
        match_length: !args.ignore_length,
        mask: MaskOptions {
            ignore_ldr_str_offset: args.ignore_ldr_str_offset,
            ignore_b_offset: args.ignore_b_offset,
        },
        min_length: args.min_length,
        source_types,
        source_ignore: full_match_regex(ignore.as_deref())?,
        target_filter: full_match_regex(override_filter.as_deref())?,
    };
    let correlations = correlate_symbols(&source, &target, &options)?;

    // Output-level filtering of self-matches and redundant data-pool
    // mismatches
    let mut reported = Vec::new();
    for (symbol, mut matches) in correlations {
        if !args.include_self {
            matches.retain(|found| {
                found
                    .symbol
                    .as_ref()
                    .map_or(true, |existing| existing.name != symbol.name)
            });
            if matches.is_empty() {
                continue;
            }
        }
        if args.ignore_data_pools == 1 {
            // Prefer exact non-self matches when any exist
            let has_exact = matches.iter().any(|found| {
                !found.data_pool_mismatch
                    && found
                        .symbol
                        .as_ref()
                        .map_or(true, |existing| existing.name != symbol.name)
            });
            if has_exact {
                matches.retain(|found| !found.data_pool_mismatch);
            }
        }
        reported.push((symbol, matches));
    }

    match args.format {
        OutputFormat::Human => print!("{}", formatter::symbol_report(&reported)),
        OutputFormat::Json => {
            let dump = formatter::symbol_dump(&reported);
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
    }
    Ok(())
}

/// Compile a user pattern into a full-match regex.
fn full_match_regex(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(&format!("^(?:{p})$")).with_context(|| format!("invalid regex '{p}'"))
        })
        .transpose()
}
