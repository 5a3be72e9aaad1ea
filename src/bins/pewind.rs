use std::path::PathBuf;

use pecoff_unwind::addr::Addr;
use pecoff_unwind::coff::{CoffHeader, OptionalHeader, PeCoff, Section, TextSection};
use pecoff_unwind::disassemble::Disassembly;
use pecoff_unwind::errors::UnwindError;
use pecoff_unwind::evaluator::MAX_CHAIN_DEPTH;
use pecoff_unwind::memory::{BufferMemory, Memory};
use pecoff_unwind::runtime_function::RuntimeFunction;
use pecoff_unwind::snapshot::Snapshot;
use pecoff_unwind::unwind::{unwind, DEFAULT_MAX_FRAMES};
use pecoff_unwind::unwind_info::UnwindInfo;

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
"#
)]
/// pewind - inspect the unwind data of x86-64 PE/COFF images
///
/// Shows headers, the exception table and unwind info of a module, disassembles functions and
/// unwinds captured stack snapshots offline.
struct Args {
    /// The PE/COFF image (exe or dll)
    image: PathBuf,

    #[arg(long, global = true)]
    /// Print machine readable JSON instead of text
    json: bool,

    #[arg(short, long, action = ArgAction::Count, global = true)]
    /// More log output, can be given multiple times
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the image base, the text section and the section table
    Headers,
    /// List the runtime functions of the exception table
    Functions,
    /// Show the runtime function containing an RVA and its unwind info chain
    Lookup {
        #[arg(value_parser = parse_number)]
        rva: u64,
    },
    /// Disassemble the function containing an RVA
    Disasm {
        #[arg(value_parser = parse_number)]
        rva: u64,
    },
    /// Unwind a captured thread snapshot
    Backtrace {
        #[arg(long)]
        /// JSON file with registers and stack memory
        snapshot: PathBuf,
        #[arg(long, value_parser = parse_number)]
        /// Address the module was loaded at, defaults to its image base
        load_address: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_MAX_FRAMES)]
        max_frames: usize,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unwinding Error: {0}")]
    Unwind(#[from] UnwindError),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No runtime function contains rva {0}")]
    NoFunction(Addr),
}

#[derive(Serialize)]
struct HeadersReport<'a> {
    image_base: Addr,
    size_of_image: u64,
    coff_header: &'a CoffHeader,
    optional_header: &'a OptionalHeader,
    text: TextSection,
    sections: &'a [Section],
}

#[derive(Serialize)]
struct LookupReport {
    rva: u64,
    function: RuntimeFunction,
    unwind_infos: Vec<UnwindInfo>,
}

fn main() -> Result<(), CliError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);
    debug!("set up the logger");

    let memory = BufferMemory::from_file(&args.image)?;
    let mut pecoff = PeCoff::parse(memory)?;
    info!("loaded {}", args.image.display());

    match args.command {
        Command::Headers => headers(&pecoff, args.json),
        Command::Functions => functions(&pecoff, args.json),
        Command::Lookup { rva } => lookup(&mut pecoff, rva, args.json),
        Command::Disasm { rva } => disasm(&pecoff, rva, args.json),
        Command::Backtrace {
            snapshot,
            load_address,
            max_frames,
        } => {
            let snapshot = Snapshot::from_json(&std::fs::read_to_string(snapshot)?)?;
            let load_address = load_address.unwrap_or(pecoff.load_bias());
            let backtrace = unwind(
                &mut pecoff,
                snapshot.registers,
                &snapshot.process_memory(),
                load_address,
                max_frames,
            );
            if args.json {
                println!("{}", serde_json::to_string_pretty(&backtrace)?);
            } else {
                println!("{backtrace}");
            }
            Ok(())
        }
    }
}

fn headers(pecoff: &PeCoff<BufferMemory>, json: bool) -> Result<(), CliError> {
    let (text_rva, text_size) = pecoff.text_range();
    if json {
        let report = HeadersReport {
            image_base: pecoff.load_bias().into(),
            size_of_image: pecoff.size_of_image(),
            coff_header: pecoff.coff_header(),
            optional_header: pecoff.optional_header(),
            text: TextSection {
                memory_offset: text_rva,
                memory_size: text_size,
                file_offset: pecoff.text_offset_in_file(),
            },
            sections: pecoff.sections(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("image base     {}", Addr::from(pecoff.load_bias()));
    println!("size of image  {:#x}", pecoff.size_of_image());
    println!(
        "text           rva {text_rva:#x} size {text_size:#x} file offset {:#x}",
        pecoff.text_offset_in_file()
    );
    println!();
    println!(
        "{:<16} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "name", "rva", "vsize", "offset", "size", "flags"
    );
    for s in pecoff.sections() {
        println!(
            "{:<16} {:#010x} {:#010x} {:#010x} {:#010x} {:#010x}",
            s.name, s.vmaddr, s.vmsize, s.offset, s.size, s.flags
        );
    }
    Ok(())
}

fn functions(pecoff: &PeCoff<BufferMemory>, json: bool) -> Result<(), CliError> {
    let functions = pecoff.unwinder().runtime_functions().as_slice();
    if json {
        println!("{}", serde_json::to_string_pretty(functions)?);
        return Ok(());
    }
    println!("{:>10} {:>10} {:>10}", "start", "end", "unwind");
    for f in functions {
        println!(
            "{:#010x} {:#010x} {:#010x}",
            f.start_rva, f.end_rva, f.unwind_info_rva
        );
    }
    println!("{} runtime functions", functions.len());
    Ok(())
}

fn lookup(pecoff: &mut PeCoff<BufferMemory>, rva: u64, json: bool) -> Result<(), CliError> {
    let function = *pecoff
        .unwinder()
        .find_runtime_function(rva)
        .ok_or(CliError::NoFunction(rva.into()))?;

    let mut unwind_infos = Vec::new();
    let mut next = Some(function.unwind_info_rva);
    while let Some(info_rva) = next {
        if unwind_infos.len() > MAX_CHAIN_DEPTH {
            return Err(UnwindError::InvalidCoff("unwind info chain too long").into());
        }
        let info = pecoff.unwinder_mut().unwind_info(info_rva)?.clone();
        next = info
            .has_chained_info()
            .then_some(info.chained_info)
            .flatten()
            .map(|chained| chained.unwind_info_rva);
        unwind_infos.push(info);
    }

    if json {
        let report = LookupReport {
            rva,
            function,
            unwind_infos,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "rva {rva:#x} is in {:#010x}..{:#010x} at offset {:#x}",
        function.start_rva,
        function.end_rva,
        rva - u64::from(function.start_rva)
    );
    for (depth, info) in unwind_infos.iter().enumerate() {
        println!("{:indent$}{info}", "", indent = depth * 2);
        for code in &info.codes {
            println!("{:indent$}  {code:?}", "", indent = depth * 2);
        }
        if let Some(chained) = info.chained_info {
            println!(
                "{:indent$}  chained to {:#010x}..{:#010x}",
                "",
                chained.start_rva,
                chained.end_rva,
                indent = depth * 2
            );
        }
    }
    Ok(())
}

fn disasm(pecoff: &PeCoff<BufferMemory>, rva: u64, json: bool) -> Result<(), CliError> {
    let function = *pecoff
        .unwinder()
        .find_runtime_function(rva)
        .ok_or(CliError::NoFunction(rva.into()))?;
    let start = u64::from(function.start_rva);
    let offset = pecoff
        .map_rva_to_file_offset(start)
        .ok_or(UnwindError::InvalidCoff("function is outside of all sections"))?;
    let size = function.end_rva.saturating_sub(function.start_rva) as usize;
    let code = pecoff.unwinder().file_memory().read_vec(offset, size)?;

    let disassembly = Disassembly::disassemble(&code, start.into(), Some(rva.into()));
    if json {
        println!("{}", serde_json::to_string_pretty(&disassembly)?);
    } else {
        print!("{disassembly}");
    }
    Ok(())
}

/// Accepts decimal numbers and hexadecimal numbers with a `0x` prefix
fn parse_number(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number {text:?}: {e}"))
}

fn setup_logger(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    // construct a subscriber that prints formatted traces to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    // use that subscriber to process traces emitted after this point
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not setup logger: {e}");
    }
}
