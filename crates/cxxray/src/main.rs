//! cxxray - C++ class model reconstruction
//!
//! Usage:
//!   cxxray analyze <snapshot>          Run every pass and print a summary
//!   cxxray analyze <snapshot> --json   Print the full report as JSON
//!   cxxray analyze <snapshot> --types-out types.json
//!                                      Also save the reconstructed layouts
//!   cxxray layout <snapshot> <class>   Print the reconstructed layout of a class
//!   cxxray classes <snapshot>          List the discovered classes

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cxxray_analysis::{
    Abi, AnalysisConfig, AnalysisReport, AnalysisSession, CancellationToken, ProgramSnapshot,
};
use cxxray_core::Architecture;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "cxxray")]
#[command(about = "Reconstructs C++ class models from program snapshots", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run layout synthesis, attribution and dynamic-cast recovery
    Analyze {
        /// Path to the JSON program snapshot
        snapshot: PathBuf,

        #[command(flatten)]
        options: ConfigArgs,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,

        /// Write every reconstructed layout to this JSON file
        #[arg(long)]
        types_out: Option<PathBuf>,
    },
    /// Print the reconstructed layout of one class
    Layout {
        /// Path to the JSON program snapshot
        snapshot: PathBuf,

        /// Class name
        class: String,

        #[command(flatten)]
        options: ConfigArgs,
    },
    /// List the classes found in a snapshot
    Classes {
        /// Path to the JSON program snapshot
        snapshot: PathBuf,

        #[command(flatten)]
        options: ConfigArgs,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON analysis configuration, replacing the one in the snapshot
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// C++ ABI variant (itanium, msvc)
    #[arg(long, env = "CXXRAY_ABI")]
    abi: Option<Abi>,

    /// Target architecture
    #[arg(long, value_enum)]
    arch: Option<ArchArg>,

    /// Pointer size in bytes
    #[arg(long)]
    pointer_size: Option<usize>,

    /// Skip the dynamic-cast pass
    #[arg(long)]
    no_dynamic_cast: bool,

    /// Accept base calls in any order
    #[arg(long)]
    any_order: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ArchArg {
    X86_64,
    X86,
    Arm64,
    Riscv64,
    Mips32,
}

impl From<ArchArg> for Architecture {
    fn from(arch: ArchArg) -> Self {
        match arch {
            ArchArg::X86_64 => Architecture::X86_64,
            ArchArg::X86 => Architecture::X86,
            ArchArg::Arm64 => Architecture::Arm64,
            ArchArg::Riscv64 => Architecture::RiscV64,
            ArchArg::Mips32 => Architecture::Mips32,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Analyze {
            snapshot,
            options,
            json,
            types_out,
        } => {
            let mut session = load_session(&snapshot, &options)?;
            let report = session
                .run(&CancellationToken::new())
                .context("Analysis failed")?;
            if let Some(path) = types_out {
                fs::write(&path, session.model().types().to_json()?)
                    .with_context(|| format!("Failed to write types: {}", path.display()))?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&session, &report);
            }
        }
        Commands::Layout {
            snapshot,
            class,
            options,
        } => {
            let mut session = load_session(&snapshot, &options)?;
            if session.model().by_name(&class).is_none() {
                bail!("Class not found: {}", class);
            }
            session
                .run(&CancellationToken::new())
                .context("Analysis failed")?;
            match session.model().types().format_layout(&class) {
                Some(text) => println!("{}", text),
                None => bail!("No layout could be built for {}", class),
            }
        }
        Commands::Classes { snapshot, options } => {
            let session = load_session(&snapshot, &options)?;
            print_classes(&session);
        }
    }

    Ok(())
}

/// Reads the snapshot and resolves the configuration: an explicit config
/// file replaces the snapshot's own, and flags override both.
fn load_session(path: &Path, options: &ConfigArgs) -> Result<AnalysisSession> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let mut snapshot = ProgramSnapshot::from_json(&text)
        .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

    let mut config: AnalysisConfig = match &options.config {
        Some(config_path) => {
            let text = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config: {}", config_path.display())
            })?;
            serde_json::from_str(&text).with_context(|| {
                format!("Failed to parse config: {}", config_path.display())
            })?
        }
        None => snapshot.config.take().unwrap_or_default(),
    };
    snapshot.config = None;

    if let Some(arch) = options.arch {
        let arch = Architecture::from(arch);
        config.arch = arch;
        config.pointer_size = arch.pointer_size();
    }
    if let Some(abi) = options.abi {
        config.abi = abi;
    }
    if let Some(pointer_size) = options.pointer_size {
        config.pointer_size = pointer_size;
    }
    if options.no_dynamic_cast {
        config.dynamic_cast.enabled = false;
    }
    if options.any_order {
        config.attribution.enforce_order = false;
    }
    debug!(?config, "effective configuration");

    AnalysisSession::from_snapshot(snapshot, config).context("Failed to build class model")
}

fn print_summary(session: &AnalysisSession, report: &AnalysisReport) {
    println!("Classes:             {}", report.classes);
    println!("Layouts built:       {}", report.classes_laid_out);
    println!("Attributed:          {}", report.classes_attributed);
    println!("Rejected:            {}", report.classes_rejected);
    println!("Skipped:             {}", report.classes_skipped);
    println!("Functions committed: {}", report.functions_committed);
    println!("Cast overrides:      {}", report.cast_overrides());
    if report.cancelled {
        println!("(cancelled)");
    }

    for (class, reason) in &report.layout_failures {
        println!("layout failed for {}: {}", class, reason);
    }

    let mut functions: Vec<_> = session.model().attributed_functions().collect();
    functions.sort_by_key(|f| f.function);
    if !functions.is_empty() {
        println!();
        for f in functions {
            let name = session
                .model()
                .get(f.class)
                .map_or("?", |c| c.name.as_str());
            let role = if f.is_destructor { "destructor" } else { "constructor" };
            println!("{:#010x}  {} of {}", f.function, role, name);
        }
    }

    if !session.sink().is_empty() {
        println!();
        for o in session.sink().overrides() {
            println!("{:#010x}  {}", o.call_site, o.prototype.to_c_string());
        }
    }
}

fn print_classes(session: &AnalysisSession) {
    let model = session.model();
    println!("{:<18} {:<24} {:<18} BASES", "ID", "NAME", "VTABLE");
    for class in model.classes() {
        let vtable = class
            .vtable
            .as_ref()
            .map(|v| format!("{:#x}", v.address))
            .unwrap_or_else(|| "-".to_string());
        let bases: Vec<String> = class
            .bases
            .iter()
            .map(|b| {
                let name = model.get(b.class).map_or_else(|| b.class.to_string(), |c| c.name.clone());
                if b.is_virtual() {
                    format!("virtual {}", name)
                } else {
                    name
                }
            })
            .collect();
        println!(
            "{:<18} {:<24} {:<18} {}",
            class.id.to_string(),
            class.name,
            vtable,
            bases.join(", ")
        );
    }
}
