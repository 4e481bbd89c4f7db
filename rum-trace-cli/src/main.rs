//! RUM Trace Replay CLI
//!
//! Command-line driver for the rum-trace-core library. It replays a recorded
//! page session (listener registrations, events, history calls, timers)
//! against an in-memory host with the agent installed, and writes every
//! finished trace as one JSON document per line.

use anyhow::{Context, Result};
use clap::Parser;
use rum_trace_core::{AgentSettings, JsonLinesTransport};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

mod config;
mod replay;

/// RUM Trace Replay - Reconstruct trace trees from a page session
#[derive(Parser, Debug)]
#[command(name = "rum-trace-cli")]
#[command(about = "Replay a page session through the RUM trace agent", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the scenario file (scenario.toml)
    #[arg(short, long, value_name = "FILE")]
    scenario: PathBuf,

    /// Path to agent settings (settings.toml); defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Output file for finished traces (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("RUM Trace CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using trace core library v{}", rum_trace_core::VERSION);

    log::info!("Loading scenario from: {:?}", args.scenario);
    let scenario = config::load_scenario(&args.scenario)?;
    let settings = match &args.settings {
        Some(path) => {
            log::info!("Loading settings from: {:?}", path);
            config::load_settings(path)?
        }
        None => AgentSettings::default(),
    };

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?,
        )),
        None => Box::new(io::stdout()),
    };

    let replay = replay::Replay::new(&scenario, settings, Box::new(JsonLinesTransport::new(writer)))?;
    let summary = replay.run(&scenario.steps)?;

    log::info!(
        "Replayed {} step(s): {} trace(s) written, agent {}",
        summary.steps,
        summary.traces,
        summary.state
    );

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
