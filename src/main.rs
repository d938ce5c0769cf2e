//! Thin command-line front end over the deflatten library.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;

use deflatten::classify::Strategy;
use deflatten::format::OutputFormat;
use deflatten::{parser, Config};

/// Rebuild direct control flow for one flattened AArch64 function.
#[derive(Parser)]
#[command(name = "deflatten", version, about)]
struct Cli {
    /// Path to the CFG JSON exported by the disassembler
    #[arg(short = 's', long = "input")]
    input: PathBuf,

    /// Output path for the patch list
    #[arg(short = 'o', long = "output", default_value = "fix.json")]
    output: PathBuf,

    /// Dispatcher recognition strategy
    #[arg(long, value_enum, default_value_t = Strategy::Smart)]
    strategy: Strategy,

    /// Assume a single dispatcher instead of searching for nested ones
    #[arg(long)]
    single_dispatcher: bool,

    /// Patch list output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("deflatten", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let function = parser::read_function(&cli.input)
        .with_context(|| format!("failed to load CFG from {}", cli.input.display()))?;

    let config = Config {
        single_dispatcher: cli.single_dispatcher,
    };
    let patches = deflatten::deflatten(function, cli.strategy, config)
        .context("deflattening failed; no patches were written")?;

    let rendered = cli.format.get_formatter().format(&patches)?;
    fs::write(&cli.output, rendered)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;

    info!(
        "wrote {} patch records to {}",
        patches.len(),
        cli.output.display()
    );
    Ok(())
}
