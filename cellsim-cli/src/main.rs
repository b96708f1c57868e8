//! Cellsim CLI - Command-line interface
//!
//! Runs multiplexer experiments and prints their statistics.

mod commands;

use std::path::PathBuf;

use cellsim_core::tracing_setup::{self, DEFAULT_TRACE_FILE, TraceOptions, Verbosity};
use clap::Parser;

#[derive(Parser)]
#[command(name = "cellsim")]
#[command(about = "Slotted discrete-event simulator for cell multiplexers")]
#[command(version)]
struct Cli {
    /// Console verbosity (CELLSIM_LOG overrides it)
    #[arg(long, global = true, value_enum, default_value_t = Verbosity::Warnings)]
    verbosity: Verbosity,

    /// File receiving every scheduling and admission decision
    #[arg(long, global = true, default_value = DEFAULT_TRACE_FILE)]
    trace_file: PathBuf,

    /// Do not write a trace file
    #[arg(long, global = true, conflicts_with = "item_detail")]
    no_trace_file: bool,

    /// Also record every data item in the trace file
    #[arg(long, global = true)]
    item_detail: bool,

    #[command(subcommand)]
    command: commands::Commands,
}

impl Cli {
    fn trace_options(&self) -> TraceOptions {
        let mut options = TraceOptions::console(self.verbosity);
        if !self.no_trace_file {
            options = options.with_trace_file(&self.trace_file);
        }
        if self.item_detail {
            options = options.with_item_detail();
        }
        options
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_setup::install(&cli.trace_options())?;

    commands::handle_command(cli.command)
}
