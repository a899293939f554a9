mod common;
mod drain;
mod pipeline;

use batching::BatchError;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;

#[macro_use]
extern crate log;

fn main() -> ExitCode {
    use Commands::*;
    let result = match Cli::parse().command {
        Drain(drain) => drain.invoke(),
        Pipeline(pipeline) => pipeline.invoke(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
#[clap(name = "batch-utils")]
#[clap(version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain a pre-filled, closed queue batch by batch
    Drain(drain::DrainArgs),
    /// Run producer threads against one batching consumer
    Pipeline(pipeline::PipelineArgs),
}

#[derive(Args)]
struct BatchArgs {
    /// Max items per batch.
    #[clap(short, long, default_value_t = 16)]
    max_count: usize,
    /// Log level, may be "off", "trace", "debug", "info", "warn" or "error".
    #[clap(long)]
    log: Option<String>,
}

type Result<T = ()> = std::result::Result<T, BatchError>;
