// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Autodetect CLI
//!
//! Runs a single anomaly detection job against a worker executable and
//! writes the persisted results as JSON lines.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "autodetect")]
#[command(author, version, about = "Run anomaly detection jobs", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a job, stream input to its worker, then close it
    Run {
        /// Job definition (YAML)
        #[arg(long, value_name = "JOB_FILE")]
        job: PathBuf,

        /// Manager configuration (defaults to ./autodetect.yaml if present)
        #[arg(long, value_name = "CONFIG_FILE")]
        config: Option<PathBuf>,

        /// Newline-delimited JSON input (defaults to stdin)
        #[arg(long, value_name = "INPUT_FILE")]
        input: Option<PathBuf>,

        /// Flush with interim results before closing
        #[arg(long)]
        flush: bool,

        /// Where to write persisted results (defaults to stdout)
        #[arg(long, value_name = "OUTPUT_FILE")]
        output: Option<PathBuf>,
    },

    /// Check a job definition and show the fields its worker reads
    Validate {
        /// Job definition (YAML)
        #[arg(long, value_name = "JOB_FILE")]
        job: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            job,
            config,
            input,
            flush,
            output,
        } => commands::run::run(commands::run::RunArgs {
            job,
            config,
            input,
            flush,
            output,
        }),
        Commands::Validate { job } => commands::validate::run(&job),
    }
}
