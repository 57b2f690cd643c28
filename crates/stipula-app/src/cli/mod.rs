use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "stipula",
    version,
    author,
    about = "Stipula contract clause extraction service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            command: None,
            verbose: 0,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the Stipula HTTP server.
    Serve(ServeArgs),
    /// Run the pipeline worker loop.
    Worker(WorkerArgs),
    /// Run the full extraction pipeline against a local PDF file.
    Extract(ExtractArgs),
    /// Inspect and maintain pipeline runs.
    Jobs(JobsArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Override the configured worker concurrency (>= 1).
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// One-shot extraction of a local file through the full pipeline.
#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// PDF document to process.
    #[arg(value_name = "PDF")]
    pub input: PathBuf,
    /// Pretty-print the stored extraction payload to stdout.
    #[arg(long)]
    pub print_result: bool,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommands,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommands {
    /// Print run counts per status.
    Status,
    /// Requeue or fail stale runs now.
    Reap,
}
