//! CLI argument parsing for calltrace

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "calltrace")]
#[command(version)]
#[command(about = "Inspect function-call trace stores", long_about = None)]
pub struct Cli {
    /// Trace-store root directory (overrides the config file and CALLTRACE_ROOT)
    #[arg(short, long, value_name = "DIR", global = true)]
    pub root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage stored logs
    #[command(subcommand)]
    Log(LogCommand),
}

#[derive(Subcommand, Debug)]
pub enum LogCommand {
    /// List every log with its status
    Ls,
    /// Show metadata and segment index of a log
    Info {
        /// Log ID (32 hex characters)
        id: String,
    },
    /// Print the records of a log
    Cat(CatArgs),
    /// Delete a log and all of its files
    Rm {
        /// Log ID (32 hex characters)
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct CatArgs {
    /// Log ID (32 hex characters)
    pub id: String,

    /// Only raw events stamped at or after this time (nanoseconds)
    #[arg(long, value_name = "NS")]
    pub start: Option<i64>,

    /// Only raw events stamped at or before this time (nanoseconds)
    #[arg(long, value_name = "NS")]
    pub end: Option<i64>,

    /// Print reconstructed call records instead of raw events
    #[arg(long, conflicts_with = "goroutines")]
    pub calls: bool,

    /// Print goroutine records instead of raw events
    #[arg(long)]
    pub goroutines: bool,

    /// Resolve frames through the symbol table
    #[arg(short, long)]
    pub symbols: bool,
}
