use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

#[derive(Debug, Clone, Parser)]
#[command(name = "release-impact")]
#[command(about = "Incrementally analyse completion documents for release impact")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Repository root; defaults to the current directory.
    #[arg(long, value_name = "DIR", global = true)]
    pub repo: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true)]
    pub state: Option<PathBuf>,

    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Analyse documents added since the last run and print the result.
    Analyze {
        /// Forget previous results and analyse everything.
        #[arg(long)]
        reset: bool,
    },
    /// Print the persisted analysis state, or `null`.
    State,
    /// Delete the persisted analysis state.
    Reset,
    /// Print the most recent release tag.
    LastRelease,
    /// Print commits and file changes since a reference.
    Changes {
        #[arg(value_name = "REF")]
        reference: String,
    },
}
