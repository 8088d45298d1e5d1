//! CLI command definitions for the `cflx` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod definition;
pub mod instance;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use conflux_observe::LogFormat;
use uuid::Uuid;

/// Run and inspect cross-service workflows.
#[derive(Parser)]
#[command(name = "cflx", version, about, long_about = None)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all logging except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format: pretty or json.
    #[arg(long, global = true, default_value = "pretty", env = "CONFLUX_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Filter directive used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => match self.command {
                Commands::Serve { .. } => "info,sqlx=warn",
                _ => "warn",
            },
            1 => "info,conflux_core=debug,conflux_infra=debug,conflux_api=debug,sqlx=warn",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Trigger API server and resume unfinished instances.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Check a definition file without registering it.
    Validate {
        /// Path to a YAML or JSON definition.
        file: PathBuf,
    },

    /// Validate and register a definition as its next version.
    Register {
        /// Path to a YAML or JSON definition.
        file: PathBuf,
    },

    /// List registered definitions.
    Definitions,

    /// Start an instance of a definition.
    Run {
        /// Definition id.
        definition: String,

        /// Definition version (latest if omitted).
        #[arg(long)]
        version: Option<u32>,

        /// Initial context as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Correlation id (defaults to the instance id).
        #[arg(long)]
        correlation_id: Option<String>,

        /// Drive the instance in this process until it finishes.
        #[arg(long)]
        wait: bool,
    },

    /// Show an instance's state, ready steps and execution history.
    Show {
        /// Instance id.
        instance: Uuid,

        /// Also print the raw state log.
        #[arg(long)]
        log: bool,
    },

    /// List workflow instances, newest first.
    #[command(alias = "ls")]
    List {
        /// Only instances that have not finished.
        #[arg(long)]
        active: bool,
    },

    /// Rebuild an instance from its state log and check the log is consistent.
    Replay {
        /// Instance id.
        instance: Uuid,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
