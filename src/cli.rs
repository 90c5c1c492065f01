//! Command-line interface definitions for StatusRelay.
//!
//! This module defines all CLI arguments, subcommands, and options using the clap derive API.
//! Every option that has a configuration-file counterpart is optional here: when given it
//! overrides the file and the environment, otherwise the layered configuration applies.
//!
//! # Example
//!
//! ```bash
//! # Watch a directory and publish records to the broker
//! statusrelay watch --input-dir /var/spool/instruments
//!
//! # Detect same-size, same-timestamp rewrites too
//! statusrelay watch --input-dir ./input --hash
//!
//! # Persist published records
//! statusrelay consume --database /var/lib/statusrelay/instrument.db
//!
//! # Inspect the stored module states
//! statusrelay modules --json
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Relay instrument module states from snapshot files to a durable store.
///
/// `watch` polls a directory for new or changed snapshots and publishes one
/// record per file; `consume` applies published records to a SQLite store.
#[derive(Debug, Parser)]
#[command(name = "statusrelay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (TOML)
    ///
    /// If not specified, a default platform-specific path is used.
    #[arg(long, value_name = "PATH", global = true, env = "STATUSRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands for StatusRelay.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Poll the input directory and publish a record for each new or changed snapshot
    Watch(WatchArgs),
    /// Apply published records to the module state store
    Consume(ConsumeArgs),
    /// Print the stored module states
    Modules(ModulesArgs),
    /// Write the effective configuration to the config file
    InitConfig(InitConfigArgs),
}

/// Broker overrides shared by `watch` and `consume`.
#[derive(Debug, Default, Args)]
pub struct BrokerArgs {
    /// Broker host name
    #[arg(long, value_name = "HOST")]
    pub broker_host: Option<String>,

    /// Broker port
    #[arg(long, value_name = "PORT")]
    pub broker_port: Option<u16>,

    /// Routing key (topic below the exchange)
    #[arg(long, value_name = "KEY")]
    pub routing_key: Option<String>,
}

/// Arguments for the watch subcommand.
#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Directory containing snapshot files
    #[arg(long, value_name = "DIR")]
    pub input_dir: Option<PathBuf>,

    /// Milliseconds between scans
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_ms: Option<u64>,

    /// Include a content digest in fingerprints (detects same-size rewrites)
    #[arg(long, conflicts_with = "no_hash")]
    pub hash: bool,

    /// Compare size and modification time only
    #[arg(long)]
    pub no_hash: bool,

    /// Glob selecting snapshot files (e.g. "*.xml")
    #[arg(long, value_name = "GLOB")]
    pub pattern: Option<String>,

    /// Maximum files checked concurrently per scan
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub workers: Option<u64>,

    /// Broker overrides
    #[command(flatten)]
    pub broker: BrokerArgs,
}

impl WatchArgs {
    /// The hashing override, if either flag was given.
    #[must_use]
    pub fn use_hash(&self) -> Option<bool> {
        match (self.hash, self.no_hash) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// Arguments for the consume subcommand.
#[derive(Debug, Args)]
pub struct ConsumeArgs {
    /// SQLite database file
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Failed deliveries before a message is dead-lettered (0 = never)
    #[arg(long, value_name = "N")]
    pub max_deliveries: Option<u32>,

    /// Broker overrides
    #[command(flatten)]
    pub broker: BrokerArgs,
}

/// Arguments for the modules subcommand.
#[derive(Debug, Args)]
pub struct ModulesArgs {
    /// SQLite database file
    #[arg(long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Print JSON instead of one line per module
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the init-config subcommand.
#[derive(Debug, Args)]
pub struct InitConfigArgs {
    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
