//! StatusRelay - change detection and reliable delivery of instrument states
//!
//! Two processes share this library:
//!
//! - `watch` polls a directory of snapshot files, detects new or changed
//!   files with a fingerprint cache, turns each into a [`record::StatusRecord`]
//!   and publishes it on a durable channel
//! - `consume` receives records with manual acknowledgement and applies them
//!   idempotently to a SQLite store of module states
//!
//! A file's fingerprint is committed only after the broker confirmed its
//! record, and a delivery is acknowledged only after the store committed it.
//! Delivery is at-least-once; idempotent application makes the effect
//! exactly-once.

pub mod cache;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod scanner;
pub mod signal;
pub mod store;

use std::path::PathBuf;

use anyhow::Context;

use crate::channel::{Consumer, MqttPublisher, MqttSubscription, RecordPublisher};
use crate::cli::{Cli, Commands, InitConfigArgs, ModulesArgs};
use crate::config::Config;
use crate::error::ExitCode;
use crate::pipeline::FileRelay;
use crate::record::RecordProducer;
use crate::scanner::DirectoryPoller;
use crate::signal::ShutdownHandler;
use crate::store::ModuleStateStore;

/// Run the application with parsed CLI arguments.
///
/// # Errors
///
/// Returns fatal startup failures: invalid configuration, an unreachable
/// broker, or a store that cannot be opened.
pub fn run_app(cli: Cli) -> anyhow::Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);
    log::debug!(
        "statusrelay {} starting, log level {}",
        env!("CARGO_PKG_VERSION"),
        logging::current_level_name()
    );

    let config_path = cli.config.clone().or_else(Config::default_path);
    let mut config = match &cli.config {
        Some(path) => Config::try_load_from_path(Some(path))
            .with_context(|| format!("Cannot load configuration from {}", path.display()))?,
        None => Config::load_from_path(config_path.as_deref()),
    };

    match cli.command {
        Commands::Watch(args) => {
            config.merge_watch_args(&args);
            config.validate().context("Invalid configuration")?;
            run_watch(&config)
        }
        Commands::Consume(args) => {
            config.merge_consume_args(&args);
            config.validate().context("Invalid configuration")?;
            run_consume(&config)
        }
        Commands::Modules(args) => run_modules(&config, &args),
        Commands::InitConfig(args) => run_init_config(&config, config_path, &args),
    }
}

fn exit_code_for(shutdown: &ShutdownHandler) -> ExitCode {
    if shutdown.is_shutdown_requested() {
        ExitCode::Interrupted
    } else {
        ExitCode::Success
    }
}

fn run_watch(config: &Config) -> anyhow::Result<ExitCode> {
    let shutdown = signal::install_handler().context("Failed to install signal handler")?;

    let poller = DirectoryPoller::new(config.poller_config(), shutdown.clone())
        .context("Failed to set up the directory poller")?;

    let settings = config.mqtt_settings();
    let sink = MqttPublisher::connect(&settings, shutdown.clone()).with_context(|| {
        format!(
            "Cannot connect to broker at {}:{}",
            settings.host, settings.port
        )
    })?;

    let relay = FileRelay::new(RecordProducer::new(), RecordPublisher::new(sink));
    pipeline::run_watch(&poller, &relay);

    relay.into_publisher().into_sink().close();
    Ok(exit_code_for(&shutdown))
}

fn run_consume(config: &Config) -> anyhow::Result<ExitCode> {
    let shutdown = signal::install_handler().context("Failed to install signal handler")?;

    let store = ModuleStateStore::open(&config.store.database_path).with_context(|| {
        format!(
            "Cannot open module store {}",
            config.store.database_path.display()
        )
    })?;

    let settings = config.mqtt_settings();
    let subscription = MqttSubscription::connect(&settings).with_context(|| {
        format!(
            "Cannot connect to broker at {}:{}",
            settings.host, settings.port
        )
    })?;

    let mut consumer = Consumer::new(subscription, config.redelivery_policy(), shutdown.clone());
    pipeline::run_consume(&mut consumer, &store);

    consumer.into_source().close();
    Ok(exit_code_for(&shutdown))
}

fn run_modules(config: &Config, args: &ModulesArgs) -> anyhow::Result<ExitCode> {
    let path = args
        .database
        .as_deref()
        .unwrap_or(&config.store.database_path);
    let store = ModuleStateStore::open(path)
        .with_context(|| format!("Cannot open module store {}", path.display()))?;
    let modules = store.list().context("Failed to read module states")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&modules)?);
    } else {
        for module in &modules {
            println!(
                "{}\t{}\t{}",
                module.module_id,
                module.state,
                module.updated_at.to_rfc3339()
            );
        }
    }
    Ok(ExitCode::Success)
}

fn run_init_config(
    config: &Config,
    path: Option<PathBuf>,
    args: &InitConfigArgs,
) -> anyhow::Result<ExitCode> {
    let path = path.ok_or(crate::config::ConfigError::NoConfigDir)?;
    if path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    config
        .save(&path)
        .with_context(|| format!("Cannot write configuration to {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::Success)
}
