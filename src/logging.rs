//! Logging setup shared by the `watch` and `consume` processes.
//!
//! Everything logs through the `log` facade; the binary installs an
//! `env_logger` backend. The effective level is chosen as follows:
//!
//! 1. `RUST_LOG`, when set, is used as is
//! 2. `--quiet` limits output to errors
//! 3. `-v` enables debug output, `-vv` trace output
//! 4. otherwise info
//!
//! The MQTT client logs every packet at debug level. Its output is capped
//! at info unless trace output was requested, so `-v` shows the relay's own
//! decisions rather than keep-alive pings.
//!
//! # Example
//!
//! ```rust,no_run
//! use statusrelay::logging::init_logging;
//!
//! init_logging(1, false);
//! log::debug!("Polling ./input every 1000ms");
//! ```

use std::env;
use std::io::Write;

use env_logger::Builder;
use log::LevelFilter;

/// Crates whose debug output is suppressed below `-vv`.
const NOISY_DEPENDENCIES: [&str; 1] = ["rumqttc"];

/// Install the global logger.
///
/// # Arguments
///
/// * `verbose` - Number of `-v` flags
/// * `quiet` - Whether `--quiet` was given; wins over `verbose`
///
/// A second call keeps the logger installed by the first one.
pub fn init_logging(verbose: u8, quiet: bool) {
    let from_env = env::var("RUST_LOG").ok();
    let level = determine_level(verbose, quiet);

    let mut builder = Builder::new();
    match &from_env {
        Some(spec) => {
            builder.parse_filters(spec);
        }
        None => {
            builder.filter_level(level);
            for name in NOISY_DEPENDENCIES {
                builder.filter_module(name, dependency_level(level));
            }
        }
    }
    configure_format(&mut builder, verbose);

    if builder.try_init().is_err() {
        log::debug!("Logger already installed");
        return;
    }

    match from_env {
        Some(spec) => log::debug!("Log filters taken from RUST_LOG={}", spec),
        None => log::debug!("Log level set to {}", level),
    }
}

fn determine_level(verbose: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

fn dependency_level(level: LevelFilter) -> LevelFilter {
    if level == LevelFilter::Trace {
        LevelFilter::Trace
    } else {
        level.min(LevelFilter::Info)
    }
}

/// Timestamped lines; the module path is added for debug builds and `-v`.
fn configure_format(builder: &mut Builder, verbose: u8) {
    let with_module = cfg!(debug_assertions) || verbose > 0;

    builder.format(move |buf, record| {
        let style = buf.default_level_style(record.level());
        let timestamp = buf.timestamp_millis();

        if with_module {
            writeln!(
                buf,
                "{timestamp} {style}{:<5}{style:#} [{}] {}",
                record.level(),
                record.module_path().unwrap_or("-"),
                record.args()
            )
        } else {
            writeln!(
                buf,
                "{timestamp} {style}{:<5}{style:#} {}",
                record.level(),
                record.args()
            )
        }
    });
}

/// Name of the active maximum level, in lowercase.
#[must_use]
pub fn current_level_name() -> String {
    log::max_level().to_string().to_lowercase()
}
