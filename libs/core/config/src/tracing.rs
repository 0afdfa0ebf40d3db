//! Log output for workers
//!
//! [`LogSettings`] picks the output format and filter directives from
//! `APP_ENV`, `LOG_FORMAT` and `RUST_LOG`; [`init_tracing`] installs the
//! subscriber with an `ErrorLayer` so eyre reports carry span traces.

use crate::{ConfigError, Environment};
use std::env;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, prelude::*};

const PRODUCTION_DIRECTIVES: &str = "info,lapin=warn,redis=warn";
const DEVELOPMENT_DIRECTIVES: &str = "debug,job_consumer=trace,lapin=info,redis=info";

/// Install color-eyre for binaries.
///
/// Errors show the source location but not the environment section.
/// Later calls are ignored.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One flattened JSON object per event
    Json,
    /// Multi-line human readable output
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}', expected 'json' or 'pretty'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => f.write_str("json"),
            LogFormat::Pretty => f.write_str("pretty"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub format: LogFormat,
    /// `EnvFilter` directives, e.g. `info,job_consumer=debug`
    pub directives: String,
}

impl LogSettings {
    /// Defaults without reading any variable
    pub fn for_environment(environment: &Environment) -> Self {
        if environment.is_production() {
            Self {
                format: LogFormat::Json,
                directives: PRODUCTION_DIRECTIVES.to_string(),
            }
        } else {
            Self {
                format: LogFormat::Pretty,
                directives: DEVELOPMENT_DIRECTIVES.to_string(),
            }
        }
    }

    /// Environment defaults overridden by `LOG_FORMAT` and `RUST_LOG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] for an unknown format or
    /// directives `EnvFilter` cannot parse.
    pub fn from_env(environment: &Environment) -> Result<Self, ConfigError> {
        let mut settings = Self::for_environment(environment);
        settings.format = crate::env_parse("LOG_FORMAT", settings.format)?;

        if let Ok(directives) = env::var(EnvFilter::DEFAULT_ENV) {
            EnvFilter::try_new(&directives).map_err(|e| ConfigError::ParseError {
                key: EnvFilter::DEFAULT_ENV.to_string(),
                details: e.to_string(),
            })?;
            settings.directives = directives;
        }
        Ok(settings)
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, as happens when
/// several tests initialize logging.
pub fn init_tracing(settings: &LogSettings) -> bool {
    let json = (settings.format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .flatten_event(true)
    });
    let pretty = (settings.format == LogFormat::Pretty).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .pretty()
    });

    let installed = tracing_subscriber::registry()
        .with(json)
        .with(pretty)
        .with(tracing_error::ErrorLayer::default())
        .with(EnvFilter::new(&settings.directives))
        .try_init()
        .is_ok();

    if installed {
        info!(format = %settings.format, filter = %settings.directives, "Logging initialized");
    } else {
        debug!("Subscriber already installed, keeping it");
    }
    installed
}
