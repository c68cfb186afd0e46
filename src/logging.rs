//! Logging setup: stdout in `--debug`, an append-only file in agent
//! mode, with a filter combining the configured level and per-scope
//! WebRTC directives.

use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::errors::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lower")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directives, e.g. `boardwalk=info,webrtc_ice=debug`.
    pub filter: String,
    /// Log sink; stdout when absent.
    pub file: Option<PathBuf>,
}

pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|err| AgentError::Config(format!("bad log filter {:?}: {err}", config.filter)))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    AgentError::Config(format!("open log file {}: {err}", path.display()))
                })?;
            builder.with_ansi(false).with_writer(Arc::new(file)).try_init()
        }
        None => builder.try_init(),
    };
    // A second init (tests, restart paths) keeps the first subscriber.
    let _ = result;
    Ok(())
}
