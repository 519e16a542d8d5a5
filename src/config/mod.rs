//! Configuration module.
//!
//! Structured configuration loading from environment variables (a `.env` file
//! is loaded by the binary first). Command-line flags override these values.

mod observability_config;

pub use observability_config::ObservabilityEnvConfig;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_JOURNAL_PATH: &str = "algo_journal.jsonl";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker threads, one strand each
    pub threads: usize,
    pub journal_path: PathBuf,
    /// Respawn the algos the journal shows as live
    pub restore_on_boot: bool,
    /// First journal sequence replayed at boot
    pub replay_from: u32,
    pub observability: ObservabilityEnvConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            journal_path: PathBuf::from(DEFAULT_JOURNAL_PATH),
            restore_on_boot: true,
            replay_from: 0,
            observability: ObservabilityEnvConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unset keys take defaults;
    /// set but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let threads = parse_or(&lookup, "ALGO_THREADS", defaults.threads)?;
        if threads == 0 {
            anyhow::bail!("ALGO_THREADS must be at least 1");
        }

        Ok(Self {
            threads,
            journal_path: lookup("ALGO_JOURNAL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.journal_path),
            restore_on_boot: parse_or(&lookup, "ALGO_RESTORE_ON_BOOT", defaults.restore_on_boot)?,
            replay_from: parse_or(&lookup, "ALGO_REPLAY_FROM", defaults.replay_from)?,
            observability: ObservabilityEnvConfig::from_lookup(&lookup),
        })
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Failed to parse {}={:?}", key, raw)),
        None => Ok(default),
    }
}
