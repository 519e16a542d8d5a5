//! Logging configuration parsing from environment variables.

/// Observability environment configuration
#[derive(Debug, Clone)]
pub struct ObservabilityEnvConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub log_filter: String,
    pub ansi: bool,
    pub with_target: bool,
}

impl Default for ObservabilityEnvConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            ansi: true,
            with_target: false,
        }
    }
}

impl ObservabilityEnvConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            log_filter: lookup("ALGO_LOG").unwrap_or(defaults.log_filter),
            ansi: lookup("ALGO_LOG_ANSI")
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(defaults.ansi),
            with_target: lookup("ALGO_LOG_TARGET")
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(defaults.with_target),
        }
    }
}
