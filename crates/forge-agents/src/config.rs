//! Build-core configuration, environment-driven.

use std::path::PathBuf;
use std::time::Duration;

/// Oracle endpoint configuration.
#[derive(Debug, Clone)]
pub struct OracleEndpoint {
    pub url: String,
    pub model: String,
    pub api_key: String,
}

/// Top-level configuration for the agent core.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    /// Oracle endpoint (None disables AI steps and the oracle-assisted
    /// diagnosis fallback).
    pub oracle: Option<OracleEndpoint>,
    /// Validation retries before the build rolls back.
    pub max_retries: u32,
    /// Healing-loop iteration budget.
    pub max_heal_iterations: u32,
    /// Deadline for each child command.
    pub command_timeout: Duration,
    /// Deadline for each oracle call.
    pub oracle_timeout: Duration,
    /// Retries (with exponential backoff) for transient oracle failures.
    pub oracle_max_retries: u32,
    /// Deadline for checkpoint persistence.
    pub checkpoint_timeout: Duration,
    /// Directory for the JSON checkpoint store (None = in-memory only).
    pub checkpoint_dir: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            oracle: Self::oracle_from_env(),
            max_retries: env_parse("FORGE_MAX_RETRIES", 3),
            max_heal_iterations: env_parse("FORGE_MAX_HEAL_ITERATIONS", 5),
            command_timeout: Duration::from_secs(env_parse("FORGE_COMMAND_TIMEOUT_SECS", 120)),
            oracle_timeout: Duration::from_secs(env_parse("FORGE_ORACLE_TIMEOUT_SECS", 120)),
            oracle_max_retries: env_parse("FORGE_ORACLE_MAX_RETRIES", 3),
            checkpoint_timeout: Duration::from_secs(env_parse(
                "FORGE_CHECKPOINT_TIMEOUT_SECS",
                10,
            )),
            checkpoint_dir: std::env::var("FORGE_CHECKPOINT_DIR")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }
}

impl ForgeConfig {
    fn oracle_from_env() -> Option<OracleEndpoint> {
        let url = std::env::var("FORGE_ORACLE_URL").ok()?;
        let api_key = std::env::var("FORGE_ORACLE_API_KEY").unwrap_or_else(|_| "not-needed".into());
        let model =
            std::env::var("FORGE_ORACLE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        Some(OracleEndpoint {
            url,
            model,
            api_key,
        })
    }
}
