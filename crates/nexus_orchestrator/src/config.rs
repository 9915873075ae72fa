//! Configuration recognized by the core (spec section 6).

use nexus_router::Environment;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NexusConfig {
    /// Below this Jaccard-derived score, synthesis adds a disclosure header.
    pub consensus_threshold: f64,
    /// Cap on fan-out when the caller doesn't ask for fewer.
    pub max_models: usize,
    /// Per-request deadline for the whole fan-out.
    pub timeout: Duration,
    pub environment: Environment,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.75,
            max_models: 5,
            timeout: Duration::from_secs(120),
            environment: Environment::Production,
        }
    }
}

impl NexusConfig {
    /// Load from environment variables, falling back to spec defaults.
    /// `nexus_consensus_threshold`, `nexus_max_models`,
    /// `nexus_timeout_seconds`, `environment`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("NEXUS_CONSENSUS_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                cfg.consensus_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("NEXUS_MAX_MODELS") {
            if let Ok(parsed) = v.parse() {
                cfg.max_models = parsed;
            }
        }
        if let Ok(v) = std::env::var("NEXUS_TIMEOUT_SECONDS") {
            if let Ok(parsed) = v.parse::<u64>() {
                cfg.timeout = Duration::from_secs(parsed);
            }
        }
        if let Ok(v) = std::env::var("ENVIRONMENT") {
            cfg.environment = match v.as_str() {
                "development" => Environment::Development,
                "staging" => Environment::Staging,
                _ => Environment::Production,
            };
        }

        cfg
    }
}
