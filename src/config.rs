use clap::Parser;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::GovernorError;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "request-governor")]
#[command(about = "Rate limiting, deduplicating and retrying gateway for one upstream API")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Upstream base URL every forwarded path is joined onto
    #[arg(short, long, default_value = "http://localhost:54321")]
    pub upstream: String,

    // JSON file of per-prefix limit overrides
    // Example: {"ndvi": {"max_requests": 60}}
    #[arg(short, long)]
    pub limits: Option<PathBuf>,

    // Inbound requests allowed per API key per window
    #[arg(long, default_value_t = 1000)]
    pub inbound_limit: u32,

    // Inbound window in seconds
    #[arg(long, default_value_t = 3600)]
    pub inbound_window: u64,

    // Idle entry sweep interval in seconds
    #[arg(long, default_value_t = 60)]
    pub sweep_interval: u64,
}

/// Prefix whose config backs every key without a registered prefix.
pub const DEFAULT_PREFIX: &str = "default";

/// Limits applied to every key sharing a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    pub min_interval_ms: u64,
    /// Total attempts made by `execute_with_retry`, first call included.
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
}

impl RateLimitConfig {
    pub const fn new(
        max_requests: u32,
        window_ms: u64,
        min_interval_ms: u64,
        max_retries: u32,
        base_retry_delay_ms: u64,
    ) -> Self {
        Self {
            max_requests,
            window_ms,
            min_interval_ms,
            max_retries,
            base_retry_delay_ms,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    fn merged(mut self, patch: &ConfigPatch) -> Self {
        if let Some(v) = patch.max_requests {
            self.max_requests = v;
        }
        if let Some(v) = patch.window_ms {
            self.window_ms = v;
        }
        if let Some(v) = patch.min_interval_ms {
            self.min_interval_ms = v;
        }
        if let Some(v) = patch.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = patch.base_retry_delay_ms {
            self.base_retry_delay_ms = v;
        }
        self
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(100, 60_000, 100, 3, 1_000)
    }
}

// Built-in limits per API category
const BUILTIN_CONFIGS: [(&str, RateLimitConfig); 5] = [
    (DEFAULT_PREFIX, RateLimitConfig::new(100, 60_000, 100, 3, 1_000)),
    ("ndvi", RateLimitConfig::new(30, 60_000, 500, 3, 2_000)),
    ("soil", RateLimitConfig::new(30, 60_000, 500, 3, 2_000)),
    ("auth", RateLimitConfig::new(10, 60_000, 1_000, 2, 3_000)),
    ("upload", RateLimitConfig::new(20, 60_000, 200, 2, 2_000)),
];

/// Partial config. Unset fields fall back to the `default` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigPatch {
    pub max_requests: Option<u32>,
    pub window_ms: Option<u64>,
    pub min_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_retry_delay_ms: Option<u64>,
}

/// Prefix -> config lookup.
pub struct ConfigRegistry {
    configs: DashMap<String, RateLimitConfig>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        let configs = DashMap::new();
        for (prefix, config) in BUILTIN_CONFIGS {
            configs.insert(prefix.to_string(), config);
        }
        Self { configs }
    }

    /// `"ndvi:health"` -> `"ndvi"`. A key without `:` is its own prefix.
    pub fn prefix_of(key: &str) -> &str {
        key.split(':').next().unwrap_or(key)
    }

    pub fn resolve(&self, key: &str) -> RateLimitConfig {
        self.configs
            .get(Self::prefix_of(key))
            .or_else(|| self.configs.get(DEFAULT_PREFIX))
            .map(|config| *config)
            .unwrap_or_default()
    }

    /// Registers `patch` merged onto the current `default` config.
    ///
    /// Any earlier config for the same prefix is replaced, not patched.
    pub fn set(&self, prefix: &str, patch: &ConfigPatch) -> RateLimitConfig {
        let base = self
            .configs
            .get(DEFAULT_PREFIX)
            .map(|config| *config)
            .unwrap_or_default();
        let config = base.merged(patch);
        self.configs.insert(prefix.to_string(), config);
        config
    }

    /// Applies every prefix in a JSON file of the form `{"prefix": {..patch..}}`.
    pub fn load_overrides(&self, path: &Path) -> Result<usize, GovernorError> {
        let raw = std::fs::read_to_string(path).map_err(|source| GovernorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let patches: HashMap<String, ConfigPatch> =
            serde_json::from_str(&raw).map_err(|source| GovernorError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        // default first so the other prefixes merge onto the overridden base
        if let Some(patch) = patches.get(DEFAULT_PREFIX) {
            self.set(DEFAULT_PREFIX, patch);
        }
        for (prefix, patch) in patches.iter().filter(|(p, _)| p.as_str() != DEFAULT_PREFIX) {
            let config = self.set(prefix, patch);
            info!(prefix = %prefix, ?config, "loaded limit override");
        }
        Ok(patches.len())
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}
