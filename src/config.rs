use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

/// Knobs of the protection layer, loaded from the environment once at
/// startup. Nothing in the cache or limiter reads the environment itself.
pub struct Config {
    pub port: u16,
    pub redis_url: String,

    pub default_ttl_secs: u64,
    pub local_max_entries: usize,
    pub local_tier_enabled: bool,
    pub remote_tier_enabled: bool,

    pub auth_limit: u32,
    pub auth_window_secs: u64,
    pub analysis_limit: u32,
    pub analysis_window_secs: u64,
    pub general_limit: u32,
    pub general_window_secs: u64,

    pub sweep_interval_secs: u64,
    pub retention_secs: u64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("RUST_PORT", "1111"),
            redis_url: try_load("REDIS_URL", "redis://127.0.0.1:6379"),
            default_ttl_secs: try_load("CACHE_DEFAULT_TTL_SECS", "300"),
            local_max_entries: try_load("CACHE_LOCAL_MAX_ENTRIES", "1000"),
            local_tier_enabled: try_load("CACHE_LOCAL_ENABLED", "true"),
            remote_tier_enabled: try_load("CACHE_REMOTE_ENABLED", "true"),
            auth_limit: try_load("AUTH_LIMIT", "10"),
            auth_window_secs: try_load("AUTH_WINDOW_SECS", "60"),
            analysis_limit: try_load("ANALYSIS_LIMIT", "20"),
            analysis_window_secs: try_load("ANALYSIS_WINDOW_SECS", "60"),
            general_limit: try_load("GENERAL_LIMIT", "100"),
            general_window_secs: try_load("GENERAL_WINDOW_SECS", "60"),
            sweep_interval_secs: try_load("SWEEP_INTERVAL_SECS", "300"),
            retention_secs: try_load("RETENTION_SECS", "3600"),
        }
    }
}

#[cfg(test)]
impl Config {
    /// Isolated instance for tests; nothing is read from the environment.
    pub(crate) fn for_tests() -> Self {
        Self {
            port: 0,
            redis_url: String::new(),
            default_ttl_secs: 300,
            local_max_entries: 1000,
            local_tier_enabled: true,
            remote_tier_enabled: true,
            auth_limit: 10,
            auth_window_secs: 60,
            analysis_limit: 20,
            analysis_window_secs: 60,
            general_limit: 100,
            general_window_secs: 60,
            sweep_interval_secs: 300,
            retention_secs: 3600,
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}
