//! Connection pool tuning knobs, sourced from per-alias
//! `MOLT_DB_<ALIAS>_*` environment variables with defaults.

use std::env;
use std::time::Duration;

/// Tuning knobs for one [`crate::pool::Pool`] instance.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub min_conns: usize,
    pub max_conns: usize,
    pub max_idle: Duration,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub max_wait: Duration,
    pub health_check_interval: Duration,
    pub statement_cache_size: usize,
    pub tls_root_cert_path: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conns: 1,
            max_conns: 8,
            max_idle: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(30),
            max_wait: Duration::from_millis(500),
            health_check_interval: Duration::from_secs(30),
            statement_cache_size: 64,
            tls_root_cert_path: None,
        }
    }
}

impl PoolConfig {
    /// Builds a config from `MOLT_DB_<ALIAS>_*` env vars, falling back to
    /// [`PoolConfig::default`] for anything unset. `alias` is upper-cased
    /// for the variable name (e.g. alias `primary` reads `MOLT_DB_PRIMARY_MAX_CONNS`).
    pub fn from_env(alias: &str) -> Self {
        let prefix = format!("MOLT_DB_{}_", alias.to_uppercase());
        let mut config = Self::default();

        if let Some(v) = env_usize(&prefix, "MIN_CONNS") {
            config.min_conns = v;
        }
        if let Some(v) = env_usize(&prefix, "MAX_CONNS") {
            config.max_conns = v;
        }
        if let Some(v) = env_millis(&prefix, "MAX_IDLE_MS") {
            config.max_idle = v;
        }
        if let Some(v) = env_millis(&prefix, "CONNECT_TIMEOUT_MS") {
            config.connect_timeout = v;
        }
        if let Some(v) = env_millis(&prefix, "QUERY_TIMEOUT_MS") {
            config.query_timeout = v;
        }
        if let Some(v) = env_millis(&prefix, "MAX_WAIT_MS") {
            config.max_wait = v;
        }
        if let Some(v) = env_millis(&prefix, "HEALTH_CHECK_INTERVAL_MS") {
            config.health_check_interval = v;
        }
        if let Some(v) = env_usize(&prefix, "STATEMENT_CACHE_SIZE") {
            config.statement_cache_size = v;
        }
        config.tls_root_cert_path = env::var(format!("{prefix}TLS_ROOT_CERT_PATH")).ok();

        config
    }
}

fn env_usize(prefix: &str, suffix: &str) -> Option<usize> {
    env::var(format!("{prefix}{suffix}")).ok()?.parse().ok()
}

fn env_millis(prefix: &str, suffix: &str) -> Option<Duration> {
    env_usize(prefix, suffix).map(|ms| Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PoolConfig::default();
        assert!(config.min_conns <= config.max_conns);
        assert!(config.max_wait < config.query_timeout);
    }

    #[test]
    fn from_env_overrides_only_set_vars() {
        std::env::set_var("MOLT_DB_TESTALIAS_MAX_CONNS", "16");
        let config = PoolConfig::from_env("testalias");
        assert_eq!(config.max_conns, 16);
        assert_eq!(config.min_conns, PoolConfig::default().min_conns);
        std::env::remove_var("MOLT_DB_TESTALIAS_MAX_CONNS");
    }
}
