//! Environment configuration surface.
//!
//! `WORKER_URL` and `JWT_SECRET` are required; everything else falls back to
//! its documented default. All intervals and thresholds are milliseconds.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::str::FromStr;

use crate::runtime::ids::TaskId;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address for the HTTP ingress.
    pub bind_addr: SocketAddr,
    /// Base URL synthesized into backend callback URLs.
    pub worker_url: String,
    /// Shared secret for bearer-token validation.
    pub jwt_secret: String,
    /// Age after which a silent server is reclassified offline.
    pub stale_threshold_ms: u64,
    /// Cadence of the registry's stale-server sweep.
    pub cleanup_interval_ms: u64,
    /// Lower bound of the adaptive health-check interval.
    pub min_health_check_interval_ms: u64,
    /// Upper bound of the adaptive health-check interval.
    pub max_health_check_interval_ms: u64,
    /// Maximum time a task may spend processing.
    pub task_timeout_ms: u64,
    /// Retention window after a task reaches a terminal status.
    pub cleanup_delay_ms: u64,
    /// Retry ceiling per task.
    pub max_retries: u32,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let worker_url = std::env::var("WORKER_URL").context("WORKER_URL is required")?;
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET is required")?;

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080".parse().unwrap()),
            worker_url,
            jwt_secret,
            stale_threshold_ms: env_or("SERVER_STALE_THRESHOLD", 300_000),
            cleanup_interval_ms: env_or("SERVER_CLEANUP_INTERVAL", 60_000),
            min_health_check_interval_ms: env_or("MIN_HEALTH_CHECK_INTERVAL", 5_000),
            max_health_check_interval_ms: env_or("MAX_HEALTH_CHECK_INTERVAL", 60_000),
            task_timeout_ms: env_or("TASK_TIMEOUT", 3_600_000),
            cleanup_delay_ms: env_or("CLEANUP_DELAY", 300_000),
            max_retries: env_or("MAX_RETRIES", 3),
        })
    }

    /// The URL a backend worker calls back with asynchronous results.
    pub fn callback_url(&self, task_id: &TaskId) -> String {
        format!(
            "{}/api/task/{}",
            self.worker_url.trim_end_matches('/'),
            task_id
        )
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            worker_url: "http://gateway.test".to_string(),
            jwt_secret: "test-secret".to_string(),
            stale_threshold_ms: 300_000,
            cleanup_interval_ms: 60_000,
            min_health_check_interval_ms: 5_000,
            max_health_check_interval_ms: 60_000,
            task_timeout_ms: 3_600_000,
            cleanup_delay_ms: 300_000,
            max_retries: 3,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_url_joins_without_double_slash() {
        let mut config = GatewayConfig::for_tests();
        config.worker_url = "http://gateway.test/".to_string();

        let id = TaskId("t-1".to_string());
        assert_eq!(config.callback_url(&id), "http://gateway.test/api/task/t-1");
    }

    #[test]
    fn env_or_falls_back_on_missing_or_garbage() {
        std::env::remove_var("TG_TEST_MISSING");
        assert_eq!(env_or("TG_TEST_MISSING", 42u64), 42);

        std::env::set_var("TG_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("TG_TEST_GARBAGE", 42u64), 42);
        std::env::remove_var("TG_TEST_GARBAGE");
    }
}
