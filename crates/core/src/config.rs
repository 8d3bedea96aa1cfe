//! Runtime configuration from `CONSOLE_*` environment variables.

use crate::error::ConfigError;

pub const DEFAULT_QUEUE_CAP: usize = 2048;
pub const DEFAULT_CATALOG_NS: &str = "openshift";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    /// Per-subscription event queue bound (`CONSOLE_QUEUE_CAP`), see `SubscriptionManager::with_capacity`.
    pub queue_cap: usize,
    /// Namespace the backing service catalog is listed from (`CONSOLE_CATALOG_NS`).
    pub catalog_namespace: String,
    /// Prometheus listener address (`CONSOLE_METRICS_ADDR`).
    pub metrics_addr: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            queue_cap: DEFAULT_QUEUE_CAP,
            catalog_namespace: DEFAULT_CATALOG_NS.to_string(),
            metrics_addr: None,
        }
    }
}

impl ConsoleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable lookup; unset or empty values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();
        if let Some(v) = get("CONSOLE_QUEUE_CAP") {
            let cap = v.trim().parse::<usize>().map_err(|_| ConfigError::Invalid {
                var: "CONSOLE_QUEUE_CAP",
                value: v.clone(),
                reason: "expected a positive integer",
            })?;
            if cap == 0 {
                return Err(ConfigError::Invalid { var: "CONSOLE_QUEUE_CAP", value: v, reason: "must be greater than zero" });
            }
            cfg.queue_cap = cap;
        }
        if let Some(v) = get("CONSOLE_CATALOG_NS") {
            cfg.catalog_namespace = v.trim().to_string();
        }
        cfg.metrics_addr = get("CONSOLE_METRICS_ADDR");
        Ok(cfg)
    }
}
