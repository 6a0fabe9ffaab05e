use crate::{error::RebacError, models::RevokePolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest ancestor chain walked before failing closed
    pub max_ancestor_depth: usize,
    /// Deepest nested group membership followed before failing closed
    pub max_group_depth: usize,
    /// Attempts per check when the store reports a transient fault
    pub max_attempts: u32,
    /// Initial backoff between attempts, doubled each retry
    pub retry_backoff_ms: u64,
    /// Default deadline for a check; `None` means no deadline
    pub check_timeout_ms: Option<u64>,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub revoke_policy: RevokePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_ancestor_depth: 32,
            max_group_depth: 32,
            max_attempts: 3,
            retry_backoff_ms: 10,
            check_timeout_ms: Some(2_000),
            cache_enabled: true,
            cache_capacity: 100_000,
            revoke_policy: RevokePolicy::Retain,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `REBAC_*` environment variables
    pub fn from_env() -> Result<Self, RebacError> {
        let mut config = Self::default();

        if let Some(depth) = env_parse("REBAC_MAX_ANCESTOR_DEPTH")? {
            config.max_ancestor_depth = depth;
        }
        if let Some(depth) = env_parse("REBAC_MAX_GROUP_DEPTH")? {
            config.max_group_depth = depth;
        }
        if let Some(attempts) = env_parse("REBAC_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(backoff) = env_parse("REBAC_RETRY_BACKOFF_MS")? {
            config.retry_backoff_ms = backoff;
        }
        if let Ok(timeout) = std::env::var("REBAC_CHECK_TIMEOUT_MS") {
            config.check_timeout_ms = match timeout.as_str() {
                "" | "none" => None,
                value => Some(value.parse().map_err(|_| {
                    RebacError::Configuration(format!("REBAC_CHECK_TIMEOUT_MS is not a number: {}", value))
                })?),
            };
        }
        if let Some(enabled) = env_parse("REBAC_CACHE_ENABLED")? {
            config.cache_enabled = enabled;
        }
        if let Some(capacity) = env_parse("REBAC_CACHE_CAPACITY")? {
            config.cache_capacity = capacity;
        }
        if let Ok(policy) = std::env::var("REBAC_REVOKE_POLICY") {
            config.revoke_policy = match policy.as_str() {
                "retain" => RevokePolicy::Retain,
                "purge" => RevokePolicy::Purge,
                other => {
                    return Err(RebacError::Configuration(format!(
                        "REBAC_REVOKE_POLICY must be 'retain' or 'purge', got '{}'",
                        other
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Layered load: defaults, then the file (TOML/YAML/JSON by extension),
    /// then `REBAC_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, RebacError> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| RebacError::Configuration(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("REBAC").try_parsing(true));

        let config = builder
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| RebacError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RebacError> {
        if self.max_ancestor_depth == 0 || self.max_group_depth == 0 {
            return Err(RebacError::Configuration(
                "Traversal depth bounds must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(RebacError::Configuration("max_attempts must be at least 1".to_string()));
        }
        if self.cache_enabled && self.cache_capacity == 0 {
            return Err(RebacError::Configuration(
                "cache_capacity must be positive when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        self.check_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, RebacError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| RebacError::Configuration(format!("{} has an invalid value: {}", key, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_ancestor_depth, 32);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_zero_depth_rejected() {
        let config = EngineConfig {
            max_group_depth: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(RebacError::Configuration(_))));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("rebac-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_group_depth = 8\nrevoke_policy = \"purge\"\ncache_enabled = false").unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_group_depth, 8);
        assert_eq!(config.revoke_policy, RevokePolicy::Purge);
        assert!(!config.cache_enabled);
        assert_eq!(config.max_ancestor_depth, 32);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
