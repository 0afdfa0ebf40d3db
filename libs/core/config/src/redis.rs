use crate::{ConfigError, FromEnv, env_required};

/// Redis configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
}

impl RedisConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl FromEnv for RedisConfig {
    /// Requires REDIS_HOST to be set to a full `redis://` URI (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let uri = env_required("REDIS_HOST")?;
        if !uri.starts_with("redis://") && !uri.starts_with("rediss://") {
            return Err(ConfigError::ParseError {
                key: "REDIS_HOST".to_string(),
                details: format!("expected a redis:// or rediss:// URI, got '{uri}'"),
            });
        }
        Ok(Self { uri })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_from_env_success() {
        temp_env::with_var("REDIS_HOST", Some("redis://localhost:6379"), || {
            let config = RedisConfig::from_env();
            assert!(config.is_ok());
            let config = config.unwrap();
            assert_eq!(config.uri, "redis://localhost:6379");
        });
    }

    #[test]
    fn test_redis_config_from_env_missing() {
        temp_env::with_var_unset("REDIS_HOST", || {
            let config = RedisConfig::from_env();
            assert!(config.is_err());
            let err = config.unwrap_err();
            assert!(err.to_string().contains("REDIS_HOST"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_redis_config_rejects_bare_host() {
        temp_env::with_var("REDIS_HOST", Some("localhost:6379"), || {
            let err = RedisConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { .. }));
        });
    }
}
