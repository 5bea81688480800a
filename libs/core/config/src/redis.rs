use crate::{ConfigError, FromEnv, env_required};
use std::env;

/// Redis configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
}

impl RedisConfig {
    pub fn new(uri: String) -> Self {
        Self { uri }
    }
}

impl FromEnv for RedisConfig {
    /// Reads REDIS_URL, falling back to REDIS_HOST (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let uri = match env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => env_required("REDIS_HOST")?,
        };

        Ok(Self { uri })
    }
}
