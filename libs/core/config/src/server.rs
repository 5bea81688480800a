use crate::{ConfigError, FromEnv, env_or_default, env_parse};
use std::net::Ipv4Addr;

/// Default port of the health and metrics server
pub const DEFAULT_HEALTH_PORT: u16 = 8082;

/// Bind address of a worker's health and metrics server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthServerConfig {
    pub host: String,
    pub port: u16,
}

impl HealthServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for HealthServerConfig {
    /// - HEALTH_HOST: defaults to 0.0.0.0
    /// - HEALTH_PORT: defaults to 8082
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string()),
            port: env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
        })
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), DEFAULT_HEALTH_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars_unset(["HEALTH_HOST", "HEALTH_PORT"], || {
            let config = HealthServerConfig::from_env().unwrap();
            assert_eq!(config, HealthServerConfig::default());
            assert_eq!(config.address(), "0.0.0.0:8082");
        });
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [("HEALTH_HOST", Some("127.0.0.1")), ("HEALTH_PORT", Some("9100"))],
            || {
                let config = HealthServerConfig::from_env().unwrap();
                assert_eq!(config.address(), "127.0.0.1:9100");
            },
        );
    }

    #[test]
    fn test_from_env_port_out_of_range() {
        temp_env::with_var("HEALTH_PORT", Some("99999"), || {
            let err = HealthServerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("HEALTH_PORT"));
        });
    }
}
