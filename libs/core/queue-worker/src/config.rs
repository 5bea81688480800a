//! Transport and worker configuration
//!
//! - `RedisTransportConfig`: connection and stream settings for the Redis backend
//! - `WorkerOptions`: per-instance settings applied on top of a worker definition

use crate::definition::DeadLetterPolicy;
use core_config::{ConfigError, FromEnv, env_parse, redis::RedisConfig};

/// Configuration for the Redis Streams transport
#[derive(Debug, Clone)]
pub struct RedisTransportConfig {
    /// Redis connection URL
    pub url: String,

    /// Consumer group shared by all consumers of a queue
    pub queue_group: String,

    /// Upper bound for one blocking read in milliseconds
    pub block_timeout_ms: u64,

    /// Lifetime of reply streams in seconds
    pub reply_ttl_secs: u64,

    /// Approximate maximum stream length before trimming
    pub max_length: usize,

    /// Pending entries idle for longer than this are claimed by other consumers
    pub claim_idle_ms: u64,
}

impl RedisTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue_group: "workers".to_string(),
            block_timeout_ms: 1000,
            reply_ttl_secs: 300,
            max_length: 100_000,
            claim_idle_ms: 30_000,
        }
    }

    /// Set the shared queue consumer group
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = group.into();
        self
    }

    /// Set the blocking read timeout (at least 1ms, 0 would block forever)
    pub fn with_block_timeout_ms(mut self, timeout: u64) -> Self {
        self.block_timeout_ms = timeout.max(1);
        self
    }

    /// Set the reply stream lifetime
    pub fn with_reply_ttl_secs(mut self, ttl: u64) -> Self {
        self.reply_ttl_secs = ttl;
        self
    }

    /// Set the maximum stream length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the idle time after which pending entries are claimed
    pub fn with_claim_idle_ms(mut self, idle: u64) -> Self {
        self.claim_idle_ms = idle;
        self
    }
}

impl Default for RedisTransportConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

impl FromEnv for RedisTransportConfig {
    /// Reads the Redis URL via `RedisConfig` plus:
    /// - QUEUE_GROUP (default "workers")
    /// - QUEUE_BLOCK_TIMEOUT_MS (default 1000)
    /// - QUEUE_REPLY_TTL_SECS (default 300)
    /// - QUEUE_MAX_LENGTH (default 100000)
    /// - QUEUE_CLAIM_IDLE_MS (default 30000)
    fn from_env() -> Result<Self, ConfigError> {
        let redis = RedisConfig::from_env()?;
        let defaults = Self::new(redis.uri);

        Ok(Self {
            queue_group: core_config::env_or_default("QUEUE_GROUP", &defaults.queue_group),
            block_timeout_ms: env_parse("QUEUE_BLOCK_TIMEOUT_MS", defaults.block_timeout_ms)?
                .max(1),
            reply_ttl_secs: env_parse("QUEUE_REPLY_TTL_SECS", defaults.reply_ttl_secs)?,
            max_length: env_parse("QUEUE_MAX_LENGTH", defaults.max_length)?,
            claim_idle_ms: env_parse("QUEUE_CLAIM_IDLE_MS", defaults.claim_idle_ms)?,
            ..defaults
        })
    }
}

/// Per-instance worker settings
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Overrides the definition's dead-letter policy when set
    pub dead_letter: Option<DeadLetterPolicy>,

    /// Log the processing time of every message
    pub log_times: bool,

    /// Cap for the backoff after transient transport errors
    pub max_backoff_secs: u64,
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self {
            dead_letter: None,
            log_times: true,
            max_backoff_secs: 30,
        }
    }

    /// Override the dead-letter policy for these instances
    pub fn with_dead_letter(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter = Some(policy);
        self
    }

    /// Enable or disable per-message timing logs
    pub fn with_log_times(mut self, enable: bool) -> Self {
        self.log_times = enable;
        self
    }

    /// Set the backoff cap
    pub fn with_max_backoff_secs(mut self, secs: u64) -> Self {
        self.max_backoff_secs = secs.max(1);
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::new()
    }
}
