//! Shared test utilities for queue worker tests
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic queue and worker names (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let queue = builder.queue_name("calc", "main");
//!     let config = RedisTransportConfig::new(redis.url());
//! }
//! ```

use std::time::Duration;
use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use self::redis::TestRedis;

/// Builder for test data with deterministic names
///
/// Seeded names keep keys readable and stop concurrent tests against one
/// server from sharing queues.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is the hash of the name)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_request_reply");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue or topic name unique to this test
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.queue_name("calc", "main"), "test.calc.7.main");
    /// ```
    pub fn queue_name(&self, prefix: &str, suffix: &str) -> String {
        format!("test.{}.{}.{}", prefix, self.seed, suffix)
    }

    /// Worker name unique to this test, in the `CamelCase` style of worker kinds
    pub fn worker_name(&self, kind: &str) -> String {
        format!("{}{}", kind, self.seed % 100_000)
    }

    /// Deterministic correlation id
    pub fn correlation_id(&self) -> String {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes).to_string()
    }
}

/// Test assertion helpers
pub mod assertions {
    use super::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert that `actual` lies within `tolerance` of `expected`
    pub fn assert_duration_near(
        actual: Duration,
        expected: Duration,
        tolerance: Duration,
        context: &str,
    ) {
        let low = expected.saturating_sub(tolerance);
        let high = expected + tolerance;
        assert!(
            actual >= low && actual <= high,
            "{}: expected {:?} +/- {:?}, got {:?}",
            context,
            expected,
            tolerance,
            actual
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.correlation_id(), builder2.correlation_id());
        assert_eq!(
            builder1.queue_name("calc", "main"),
            builder2.queue_name("calc", "main")
        );
        assert_eq!(builder1.worker_name("Calc"), "Calc42");
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.queue_name("q", "a"), builder2.queue_name("q", "a"));
    }

    #[test]
    fn test_assert_duration_near() {
        assertions::assert_duration_near(
            Duration::from_millis(5_020),
            Duration::from_secs(5),
            Duration::from_millis(50),
            "deadline",
        );
    }

    #[test]
    #[should_panic(expected = "deadline")]
    fn test_assert_duration_near_fails() {
        assertions::assert_duration_near(
            Duration::from_secs(7),
            Duration::from_secs(5),
            Duration::from_millis(50),
            "deadline",
        );
    }
}
