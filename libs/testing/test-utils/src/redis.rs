//! Redis test infrastructure
//!
//! `TestRedis` starts a Redis container and removes it when dropped.

use redis::Client;
use redis::aio::MultiplexedConnection;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Redis container for integration tests
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let url = redis.url();
/// // Hand `url` to the transport under test
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    url: String,
}

impl TestRedis {
    /// Start Redis 8 (Alpine); streams and consumer groups need Redis 5+
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let url = format!("redis://127.0.0.1:{}", host_port);

        let connection = Client::open(url.as_str())
            .expect("Failed to create Redis client")
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready");

        Self {
            container,
            connection,
            url,
        }
    }

    /// Connection for inspecting keys from the test
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Length of a stream, 0 when it doesn't exist
    pub async fn stream_len(&self, key: &str) -> usize {
        let mut conn = self.connection();
        redis::cmd("XLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .expect("XLEN failed")
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
