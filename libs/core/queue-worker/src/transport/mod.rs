//! Transport adapters
//!
//! A transport maps [`Destination`]s onto a concrete backend. Workers and
//! publishers only talk to these traits, so the same worker code runs against
//! Redis Streams in production and the in-memory backend in tests.
//!
//! Semantics every backend provides:
//! - delivery is FIFO per destination per producer
//! - a message counts as consumed only after [`Consumer::acknowledge`]
//! - [`Consumer::receive`] blocks until a message arrives, the consumer is
//!   interrupted or it is closed; after interruption it keeps returning `None`
//! - reply destinations are unique per requester and hand replies only to the
//!   reader asking for the matching correlation id

pub mod memory;
pub mod redis;

use crate::destination::Destination;
use crate::envelope::Envelope;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use memory::MemoryTransport;
pub use self::redis::RedisTransport;

/// Receiving side bound to one destination
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Wait for the next message; `None` once interrupted or closed
    async fn receive(&self) -> Result<Option<Envelope>, TransportError>;

    /// Mark a received message as consumed
    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Wake a pending `receive` and make further calls return `None`
    fn interrupt(&self);

    /// Release the consumer; calling it again is a no-op
    async fn close(&self) -> Result<(), TransportError>;
}

/// Sending side bound to one destination
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A broker backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend name for logs and health output
    fn name(&self) -> &'static str;

    /// Open a consumer; `consumer_name` identifies the worker kind, which
    /// selects the consumer queue for virtual topics
    async fn open_consumer(
        &self,
        destination: &Destination,
        consumer_name: &str,
    ) -> Result<Arc<dyn Consumer>, TransportError>;

    async fn open_producer(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn Producer>, TransportError>;

    /// Allocate an ephemeral destination for replies to one requester
    async fn allocate_reply_destination(&self) -> Result<Destination, TransportError>;

    /// Wait up to `timeout` for a reply carrying `correlation_id`
    ///
    /// Replies for other correlation ids are discarded. A zero timeout only
    /// returns a reply that is already waiting.
    async fn read_reply(
        &self,
        reply_to: &Destination,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError>;

    /// Drop an allocated reply destination
    async fn release_reply_destination(
        &self,
        _reply_to: &Destination,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// Check backend connectivity
    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Resolve once the flag behind `rx` is set or its sender is gone
pub(crate) async fn signalled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
