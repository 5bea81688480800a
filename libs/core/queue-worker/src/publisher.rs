//! Publishing messages to a destination
//!
//! ```rust,ignore
//! let publisher = Publisher::new(transport, registry, Destination::queue("Calc"));
//! let handle = publisher.request(&21).await?;
//! match handle.read_response::<i64>(Duration::from_secs(5)).await? {
//!     Response::Message(answer) => assert_eq!(answer, 42),
//!     Response::TimedOut => warn!("Calc did not answer"),
//! }
//! ```

use crate::destination::Destination;
use crate::envelope::{Envelope, headers};
use crate::error::{MarshalError, PublishError};
use crate::marshal::{DEFAULT_STRATEGY, MarshalRegistry, marshal_object};
use crate::metrics::PublisherMetrics;
use crate::response::PublishHandle;
use crate::transport::{Producer, Transport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-publish settings
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Marshal strategy; falls back to the publisher's, then the registry default
    pub marshal: Option<String>,
    /// Extra headers; reserved `x-` headers set by the publisher take precedence
    pub headers: BTreeMap<String, String>,
    /// Allocate a reply destination and return a handle
    pub want_reply: bool,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marshal(mut self, name: impl Into<String>) -> Self {
        self.marshal = Some(name.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_reply(mut self) -> Self {
        self.want_reply = true;
        self
    }
}

/// Sends objects to one destination
pub struct Publisher {
    transport: Arc<dyn Transport>,
    registry: Arc<MarshalRegistry>,
    destination: Destination,
    marshal: Option<String>,
    producer: OnceCell<Arc<dyn Producer>>,
    metrics: PublisherMetrics,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<MarshalRegistry>,
        destination: Destination,
    ) -> Self {
        Self {
            metrics: PublisherMetrics::new(destination.to_string()),
            transport,
            registry,
            destination,
            marshal: None,
            producer: OnceCell::new(),
        }
    }

    /// Use `name` as this publisher's default strategy; fails if it is unknown
    pub fn with_marshal(mut self, name: impl Into<String>) -> Result<Self, MarshalError> {
        let name = name.into();
        self.registry.resolve(Some(&name))?;
        self.marshal = Some(name);
        Ok(self)
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn producer(&self) -> Result<&Arc<dyn Producer>, PublishError> {
        Ok(self
            .producer
            .get_or_try_init(|| self.transport.open_producer(&self.destination))
            .await?)
    }

    /// Encode and send `object`; returns a handle when a reply was requested
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        object: &T,
        options: PublishOptions,
    ) -> Result<Option<PublishHandle>, PublishError> {
        let marshal = options.marshal.or_else(|| self.marshal.clone());
        let strategy = self.registry.resolve(marshal.as_deref())?;
        let payload = marshal_object(strategy.as_ref(), object)?;

        let correlation_id = Uuid::new_v4().to_string();
        let mut envelope = Envelope::new(payload);
        envelope.headers = options.headers;
        envelope = envelope.with_header(headers::CORRELATION_ID, correlation_id.as_str());
        if let Some(marshal) = &marshal {
            envelope = envelope.with_header(headers::MARSHAL, marshal.as_str());
        }

        let reply_to = if options.want_reply {
            let reply_to = self.transport.allocate_reply_destination().await?;
            envelope = envelope.with_header(headers::REPLY_TO, reply_to.to_string());
            Some(reply_to)
        } else {
            None
        };

        let published_at = tokio::time::Instant::now();
        let sent: Result<(), PublishError> = async {
            self.producer().await?.send(envelope).await?;
            Ok(())
        }
        .await;

        if let Err(e) = sent {
            if let Some(reply_to) = &reply_to
                && let Err(release_err) = self.transport.release_reply_destination(reply_to).await
            {
                warn!(
                    reply_to = %reply_to,
                    error = %release_err,
                    "Failed to release reply destination"
                );
            }
            return Err(e);
        }

        self.metrics
            .message_published(marshal.as_deref().unwrap_or(DEFAULT_STRATEGY));
        debug!(
            destination = %self.destination,
            correlation_id = %correlation_id,
            want_reply = reply_to.is_some(),
            "Published message"
        );

        Ok(reply_to.map(|reply_to| {
            PublishHandle::new(
                self.transport.clone(),
                self.registry.clone(),
                correlation_id,
                reply_to,
                published_at,
                self.metrics.clone(),
            )
        }))
    }

    /// Fire and forget
    pub async fn send<T: Serialize + ?Sized>(&self, object: &T) -> Result<(), PublishError> {
        self.publish(object, PublishOptions::new()).await?;
        Ok(())
    }

    /// Publish and return a handle for the replies
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        object: &T,
    ) -> Result<PublishHandle, PublishError> {
        self.publish(object, PublishOptions::new().with_reply())
            .await?
            .ok_or_else(|| {
                PublishError::Serialization("no reply destination allocated".to_string())
            })
    }

    /// Close the cached producer
    pub async fn close(&self) -> Result<(), PublishError> {
        if let Some(producer) = self.producer.get() {
            producer.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::marshal::Payload;

    fn publisher(transport: &MemoryTransport, destination: Destination) -> Publisher {
        Publisher::new(
            Arc::new(transport.clone()),
            Arc::new(MarshalRegistry::new()),
            destination,
        )
    }

    #[tokio::test]
    async fn test_send_sets_headers() {
        let transport = MemoryTransport::new();
        let destination = Destination::queue("Calc");
        let publisher = publisher(&transport, destination.clone())
            .with_marshal("json")
            .unwrap();

        publisher
            .publish(&21, PublishOptions::new().with_header("x-tenant", "acme"))
            .await
            .unwrap();

        let consumer = transport.open_consumer(&destination, "Calc").await.unwrap();
        let envelope = consumer.receive().await.unwrap().unwrap();
        assert_eq!(envelope.marshal(), Some("json"));
        assert_eq!(envelope.header("x-tenant"), Some("acme"));
        assert!(envelope.correlation_id().is_some());
        assert!(envelope.reply_to().unwrap().is_none());
        assert_eq!(envelope.payload, Some(Payload::Text("21".to_string())));
    }

    #[tokio::test]
    async fn test_default_strategy_leaves_marshal_header_unset() {
        let transport = MemoryTransport::new();
        let destination = Destination::queue("Calc");
        publisher(&transport, destination.clone()).send(&"hi").await.unwrap();

        let consumer = transport.open_consumer(&destination, "Calc").await.unwrap();
        let envelope = consumer.receive().await.unwrap().unwrap();
        assert_eq!(envelope.marshal(), None);
        assert!(matches!(envelope.payload, Some(Payload::Bytes(_))));
    }

    #[tokio::test]
    async fn test_unknown_marshal_fails_before_send() {
        let transport = MemoryTransport::new();
        let destination = Destination::queue("Calc");
        let publisher = publisher(&transport, destination.clone());

        let err = publisher
            .publish(&1, PublishOptions::new().with_marshal("yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Marshal(MarshalError::UnknownStrategy(_))));
        assert_eq!(transport.depth(&destination), 0);

        assert!(
            Publisher::new(
                Arc::new(transport.clone()),
                Arc::new(MarshalRegistry::new()),
                destination,
            )
            .with_marshal("yaml")
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_request_sets_reply_to() {
        let transport = MemoryTransport::new();
        let destination = Destination::queue("Calc");
        let handle = publisher(&transport, destination.clone())
            .request(&21)
            .await
            .unwrap();

        let consumer = transport.open_consumer(&destination, "Calc").await.unwrap();
        let envelope = consumer.receive().await.unwrap().unwrap();
        assert_eq!(envelope.reply_to().unwrap().as_ref(), Some(handle.reply_to()));
        assert_eq!(envelope.correlation_id(), Some(handle.correlation_id()));
    }

    #[tokio::test]
    async fn test_closed_publisher_fails() {
        let transport = MemoryTransport::new();
        let publisher = publisher(&transport, Destination::queue("Calc"));
        publisher.send(&1).await.unwrap();
        publisher.close().await.unwrap();
        assert!(matches!(
            publisher.send(&2).await,
            Err(PublishError::Transport(_))
        ));
    }
}
