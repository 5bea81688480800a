//! Message destinations
//!
//! A destination is exactly one of a queue, a topic, a virtual topic or an
//! opaque handle (used for ephemeral reply destinations). The text form
//! (`queue://orders`) travels in the `x-reply-to` header.

use crate::error::TransportError;
use std::fmt;
use std::str::FromStr;

/// Prefix used by publishers for virtual topics
pub const VIRTUAL_TOPIC_PREFIX: &str = "VirtualTopic.";

/// Named target for message delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    /// Point-to-point queue, each message goes to one consumer
    Queue(String),
    /// Publish/subscribe topic, each open consumer gets a copy
    Topic(String),
    /// Topic where each consuming worker name gets its own queue
    VirtualTopic(String),
    /// Opaque backend handle, e.g. an allocated reply destination
    Handle(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Destination::Topic(name.into())
    }

    pub fn virtual_topic(name: impl Into<String>) -> Self {
        Destination::VirtualTopic(name.into())
    }

    pub fn handle(key: impl Into<String>) -> Self {
        Destination::Handle(key.into())
    }

    /// The name or key without the discriminant
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name)
            | Destination::Topic(name)
            | Destination::VirtualTopic(name)
            | Destination::Handle(name) => name,
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            Destination::Queue(_) => "queue",
            Destination::Topic(_) => "topic",
            Destination::VirtualTopic(_) => "virtual-topic",
            Destination::Handle(_) => "handle",
        }
    }

    /// Name of the queue a worker called `consumer` reads from for this destination
    ///
    /// Only virtual topics are rewritten (`Consumer.<consumer>.VirtualTopic.<topic>`).
    pub fn consumer_queue_name(&self, consumer: &str) -> String {
        match self {
            Destination::VirtualTopic(topic) => {
                format!("Consumer.{}.{}{}", consumer, VIRTUAL_TOPIC_PREFIX, topic)
            }
            other => other.name().to_string(),
        }
    }

    /// Name publishers write to for this destination
    pub fn publish_name(&self) -> String {
        match self {
            Destination::VirtualTopic(topic) => format!("{}{}", VIRTUAL_TOPIC_PREFIX, topic),
            other => other.name().to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.name())
    }
}

impl FromStr for Destination {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, name) = s
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidDestination(s.to_string()))?;

        if name.is_empty() {
            return Err(TransportError::InvalidDestination(s.to_string()));
        }

        match scheme {
            "queue" => Ok(Destination::Queue(name.to_string())),
            "topic" => Ok(Destination::Topic(name.to_string())),
            "virtual-topic" => Ok(Destination::VirtualTopic(name.to_string())),
            "handle" => Ok(Destination::Handle(name.to_string())),
            _ => Err(TransportError::InvalidDestination(s.to_string())),
        }
    }
}
