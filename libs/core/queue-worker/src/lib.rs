//! Queue Worker Framework
//!
//! Workers consume named destinations, run application logic on every message
//! and optionally reply to the sender. Publishers send messages and collect
//! correlated replies, from one worker or fanned in from several.
//!
//! ## Features
//!
//! - **Pluggable codecs**: `MarshalRegistry` maps strategy names to codecs
//!   (`native`, `json`, `string` built in, custom ones via `StrategyBuilder`)
//! - **Pluggable transports**: Redis Streams for production, in-memory for tests
//! - **Destinations**: queues, topics and virtual topics (one shared queue per
//!   consumer name)
//! - **Dead-lettering**: faulted messages are forwarded unchanged to
//!   `<Name>Failure` or a named queue
//! - **Request/response**: `PublishHandle::read_response` for one reply,
//!   `read_responses` for fan-in with per-worker handlers and deadlines
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use queue_worker::{Manager, MarshalRegistry, MemoryTransport, WorkerDefinition, WorkerOptions};
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let registry = Arc::new(MarshalRegistry::new());
//!
//! let mut manager = Manager::new(transport.clone(), registry.clone());
//! manager.add(WorkerDefinition::new("Calc"), CalcProcessor, 2, WorkerOptions::default())?;
//! manager.start_all().await;
//!
//! let publisher = Publisher::new(transport, registry, Destination::queue("Calc"));
//! let handle = publisher.request(&21).await?;
//! let answer = handle.read_response::<i64>(Duration::from_secs(5)).await?;
//!
//! manager.stop_all().await;
//! ```

pub mod config;
mod definition;
pub mod destination;
pub mod envelope;
mod error;
mod health;
mod manager;
pub mod marshal;
pub mod metrics;
mod processor;
mod publisher;
mod response;
mod supervisor;
pub mod transport;
mod worker;

// Re-export main types
pub use config::{RedisTransportConfig, WorkerOptions};
pub use definition::{DeadLetterPolicy, WorkerDefinition};
pub use destination::Destination;
pub use envelope::{Envelope, RemoteException};
pub use error::{
    ErrorCategory, MarshalError, ProcessingError, PublishError, ResponseError, TransportError,
    WorkerError,
};
pub use health::{HealthState, health_router};
pub use manager::{ManagedPool, Manager};
pub use marshal::{MarshalRegistry, MarshalStrategy, Payload, PayloadKind, StrategyBuilder};
pub use metrics::{PublisherMetrics, WorkerMetrics, init_metrics};
pub use processor::Processor;
pub use publisher::{PublishOptions, Publisher};
pub use response::{PublishHandle, Response, ResponseContext, WorkerResponse};
pub use supervisor::Supervisor;
pub use transport::{Consumer, MemoryTransport, Producer, RedisTransport, Transport};
pub use worker::{Worker, WorkerPhase, WorkerStatus};
