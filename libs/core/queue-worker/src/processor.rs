//! Application processing hook

use crate::error::ProcessingError;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

/// Application logic run by a worker for every message.
///
/// The request is decoded with the marshal strategy named by the message and
/// the response is encoded with the same strategy. A response is only sent
/// when the message carries a reply destination.
///
/// # Example
///
/// ```rust,ignore
/// use queue_worker::{Processor, ProcessingError};
///
/// struct Doubler;
///
/// #[async_trait]
/// impl Processor for Doubler {
///     type Request = i64;
///     type Response = i64;
///
///     async fn perform(&self, request: i64) -> Result<i64, ProcessingError> {
///         Ok(request * 2)
///     }
///
///     fn name(&self) -> &'static str {
///         "Doubler"
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    /// Handle one request
    ///
    /// An `Err` is counted against the worker, dead-lettered when configured
    /// and sent back as a remote exception. It never stops the worker.
    async fn perform(&self, request: Self::Request) -> Result<Self::Response, ProcessingError>;

    /// Processor name for logs and metrics
    fn name(&self) -> &'static str;
}
