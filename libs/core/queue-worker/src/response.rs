//! Correlated replies
//!
//! A `PublishHandle` is returned for every publish that asked for replies. It
//! is consumed by exactly one read:
//!
//! - [`PublishHandle::read_response`] waits for a single reply
//! - [`PublishHandle::read_responses`] fans in replies from several workers,
//!   dispatching each to the handler registered for its source
//!
//! Deadlines are measured from the moment of publishing, not from the start
//! of the read.

use crate::destination::Destination;
use crate::envelope::{Envelope, RemoteException, ReplyBody};
use crate::error::ResponseError;
use crate::marshal::{MarshalRegistry, Payload};
use crate::metrics::PublisherMetrics;
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a single reply read
#[derive(Debug, Clone, PartialEq)]
pub enum Response<T> {
    Message(T),
    TimedOut,
}

impl<T> Response<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Response::TimedOut)
    }

    pub fn into_message(self) -> Option<T> {
        match self {
            Response::Message(message) => Some(message),
            Response::TimedOut => None,
        }
    }
}

/// Passed to every response handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseContext {
    /// Worker the reply (or timeout) belongs to
    pub name: String,
    /// Time since publishing
    pub elapsed: Duration,
}

impl ResponseContext {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

type MessageHandler<'a> =
    Box<dyn FnMut(&ResponseContext, Value) -> Result<(), ResponseError> + Send + 'a>;
type TimeoutHandler<'a> = Box<dyn FnMut(&ResponseContext) + Send + 'a>;
type ExceptionHandler<'a> =
    Box<dyn FnMut(&ResponseContext, &RemoteException) + Send + 'a>;

/// Handler registry and completion tracking for a fan-in read
///
/// The read is done once every name registered with `on_message` has been
/// resolved, by a message, an exception handler or a timeout.
pub struct WorkerResponse<'a> {
    published_at: Instant,
    /// Names in registration order
    expected: Vec<String>,
    done: HashSet<String>,
    message_handlers: Vec<MessageHandler<'a>>,
    message_index: HashMap<String, usize>,
    timeout_handlers: Vec<TimeoutHandler<'a>>,
    timeout_index: HashMap<String, usize>,
    default_timeout: Option<TimeoutHandler<'a>>,
    exception_handlers: Vec<ExceptionHandler<'a>>,
    exception_index: HashMap<String, usize>,
    default_exception: Option<ExceptionHandler<'a>>,
}

impl<'a> WorkerResponse<'a> {
    fn new(published_at: Instant) -> Self {
        Self {
            published_at,
            expected: Vec::new(),
            done: HashSet::new(),
            message_handlers: Vec::new(),
            message_index: HashMap::new(),
            timeout_handlers: Vec::new(),
            timeout_index: HashMap::new(),
            default_timeout: None,
            exception_handlers: Vec::new(),
            exception_index: HashMap::new(),
            default_exception: None,
        }
    }

    /// Handle replies from `names`, decoded into `T`
    pub fn on_message<T, F>(&mut self, names: &[&str], mut handler: F) -> &mut Self
    where
        T: DeserializeOwned,
        F: FnMut(&ResponseContext, T) + Send + 'a,
    {
        let slot = self.message_handlers.len();
        self.message_handlers.push(Box::new(move |ctx, value| {
            let message: T = serde_json::from_value(value)?;
            handler(ctx, message);
            Ok(())
        }));

        for name in names {
            if self.message_index.insert(name.to_string(), slot).is_none() {
                self.expected.push(name.to_string());
            }
        }
        self
    }

    /// Called when `names` have not replied by the deadline
    pub fn on_timeout<F>(&mut self, names: &[&str], handler: F) -> &mut Self
    where
        F: FnMut(&ResponseContext) + Send + 'a,
    {
        let slot = self.timeout_handlers.len();
        self.timeout_handlers.push(Box::new(handler));
        for name in names {
            self.timeout_index.insert(name.to_string(), slot);
        }
        self
    }

    /// Timeout handler for names without their own
    pub fn on_default_timeout<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&ResponseContext) + Send + 'a,
    {
        self.default_timeout = Some(Box::new(handler));
        self
    }

    /// Called when one of `names` reports a fault
    pub fn on_remote_exception<F>(&mut self, names: &[&str], handler: F) -> &mut Self
    where
        F: FnMut(&ResponseContext, &RemoteException) + Send + 'a,
    {
        let slot = self.exception_handlers.len();
        self.exception_handlers.push(Box::new(handler));
        for name in names {
            self.exception_index.insert(name.to_string(), slot);
        }
        self
    }

    /// Exception handler for names without their own
    pub fn on_default_remote_exception<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&ResponseContext, &RemoteException) + Send + 'a,
    {
        self.default_exception = Some(Box::new(handler));
        self
    }

    /// Whether every expected name has been resolved
    pub fn is_done(&self) -> bool {
        self.expected.iter().all(|name| self.done.contains(name))
    }

    fn context(&self, name: &str) -> ResponseContext {
        ResponseContext {
            name: name.to_string(),
            elapsed: self.published_at.elapsed(),
        }
    }

    /// Replies for names that are already resolved are ignored
    fn already_done(&self, name: &str) -> bool {
        let done = self.done.contains(name);
        if done {
            debug!(source = %name, "Ignoring repeated reply");
        }
        done
    }

    fn make_message_call(&mut self, name: &str, value: Value) -> Result<(), ResponseError> {
        if self.already_done(name) {
            return Ok(());
        }
        if !self.message_index.contains_key(name) {
            debug!(source = %name, "Ignoring reply from undeclared worker");
            return Ok(());
        }

        let ctx = self.context(name);
        self.done.insert(name.to_string());
        let handler = &mut self.message_handlers[self.message_index[name]];
        handler(&ctx, value)
    }

    fn make_exception_call(
        &mut self,
        name: &str,
        exception: RemoteException,
    ) -> Result<(), ResponseError> {
        if self.already_done(name) {
            return Ok(());
        }

        let ctx = self.context(name);
        let handler = match self.exception_index.get(name) {
            Some(&slot) => Some(&mut self.exception_handlers[slot]),
            None => self.default_exception.as_mut(),
        };

        match handler {
            Some(handler) => {
                handler(&ctx, &exception);
                self.done.insert(name.to_string());
                Ok(())
            }
            None => Err(ResponseError::Remote {
                worker: name.to_string(),
                exception,
            }),
        }
    }

    fn make_timeout_calls(&mut self) {
        let pending: Vec<String> = self
            .expected
            .iter()
            .filter(|name| !self.done.contains(*name))
            .cloned()
            .collect();

        for name in pending {
            let ctx = self.context(&name);
            let handler = match self.timeout_index.get(&name) {
                Some(&slot) => Some(&mut self.timeout_handlers[slot]),
                None => self.default_timeout.as_mut(),
            };

            match handler {
                Some(handler) => handler(&ctx),
                None => debug!(source = %name, "No reply before deadline"),
            }
            self.done.insert(name);
        }
    }
}

/// Correlation state of one publish that asked for replies
pub struct PublishHandle {
    transport: Arc<dyn Transport>,
    registry: Arc<MarshalRegistry>,
    correlation_id: String,
    reply_to: Destination,
    published_at: Instant,
    metrics: PublisherMetrics,
}

impl fmt::Debug for PublishHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishHandle")
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("transport", &self.transport.name())
            .finish()
    }
}

impl PublishHandle {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<MarshalRegistry>,
        correlation_id: String,
        reply_to: Destination,
        published_at: Instant,
        metrics: PublisherMetrics,
    ) -> Self {
        Self {
            transport,
            registry,
            correlation_id,
            reply_to,
            published_at,
            metrics,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn reply_to(&self) -> &Destination {
        &self.reply_to
    }

    pub fn published_at(&self) -> Instant {
        self.published_at
    }

    /// Time left of `timeout` since publishing, floored at zero
    pub fn remaining(&self, timeout: Duration) -> Duration {
        timeout.saturating_sub(self.published_at.elapsed())
    }

    async fn next_reply(&self, timeout: Duration) -> Result<Option<Envelope>, ResponseError> {
        let remaining = self.remaining(timeout);
        if remaining.is_zero() {
            return Ok(None);
        }

        Ok(self
            .transport
            .read_reply(&self.reply_to, &self.correlation_id, remaining)
            .await?)
    }

    fn decode(&self, marshal: Option<&str>, payload: &Payload) -> Result<Value, ResponseError> {
        let strategy = self.registry.resolve(marshal)?;
        Ok(strategy.unmarshal(payload)?)
    }

    async fn release(&self) {
        if let Err(e) = self.transport.release_reply_destination(&self.reply_to).await {
            warn!(reply_to = %self.reply_to, error = %e, "Failed to release reply destination");
        }
    }

    /// Wait for one reply until `timeout` after publishing
    pub async fn read_response<T: DeserializeOwned>(
        self,
        timeout: Duration,
    ) -> Result<Response<T>, ResponseError> {
        let result = self.read_one(timeout).await;
        self.release().await;

        let outcome = match &result {
            Ok(Response::Message(_)) => "message",
            Ok(Response::TimedOut) => "timeout",
            Err(ResponseError::Remote { .. }) => "exception",
            Err(_) => "error",
        };
        self.metrics.response(outcome);
        result
    }

    async fn read_one<T: DeserializeOwned>(
        &self,
        timeout: Duration,
    ) -> Result<Response<T>, ResponseError> {
        let Some(envelope) = self.next_reply(timeout).await? else {
            debug!(correlation_id = %self.correlation_id, "Timed out waiting for reply");
            return Ok(Response::TimedOut);
        };

        match envelope.reply_body()? {
            ReplyBody::Message { marshal, payload } => {
                let value = self.decode(marshal.as_deref(), &payload)?;
                Ok(Response::Message(serde_json::from_value(value)?))
            }
            ReplyBody::RemoteException(exception) => Err(ResponseError::Remote {
                worker: envelope.source().unwrap_or("unknown").to_string(),
                exception,
            }),
        }
    }

    /// Collect replies from several workers
    ///
    /// `register` declares the expected workers through `on_message` and any
    /// timeout or exception handlers. Returns once every expected worker is
    /// resolved or the deadline passes, after running the timeout handlers of
    /// the workers that stayed silent.
    ///
    /// ```rust,ignore
    /// handle
    ///     .read_responses(Duration::from_secs(5), |r| {
    ///         r.on_message(&["Inventory"], |_, stock: Stock| println!("{stock:?}"));
    ///         r.on_message(&["Pricing"], |_, price: Price| println!("{price:?}"));
    ///         r.on_default_timeout(|ctx| println!("{} timed out", ctx.name));
    ///     })
    ///     .await?;
    /// ```
    pub async fn read_responses<'a, F>(
        self,
        timeout: Duration,
        register: F,
    ) -> Result<(), ResponseError>
    where
        F: FnOnce(&mut WorkerResponse<'a>),
    {
        let mut response = WorkerResponse::new(self.published_at);
        register(&mut response);

        let result = if response.expected.is_empty() {
            Err(ResponseError::NoHandlers)
        } else {
            self.collect(timeout, &mut response).await
        };
        self.release().await;
        result
    }

    async fn collect(
        &self,
        timeout: Duration,
        response: &mut WorkerResponse<'_>,
    ) -> Result<(), ResponseError> {
        while !response.is_done() {
            let Some(envelope) = self.next_reply(timeout).await? else {
                self.metrics.response("timeout");
                response.make_timeout_calls();
                return Ok(());
            };

            let source = envelope.source().unwrap_or_default().to_string();
            match envelope.reply_body()? {
                ReplyBody::Message { marshal, payload } => {
                    let value = self.decode(marshal.as_deref(), &payload)?;
                    self.metrics.response("message");
                    response.make_message_call(&source, value)?;
                }
                ReplyBody::RemoteException(exception) => {
                    self.metrics.response("exception");
                    response.make_exception_call(&source, exception)?;
                }
            }
        }
        Ok(())
    }
}
