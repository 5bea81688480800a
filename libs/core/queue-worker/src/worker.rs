//! Worker consume loop
//!
//! A `Worker` owns one consumer on its destination and processes messages one
//! at a time:
//!
//! 1. decode the payload with the strategy named by the `x-marshal` header
//! 2. run the processor
//! 3. reply to `x-reply-to` when present, with the result or a remote exception
//! 4. acknowledge the message
//!
//! Faults never stop the loop. A faulted message is counted once, forwarded
//! to the dead-letter queue when one is configured and reported to the
//! requester. Transient receive errors back off exponentially; permanent ones
//! end the loop in the `Error` phase.
//!
//! `stop` waits for the message in progress. The consumer is only closed once
//! processing has finished, so a stopped worker never loses a message.

use crate::config::WorkerOptions;
use crate::definition::WorkerDefinition;
use crate::destination::Destination;
use crate::envelope::{Envelope, RemoteException, headers};
use crate::error::{ErrorCategory, ProcessingError, TransportError, WorkerError};
use crate::marshal::{MarshalRegistry, Payload, marshal_object};
use crate::metrics::WorkerMetrics;
use crate::processor::Processor;
use crate::transport::{Consumer, Producer, Transport, signalled};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, watch};
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lifecycle phase of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, strum::Display)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerPhase {
    Created,
    Running,
    Stopping,
    Stopped,
    /// The loop ended on a permanent transport error
    Error(String),
}

/// Point-in-time view of a worker, safe to take from any task
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub index: usize,
    pub destination: String,
    pub phase: WorkerPhase,
    /// Human readable activity line
    pub status: String,
    pub message_count: u64,
    pub error_count: u64,
    pub last_duration_ms: Option<f64>,
    pub total_duration_ms: f64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct WorkerStats {
    phase: WorkerPhase,
    status: String,
    message_count: u64,
    error_count: u64,
    last_duration: Option<Duration>,
    total_duration: Duration,
    last_message_at: Option<DateTime<Utc>>,
}

/// A single consumer of a worker definition's destination
pub struct Worker<P: Processor> {
    name: String,
    index: usize,
    destination: Destination,
    dead_letter: Option<Destination>,
    options: WorkerOptions,
    processor: Arc<P>,
    transport: Arc<dyn Transport>,
    registry: Arc<MarshalRegistry>,
    metrics: WorkerMetrics,
    stop: watch::Sender<bool>,
    /// Held while a message is processed; `stop` takes it before closing
    processing: tokio::sync::Mutex<()>,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
    dead_letter_producer: OnceCell<Arc<dyn Producer>>,
    stats: Mutex<WorkerStats>,
}

impl<P: Processor> Worker<P> {
    /// Create a worker; fails when the definition or its dead-letter target is invalid
    pub fn new(
        definition: &WorkerDefinition,
        index: usize,
        processor: Arc<P>,
        transport: Arc<dyn Transport>,
        registry: Arc<MarshalRegistry>,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        definition.validate()?;
        let dead_letter = definition.resolve_dead_letter(&options)?;
        let (stop, _) = watch::channel(false);

        Ok(Self {
            name: definition.name.clone(),
            index,
            metrics: WorkerMetrics::new(&definition.name, definition.destination.to_string()),
            destination: definition.destination.clone(),
            dead_letter,
            options,
            processor,
            transport,
            registry,
            stop,
            processing: tokio::sync::Mutex::new(()),
            consumer: Mutex::new(None),
            dead_letter_producer: OnceCell::new(),
            stats: Mutex::new(WorkerStats {
                phase: WorkerPhase::Created,
                status: "initialized".to_string(),
                message_count: 0,
                error_count: 0,
                last_duration: None,
                total_duration: Duration::ZERO,
                last_message_at: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn dead_letter(&self) -> Option<&Destination> {
        self.dead_letter.as_ref()
    }

    pub fn phase(&self) -> WorkerPhase {
        lock(&self.stats).phase.clone()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Snapshot of counters and activity
    pub fn status(&self) -> WorkerStatus {
        let stats = lock(&self.stats);
        WorkerStatus {
            name: self.name.clone(),
            index: self.index,
            destination: self.destination.to_string(),
            phase: stats.phase.clone(),
            status: stats.status.clone(),
            message_count: stats.message_count,
            error_count: stats.error_count,
            last_duration_ms: stats.last_duration.map(|d| d.as_secs_f64() * 1000.0),
            total_duration_ms: stats.total_duration.as_secs_f64() * 1000.0,
            last_message_at: stats.last_message_at,
        }
    }

    fn set_phase(&self, phase: WorkerPhase) {
        lock(&self.stats).phase = phase;
    }

    fn take_consumer(&self) -> Option<Arc<dyn Consumer>> {
        lock(&self.consumer).take()
    }

    async fn close_consumer(&self) {
        if let Some(consumer) = self.take_consumer()
            && let Err(e) = consumer.close().await
        {
            warn!(worker = %self, error = %e, "Failed to close consumer");
        }
    }

    /// Run the consume loop until stopped or a permanent transport error occurs
    pub async fn run(&self) -> Result<(), WorkerError> {
        {
            let mut stats = lock(&self.stats);
            match stats.phase {
                WorkerPhase::Created => {}
                WorkerPhase::Stopped if self.is_stopped() => return Ok(()),
                _ => return Err(WorkerError::AlreadyStarted(self.to_string())),
            }
            stats.phase = WorkerPhase::Running;
        }

        let consumer = match self
            .transport
            .open_consumer(&self.destination, &self.name)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(worker = %self, error = %e, "Failed to open consumer");
                self.set_phase(WorkerPhase::Error(e.to_string()));
                return Err(e.into());
            }
        };
        *lock(&self.consumer) = Some(consumer.clone());

        // stop() may have run before the consumer was stored
        if self.is_stopped() {
            consumer.interrupt();
        }

        info!(
            worker = %self,
            destination = %self.destination,
            dead_letter = ?self.dead_letter.as_ref().map(ToString::to_string),
            transport = self.transport.name(),
            processor = self.processor.name(),
            "Worker started"
        );
        self.metrics.worker_started();

        let result = self.consume(consumer.as_ref()).await;

        {
            let _guard = self.processing.lock().await;
            self.close_consumer().await;
        }
        self.metrics.worker_stopped();

        let mut stats = lock(&self.stats);
        stats.status = "Exited".to_string();
        match &result {
            Ok(()) => {
                stats.phase = WorkerPhase::Stopped;
                info!(worker = %self, messages = stats.message_count, "Worker stopped");
            }
            Err(e) => stats.phase = WorkerPhase::Error(e.to_string()),
        }
        result
    }

    async fn consume(&self, consumer: &dyn Consumer) -> Result<(), WorkerError> {
        let max_backoff_ms = self.options.max_backoff_secs * 1000;
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.is_stopped() {
                return Ok(());
            }

            let envelope = match consumer.receive().await {
                Ok(Some(envelope)) => {
                    if consecutive_errors > 0 {
                        info!(worker = %self, errors = consecutive_errors, "Transport recovered");
                        consecutive_errors = 0;
                    }
                    envelope
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_transient() => {
                    let delay = ErrorCategory::Transient
                        .backoff_delay_ms(consecutive_errors.min(16), max_backoff_ms);
                    consecutive_errors += 1;
                    warn!(
                        worker = %self,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = delay,
                        "Transport error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = signalled(self.stop.subscribe()) => return Ok(()),
                    }
                    continue;
                }
                Err(e) => {
                    error!(worker = %self, error = %e, "Permanent transport error, worker exiting");
                    return Err(e.into());
                }
            };

            let _guard = self.processing.lock().await;
            if self.is_stopped() {
                // unacknowledged, the backend redelivers it
                debug!(worker = %self, id = %envelope.id, "Stopped before processing message");
                return Ok(());
            }
            self.handle(consumer, envelope).await;
        }
    }

    async fn handle(&self, consumer: &dyn Consumer, envelope: Envelope) {
        let started = Instant::now();
        let count = {
            let mut stats = lock(&self.stats);
            stats.message_count += 1;
            stats.last_message_at = Some(Utc::now());
            stats.status = format!("Processing message {}", stats.message_count);
            stats.message_count
        };
        self.metrics.message_received();
        debug!(worker = %self, id = %envelope.id, count, "Received message");

        let reply_to = match envelope.reply_to() {
            Ok(reply_to) => reply_to,
            Err(e) => {
                warn!(
                    worker = %self,
                    id = %envelope.id,
                    error = %e,
                    "Ignoring invalid reply destination"
                );
                None
            }
        };

        let outcome = self.process(&envelope, reply_to.is_some()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(reply) => {
                self.metrics.message_processed(elapsed);
                if let (Some(reply_to), Some(payload)) = (&reply_to, reply) {
                    let mut response = Envelope::new(payload)
                        .with_header(headers::CORRELATION_ID, correlation_of(&envelope))
                        .with_header(headers::SOURCE, self.name.as_str());
                    if let Some(marshal) = envelope.marshal() {
                        response = response.with_header(headers::MARSHAL, marshal);
                    }
                    self.send_reply(reply_to, response, "message").await;
                }
            }
            Err(fault) => {
                self.metrics.message_failed(fault.kind(), elapsed);
                self.on_fault(&envelope, &fault, reply_to.as_ref()).await;
            }
        }

        if let Err(e) = consumer.acknowledge(&envelope).await {
            warn!(worker = %self, id = %envelope.id, error = %e, "Failed to acknowledge message");
        }

        let mut stats = lock(&self.stats);
        stats.last_duration = Some(elapsed);
        stats.total_duration += elapsed;
        stats.status = format!("Finished message {}", count);
        drop(stats);

        if self.options.log_times {
            info!(
                worker = %self,
                id = %envelope.id,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "Processed message"
            );
        }
    }

    /// Decode, perform and encode the reply when one is wanted
    async fn process(
        &self,
        envelope: &Envelope,
        wants_reply: bool,
    ) -> Result<Option<Payload>, ProcessingError> {
        let strategy = self.registry.resolve(envelope.marshal())?;
        let payload = envelope
            .payload
            .as_ref()
            .ok_or_else(|| ProcessingError::InvalidRequest("message has no payload".to_string()))?;

        let value = strategy.unmarshal(payload)?;
        let request: P::Request = serde_json::from_value(value)
            .map_err(|e| ProcessingError::InvalidRequest(e.to_string()))?;

        let response = self.processor.perform(request).await?;

        if !wants_reply {
            return Ok(None);
        }
        Ok(Some(marshal_object(strategy.as_ref(), &response)?))
    }

    async fn on_fault(
        &self,
        envelope: &Envelope,
        fault: &ProcessingError,
        reply_to: Option<&Destination>,
    ) {
        lock(&self.stats).error_count += 1;
        error!(
            worker = %self,
            id = %envelope.id,
            kind = fault.kind(),
            error = %fault,
            "Message processing failed"
        );

        if let Some(dead_letter) = &self.dead_letter {
            match self.forward_to_dead_letter(dead_letter, envelope).await {
                Ok(()) => {
                    self.metrics.dead_lettered();
                    info!(
                        worker = %self,
                        id = %envelope.id,
                        dead_letter = %dead_letter,
                        "Forwarded to dead-letter queue"
                    );
                }
                Err(e) => error!(
                    worker = %self,
                    id = %envelope.id,
                    dead_letter = %dead_letter,
                    error = %e,
                    "Failed to forward message to dead-letter queue"
                ),
            }
        }

        if let Some(reply_to) = reply_to {
            let exception = RemoteException::from(fault);
            match Envelope::remote_exception(&exception, correlation_of(envelope), &self.name) {
                Ok(response) => self.send_reply(reply_to, response, "exception").await,
                Err(e) => error!(worker = %self, error = %e, "Failed to encode remote exception"),
            }
        }
    }

    async fn forward_to_dead_letter(
        &self,
        dead_letter: &Destination,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let producer = self
            .dead_letter_producer
            .get_or_try_init(|| self.transport.open_producer(dead_letter))
            .await?;

        let mut original = envelope.clone();
        original.delivery_tag = None;
        producer.send(original).await
    }

    async fn send_reply(&self, reply_to: &Destination, response: Envelope, outcome: &'static str) {
        let result: Result<(), TransportError> = async {
            let producer = self.transport.open_producer(reply_to).await?;
            let sent = producer.send(response).await;
            producer.close().await?;
            sent
        }
        .await;

        match result {
            Ok(()) => self.metrics.reply_sent(outcome),
            Err(e) => warn!(
                worker = %self,
                reply_to = %reply_to,
                error = %e,
                "Failed to send reply"
            ),
        }
    }

    /// Stop consuming
    ///
    /// Interrupts a pending receive, waits for the message in progress and then
    /// closes the consumer. Safe to call more than once and before `run`.
    pub async fn stop(&self) {
        if self.stop.send_replace(true) {
            return;
        }

        {
            let mut stats = lock(&self.stats);
            match stats.phase {
                WorkerPhase::Created => stats.phase = WorkerPhase::Stopped,
                WorkerPhase::Running => stats.phase = WorkerPhase::Stopping,
                _ => {}
            }
        }
        info!(worker = %self, "Stopping worker");

        if let Some(consumer) = lock(&self.consumer).as_ref() {
            consumer.interrupt();
        }

        let _guard = self.processing.lock().await;
        self.close_consumer().await;
    }
}

/// Correlation id for replies; the message id when the sender set none
fn correlation_of(envelope: &Envelope) -> &str {
    envelope.correlation_id().unwrap_or(&envelope.id)
}

impl<P: Processor> fmt::Display for Worker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.index)
    }
}
