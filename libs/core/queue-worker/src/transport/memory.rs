//! In-process transport
//!
//! Destinations are in-memory mailboxes:
//! - queues and handles keep messages until a consumer takes them
//! - topics copy each message to every consumer open at send time
//! - virtual topics copy each message to one shared mailbox per consumer name
//! - reply destinations hand replies straight to the waiting reader
//!
//! Consumers track unacknowledged deliveries and put them back at the head of
//! a retaining mailbox when closed.

use super::{Consumer, Producer, Transport, signalled};
use crate::destination::Destination;
use crate::envelope::Envelope;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, trace};
use uuid::Uuid;

/// Key prefix of allocated reply destinations
const REPLY_PREFIX: &str = "reply.";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// FIFO of envelopes with async wake-up
#[derive(Default)]
struct Mailbox {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Mailbox {
    fn push(&self, envelope: Envelope) {
        lock(&self.messages).push_back(envelope);
        self.notify.notify_one();
    }

    /// Put envelopes back at the head, keeping their relative order
    fn requeue(&self, envelopes: Vec<Envelope>) {
        let count = envelopes.len();
        {
            let mut messages = lock(&self.messages);
            for envelope in envelopes.into_iter().rev() {
                messages.push_front(envelope);
            }
        }
        for _ in 0..count {
            self.notify.notify_one();
        }
    }

    fn try_pop(&self) -> Option<Envelope> {
        lock(&self.messages).pop_front()
    }

    async fn pop(&self) -> Envelope {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.try_pop() {
                return envelope;
            }

            notified.await;
        }
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }
}

#[derive(Default)]
struct Broker {
    /// Queue and plain handle mailboxes, keyed by destination
    queues: HashMap<Destination, Arc<Mailbox>>,
    /// topic -> subscriber id -> mailbox
    topics: HashMap<String, HashMap<u64, Arc<Mailbox>>>,
    /// topic -> consumer queue name -> mailbox
    virtual_topics: HashMap<String, HashMap<String, Arc<Mailbox>>>,
    /// allocated reply key -> mailbox
    replies: HashMap<String, Arc<Mailbox>>,
    next_subscriber: u64,
}

impl Broker {
    fn queue(&mut self, destination: &Destination) -> Arc<Mailbox> {
        self.queues
            .entry(destination.clone())
            .or_default()
            .clone()
    }

    /// Mailboxes a message sent to `destination` lands in
    fn targets(&mut self, destination: &Destination) -> Vec<Arc<Mailbox>> {
        match destination {
            Destination::Queue(_) => vec![self.queue(destination)],
            Destination::Handle(key) => {
                if let Some(mailbox) = self.replies.get(key) {
                    vec![mailbox.clone()]
                } else if key.starts_with(REPLY_PREFIX) {
                    // Requester already gave up on this reply destination
                    Vec::new()
                } else {
                    vec![self.queue(destination)]
                }
            }
            Destination::Topic(topic) => self
                .topics
                .get(topic)
                .map(|subscribers| subscribers.values().cloned().collect())
                .unwrap_or_default(),
            Destination::VirtualTopic(topic) => self
                .virtual_topics
                .get(topic)
                .map(|consumers| consumers.values().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// In-process transport for tests and single-process deployments
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Mutex<Broker>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting in a queue or handle destination
    pub fn depth(&self, destination: &Destination) -> usize {
        let broker = lock(&self.broker);
        match destination {
            Destination::Handle(key) if broker.replies.contains_key(key) => {
                broker.replies[key].len()
            }
            _ => broker
                .queues
                .get(destination)
                .map(|mailbox| mailbox.len())
                .unwrap_or(0),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_consumer(
        &self,
        destination: &Destination,
        consumer_name: &str,
    ) -> Result<Arc<dyn Consumer>, TransportError> {
        let mut broker = lock(&self.broker);

        let (mailbox, subscription) = match destination {
            Destination::Handle(key) if broker.replies.contains_key(key) => {
                return Err(TransportError::InvalidDestination(format!(
                    "{} is a reply destination, use read_reply",
                    destination
                )));
            }
            Destination::Queue(_) | Destination::Handle(_) => (broker.queue(destination), None),
            Destination::Topic(topic) => {
                let id = broker.next_subscriber;
                broker.next_subscriber += 1;
                let mailbox: Arc<Mailbox> = Arc::default();
                broker
                    .topics
                    .entry(topic.clone())
                    .or_default()
                    .insert(id, mailbox.clone());
                (mailbox, Some((topic.clone(), id)))
            }
            Destination::VirtualTopic(topic) => {
                let queue_name = destination.consumer_queue_name(consumer_name);
                let mailbox = broker
                    .virtual_topics
                    .entry(topic.clone())
                    .or_default()
                    .entry(queue_name)
                    .or_default()
                    .clone();
                (mailbox, None)
            }
        };

        debug!(
            destination = %destination,
            consumer = %consumer_name,
            "Opened in-memory consumer"
        );

        let (interrupt, _) = watch::channel(false);
        Ok(Arc::new(MemoryConsumer {
            broker: self.broker.clone(),
            mailbox,
            subscription,
            interrupt,
            in_flight: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_producer(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn Producer>, TransportError> {
        Ok(Arc::new(MemoryProducer {
            broker: self.broker.clone(),
            destination: destination.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn allocate_reply_destination(&self) -> Result<Destination, TransportError> {
        let key = format!("{}{}", REPLY_PREFIX, Uuid::new_v4());
        lock(&self.broker)
            .replies
            .insert(key.clone(), Arc::default());
        Ok(Destination::Handle(key))
    }

    async fn read_reply(
        &self,
        reply_to: &Destination,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError> {
        let mailbox = match reply_to {
            Destination::Handle(key) => lock(&self.broker).replies.get(key).cloned(),
            _ => None,
        }
        .ok_or_else(|| TransportError::InvalidDestination(reply_to.to_string()))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, mailbox.pop()).await {
                Err(_) => return Ok(None),
                Ok(envelope) if envelope.correlation_id() == Some(correlation_id) => {
                    return Ok(Some(envelope));
                }
                Ok(envelope) => {
                    debug!(
                        expected = %correlation_id,
                        received = ?envelope.correlation_id(),
                        "Discarding reply for another request"
                    );
                }
            }
        }
    }

    async fn release_reply_destination(
        &self,
        reply_to: &Destination,
    ) -> Result<(), TransportError> {
        if let Destination::Handle(key) = reply_to {
            lock(&self.broker).replies.remove(key);
        }
        Ok(())
    }
}

struct MemoryConsumer {
    broker: Arc<Mutex<Broker>>,
    mailbox: Arc<Mailbox>,
    /// Topic subscription to remove on close
    subscription: Option<(String, u64)>,
    interrupt: watch::Sender<bool>,
    /// Unacknowledged deliveries in receive order
    in_flight: Mutex<Vec<Envelope>>,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&self) -> Result<Option<Envelope>, TransportError> {
        if self.closed.load(Ordering::SeqCst) || *self.interrupt.borrow() {
            return Ok(None);
        }

        let mut envelope = tokio::select! {
            biased;
            _ = signalled(self.interrupt.subscribe()) => return Ok(None),
            envelope = self.mailbox.pop() => envelope,
        };

        envelope.delivery_tag = Some(Uuid::new_v4().to_string());
        lock(&self.in_flight).push(envelope.clone());
        trace!(id = %envelope.id, "Delivered in-memory message");
        Ok(Some(envelope))
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut in_flight = lock(&self.in_flight);
        let before = in_flight.len();
        in_flight.retain(|pending| pending.delivery_tag != envelope.delivery_tag);
        if in_flight.len() == before {
            debug!(id = %envelope.id, "Acknowledge for unknown delivery ignored");
        }
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupt.send_replace(true);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.interrupt();

        let unacked: Vec<Envelope> = lock(&self.in_flight)
            .drain(..)
            .map(|mut envelope| {
                envelope.delivery_tag = None;
                envelope
            })
            .collect();

        match &self.subscription {
            Some((topic, id)) => {
                let mut broker = lock(&self.broker);
                if let Some(subscribers) = broker.topics.get_mut(topic) {
                    subscribers.remove(id);
                    if subscribers.is_empty() {
                        broker.topics.remove(topic);
                    }
                }
            }
            None if !unacked.is_empty() => {
                debug!(count = unacked.len(), "Requeueing unacknowledged messages");
                self.mailbox.requeue(unacked);
            }
            None => {}
        }

        Ok(())
    }
}

struct MemoryProducer {
    broker: Arc<Mutex<Broker>>,
    destination: Destination,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(format!(
                "producer for {}",
                self.destination
            )));
        }

        let targets = lock(&self.broker).targets(&self.destination);
        if targets.is_empty() {
            debug!(
                destination = %self.destination,
                id = %envelope.id,
                "No receivers, message dropped"
            );
            return Ok(());
        }

        let mut envelope = envelope;
        envelope.delivery_tag = None;
        for mailbox in targets {
            mailbox.push(envelope.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::headers;
    use crate::marshal::Payload;

    fn text(body: &str) -> Envelope {
        Envelope::new(Payload::Text(body.to_string()))
    }

    fn body(envelope: &Envelope) -> String {
        envelope.payload.as_ref().unwrap().as_text_lossy()
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let transport = MemoryTransport::new();
        let dest = Destination::queue("jobs");
        let producer = transport.open_producer(&dest).await.unwrap();
        for i in 0..3 {
            producer.send(text(&i.to_string())).await.unwrap();
        }
        assert_eq!(transport.depth(&dest), 3);

        let consumer = transport.open_consumer(&dest, "jobs").await.unwrap();
        for i in 0..3 {
            let envelope = consumer.receive().await.unwrap().unwrap();
            assert_eq!(body(&envelope), i.to_string());
            consumer.acknowledge(&envelope).await.unwrap();
        }
        assert_eq!(transport.depth(&dest), 0);
    }

    #[tokio::test]
    async fn test_close_requeues_unacknowledged() {
        let transport = MemoryTransport::new();
        let dest = Destination::queue("jobs");
        let producer = transport.open_producer(&dest).await.unwrap();
        producer.send(text("first")).await.unwrap();
        producer.send(text("second")).await.unwrap();

        let consumer = transport.open_consumer(&dest, "jobs").await.unwrap();
        let first = consumer.receive().await.unwrap().unwrap();
        let second = consumer.receive().await.unwrap().unwrap();
        consumer.acknowledge(&second).await.unwrap();
        consumer.close().await.unwrap();
        consumer.close().await.unwrap();

        assert_eq!(transport.depth(&dest), 1);
        let again = transport.open_consumer(&dest, "jobs").await.unwrap();
        let redelivered = again.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.id, first.id);
        assert_eq!(body(&redelivered), "first");
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_receive() {
        let transport = MemoryTransport::new();
        let consumer = transport
            .open_consumer(&Destination::queue("idle"), "idle")
            .await
            .unwrap();

        let waiting = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.receive().await })
        };
        tokio::task::yield_now().await;

        consumer.interrupt();
        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_none());

        // Sticky after interruption
        assert!(consumer.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_open_consumers() {
        let transport = MemoryTransport::new();
        let dest = Destination::topic("prices");
        let a = transport.open_consumer(&dest, "a").await.unwrap();
        let b = transport.open_consumer(&dest, "b").await.unwrap();

        let producer = transport.open_producer(&dest).await.unwrap();
        producer.send(text("tick")).await.unwrap();

        assert_eq!(body(&a.receive().await.unwrap().unwrap()), "tick");
        assert_eq!(body(&b.receive().await.unwrap().unwrap()), "tick");

        b.close().await.unwrap();
        producer.send(text("tock")).await.unwrap();
        assert_eq!(body(&a.receive().await.unwrap().unwrap()), "tock");
    }

    #[tokio::test]
    async fn test_virtual_topic_shares_queue_per_consumer_name() {
        let transport = MemoryTransport::new();
        let dest = Destination::virtual_topic("orders");
        let billing_1 = transport.open_consumer(&dest, "Billing").await.unwrap();
        let billing_2 = transport.open_consumer(&dest, "Billing").await.unwrap();
        let shipping = transport.open_consumer(&dest, "Shipping").await.unwrap();

        let producer = transport.open_producer(&dest).await.unwrap();
        producer.send(text("o-1")).await.unwrap();
        producer.send(text("o-2")).await.unwrap();

        // Billing instances compete, Shipping gets its own copy of each
        let first = billing_1.receive().await.unwrap().unwrap();
        let second = billing_2.receive().await.unwrap().unwrap();
        assert_eq!(body(&first), "o-1");
        assert_eq!(body(&second), "o-2");

        assert_eq!(body(&shipping.receive().await.unwrap().unwrap()), "o-1");
        assert_eq!(body(&shipping.receive().await.unwrap().unwrap()), "o-2");
    }

    #[tokio::test]
    async fn test_reply_hand_off_filters_by_correlation_id() {
        let transport = MemoryTransport::new();
        let reply_to = transport.allocate_reply_destination().await.unwrap();
        let producer = transport.open_producer(&reply_to).await.unwrap();

        producer
            .send(text("stale").with_header(headers::CORRELATION_ID, "old"))
            .await
            .unwrap();
        producer
            .send(text("fresh").with_header(headers::CORRELATION_ID, "new"))
            .await
            .unwrap();

        let reply = transport
            .read_reply(&reply_to, "new", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body(&reply), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_reply_times_out() {
        let transport = MemoryTransport::new();
        let reply_to = transport.allocate_reply_destination().await.unwrap();

        let started = tokio::time::Instant::now();
        let reply = transport
            .read_reply(&reply_to, "id", Duration::from_secs(3))
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_released_reply_destination_drops_replies() {
        let transport = MemoryTransport::new();
        let reply_to = transport.allocate_reply_destination().await.unwrap();
        transport.release_reply_destination(&reply_to).await.unwrap();

        let producer = transport.open_producer(&reply_to).await.unwrap();
        producer.send(text("late")).await.unwrap();
        assert_eq!(transport.depth(&reply_to), 0);
        assert!(
            transport
                .read_reply(&reply_to, "id", Duration::ZERO)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_closed_producer_rejects_send() {
        let transport = MemoryTransport::new();
        let producer = transport
            .open_producer(&Destination::queue("jobs"))
            .await
            .unwrap();
        producer.close().await.unwrap();
        assert!(matches!(
            producer.send(text("x")).await,
            Err(TransportError::Closed(_))
        ));
    }
}
