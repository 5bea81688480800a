//! Redis Streams transport
//!
//! ## Key layout
//!
//! | Destination | Stream | Consumer group |
//! |-------------|--------|----------------|
//! | `Queue(q)` | `q` | shared `queue_group`, reads from the start |
//! | `Topic(t)` | `topic.t` | one group per consumer, new messages only, destroyed on close |
//! | `VirtualTopic(t)` | `VirtualTopic.t` | `Consumer.<name>.VirtualTopic.t`, new messages only |
//! | `Handle(h)` | `h` | shared `queue_group` |
//!
//! Reply destinations are `reply.<uuid>` streams that expire after
//! `reply_ttl_secs`. Replies are read with `XREAD` and deleted once seen.
//!
//! Each consumer owns a dedicated connection for its blocking reads; producers
//! and acknowledgements share one `ConnectionManager`.
//!
//! A consumer reads in this order: its own pending entries (after opening and
//! after a failed acknowledgement), entries claimed from idle consumers, then
//! new entries. Entries that cannot be decoded are acknowledged and dropped.

use super::{Consumer, Producer, Transport, signalled};
use crate::config::RedisTransportConfig;
use crate::destination::Destination;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::marshal::{Payload, PayloadKind};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisResult};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key prefix of allocated reply streams
const REPLY_PREFIX: &str = "reply.";

/// Entries claimed from idle consumers per attempt
const CLAIM_BATCH: usize = 10;

/// `XREAD`/`XREADGROUP` reply: stream name -> entries
type StreamReply = Vec<(String, StreamEntries)>;

/// Stream entries: id -> field/value pairs
type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;

mod field {
    pub const ID: &str = "id";
    pub const HEADERS: &str = "headers";
    pub const KIND: &str = "kind";
    pub const PAYLOAD: &str = "payload";
}

/// Stream key a destination is stored in
pub fn stream_key(destination: &Destination) -> String {
    match destination {
        Destination::Queue(name) | Destination::Handle(name) => name.clone(),
        Destination::Topic(topic) => format!("topic.{}", topic),
        Destination::VirtualTopic(_) => destination.publish_name(),
    }
}

/// Consumer group and start id for a consumer of `destination`
pub fn consumer_group(
    destination: &Destination,
    consumer_name: &str,
    queue_group: &str,
) -> (String, &'static str) {
    match destination {
        Destination::Queue(_) | Destination::Handle(_) => (queue_group.to_string(), "0"),
        Destination::Topic(topic) => (format!("topic.{}.{}", topic, Uuid::new_v4()), "$"),
        Destination::VirtualTopic(_) => (destination.consumer_queue_name(consumer_name), "$"),
    }
}

/// Flatten an envelope into stream fields
pub fn encode_fields(envelope: &Envelope) -> Result<Vec<(&'static str, Vec<u8>)>, TransportError> {
    let mut fields = vec![
        (field::ID, envelope.id.clone().into_bytes()),
        (field::HEADERS, serde_json::to_vec(&envelope.headers)?),
    ];

    if let Some(payload) = &envelope.payload {
        fields.push((field::KIND, payload.kind().to_string().into_bytes()));
        fields.push((field::PAYLOAD, payload.as_bytes().to_vec()));
    }

    Ok(fields)
}

/// Rebuild an envelope from a stream entry
pub fn decode_entry(
    entry_id: &str,
    fields: Vec<(String, Vec<u8>)>,
) -> Result<Envelope, TransportError> {
    let mut id = None;
    let mut headers = BTreeMap::new();
    let mut kind = None;
    let mut payload = None;

    for (name, value) in fields {
        match name.as_str() {
            field::ID => {
                id = Some(
                    String::from_utf8(value).map_err(|e| TransportError::Encoding(e.to_string()))?,
                )
            }
            field::HEADERS => headers = serde_json::from_slice(&value)?,
            field::KIND => {
                let raw = String::from_utf8_lossy(&value);
                kind = Some(raw.parse::<PayloadKind>().map_err(|_| {
                    TransportError::Encoding(format!("unknown payload kind {}", raw))
                })?);
            }
            field::PAYLOAD => payload = Some(value),
            _ => {}
        }
    }

    let payload = match (kind, payload) {
        (Some(kind), Some(bytes)) => Some(
            Payload::from_parts(kind, bytes).map_err(|e| TransportError::Encoding(e.to_string()))?,
        ),
        (None, None) => None,
        _ => {
            return Err(TransportError::Encoding(format!(
                "entry {} has a partial payload",
                entry_id
            )));
        }
    };

    Ok(Envelope {
        id: id.unwrap_or_else(|| entry_id.to_string()),
        headers,
        payload,
        delivery_tag: Some(entry_id.to_string()),
    })
}

fn flatten(reply: StreamReply) -> StreamEntries {
    reply.into_iter().flat_map(|(_, entries)| entries).collect()
}

/// Redis Streams backed transport
#[derive(Clone)]
pub struct RedisTransport {
    client: Client,
    manager: ConnectionManager,
    config: RedisTransportConfig,
    /// Idle connections for blocking reply reads
    reply_connections: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl RedisTransport {
    /// Connect and verify the connection with PING
    pub async fn connect(config: RedisTransportConfig) -> Result<Self, TransportError> {
        info!(url = %config.url, "Connecting Redis transport");

        let client = Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client.clone()).await?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(group = %config.queue_group, "Redis transport ready");
        Ok(Self {
            client,
            manager,
            config,
            reply_connections: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &RedisTransportConfig {
        &self.config
    }

    /// Create the consumer group if it doesn't exist
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: &str,
    ) -> Result<(), TransportError> {
        let mut conn = self.manager.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(TransportError::Redis(e)),
        }
    }

    async fn reply_connection(&self) -> Result<MultiplexedConnection, TransportError> {
        let pooled = self
            .reply_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        match pooled {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn return_reply_connection(&self, conn: MultiplexedConnection) {
        self.reply_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }

    async fn read_reply_with(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let block_ms = (remaining.as_millis() as u64).min(self.config.block_timeout_ms);

            let mut cmd = redis::cmd("XREAD");
            cmd.arg("COUNT").arg(CLAIM_BATCH);
            // BLOCK 0 would wait forever, so an exhausted deadline polls once
            if block_ms > 0 {
                cmd.arg("BLOCK").arg(block_ms);
            }
            cmd.arg("STREAMS").arg(stream).arg("0");

            let reply: Option<StreamReply> = cmd.query_async(conn).await?;
            for (entry_id, fields) in reply.map(flatten).unwrap_or_default() {
                let _: i64 = redis::cmd("XDEL")
                    .arg(stream)
                    .arg(&entry_id)
                    .query_async(conn)
                    .await?;

                match decode_entry(&entry_id, fields) {
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
                    Err(e) => {
                        warn!(entry_id = %entry_id, error = %e, "Discarding unreadable reply")
                    }
                }
            }

            if block_ms == 0 || tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn open_consumer(
        &self,
        destination: &Destination,
        consumer_name: &str,
    ) -> Result<Arc<dyn Consumer>, TransportError> {
        if matches!(destination, Destination::Handle(key) if key.starts_with(REPLY_PREFIX)) {
            return Err(TransportError::InvalidDestination(format!(
                "{} is a reply destination, use read_reply",
                destination
            )));
        }

        let stream = stream_key(destination);
        let (group, start) = consumer_group(destination, consumer_name, &self.config.queue_group);
        self.ensure_group(&stream, &group, start).await?;

        let conn = self.client.get_multiplexed_async_connection().await?;
        let consumer_id = format!("{}-{}", consumer_name, Uuid::new_v4());

        info!(
            stream = %stream,
            group = %group,
            consumer = %consumer_id,
            "Opened Redis consumer"
        );

        let (interrupt, _) = watch::channel(false);
        Ok(Arc::new(RedisConsumer {
            conn: tokio::sync::Mutex::new(conn),
            manager: self.manager.clone(),
            stream,
            group,
            start,
            consumer_id,
            ephemeral_group: matches!(destination, Destination::Topic(_)),
            block_timeout_ms: self.config.block_timeout_ms,
            claim_idle_ms: self.config.claim_idle_ms,
            backlog: Mutex::new(VecDeque::new()),
            own_pending: AtomicBool::new(true),
            last_claim: Mutex::new(None),
            interrupt,
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_producer(
        &self,
        destination: &Destination,
    ) -> Result<Arc<dyn Producer>, TransportError> {
        let reply_ttl_secs = match destination {
            Destination::Handle(key) if key.starts_with(REPLY_PREFIX) => {
                Some(self.config.reply_ttl_secs)
            }
            _ => None,
        };

        Ok(Arc::new(RedisProducer {
            manager: self.manager.clone(),
            stream: stream_key(destination),
            max_length: self.config.max_length,
            reply_ttl_secs,
            closed: AtomicBool::new(false),
        }))
    }

    async fn allocate_reply_destination(&self) -> Result<Destination, TransportError> {
        Ok(Destination::Handle(format!("{}{}", REPLY_PREFIX, Uuid::new_v4())))
    }

    async fn read_reply(
        &self,
        reply_to: &Destination,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError> {
        let stream = match reply_to {
            Destination::Handle(key) => key.clone(),
            other => return Err(TransportError::InvalidDestination(other.to_string())),
        };

        let mut conn = self.reply_connection().await?;
        let result = self
            .read_reply_with(&mut conn, &stream, correlation_id, timeout)
            .await;

        // A failed connection is dropped instead of pooled
        if result.is_ok() {
            self.return_reply_connection(conn);
        }
        result
    }

    async fn release_reply_destination(
        &self,
        reply_to: &Destination,
    ) -> Result<(), TransportError> {
        if let Destination::Handle(key) = reply_to {
            let mut conn = self.manager.clone();
            let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        let mut conn = self.manager.clone();
        let response: String = redis::cmd("PING").query_async(&mut conn).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(TransportError::Encoding(format!("unexpected PING response: {}", response)))
        }
    }
}

struct RedisConsumer {
    /// Dedicated connection for blocking reads
    conn: tokio::sync::Mutex<MultiplexedConnection>,
    manager: ConnectionManager,
    stream: String,
    group: String,
    start: &'static str,
    consumer_id: String,
    /// Topic groups belong to a single consumer and are destroyed on close
    ephemeral_group: bool,
    block_timeout_ms: u64,
    claim_idle_ms: u64,
    /// Own pending and claimed entries, delivered before new ones
    backlog: Mutex<VecDeque<Envelope>>,
    /// Re-read this consumer's pending entries before anything else
    own_pending: AtomicBool,
    last_claim: Mutex<Option<tokio::time::Instant>>,
    interrupt: watch::Sender<bool>,
    closed: AtomicBool,
}

impl RedisConsumer {
    /// Decode entries; undecodable ones are acknowledged so they are not redelivered
    async fn accept(&self, entries: StreamEntries) -> Result<Vec<Envelope>, TransportError> {
        let mut envelopes = Vec::with_capacity(entries.len());
        for (entry_id, fields) in entries {
            match decode_entry(&entry_id, fields) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    warn!(
                        stream = %self.stream,
                        entry_id = %entry_id,
                        error = %e,
                        "Dropping undecodable entry"
                    );
                    self.ack(&entry_id).await?;
                }
            }
        }
        Ok(envelopes)
    }

    async fn ack(&self, entry_id: &str) -> Result<(), TransportError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn push_backlog(&self, envelopes: Vec<Envelope>) -> Option<Envelope> {
        let mut backlog = self
            .backlog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        backlog.extend(envelopes);
        backlog.pop_front()
    }

    /// Entries delivered to this consumer and not yet acknowledged
    async fn read_own_pending(&self) -> Result<Vec<Envelope>, TransportError> {
        let mut conn = self.manager.clone();
        let result: RedisResult<Option<StreamReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg("COUNT")
            .arg(CLAIM_BATCH)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg("0")
            .query_async(&mut conn)
            .await;

        let entries = match result {
            Ok(reply) => reply.map(flatten).unwrap_or_default(),
            Err(e) if e.to_string().contains("NOGROUP") => Vec::new(),
            Err(e) => return Err(TransportError::Redis(e)),
        };
        if entries.len() < CLAIM_BATCH {
            self.own_pending.store(false, Ordering::SeqCst);
        }

        // entries deleted from the stream come back without fields
        let (deleted, entries): (StreamEntries, StreamEntries) =
            entries.into_iter().partition(|(_, fields)| fields.is_empty());
        for (entry_id, _) in deleted {
            self.ack(&entry_id).await?;
        }
        self.accept(entries).await
    }

    fn claim_due(&self) -> bool {
        let mut last = self
            .last_claim
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = tokio::time::Instant::now();
        let due = match *last {
            None => true,
            Some(at) => now.duration_since(at) >= Duration::from_millis(self.claim_idle_ms),
        };
        if due {
            *last = Some(now);
        }
        due
    }

    /// Claim entries other consumers left pending for longer than `claim_idle_ms`
    async fn claim_abandoned(&self) -> Result<Vec<Envelope>, TransportError> {
        let mut conn = self.manager.clone();

        let pending: RedisResult<Vec<(String, String, i64, i64)>> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(CLAIM_BATCH)
            .query_async(&mut conn)
            .await;

        let pending = match pending {
            Ok(p) => p,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(vec![]),
            Err(e) => return Err(TransportError::Redis(e)),
        };

        let claim_ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, owner, idle_ms, _)| {
                owner != &self.consumer_id && *idle_ms > self.claim_idle_ms as i64
            })
            .map(|(id, _, _, _)| id)
            .collect();

        if claim_ids.is_empty() {
            return Ok(vec![]);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg(self.claim_idle_ms);
        for id in &claim_ids {
            cmd.arg(id);
        }

        let entries: StreamEntries = cmd.query_async(&mut conn).await?;
        let envelopes = self.accept(entries).await?;
        if !envelopes.is_empty() {
            warn!(
                stream = %self.stream,
                count = envelopes.len(),
                "Claimed abandoned messages"
            );
        }
        Ok(envelopes)
    }

    /// One bounded read; `None` when nothing arrived within the block timeout
    async fn read_next(&self) -> Result<Option<Envelope>, TransportError> {
        if let Some(envelope) = self.push_backlog(Vec::new()) {
            return Ok(Some(envelope));
        }

        if self.own_pending.load(Ordering::SeqCst) {
            let pending = self.read_own_pending().await?;
            if !pending.is_empty() {
                debug!(
                    stream = %self.stream,
                    count = pending.len(),
                    "Redelivering own pending entries"
                );
            }
            if let Some(envelope) = self.push_backlog(pending) {
                return Ok(Some(envelope));
            }
        }

        if self.claim_due() {
            let claimed = self.claim_abandoned().await?;
            if let Some(envelope) = self.push_backlog(claimed) {
                return Ok(Some(envelope));
            }
        }

        let mut conn = self.conn.lock().await;
        let result: RedisResult<Option<StreamReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.block_timeout_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut *conn)
            .await;
        drop(conn);

        match result {
            Ok(reply) => {
                let envelopes = self.accept(reply.map(flatten).unwrap_or_default()).await?;
                Ok(envelopes.into_iter().next())
            }
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!(
                    stream = %self.stream,
                    group = %self.group,
                    "Consumer group missing, recreating"
                );
                self.recreate_group().await?;
                Ok(None)
            }
            Err(e) => Err(TransportError::Redis(e)),
        }
    }

    async fn recreate_group(&self) -> Result<(), TransportError> {
        let mut conn = self.manager.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(self.start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(TransportError::Redis(e)),
        }
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    async fn receive(&self) -> Result<Option<Envelope>, TransportError> {
        loop {
            if self.closed.load(Ordering::SeqCst) || *self.interrupt.borrow() {
                return Ok(None);
            }

            tokio::select! {
                biased;
                _ = signalled(self.interrupt.subscribe()) => return Ok(None),
                result = self.read_next() => {
                    if let Some(envelope) = result? {
                        return Ok(Some(envelope));
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let Some(entry_id) = envelope.delivery_tag.as_deref() else {
            return Err(TransportError::Encoding(format!(
                "envelope {} has no delivery tag",
                envelope.id
            )));
        };

        if let Err(e) = self.ack(entry_id).await {
            // the entry stays pending for this consumer; read it again next
            self.own_pending.store(true, Ordering::SeqCst);
            return Err(e);
        }

        debug!(stream = %self.stream, entry_id = %entry_id, "Acknowledged message");
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

        if self.ephemeral_group {
            let mut conn = self.manager.clone();
            let _: i64 = redis::cmd("XGROUP")
                .arg("DESTROY")
                .arg(&self.stream)
                .arg(&self.group)
                .query_async(&mut conn)
                .await?;
            debug!(stream = %self.stream, group = %self.group, "Destroyed topic group");
        }

        Ok(())
    }
}

struct RedisProducer {
    manager: ConnectionManager,
    stream: String,
    max_length: usize,
    /// Set for reply streams, refreshed on every send
    reply_ttl_secs: Option<u64>,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for RedisProducer {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(format!("producer for {}", self.stream)));
        }

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*");
        for (name, value) in encode_fields(&envelope)? {
            cmd.arg(name).arg(value);
        }

        let mut conn = self.manager.clone();
        let entry_id: String = cmd.query_async(&mut conn).await?;

        if let Some(ttl) = self.reply_ttl_secs {
            let _: i64 = redis::cmd("EXPIRE")
                .arg(&self.stream)
                .arg(ttl)
                .query_async(&mut conn)
                .await?;
        }

        debug!(stream = %self.stream, entry_id = %entry_id, id = %envelope.id, "Sent message");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
