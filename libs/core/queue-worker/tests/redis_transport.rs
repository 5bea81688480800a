//! Redis Streams transport against a real server
//!
//! Run with: cargo test -p queue-worker --test redis_transport -- --ignored

use async_trait::async_trait;
use queue_worker::transport::redis::stream_key;
use queue_worker::{
    Destination, Envelope, Manager, MarshalRegistry, Payload, ProcessingError, Processor,
    Publisher, RedisTransport, RedisTransportConfig, Response, Transport, WorkerDefinition,
    WorkerOptions,
};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRedis};

struct Doubler;

#[async_trait]
impl Processor for Doubler {
    type Request = i64;
    type Response = i64;

    async fn perform(&self, request: i64) -> Result<i64, ProcessingError> {
        if request < 0 {
            return Err(ProcessingError::with_kind("NegativeInput", "negative input"));
        }
        Ok(request * 2)
    }

    fn name(&self) -> &'static str {
        "Doubler"
    }
}

async fn connect(redis: &TestRedis, builder: &TestDataBuilder) -> Arc<RedisTransport> {
    let config = RedisTransportConfig::new(redis.url())
        .with_queue_group(builder.queue_name("group", "workers"))
        .with_block_timeout_ms(100);
    Arc::new(RedisTransport::connect(config).await.unwrap())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_request_reply_over_streams() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_request_reply_over_streams");
    let transport = connect(&redis, &builder).await;
    let registry = Arc::new(MarshalRegistry::new());

    let worker = builder.worker_name("Calc");
    let queue = builder.queue_name("calc", "main");
    let mut manager = Manager::new(transport.clone(), registry.clone());
    manager
        .add(
            WorkerDefinition::new(&worker).with_queue(&queue),
            Doubler,
            2,
            WorkerOptions::default(),
        )
        .unwrap();
    manager.start_all().await;

    let publisher = Publisher::new(transport.clone(), registry, Destination::queue(&queue));
    let handle = publisher.request(&21).await.unwrap();
    let reply_key = stream_key(handle.reply_to());
    let response = handle
        .read_response::<i64>(Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(response, Response::Message(42));

    // Reply streams are deleted once read
    assert_eq!(redis.stream_len(&reply_key).await, 0);

    manager.stop_all().await;
    assert!(transport.health_check().await.is_ok());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_fault_is_dead_lettered() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_fault_is_dead_lettered");
    let transport = connect(&redis, &builder).await;
    let registry = Arc::new(MarshalRegistry::new());

    let worker = builder.worker_name("Calc");
    let mut manager = Manager::new(transport.clone(), registry.clone());
    manager
        .add(WorkerDefinition::new(&worker), Doubler, 1, WorkerOptions::default())
        .unwrap();
    manager.start_all().await;

    let publisher = Publisher::new(transport.clone(), registry, Destination::queue(&worker));
    publisher.send(&-1).await.unwrap();

    let failure_key = stream_key(&Destination::queue(format!("{}Failure", worker)));
    for _ in 0..50 {
        if redis.stream_len(&failure_key).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    manager.stop_all().await;
    assert_eq!(redis.stream_len(&failure_key).await, 1);
    assert_eq!(manager.statuses()[0].error_count, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reply_times_out_without_worker() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_reply_times_out_without_worker");
    let transport = connect(&redis, &builder).await;

    let publisher = Publisher::new(
        transport.clone(),
        Arc::new(MarshalRegistry::new()),
        Destination::queue(builder.queue_name("calc", "idle")),
    );
    let handle = publisher.request(&1).await.unwrap();
    let response = handle
        .read_response::<i64>(Duration::from_millis(500))
        .await
        .unwrap();

    assert!(response.is_timed_out());
}

/// Count of entries delivered to `group` and not yet acknowledged
async fn pending_count(redis: &TestRedis, stream: &str, group: &str) -> usize {
    let mut conn = redis.connection();
    let summary: (usize, Option<String>, Option<String>, Option<Vec<(String, String)>>) =
        redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .unwrap();
    summary.0
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_undecodable_entry_is_acknowledged() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_undecodable_entry_is_acknowledged");
    let transport = connect(&redis, &builder).await;
    let group = builder.queue_name("group", "workers");
    let queue = Destination::queue(builder.queue_name("calc", "main"));
    let key = stream_key(&queue);

    // A payload without its kind field cannot be rebuilt
    let mut conn = redis.connection();
    let _: String = redis::cmd("XADD")
        .arg(&key)
        .arg("*")
        .arg("id")
        .arg("broken")
        .arg("payload")
        .arg("42")
        .query_async(&mut conn)
        .await
        .unwrap();

    let consumer = transport.open_consumer(&queue, "calc").await.unwrap();
    let producer = transport.open_producer(&queue).await.unwrap();
    let valid = Envelope::new(Payload::Text("21".into()));
    producer.send(valid.clone()).await.unwrap();

    let received = consumer.receive().await.unwrap().unwrap();
    assert_eq!(received.id, valid.id);
    consumer.acknowledge(&received).await.unwrap();

    assert_eq!(pending_count(&redis, &key, &group).await, 0);
    consumer.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_entry_is_redelivered_after_failed_acknowledge() {
    let redis = TestRedis::new().await;
    let builder =
        TestDataBuilder::from_test_name("test_entry_is_redelivered_after_failed_acknowledge");
    let transport = connect(&redis, &builder).await;
    let queue = Destination::queue(builder.queue_name("calc", "main"));

    let consumer = transport.open_consumer(&queue, "calc").await.unwrap();
    let producer = transport.open_producer(&queue).await.unwrap();
    let first = Envelope::new(Payload::Text("1".into()));
    let second = Envelope::new(Payload::Text("2".into()));
    producer.send(first.clone()).await.unwrap();
    producer.send(second.clone()).await.unwrap();

    let received = consumer.receive().await.unwrap().unwrap();
    assert_eq!(received.id, first.id);

    let mut bogus = received.clone();
    bogus.delivery_tag = Some("not-an-entry-id".to_string());
    assert!(consumer.acknowledge(&bogus).await.is_err());

    // The unacknowledged entry comes back before anything new
    let again = consumer.receive().await.unwrap().unwrap();
    assert_eq!(again.id, first.id);
    consumer.acknowledge(&again).await.unwrap();

    let next = consumer.receive().await.unwrap().unwrap();
    assert_eq!(next.id, second.id);
    consumer.acknowledge(&next).await.unwrap();
    consumer.close().await.unwrap();
}
