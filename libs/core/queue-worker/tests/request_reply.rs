//! Request/response over the in-memory transport, driven through the public API

use async_trait::async_trait;
use queue_worker::{
    Destination, Manager, MarshalRegistry, MemoryTransport, ProcessingError, Processor,
    PublishOptions, Publisher, Response, ResponseError, WorkerDefinition, WorkerOptions,
    WorkerPhase,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use test_utils::assertions::assert_duration_near;
use tokio::time::Instant;

struct Doubler;

#[async_trait]
impl Processor for Doubler {
    type Request = i64;
    type Response = i64;

    async fn perform(&self, request: i64) -> Result<i64, ProcessingError> {
        Ok(request * 2)
    }

    fn name(&self) -> &'static str {
        "Doubler"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Quote {
    sku: String,
    cents: u64,
}

struct Pricing;

#[async_trait]
impl Processor for Pricing {
    type Request = String;
    type Response = Quote;

    async fn perform(&self, sku: String) -> Result<Quote, ProcessingError> {
        if sku.is_empty() {
            return Err(ProcessingError::with_kind("UnknownSku", "empty sku"));
        }
        Ok(Quote { sku, cents: 1299 })
    }

    fn name(&self) -> &'static str {
        "Pricing"
    }
}

fn setup() -> (Arc<MemoryTransport>, Arc<MarshalRegistry>) {
    (
        Arc::new(MemoryTransport::new()),
        Arc::new(MarshalRegistry::new()),
    )
}

/// Yield until every worker has opened its consumer
async fn wait_running(manager: &Manager) {
    for _ in 0..100 {
        if manager
            .statuses()
            .iter()
            .all(|status| status.phase == WorkerPhase::Running)
        {
            tokio::task::yield_now().await;
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("workers did not start: {:?}", manager.statuses());
}

#[tokio::test]
async fn test_single_reply() {
    let (transport, registry) = setup();
    let mut manager = Manager::new(transport.clone(), registry.clone());
    manager
        .add(WorkerDefinition::new("Calc"), Doubler, 2, WorkerOptions::default())
        .unwrap();
    manager.start_all().await;

    let publisher = Publisher::new(transport, registry, Destination::queue("Calc"));
    let handle = publisher.request(&21).await.unwrap();
    let response = handle
        .read_response::<i64>(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(response, Response::Message(42));
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_worker_times_out_at_deadline() {
    let (transport, registry) = setup();
    let publisher = Publisher::new(transport.clone(), registry, Destination::queue("Nobody"));

    let started = Instant::now();
    let handle = publisher.request(&21).await.unwrap();
    let response = handle
        .read_response::<i64>(Duration::from_secs(5))
        .await
        .unwrap();

    assert!(response.is_timed_out());
    assert_duration_near(
        started.elapsed(),
        Duration::from_secs(5),
        Duration::from_millis(50),
        "read_response deadline",
    );
    // The request stays queued for a worker that may still come
    assert_eq!(transport.depth(&Destination::queue("Nobody")), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_returns_immediately() {
    let (transport, registry) = setup();
    let publisher = Publisher::new(transport, registry, Destination::queue("Nobody"));

    let started = Instant::now();
    let handle = publisher.request(&1).await.unwrap();
    let response = handle.read_response::<i64>(Duration::ZERO).await.unwrap();

    assert!(response.is_timed_out());
    assert!(started.elapsed() < Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_fan_in_with_missing_worker() {
    let (transport, registry) = setup();
    let mut manager = Manager::new(transport.clone(), registry.clone());
    manager
        .add(
            WorkerDefinition::new("Pricing").with_topic("catalog"),
            Pricing,
            1,
            WorkerOptions::default(),
        )
        .unwrap();
    manager.start_all().await;
    wait_running(&manager).await;

    let publisher = Publisher::new(transport, registry, Destination::topic("catalog"));
    let handle = publisher.request("sku-1").await.unwrap();

    let mut quotes = Vec::new();
    let mut timed_out = Vec::new();
    let (quotes_out, timed_out_out) = (&mut quotes, &mut timed_out);
    handle
        .read_responses(Duration::from_secs(2), move |r| {
            r.on_message(&["Pricing", "Inventory"], move |ctx, quote: Quote| {
                quotes_out.push((ctx.name.clone(), quote));
            });
            r.on_timeout(&["Inventory"], move |ctx| {
                timed_out_out.push(ctx.name.clone())
            });
        })
        .await
        .unwrap();

    assert_eq!(
        quotes,
        vec![(
            "Pricing".to_string(),
            Quote {
                sku: "sku-1".to_string(),
                cents: 1299
            }
        )]
    );
    assert_eq!(timed_out, vec!["Inventory".to_string()]);
    manager.stop_all().await;
}

#[tokio::test]
async fn test_fan_in_remote_exception_without_handler_is_an_error() {
    let (transport, registry) = setup();
    let mut manager = Manager::new(transport.clone(), registry.clone());
    manager
        .add(
            WorkerDefinition::new("Pricing").with_virtual_topic("catalog"),
            Pricing,
            1,
            WorkerOptions::default(),
        )
        .unwrap();
    manager.start_all().await;
    wait_running(&manager).await;

    let publisher = Publisher::new(transport, registry, Destination::virtual_topic("catalog"));
    let handle = publisher.request("").await.unwrap();

    let err = handle
        .read_responses(Duration::from_secs(5), |r| {
            r.on_message(&["Pricing"], |_, _: Quote| {});
        })
        .await
        .unwrap_err();

    match err {
        ResponseError::Remote { worker, exception } => {
            assert_eq!(worker, "Pricing");
            assert_eq!(exception.kind, "UnknownSku");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    manager.stop_all().await;
}

#[tokio::test]
async fn test_virtual_topic_shares_one_queue_per_worker_kind() {
    let (transport, registry) = setup();
    let mut manager = Manager::new(transport.clone(), registry.clone());
    manager
        .add(
            WorkerDefinition::new("Calc").with_virtual_topic("numbers"),
            Doubler,
            3,
            WorkerOptions::default(),
        )
        .unwrap();
    manager.start_all().await;
    wait_running(&manager).await;

    let publisher = Publisher::new(transport, registry, Destination::virtual_topic("numbers"));
    for n in 0..6 {
        publisher.send(&n).await.unwrap();
    }

    // Each message is handled by exactly one of the pool's workers
    for _ in 0..100 {
        let total: u64 = manager.statuses().iter().map(|s| s.message_count).sum();
        if total == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.stop_all().await;

    let total: u64 = manager.statuses().iter().map(|s| s.message_count).sum();
    assert_eq!(total, 6);
}

#[tokio::test]
async fn test_custom_marshal_round_trip() {
    let (transport, registry) = setup();
    let mut manager = Manager::new(transport.clone(), registry.clone());
    manager
        .add(WorkerDefinition::new("Calc"), Doubler, 1, WorkerOptions::default())
        .unwrap();
    manager.start_all().await;

    let publisher = Publisher::new(transport, registry, Destination::queue("Calc"))
        .with_marshal("json")
        .unwrap();
    let handle = publisher
        .publish(
            &5,
            PublishOptions::new()
                .with_header("x-tenant", "acme")
                .with_reply(),
        )
        .await
        .unwrap()
        .unwrap();

    let mut replies = HashMap::new();
    let replies_out = &mut replies;
    handle
        .read_responses(Duration::from_secs(5), move |r| {
            r.on_message(&["Calc"], move |ctx, value: i64| {
                replies_out.insert(ctx.name.clone(), value);
            });
        })
        .await
        .unwrap();

    assert_eq!(replies.get("Calc"), Some(&10));
    manager.stop_all().await;
}
