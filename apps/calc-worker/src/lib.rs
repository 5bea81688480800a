//! Calc Worker Service
//!
//! Hosts a pool of `Calc` workers answering arithmetic requests.
//!
//! ## Architecture
//!
//! ```text
//! Publisher (request + x-reply-to)
//!   ↓
//! Queue "Calc" (memory or Redis Streams)
//!   ↓
//! Supervisor<CalcProcessor> x CALC_WORKER_COUNT
//!   ↓                       ↘ faults
//! reply.<uuid>               CalcFailure
//! ```
//!
//! A request is a bare number, which is doubled, a single-operand operation
//! `{"op": "double", "value": 21}`, or an operation over a list of operands
//! `{"op": "add", "args": [1, 2, 3]}`.

use async_trait::async_trait;
use axum::Router;
use core_config::server::HealthServerConfig;
use core_config::{ConfigError, Environment, FromEnv, env_or_default, env_parse};
use eyre::{Result, WrapErr};
use queue_worker::{
    HealthState, Manager, MarshalRegistry, MemoryTransport, ProcessingError, Processor,
    RedisTransport, RedisTransportConfig, Transport, WorkerDefinition, WorkerError, WorkerOptions,
    health_router, init_metrics,
};
use serde::Deserialize;
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Worker kind name; also the queue it consumes
pub const CALC_WORKER: &str = "Calc";

/// Arithmetic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CalcOp {
    Double,
    Square,
    Add,
    Divide,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CalcRequest {
    /// Shorthand for `double`
    Number(i64),
    Unary { op: CalcOp, value: i64 },
    Op { op: CalcOp, args: Vec<i64> },
}

pub struct CalcProcessor;

impl CalcProcessor {
    fn single(op: CalcOp, args: &[i64]) -> Result<i64, ProcessingError> {
        match args {
            [value] => Ok(*value),
            _ => Err(ProcessingError::InvalidRequest(format!(
                "{} takes exactly one argument, got {}",
                op,
                args.len()
            ))),
        }
    }

    fn overflow(op: CalcOp) -> ProcessingError {
        ProcessingError::with_kind("Overflow", format!("{} overflowed", op))
    }

    pub fn evaluate(request: &CalcRequest) -> Result<i64, ProcessingError> {
        let (op, args) = match request {
            CalcRequest::Number(value) => (CalcOp::Double, std::slice::from_ref(value)),
            CalcRequest::Unary { op, value } => (*op, std::slice::from_ref(value)),
            CalcRequest::Op { op, args } => (*op, args.as_slice()),
        };

        match op {
            CalcOp::Double => Self::single(op, args)?
                .checked_mul(2)
                .ok_or_else(|| Self::overflow(op)),
            CalcOp::Square => {
                let value = Self::single(op, args)?;
                value.checked_mul(value).ok_or_else(|| Self::overflow(op))
            }
            CalcOp::Add => args
                .iter()
                .try_fold(0i64, |sum, value| sum.checked_add(*value))
                .ok_or_else(|| Self::overflow(op)),
            CalcOp::Divide => match args {
                [_, 0] => Err(ProcessingError::with_kind(
                    "ZeroDivisionError",
                    "divided by 0",
                )),
                [dividend, divisor] => Ok(dividend / divisor),
                _ => Err(ProcessingError::InvalidRequest(format!(
                    "divide takes two arguments, got {}",
                    args.len()
                ))),
            },
        }
    }
}

#[async_trait]
impl Processor for CalcProcessor {
    type Request = CalcRequest;
    type Response = i64;

    async fn perform(&self, request: CalcRequest) -> Result<i64, ProcessingError> {
        Self::evaluate(&request)
    }

    fn name(&self) -> &'static str {
        "CalcProcessor"
    }
}

/// Message backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum QueueBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct CalcWorkerConfig {
    pub backend: QueueBackend,
    pub worker_count: usize,
    pub health: HealthServerConfig,
}

impl FromEnv for CalcWorkerConfig {
    /// - QUEUE_BACKEND: memory | redis (default memory)
    /// - CALC_WORKER_COUNT: default 2
    /// - HEALTH_HOST / HEALTH_PORT: see `HealthServerConfig`
    fn from_env() -> Result<Self, ConfigError> {
        let raw = env_or_default("QUEUE_BACKEND", "memory");
        let backend = raw.parse().map_err(|_| ConfigError::ParseError {
            key: "QUEUE_BACKEND".to_string(),
            details: format!("unknown backend '{}', expected memory or redis", raw),
        })?;

        Ok(Self {
            backend,
            worker_count: env_parse("CALC_WORKER_COUNT", 2)?,
            health: HealthServerConfig::from_env()?,
        })
    }
}

/// Connect the configured backend
pub async fn connect_transport(backend: QueueBackend) -> Result<Arc<dyn Transport>> {
    match backend {
        QueueBackend::Memory => {
            info!("Using in-memory transport");
            Ok(Arc::new(MemoryTransport::new()))
        }
        QueueBackend::Redis => {
            let config = RedisTransportConfig::from_env()
                .wrap_err("Failed to load Redis transport configuration")?;
            let transport = RedisTransport::connect(config)
                .await
                .wrap_err("Failed to connect to Redis")?;
            Ok(Arc::new(transport))
        }
    }
}

/// Manager hosting the `Calc` pool
pub fn build_manager(
    transport: Arc<dyn Transport>,
    registry: Arc<MarshalRegistry>,
    worker_count: usize,
) -> Result<Manager, WorkerError> {
    let mut manager = Manager::new(transport, registry);
    manager.add(
        WorkerDefinition::new(CALC_WORKER),
        CalcProcessor,
        worker_count,
        WorkerOptions::default(),
    )?;
    Ok(manager)
}

/// Start the health and metrics HTTP server
async fn start_health_server(state: HealthState, config: HealthServerConfig) -> Result<()> {
    let app: Router = health_router(state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the calc worker until SIGINT or SIGTERM
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    init_metrics();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, environment = ?environment, "Starting calc worker service");

    let config = CalcWorkerConfig::from_env().wrap_err("Failed to load configuration")?;
    info!(
        backend = %config.backend,
        workers = config.worker_count,
        "Worker configuration loaded"
    );

    let transport = connect_transport(config.backend).await?;
    let registry = Arc::new(MarshalRegistry::new());
    let manager = Arc::new(
        build_manager(transport, registry, config.worker_count)
            .wrap_err("Failed to build worker manager")?,
    );

    let health_state = HealthState::new(manager.clone(), name, version);
    let health_config = config.health.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    manager.start_all().await;

    if let Err(e) = shutdown_signal().await {
        error!(error = %e, "Error waiting for shutdown signal");
    }

    manager.stop_all().await;
    info!("Calc worker service stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_worker::{
        Destination, PublishOptions, Publisher, Response, ResponseError, WorkerPhase,
    };
    use std::time::Duration;

    fn op(op: CalcOp, args: &[i64]) -> CalcRequest {
        CalcRequest::Op {
            op,
            args: args.to_vec(),
        }
    }

    #[test]
    fn test_evaluate() {
        assert_eq!(CalcProcessor::evaluate(&CalcRequest::Number(21)).unwrap(), 42);
        assert_eq!(CalcProcessor::evaluate(&op(CalcOp::Square, &[9])).unwrap(), 81);
        assert_eq!(CalcProcessor::evaluate(&op(CalcOp::Add, &[1, 2, 3])).unwrap(), 6);
        assert_eq!(CalcProcessor::evaluate(&op(CalcOp::Divide, &[9, 2])).unwrap(), 4);
    }

    #[test]
    fn test_evaluate_faults() {
        let err = CalcProcessor::evaluate(&op(CalcOp::Divide, &[1, 0])).unwrap_err();
        assert_eq!(err.kind(), "ZeroDivisionError");

        let err = CalcProcessor::evaluate(&op(CalcOp::Square, &[1, 2])).unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");

        let err = CalcProcessor::evaluate(&CalcRequest::Number(i64::MAX)).unwrap_err();
        assert_eq!(err.kind(), "Overflow");
    }

    #[test]
    fn test_request_shapes() {
        let number: CalcRequest = serde_json::from_str("21").unwrap();
        assert_eq!(number, CalcRequest::Number(21));

        let add: CalcRequest = serde_json::from_str(r#"{"op":"add","args":[1,2]}"#).unwrap();
        assert_eq!(add, op(CalcOp::Add, &[1, 2]));

        let double: CalcRequest = serde_json::from_str(r#"{"op":"double","value":21}"#).unwrap();
        assert_eq!(
            double,
            CalcRequest::Unary {
                op: CalcOp::Double,
                value: 21
            }
        );
        assert_eq!(CalcProcessor::evaluate(&double).unwrap(), 42);

        let divide: CalcRequest = serde_json::from_str(r#"{"op":"divide","value":4}"#).unwrap();
        assert_eq!(CalcProcessor::evaluate(&divide).unwrap_err().kind(), "InvalidRequest");

        assert!(serde_json::from_str::<CalcRequest>(r#"{"op":"pow","args":[1]}"#).is_err());
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("QUEUE_BACKEND", None),
                ("CALC_WORKER_COUNT", Some("4")),
                ("HEALTH_PORT", None),
            ],
            || {
                let config = CalcWorkerConfig::from_env().unwrap();
                assert_eq!(config.backend, QueueBackend::Memory);
                assert_eq!(config.worker_count, 4);
                assert_eq!(config.health.port, 8082);
            },
        );

        temp_env::with_var("QUEUE_BACKEND", Some("Redis"), || {
            assert_eq!(CalcWorkerConfig::from_env().unwrap().backend, QueueBackend::Redis);
        });

        temp_env::with_var("QUEUE_BACKEND", Some("kafka"), || {
            let err = CalcWorkerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("QUEUE_BACKEND"));
        });
    }

    async fn started_manager(transport: Arc<MemoryTransport>, count: usize) -> Arc<Manager> {
        let manager = Arc::new(
            build_manager(transport, Arc::new(MarshalRegistry::new()), count).unwrap(),
        );
        manager.start_all().await;
        manager
    }

    fn publisher(transport: Arc<MemoryTransport>) -> Publisher {
        Publisher::new(
            transport,
            Arc::new(MarshalRegistry::new()),
            Destination::queue(CALC_WORKER),
        )
    }

    #[tokio::test]
    async fn test_calc_doubles_end_to_end() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = started_manager(transport.clone(), 2).await;
        let publisher = publisher(transport);

        let handle = publisher.request(&21).await.unwrap();
        let response = handle
            .read_response::<i64>(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, Response::Message(42));

        let handle = publisher
            .publish(
                &serde_json::json!({"op": "add", "args": [40, 2]}),
                PublishOptions::new().with_marshal("json").with_reply(),
            )
            .await
            .unwrap()
            .unwrap();
        let response = handle
            .read_response::<i64>(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, Response::Message(42));

        let handle = publisher
            .request(&serde_json::json!({"op": "double", "value": 21}))
            .await
            .unwrap();
        let response = handle
            .read_response::<i64>(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, Response::Message(42));

        manager.stop_all().await;
        let statuses = manager.statuses();
        assert_eq!(statuses.iter().map(|s| s.message_count).sum::<u64>(), 3);
        assert!(statuses.iter().all(|s| s.phase == WorkerPhase::Stopped));
    }

    #[tokio::test]
    async fn test_calc_fault_reaches_requester_and_dead_letter_queue() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = started_manager(transport.clone(), 1).await;
        let publisher = publisher(transport.clone());

        let handle = publisher
            .request(&serde_json::json!({"op": "divide", "args": [1, 0]}))
            .await
            .unwrap();
        let err = handle
            .read_response::<i64>(Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ResponseError::Remote { worker, exception } => {
                assert_eq!(worker, CALC_WORKER);
                assert_eq!(exception.kind, "ZeroDivisionError");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        manager.stop_all().await;
        assert_eq!(transport.depth(&Destination::queue("CalcFailure")), 1);
        assert_eq!(manager.statuses()[0].error_count, 1);
    }
}
