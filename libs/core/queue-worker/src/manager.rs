//! Orchestration of worker pools
//!
//! The `Manager` hosts one `Supervisor` per worker definition, all sharing a
//! transport and a marshal registry. Build it, `add` the pools, then share it
//! behind an `Arc` with the health router.

use crate::config::WorkerOptions;
use crate::definition::WorkerDefinition;
use crate::error::WorkerError;
use crate::marshal::MarshalRegistry;
use crate::processor::Processor;
use crate::supervisor::Supervisor;
use crate::transport::Transport;
use crate::worker::WorkerStatus;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Type-erased view of a supervisor
#[async_trait]
pub trait ManagedPool: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self);

    async fn stop(&self);

    fn statuses(&self) -> Vec<WorkerStatus>;
}

#[async_trait]
impl<P: Processor> ManagedPool for Supervisor<P> {
    fn name(&self) -> &str {
        &self.definition().name
    }

    async fn start(&self) {
        Supervisor::start(self).await
    }

    async fn stop(&self) {
        Supervisor::stop(self).await
    }

    fn statuses(&self) -> Vec<WorkerStatus> {
        Supervisor::statuses(self)
    }
}

pub struct Manager {
    transport: Arc<dyn Transport>,
    registry: Arc<MarshalRegistry>,
    pools: Vec<Box<dyn ManagedPool>>,
    allowed_workers: Option<HashSet<String>>,
}

impl Manager {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<MarshalRegistry>) -> Self {
        Self {
            transport,
            registry,
            pools: Vec::new(),
            allowed_workers: None,
        }
    }

    /// Only accept definitions whose name is in `names`
    pub fn with_allowed_workers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_workers = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<MarshalRegistry> {
        &self.registry
    }

    /// Add a pool of `count` workers for `definition`
    pub fn add<P: Processor>(
        &mut self,
        definition: WorkerDefinition,
        processor: P,
        count: usize,
        options: WorkerOptions,
    ) -> Result<(), WorkerError> {
        if let Some(allowed) = &self.allowed_workers
            && !allowed.contains(&definition.name)
        {
            return Err(WorkerError::config(format!(
                "worker {} is not in the allowed worker list",
                definition.name
            )));
        }

        if self.pools.iter().any(|pool| pool.name() == definition.name) {
            return Err(WorkerError::config(format!(
                "worker {} is already registered",
                definition.name
            )));
        }

        info!(
            worker = %definition.name,
            destination = %definition.destination,
            count,
            "Registered worker pool"
        );

        let supervisor = Supervisor::new(
            definition,
            Arc::new(processor),
            count,
            options,
            self.transport.clone(),
            self.registry.clone(),
        )?;
        self.pools.push(Box::new(supervisor));
        Ok(())
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.pools.iter().map(|pool| pool.name().to_string()).collect()
    }

    pub async fn start_all(&self) {
        info!(pools = self.pools.len(), transport = self.transport.name(), "Starting all workers");
        for pool in &self.pools {
            pool.start().await;
        }
    }

    /// Stop every pool concurrently and wait for all workers
    pub async fn stop_all(&self) {
        info!("Stopping all workers");
        join_all(self.pools.iter().map(|pool| pool.stop())).await;
        info!("All workers stopped");
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.pools.iter().flat_map(|pool| pool.statuses()).collect()
    }
}
