//! Worker pools
//!
//! A `Supervisor` runs `count` workers of one definition, each on its own
//! task and consumer. Stopping the pool stops every worker and waits for all
//! tasks to finish.

use crate::config::WorkerOptions;
use crate::definition::WorkerDefinition;
use crate::error::WorkerError;
use crate::marshal::MarshalRegistry;
use crate::processor::Processor;
use crate::transport::Transport;
use crate::worker::{Worker, WorkerStatus};
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Supervisor<P: Processor> {
    definition: WorkerDefinition,
    workers: Vec<Arc<Worker<P>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<Result<(), WorkerError>>>>,
}

impl<P: Processor> Supervisor<P> {
    /// Build `count` workers sharing one processor
    pub fn new(
        definition: WorkerDefinition,
        processor: Arc<P>,
        count: usize,
        options: WorkerOptions,
        transport: Arc<dyn Transport>,
        registry: Arc<MarshalRegistry>,
    ) -> Result<Self, WorkerError> {
        definition.validate()?;
        definition.resolve_dead_letter(&options)?;

        let workers = (0..count)
            .map(|index| {
                Worker::new(
                    &definition,
                    index,
                    processor.clone(),
                    transport.clone(),
                    registry.clone(),
                    options.clone(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            definition,
            workers,
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn definition(&self) -> &WorkerDefinition {
        &self.definition
    }

    pub fn workers(&self) -> &[Arc<Worker<P>>] {
        &self.workers
    }

    /// Spawn a task per worker; no-op when already started
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        info!(
            worker = %self.definition.name,
            count = self.workers.len(),
            "Starting workers"
        );

        for worker in &self.workers {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(e) = &result {
                    error!(worker = %worker, error = %e, "Worker exited with error");
                }
                result
            }));
        }
    }

    /// Stop all workers and wait for their tasks
    pub async fn stop(&self) {
        join_all(self.workers.iter().map(|worker| worker.stop())).await;

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(worker = %self.definition.name, error = %e, "Worker task panicked");
            }
        }

        info!(worker = %self.definition.name, "Workers stopped");
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(|worker| worker.status()).collect()
    }
}
