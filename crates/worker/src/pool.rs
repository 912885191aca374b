//! Worker pool: spawns and supervises N dispatch workers per node.

use crate::worker::{DispatchWorker, WorkerContext};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    node_id: String,
    count: usize,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, node_id: impl Into<String>, count: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            node_id: node_id.into(),
            count,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn all workers.
    pub fn start(&mut self) {
        for i in 0..self.count {
            let worker_id = format!("{}-worker-{:02}", self.node_id, i);
            let worker = DispatchWorker::new(worker_id.clone(), self.ctx.clone());
            self.handles.push(worker.spawn(self.shutdown.subscribe()));
            info!(worker_id = %worker_id, "Worker spawned");
        }

        metrics::gauge!("dispatch.workers").set(self.handles.len() as f64);
        info!(count = self.count, node = %self.node_id, "All dispatch workers started");
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Ask every worker to stop after settling the item in hand.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for all workers to exit.
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        metrics::gauge!("dispatch.workers").set(0.0);
    }

    pub async fn stop(mut self) {
        self.shutdown();
        self.wait().await;
        info!(node = %self.node_id, "Worker pool stopped");
    }
}
