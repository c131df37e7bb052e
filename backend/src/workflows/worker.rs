// Worker Pool - Bounded pool draining the execution queue
//
// Replaces fire-and-forget background tasks with an explicit pool: a
// bounded queue provides back-pressure (a rejected enqueue is recovered by
// the pending-action sweep) and shutdown drains in-flight executions.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::scheduler::ActionScheduler;

/// Cloneable enqueue side of the pool. Holds only a weak sender so that
/// shutting the pool down closes the queue even while handles are alive.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::WeakSender<Uuid>,
}

impl WorkerHandle {
    /// Queue an execution for processing. Returns false when the queue is
    /// full or the pool is shut down; callers treat that as back-pressure,
    /// not an error.
    pub fn dispatch(&self, execution_id: Uuid) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.try_send(execution_id).is_ok(),
            None => false,
        }
    }
}

pub struct WorkerPool {
    tx: mpsc::Sender<Uuid>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(scheduler: Arc<ActionScheduler>, worker_count: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Uuid>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let scheduler = scheduler.clone();

                tokio::spawn(async move {
                    loop {
                        let next = { rx.lock().await.recv().await };
                        match next {
                            Some(execution_id) => {
                                if let Err(e) = scheduler.run_execution(execution_id).await {
                                    error!(
                                        "Worker {} failed on execution {}: {}",
                                        worker_id, execution_id, e
                                    );
                                }
                            }
                            None => break,
                        }
                    }
                    info!("Worker {} drained and stopped", worker_id);
                })
            })
            .collect();

        info!(
            "Worker pool started: {} workers, queue capacity {}",
            worker_count.max(1),
            queue_capacity.max(1)
        );

        Self { tx, workers }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            tx: self.tx.downgrade(),
        }
    }

    /// Close the queue and wait for workers to finish what they hold.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Worker pool shut down");
    }
}
