// Background Jobs - Periodic pending-action sweep
//
// Jobs are scheduled with tokio-cron-scheduler. The sweep recovers actions
// whose execution-level scheduling loop was interrupted (process restart,
// full worker queue) and re-queues them on the worker pool.

use std::sync::Arc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};

use crate::workflows::WorkflowEngine;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
}

pub type JobResult<T> = Result<T, JobError>;

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<WorkflowEngine>,
    sweep_interval_minutes: u32,
}

impl JobScheduler {
    pub async fn new(engine: Arc<WorkflowEngine>, sweep_interval_minutes: u32) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            sweep_interval_minutes: sweep_interval_minutes.max(1),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_pending_sweep().await?;
        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_pending_sweep(&self) -> JobResult<()> {
        let interval = self.sweep_interval_minutes;
        let cron_expr = format!("0 */{} * * * *", interval);

        let engine = self.engine.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                match engine.process_pending().await {
                    Ok(sweep) => {
                        if sweep.actions_total > 0 {
                            info!(
                                "Pending sweep: {} executions queued, {} actions due",
                                sweep.executions_queued, sweep.actions_total
                            );
                        }
                    }
                    Err(e) => {
                        error!("Pending sweep failed: {}", e);
                    }
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled pending-action sweep every {} minutes", interval);

        Ok(())
    }

    /// Run the sweep immediately, outside its schedule.
    pub async fn run_sweep_now(&self) -> JobResult<()> {
        self.engine
            .process_pending()
            .await
            .map_err(|e| JobError::ExecutionError(e.to_string()))?;
        Ok(())
    }
}
