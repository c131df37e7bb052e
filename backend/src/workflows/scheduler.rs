// Action Scheduler - Orders and times the release of an execution's actions
//
// One execution at a time per call, strictly in scheduled_for order, with a
// timer-based suspension until each action's due time. Concurrency across
// executions comes from the worker pool running many of these loops at once.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use uuid::Uuid;

use super::actions::ActionStatus;
use super::dispatcher::{ActionDispatcher, ActionOutcome};
use super::engine::{EngineError, ExecutionStatus};
use super::store::WorkflowStore;

/// Longest suspension served inline by a pooled worker. Anything further
/// out is left pending for the periodic sweep, freeing the worker for
/// other executions.
const MAX_INLINE_SUSPENSION: Duration = Duration::from_secs(120);

pub struct ActionScheduler {
    store: Arc<dyn WorkflowStore>,
    dispatcher: ActionDispatcher,
}

impl ActionScheduler {
    pub fn new(store: Arc<dyn WorkflowStore>, dispatcher: ActionDispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Drive one execution to completion: release each pending action no
    /// earlier than its due time, dispatch it, and recompute the aggregate
    /// status once every action is terminal.
    ///
    /// Safe to call concurrently for the same execution (e.g. the sweep
    /// racing the creation-time loop): every transition is compare-and-set,
    /// so each action is dispatched at most once.
    pub async fn run_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            warn!("Execution {} no longer exists, skipping", execution_id);
            return Ok(());
        };

        if execution.status.is_terminal() {
            return Ok(());
        }

        self.store
            .transition_execution(execution_id, ExecutionStatus::Pending, ExecutionStatus::Running)
            .await?;

        let actions = self.store.actions_for_execution(execution_id).await?;

        let run = async {
            for action in &actions {
                if action.status != ActionStatus::Pending {
                    continue;
                }

                let due = action.due_at();
                let now = Utc::now();
                if due > now {
                    let wait = (due - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if wait > MAX_INLINE_SUSPENSION {
                        info!(
                            "Action '{}' due in {:?}, deferring to the pending sweep",
                            action.name, wait
                        );
                        return Ok(());
                    }
                    info!(
                        "Action '{}' due in {:?}, suspending",
                        action.name, wait
                    );
                    sleep(wait).await;
                }

                // A handler failure is recorded on the action and the loop
                // moves on; only store faults abort the run.
                match self.dispatcher.execute(action, &execution.lead_snapshot).await? {
                    ActionOutcome::Completed(_) => {}
                    ActionOutcome::Failed(reason) => {
                        warn!(
                            "Action '{}' of execution {} failed: {}",
                            action.name, execution_id, reason
                        );
                    }
                    ActionOutcome::AlreadyClaimed => {
                        info!(
                            "Action '{}' of execution {} claimed elsewhere",
                            action.name, execution_id
                        );
                    }
                }
            }

            self.finalize(execution_id).await
        };

        if let Err(e) = run.await {
            warn!("Execution {} aborted: {}", execution_id, e);
            self.store
                .fail_execution(execution_id, &e.to_string())
                .await?;
            return Err(e);
        }

        Ok(())
    }

    /// Recompute the execution's aggregate status once all actions are
    /// terminal. Failed actions are counted, not fatal: the execution still
    /// completes.
    async fn finalize(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let actions = self.store.actions_for_execution(execution_id).await?;

        if !actions.iter().all(|a| a.status.is_terminal()) {
            // Another loop still owns some of the actions; whoever finishes
            // the last one closes the execution out.
            return Ok(());
        }

        let completed = actions
            .iter()
            .filter(|a| a.status == ActionStatus::Completed)
            .count() as i32;
        let failed = actions
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .count() as i32;

        if self
            .store
            .finish_execution(execution_id, completed, failed)
            .await?
        {
            info!(
                "Execution {} completed: {} actions completed, {} failed",
                execution_id, completed, failed
            );
        }

        Ok(())
    }
}
