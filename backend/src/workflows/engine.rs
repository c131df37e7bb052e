// Workflow Engine - Owns the execution state machine
//
// Creates an execution from a (workflow, lead, trigger) tuple: gates it on
// the workflow's active flag, the idempotency invariant and the condition
// evaluator, then materializes the full action batch in one transaction and
// hands the execution to the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::actions::{Action, ActionTemplate};
use super::conditions::{ConditionEvaluator, ConditionGroup};
use super::snapshot::LeadSnapshot;
use super::store::{StoreError, WorkflowStore};
use super::triggers::{Trigger, TriggerKind};
use super::worker::WorkerHandle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trigger_kind: TriggerKind,
    pub conditions: Option<ConditionGroup>,
    pub actions: Vec<ActionTemplate>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Possible statuses for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One run of a workflow for one lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub lead_id: i64,
    pub trigger_kind: TriggerKind,
    pub trigger_payload: serde_json::Value,
    pub lead_snapshot: LeadSnapshot,
    pub status: ExecutionStatus,
    pub actions_completed: i32,
    pub actions_failed: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("lead {0} not found")]
    LeadNotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why an execute-workflow call was skipped rather than created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    WorkflowInactive,
    ConditionsNotMet,
    ExecutionInProgress,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowInactive => "workflow_inactive",
            Self::ConditionsNotMet => "conditions_not_met",
            Self::ExecutionInProgress => "execution_in_progress",
        }
    }
}

/// Outcome of an execute-workflow call. Always definite and synchronous
/// even though the action processing itself happens in the background.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Created {
        execution_id: Uuid,
        workflow_name: String,
    },
    Skipped(SkipReason),
}

/// Execution statistics for a workflow, over its most recent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub workflow_id: Uuid,
    pub total_executions: i64,
    pub completed: i64,
    pub failed: i64,
    pub success_rate_pct: f64,
    pub avg_execution_time_ms: Option<i64>,
}

/// Result of a pending-action sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSweep {
    pub executions_queued: usize,
    pub actions_total: usize,
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    evaluator: Arc<dyn ConditionEvaluator>,
    workers: WorkerHandle,
    sweep_batch_size: i64,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        evaluator: Arc<dyn ConditionEvaluator>,
        workers: WorkerHandle,
        sweep_batch_size: i64,
    ) -> Self {
        Self {
            store,
            evaluator,
            workers,
            sweep_batch_size,
        }
    }

    /// Execute a workflow for a specific lead.
    ///
    /// Gating order: existence, active flag, idempotency, conditions.
    /// `force` bypasses the active flag and the condition gate but never
    /// the idempotency invariant. The execution row and all of its actions
    /// are written in a single transaction; a failure there leaves nothing
    /// behind.
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        lead_id: i64,
        trigger: Trigger,
        force: bool,
    ) -> Result<ExecutionOutcome, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let snapshot = self
            .store
            .get_lead_snapshot(lead_id)
            .await?
            .ok_or(EngineError::LeadNotFound(lead_id))?;

        if !workflow.is_active && !force {
            warn!("Workflow '{}' is inactive, skipping", workflow.name);
            return Ok(ExecutionOutcome::Skipped(SkipReason::WorkflowInactive));
        }

        // At most one non-terminal execution per (workflow, lead).
        if !force {
            if let Some(open_id) = self.store.find_open_execution(workflow_id, lead_id).await? {
                info!(
                    "Execution {} already in progress for workflow '{}' and lead {}",
                    open_id, workflow.name, lead_id
                );
                return Ok(ExecutionOutcome::Skipped(SkipReason::ExecutionInProgress));
            }
        }

        if !force {
            // Fail closed: an unreachable evaluator never lets a workflow run.
            let conditions_met = match self.evaluator.evaluate(workflow_id, lead_id).await {
                Ok(met) => met,
                Err(e) => {
                    warn!(
                        "Condition evaluation failed for workflow '{}': {}, treating as not met",
                        workflow.name, e
                    );
                    false
                }
            };

            if !conditions_met {
                info!("Conditions not met for workflow '{}'", workflow.name);
                return Ok(ExecutionOutcome::Skipped(SkipReason::ConditionsNotMet));
            }
        }

        let now = Utc::now();
        let execution = Execution {
            id: Uuid::new_v4(),
            workflow_id,
            lead_id,
            trigger_kind: trigger.kind,
            trigger_payload: trigger.payload,
            lead_snapshot: snapshot,
            status: ExecutionStatus::Pending,
            actions_completed: 0,
            actions_failed: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };

        let actions: Vec<Action> = workflow
            .actions
            .iter()
            .enumerate()
            .map(|(i, template)| Action::materialize(execution.id, i as i32, template, now))
            .collect();

        self.store.create_execution(&execution, &actions).await?;

        info!(
            "Created execution {} for workflow '{}' with {} actions",
            execution.id,
            workflow.name,
            actions.len()
        );

        // Hand off to the worker pool without blocking the caller. A full
        // queue is fine: the pending-action sweep picks the execution up.
        if !self.workers.dispatch(execution.id) {
            warn!(
                "Worker queue full, execution {} deferred to the pending sweep",
                execution.id
            );
        }

        Ok(ExecutionOutcome::Created {
            execution_id: execution.id,
            workflow_name: workflow.name,
        })
    }

    /// Recover actions whose scheduling loop was interrupted: pending
    /// actions past their due time are grouped by execution and re-queued,
    /// preserving the sequential-per-execution discipline.
    pub async fn process_pending(&self) -> Result<PendingSweep, EngineError> {
        let due = self
            .store
            .due_pending_actions(Utc::now(), self.sweep_batch_size)
            .await?;

        if due.is_empty() {
            return Ok(PendingSweep {
                executions_queued: 0,
                actions_total: 0,
            });
        }

        let actions_total = due.len();
        let executions: HashSet<Uuid> = due.iter().map(|a| a.execution_id).collect();

        let mut queued = 0;
        for execution_id in &executions {
            if self.workers.dispatch(*execution_id) {
                queued += 1;
            } else {
                warn!(
                    "Worker queue full, execution {} left for the next sweep",
                    execution_id
                );
            }
        }

        info!(
            "Pending sweep queued {} executions covering {} actions",
            queued, actions_total
        );

        Ok(PendingSweep {
            executions_queued: queued,
            actions_total,
        })
    }

    /// Execution statistics over a workflow's most recent runs.
    pub async fn workflow_stats(&self, workflow_id: Uuid) -> Result<WorkflowStats, EngineError> {
        self.store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let recent = self.store.recent_executions(workflow_id, 100).await?;

        let total = recent.len() as i64;
        let completed = recent
            .iter()
            .filter(|e| e.status == ExecutionStatus::Completed)
            .count() as i64;
        let failed = recent
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count() as i64;

        let durations: Vec<i64> = recent
            .iter()
            .filter_map(|e| match (e.started_at, e.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            })
            .collect();

        let avg_execution_time_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() / durations.len() as i64)
        };

        Ok(WorkflowStats {
            workflow_id,
            total_executions: total,
            completed,
            failed,
            success_rate_pct: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_execution_time_ms,
        })
    }
}
