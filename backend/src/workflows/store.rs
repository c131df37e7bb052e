// Workflow Store - Persistence port for the workflow engine
//
// Every component takes the `WorkflowStore` trait, never a concrete pool,
// so the engine runs unchanged against Postgres in production and an
// in-memory fake in tests. All status transitions are compare-and-set:
// the sweep-based recovery path may race the in-memory scheduling loop for
// the same action, and exactly one of them may win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Map;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use nurture_shared::{Developer, Lead, MessageDelivery, MessageTemplate, Property, Task};

use super::actions::{Action, ActionStatus};
use super::engine::{Execution, ExecutionStatus, WorkflowDefinition};
use super::snapshot::LeadSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt stored row: {0}")]
    Corrupt(String),

    #[error("rejected write: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Read-only projection of the lead and its related entities, captured
    /// once per execution.
    async fn get_lead_snapshot(&self, lead_id: i64) -> Result<Option<LeadSnapshot>, StoreError>;

    /// Id of a non-terminal execution for this (workflow, lead), if any.
    async fn find_open_execution(
        &self,
        workflow_id: Uuid,
        lead_id: i64,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Persist an execution together with its full action batch in one
    /// transaction. A failure must leave neither behind.
    async fn create_execution(
        &self,
        execution: &Execution,
        actions: &[Action],
    ) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Transition an execution's status only if it currently matches
    /// `from`. Returns whether the transition was applied.
    async fn transition_execution(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError>;

    /// Close out a running execution with its final action counts.
    async fn finish_execution(
        &self,
        id: Uuid,
        actions_completed: i32,
        actions_failed: i32,
    ) -> Result<bool, StoreError>;

    /// Mark an execution failed (infrastructure fault in its run loop).
    async fn fail_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// All actions of an execution in dispatch order.
    async fn actions_for_execution(&self, execution_id: Uuid) -> Result<Vec<Action>, StoreError>;

    /// Transition an action's status only if it currently matches `from`.
    /// Returns whether the transition was applied.
    async fn transition_action(
        &self,
        id: Uuid,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, StoreError>;

    async fn complete_action(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        external_message_id: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn fail_action(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Pending actions due at or before `now`, oldest first, bounded.
    async fn due_pending_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Action>, StoreError>;

    async fn recent_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Execution>, StoreError>;

    async fn get_message_template(&self, id: Uuid)
        -> Result<Option<MessageTemplate>, StoreError>;

    /// Append-only delivery log.
    async fn insert_delivery(&self, delivery: &MessageDelivery) -> Result<(), StoreError>;

    /// Apply a field map to the lead's mutable record. Only whitelisted
    /// fields are writable; anything else is a rejected write.
    async fn update_lead_fields(
        &self,
        lead_id: i64,
        updates: &Map<String, serde_json::Value>,
    ) -> Result<(), StoreError>;

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;
}

/// Lead record fields a workflow is allowed to mutate.
pub const WRITABLE_LEAD_FIELDS: &[&str] = &["status", "priority_tier", "next_best_action", "score"];

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    trigger_kind: String,
    conditions: Option<serde_json::Value>,
    actions: serde_json::Value,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRow> for WorkflowDefinition {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, StoreError> {
        Ok(WorkflowDefinition {
            id: row.id,
            name: row.name,
            description: row.description,
            trigger_kind: row
                .trigger_kind
                .parse()
                .map_err(StoreError::Corrupt)?,
            conditions: row
                .conditions
                .map(serde_json::from_value)
                .transpose()?,
            actions: serde_json::from_value(row.actions)?,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    lead_id: i64,
    trigger_kind: String,
    trigger_payload: serde_json::Value,
    lead_snapshot: serde_json::Value,
    status: String,
    actions_completed: i32,
    actions_failed: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, StoreError> {
        Ok(Execution {
            id: row.id,
            workflow_id: row.workflow_id,
            lead_id: row.lead_id,
            trigger_kind: row.trigger_kind.parse().map_err(StoreError::Corrupt)?,
            trigger_payload: row.trigger_payload,
            lead_snapshot: serde_json::from_value(row.lead_snapshot)?,
            status: ExecutionStatus::from_str(&row.status).map_err(StoreError::Corrupt)?,
            actions_completed: row.actions_completed,
            actions_failed: row.actions_failed,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActionRow {
    id: Uuid,
    execution_id: Uuid,
    position: i32,
    name: String,
    kind: serde_json::Value,
    scheduled_for: DateTime<Utc>,
    status: String,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    external_message_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ActionRow> for Action {
    type Error = StoreError;

    fn try_from(row: ActionRow) -> Result<Self, StoreError> {
        Ok(Action {
            id: row.id,
            execution_id: row.execution_id,
            position: row.position,
            name: row.name,
            kind: serde_json::from_value(row.kind)?,
            scheduled_for: row.scheduled_for,
            status: ActionStatus::from_str(&row.status).map_err(StoreError::Corrupt)?,
            result: row.result,
            error_message: row.error_message,
            external_message_id: row.external_message_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

const WORKFLOW_COLUMNS: &str = "id, name, description, trigger_kind, conditions, actions, \
                                is_active, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, workflow_id, lead_id, trigger_kind, trigger_payload, \
                                 lead_snapshot, status, actions_completed, actions_failed, \
                                 error_message, created_at, started_at, completed_at";

const ACTION_COLUMNS: &str = "id, execution_id, position, name, kind, scheduled_for, status, \
                              result, error_message, external_message_id, started_at, completed_at";

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowDefinition::try_from).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowDefinition::try_from).collect()
    }

    async fn get_lead_snapshot(&self, lead_id: i64) -> Result<Option<LeadSnapshot>, StoreError> {
        let lead = sqlx::query_as::<_, Lead>(
            "SELECT id, property_id, name, email, phone, source, score, priority_tier, \
             next_best_action, status, created_at, updated_at FROM leads WHERE id = $1",
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(lead) = lead else {
            return Ok(None);
        };

        let property = match lead.property_id {
            Some(property_id) => {
                sqlx::query_as::<_, Property>(
                    "SELECT id, developer_id, title, property_type, price, locality, city, \
                     bedrooms, area_sqft, created_at FROM properties WHERE id = $1",
                )
                .bind(property_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => None,
        };

        let developer = match &property {
            Some(property) => {
                sqlx::query_as::<_, Developer>(
                    "SELECT id, name, company_name, contact_email, created_at \
                     FROM developers WHERE id = $1",
                )
                .bind(property.developer_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => None,
        };

        Ok(Some(LeadSnapshot::from_parts(
            &lead,
            property.as_ref(),
            developer.as_ref(),
        )))
    }

    async fn find_open_execution(
        &self,
        workflow_id: Uuid,
        lead_id: i64,
    ) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM workflow_executions \
             WHERE workflow_id = $1 AND lead_id = $2 AND status IN ('pending', 'running') \
             LIMIT 1",
        )
        .bind(workflow_id)
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn create_execution(
        &self,
        execution: &Execution,
        actions: &[Action],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO workflow_executions \
             (id, workflow_id, lead_id, trigger_kind, trigger_payload, lead_snapshot, status, \
              actions_completed, actions_failed, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 0, $8)",
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.lead_id)
        .bind(execution.trigger_kind.as_str())
        .bind(&execution.trigger_payload)
        .bind(serde_json::to_value(&execution.lead_snapshot)?)
        .bind(execution.status.as_str())
        .bind(execution.created_at)
        .execute(&mut *tx)
        .await?;

        for action in actions {
            sqlx::query(
                "INSERT INTO workflow_actions \
                 (id, execution_id, position, name, kind, scheduled_for, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(action.id)
            .bind(action.execution_id)
            .bind(action.position)
            .bind(&action.name)
            .bind(serde_json::to_value(&action.kind)?)
            .bind(action.scheduled_for)
            .bind(action.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Execution::try_from).transpose()
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_executions \
             SET status = $3, \
                 started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, NOW()) \
                                   ELSE started_at END \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        actions_completed: i32,
        actions_failed: i32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_executions \
             SET status = 'completed', completed_at = NOW(), \
                 actions_completed = $2, actions_failed = $3 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(actions_completed)
        .bind(actions_failed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_execution(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_executions \
             SET status = 'failed', error_message = $2, completed_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn actions_for_execution(&self, execution_id: Uuid) -> Result<Vec<Action>, StoreError> {
        let rows = sqlx::query_as::<_, ActionRow>(&format!(
            "SELECT {ACTION_COLUMNS} FROM workflow_actions \
             WHERE execution_id = $1 ORDER BY scheduled_for ASC, position ASC"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Action::try_from).collect()
    }

    async fn transition_action(
        &self,
        id: Uuid,
        from: ActionStatus,
        to: ActionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_actions \
             SET status = $3, \
                 started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, NOW()) \
                                   ELSE started_at END \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_action(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        external_message_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_actions \
             SET status = 'completed', result = $2, \
                 external_message_id = COALESCE($3, external_message_id), \
                 completed_at = NOW() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(result)
        .bind(external_message_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_action(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_actions \
             SET status = 'failed', error_message = $2, completed_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn due_pending_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Action>, StoreError> {
        let rows = sqlx::query_as::<_, ActionRow>(&format!(
            "SELECT {ACTION_COLUMNS} FROM workflow_actions \
             WHERE status = 'pending' AND scheduled_for <= $1 \
             ORDER BY scheduled_for ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Action::try_from).collect()
    }

    async fn recent_executions(
        &self,
        workflow_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE workflow_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Execution::try_from).collect()
    }

    async fn get_message_template(
        &self,
        id: Uuid,
    ) -> Result<Option<MessageTemplate>, StoreError> {
        let template = sqlx::query_as::<_, MessageTemplate>(
            "SELECT id, name, channel, subject, body, created_at, updated_at \
             FROM message_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(template)
    }

    async fn insert_delivery(&self, delivery: &MessageDelivery) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO message_deliveries \
             (id, action_id, channel, recipient, subject, body, provider, \
              provider_message_id, provider_status, sent_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(delivery.id)
        .bind(delivery.action_id)
        .bind(&delivery.channel)
        .bind(&delivery.recipient)
        .bind(&delivery.subject)
        .bind(&delivery.body)
        .bind(&delivery.provider)
        .bind(&delivery.provider_message_id)
        .bind(&delivery.provider_status)
        .bind(delivery.sent_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_lead_fields(
        &self,
        lead_id: i64,
        updates: &Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for (field, value) in updates {
            if !WRITABLE_LEAD_FIELDS.contains(&field.as_str()) {
                return Err(StoreError::Rejected(format!(
                    "lead field '{}' is not writable by workflows",
                    field
                )));
            }

            let query = format!("UPDATE leads SET {} = $2, updated_at = NOW() WHERE id = $1", field);

            match field.as_str() {
                "score" => {
                    let score = value.as_i64().ok_or_else(|| {
                        StoreError::Rejected(format!("lead field 'score' expects a number, got {value}"))
                    })?;
                    sqlx::query(&query)
                        .bind(lead_id)
                        .bind(score as i32)
                        .execute(&mut *tx)
                        .await?;
                }
                _ => {
                    let text = value.as_str().ok_or_else(|| {
                        StoreError::Rejected(format!("lead field '{field}' expects a string, got {value}"))
                    })?;
                    sqlx::query(&query)
                        .bind(lead_id)
                        .bind(text)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tasks (id, lead_id, title, description, priority, status, due_date, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(task.id)
        .bind(task.lead_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.priority)
        .bind(&task.status)
        .bind(task.due_date)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
