// Workflow Actions - The scheduled steps that make up an execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use uuid::Uuid;

use crate::channels::Channel;

/// What an action does. A closed set: adding a behavior means adding a
/// variant here and a handler arm in the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    /// Render a message template and send it over an outbound channel.
    SendMessage {
        channel: Channel,
        message_template_id: Uuid,
    },
    /// Apply a field map to the lead's mutable record.
    UpdateLead { updates: Map<String, serde_json::Value> },
    /// Create a follow-up task referencing the lead.
    CreateTask {
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default = "default_task_priority")]
        priority: String,
        #[serde(default = "default_due_in_days")]
        due_in_days: i64,
    },
    /// Pure pause: extends the scheduling suspension, no external call.
    Wait { duration_minutes: i64 },
}

fn default_task_priority() -> String {
    "medium".to_string()
}

fn default_due_in_days() -> i64 {
    1
}

/// Possible statuses for a workflow action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// One step inside a workflow definition: what to do and how long after
/// the execution starts to do it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub name: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Delay from the execution's start time, in minutes.
    #[serde(default)]
    pub delay_minutes: i64,
}

impl ActionTemplate {
    pub fn new(name: &str, kind: ActionKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            delay_minutes: 0,
        }
    }

    pub fn with_delay(mut self, minutes: i64) -> Self {
        self.delay_minutes = minutes;
        self
    }

    // ===== Builders =====

    pub fn send_message(channel: Channel, message_template_id: Uuid) -> Self {
        Self::new(
            &format!("Send {}", channel),
            ActionKind::SendMessage {
                channel,
                message_template_id,
            },
        )
    }

    pub fn update_lead(updates: Map<String, serde_json::Value>) -> Self {
        Self::new("Update Lead", ActionKind::UpdateLead { updates })
    }

    pub fn create_task(title: &str, due_in_days: i64) -> Self {
        Self::new(
            "Create Task",
            ActionKind::CreateTask {
                title: title.to_string(),
                description: None,
                priority: default_task_priority(),
                due_in_days,
            },
        )
    }

    pub fn wait(duration_minutes: i64) -> Self {
        Self::new(
            &format!("Wait {} minutes", duration_minutes),
            ActionKind::Wait { duration_minutes },
        )
    }
}

/// One materialized action belonging to an execution. Created as part of
/// the execution's creation transaction; mutated only by the dispatcher
/// along its state machine; never reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub position: i32,
    pub name: String,
    pub kind: ActionKind,
    pub scheduled_for: DateTime<Utc>,
    pub status: ActionStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub external_message_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Action {
    /// Materialize an action from its template, relative to the
    /// execution's start time.
    pub fn materialize(
        execution_id: Uuid,
        position: i32,
        template: &ActionTemplate,
        execution_start: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            position,
            name: template.name.clone(),
            kind: template.kind.clone(),
            scheduled_for: execution_start + chrono::Duration::minutes(template.delay_minutes),
            status: ActionStatus::Pending,
            result: None,
            error_message: None,
            external_message_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// The instant this action becomes due. A wait action's own duration
    /// extends the suspension beyond `scheduled_for`.
    pub fn due_at(&self) -> DateTime<Utc> {
        match &self.kind {
            ActionKind::Wait { duration_minutes } => {
                self.scheduled_for + chrono::Duration::minutes(*duration_minutes)
            }
            _ => self.scheduled_for,
        }
    }
}
