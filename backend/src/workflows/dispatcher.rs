// Action Dispatcher - Resolves an action to its handler and records the
// outcome. Handler failures are isolated: they land on the action row as
// status=failed and never abort the execution's remaining actions.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use nurture_shared::{MessageDelivery, Task};

use super::actions::{Action, ActionKind, ActionStatus};
use super::snapshot::LeadSnapshot;
use super::store::{StoreError, WorkflowStore};
use super::templates;
use crate::channels::{Channel, ChannelSender};

/// Outcome of dispatching a single action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Completed(serde_json::Value),
    Failed(String),
    /// Another worker (in-memory loop vs sweep) won the claim race.
    AlreadyClaimed,
}

struct HandlerSuccess {
    result: serde_json::Value,
    external_message_id: Option<String>,
}

pub struct ActionDispatcher {
    store: Arc<dyn WorkflowStore>,
    sender: Arc<dyn ChannelSender>,
}

impl ActionDispatcher {
    pub fn new(store: Arc<dyn WorkflowStore>, sender: Arc<dyn ChannelSender>) -> Self {
        Self { store, sender }
    }

    /// Execute one action against the lead snapshot captured at execution
    /// creation. Store errors from the status bookkeeping itself propagate;
    /// everything that goes wrong inside a handler becomes `Failed`.
    pub async fn execute(
        &self,
        action: &Action,
        snapshot: &LeadSnapshot,
    ) -> Result<ActionOutcome, StoreError> {
        if !self
            .store
            .transition_action(action.id, ActionStatus::Pending, ActionStatus::Running)
            .await?
        {
            return Ok(ActionOutcome::AlreadyClaimed);
        }

        info!("Executing action '{}' ({})", action.name, action.id);

        match self.run_handler(action, snapshot).await {
            Ok(success) => {
                self.store
                    .complete_action(
                        action.id,
                        &success.result,
                        success.external_message_id.as_deref(),
                    )
                    .await?;
                Ok(ActionOutcome::Completed(success.result))
            }
            Err(message) => {
                error!("Action '{}' failed: {}", action.name, message);
                self.store.fail_action(action.id, &message).await?;
                Ok(ActionOutcome::Failed(message))
            }
        }
    }

    async fn run_handler(
        &self,
        action: &Action,
        snapshot: &LeadSnapshot,
    ) -> Result<HandlerSuccess, String> {
        match &action.kind {
            ActionKind::SendMessage {
                channel,
                message_template_id,
            } => {
                self.send_message(action, snapshot, *channel, *message_template_id)
                    .await
            }
            ActionKind::UpdateLead { updates } => {
                self.store
                    .update_lead_fields(snapshot.lead_id, updates)
                    .await
                    .map_err(|e| e.to_string())?;

                let fields: Vec<&String> = updates.keys().collect();
                Ok(HandlerSuccess {
                    result: json!({ "status": "updated", "fields": fields }),
                    external_message_id: None,
                })
            }
            ActionKind::CreateTask {
                title,
                description,
                priority,
                due_in_days,
            } => {
                let task = Task {
                    id: Uuid::new_v4(),
                    lead_id: snapshot.lead_id,
                    title: templates::render(title, snapshot),
                    description: description
                        .as_deref()
                        .map(|d| templates::render(d, snapshot)),
                    priority: priority.clone(),
                    status: "pending".to_string(),
                    due_date: Utc::now() + chrono::Duration::days(*due_in_days),
                    created_at: Utc::now(),
                };

                self.store
                    .insert_task(&task)
                    .await
                    .map_err(|e| e.to_string())?;

                Ok(HandlerSuccess {
                    result: json!({ "status": "created", "task_id": task.id }),
                    external_message_id: None,
                })
            }
            ActionKind::Wait { duration_minutes } => Ok(HandlerSuccess {
                // The scheduling delay was already served by the scheduler.
                result: json!({ "status": "waited", "duration_minutes": duration_minutes }),
                external_message_id: None,
            }),
        }
    }

    async fn send_message(
        &self,
        action: &Action,
        snapshot: &LeadSnapshot,
        channel: Channel,
        message_template_id: Uuid,
    ) -> Result<HandlerSuccess, String> {
        let template = self
            .store
            .get_message_template(message_template_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("message template {} not found", message_template_id))?;

        let recipient = match channel {
            Channel::Email => snapshot
                .email
                .clone()
                .ok_or_else(|| format!("lead {} has no email on file", snapshot.lead_id))?,
            Channel::Whatsapp | Channel::Sms => snapshot
                .phone
                .clone()
                .ok_or_else(|| format!("lead {} has no phone on file", snapshot.lead_id))?,
        };

        let body = templates::render(&template.body, snapshot);
        let subject = match channel {
            Channel::Email => Some(templates::render(
                template
                    .subject
                    .as_deref()
                    .unwrap_or("Property inquiry follow-up"),
                snapshot,
            )),
            _ => None,
        };

        let receipt = self
            .sender
            .send(channel, &recipient, subject.as_deref(), &body)
            .await
            .map_err(|e| e.to_string())?;

        let delivery = MessageDelivery {
            id: Uuid::new_v4(),
            action_id: action.id,
            channel: channel.as_str().to_string(),
            recipient: recipient.clone(),
            subject,
            body,
            provider: receipt.provider.clone(),
            provider_message_id: Some(receipt.message_id.clone()),
            provider_status: receipt.status.clone(),
            sent_at: Utc::now(),
        };

        self.store
            .insert_delivery(&delivery)
            .await
            .map_err(|e| e.to_string())?;

        info!(
            "{} sent to lead {} ({})",
            channel, snapshot.lead_id, receipt.message_id
        );

        Ok(HandlerSuccess {
            result: json!({
                "status": "sent",
                "channel": channel.as_str(),
                "recipient": recipient,
                "provider_message_id": receipt.message_id,
            }),
            external_message_id: Some(receipt.message_id),
        })
    }
}
