// Workflow Triggers - Events that may instantiate a workflow for a lead

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of events that can trigger workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    LeadCreated,
    ScoreChanged,
    BehaviorObserved,
    TimeBased,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadCreated => "lead_created",
            Self::ScoreChanged => "score_changed",
            Self::BehaviorObserved => "behavior_observed",
            Self::TimeBased => "time_based",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead_created" => Ok(Self::LeadCreated),
            "score_changed" => Ok(Self::ScoreChanged),
            "behavior_observed" => Ok(Self::BehaviorObserved),
            "time_based" => Ok(Self::TimeBased),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// A trigger event carried into an execution. Transient: the kind and
/// payload are snapshotted onto the execution row, nothing else survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub payload: serde_json::Value,
}

impl Trigger {
    pub fn new(kind: TriggerKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }

    /// A new lead landed in the CRM.
    pub fn lead_created(lead_id: i64, property_id: Option<Uuid>, source: Option<&str>) -> Self {
        Self::new(
            TriggerKind::LeadCreated,
            serde_json::json!({
                "lead_id": lead_id,
                "property_id": property_id,
                "source": source,
            }),
        )
    }

    /// The scoring engine moved a lead's score.
    pub fn score_changed(lead_id: i64, old_score: i32, new_score: i32) -> Self {
        Self::new(
            TriggerKind::ScoreChanged,
            serde_json::json!({
                "lead_id": lead_id,
                "old_score": old_score,
                "new_score": new_score,
            }),
        )
    }

    /// The behavior tracker observed something notable (site visit,
    /// brochure download, repeat property view).
    pub fn behavior_observed(lead_id: i64, behavior: &str) -> Self {
        Self::new(
            TriggerKind::BehaviorObserved,
            serde_json::json!({
                "lead_id": lead_id,
                "behavior": behavior,
            }),
        )
    }

    /// A schedule fired for this lead.
    pub fn time_based(schedule_name: &str) -> Self {
        Self::new(
            TriggerKind::TimeBased,
            serde_json::json!({ "schedule_name": schedule_name }),
        )
    }

    /// Explicit API call.
    pub fn manual() -> Self {
        Self::new(TriggerKind::Manual, serde_json::json!({}))
    }
}
