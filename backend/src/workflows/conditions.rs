// Workflow Conditions - Boolean gate deciding whether an execution may be
// created. The rule representation is a JSON-persisted group of
// field/operator/value rows evaluated against the lead snapshot payload.
// Evaluation always fails closed: an unreadable rule or an unknown
// operator means the condition is not met.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::store::WorkflowStore;
use super::EngineError;

/// A single condition to evaluate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Field name to evaluate (supports dot notation for nested fields)
    pub field: String,
    /// Operator for comparison
    pub operator: String,
    /// Value to compare against
    pub value: serde_json::Value,
}

/// Group of conditions with AND/OR logic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Logic operator: "AND" or "OR"
    pub logic: String,
    /// List of conditions in this group
    pub conditions: Vec<Condition>,
    /// Nested condition groups for complex logic
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

impl Condition {
    pub fn new(field: &str, operator: &str, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        }
    }

    pub fn equals(field: &str, value: serde_json::Value) -> Self {
        Self::new(field, "equals", value)
    }

    pub fn not_equals(field: &str, value: serde_json::Value) -> Self {
        Self::new(field, "not_equals", value)
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, "contains", serde_json::Value::String(value.to_string()))
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, "greater_than", serde_json::json!(value))
    }

    pub fn less_than(field: &str, value: f64) -> Self {
        Self::new(field, "less_than", serde_json::json!(value))
    }

    pub fn is_null(field: &str) -> Self {
        Self::new(field, "is_null", serde_json::Value::Null)
    }

    pub fn is_not_null(field: &str) -> Self {
        Self::new(field, "is_not_null", serde_json::Value::Null)
    }

    pub fn in_list(field: &str, values: Vec<serde_json::Value>) -> Self {
        Self::new(field, "in", serde_json::Value::Array(values))
    }
}

impl ConditionGroup {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self {
            logic: "AND".to_string(),
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self {
            logic: "OR".to_string(),
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn with_nested_group(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }
}

/// Evaluate a condition group against a snapshot payload.
pub fn evaluate_group(group: &ConditionGroup, payload: &serde_json::Value) -> bool {
    let mut results: Vec<bool> = group
        .conditions
        .iter()
        .map(|c| evaluate_condition(c, payload))
        .collect();

    results.extend(group.groups.iter().map(|g| evaluate_group(g, payload)));

    if results.is_empty() {
        return true;
    }

    match group.logic.as_str() {
        "OR" | "or" => results.iter().any(|&r| r),
        _ => results.iter().all(|&r| r),
    }
}

fn evaluate_condition(condition: &Condition, payload: &serde_json::Value) -> bool {
    let field_value = get_nested_value(payload, &condition.field);
    let field_value = field_value.as_ref();

    match condition.operator.as_str() {
        "equals" | "eq" | "==" => field_value.map(|v| v == &condition.value).unwrap_or(false),
        "not_equals" | "ne" | "!=" => field_value.map(|v| v != &condition.value).unwrap_or(true),
        "contains" => {
            if let (Some(s), Some(pattern)) =
                (field_value.and_then(|v| v.as_str()), condition.value.as_str())
            {
                return s.to_lowercase().contains(&pattern.to_lowercase());
            }
            false
        }
        "not_contains" => {
            if let (Some(s), Some(pattern)) =
                (field_value.and_then(|v| v.as_str()), condition.value.as_str())
            {
                return !s.to_lowercase().contains(&pattern.to_lowercase());
            }
            true
        }
        "starts_with" => {
            if let (Some(s), Some(pattern)) =
                (field_value.and_then(|v| v.as_str()), condition.value.as_str())
            {
                return s.to_lowercase().starts_with(&pattern.to_lowercase());
            }
            false
        }
        "ends_with" => {
            if let (Some(s), Some(pattern)) =
                (field_value.and_then(|v| v.as_str()), condition.value.as_str())
            {
                return s.to_lowercase().ends_with(&pattern.to_lowercase());
            }
            false
        }
        "greater_than" | "gt" | ">" => {
            if let (Some(v), Some(c)) =
                (field_value.and_then(|v| v.as_f64()), condition.value.as_f64())
            {
                return v > c;
            }
            false
        }
        "less_than" | "lt" | "<" => {
            if let (Some(v), Some(c)) =
                (field_value.and_then(|v| v.as_f64()), condition.value.as_f64())
            {
                return v < c;
            }
            false
        }
        "in" => {
            if let (Some(v), Some(arr)) = (field_value, condition.value.as_array()) {
                return arr.contains(v);
            }
            false
        }
        "not_in" => {
            if let (Some(v), Some(arr)) = (field_value, condition.value.as_array()) {
                return !arr.contains(v);
            }
            true
        }
        "is_null" | "is_empty" => {
            field_value.is_none() || field_value == Some(&serde_json::Value::Null)
        }
        "is_not_null" | "is_not_empty" => {
            field_value.is_some() && field_value != Some(&serde_json::Value::Null)
        }
        "regex" => {
            if let (Some(s), Some(pattern)) =
                (field_value.and_then(|v| v.as_str()), condition.value.as_str())
            {
                if let Ok(re) = regex::Regex::new(pattern) {
                    return re.is_match(s);
                }
            }
            false
        }
        other => {
            warn!("Unknown condition operator '{}', treating as not met", other);
            false
        }
    }
}

fn get_nested_value(json: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let mut current = json;
    for part in path.split('.') {
        match current.get(part) {
            Some(v) => current = v,
            None => return None,
        }
    }
    Some(current.clone())
}

/// Opaque boolean gate consulted before an execution is created.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(&self, workflow_id: Uuid, lead_id: i64) -> Result<bool, EngineError>;
}

/// Evaluates the condition group stored on the workflow row against the
/// current lead snapshot.
pub struct StoredRuleEvaluator {
    store: Arc<dyn WorkflowStore>,
}

impl StoredRuleEvaluator {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConditionEvaluator for StoredRuleEvaluator {
    async fn evaluate(&self, workflow_id: Uuid, lead_id: i64) -> Result<bool, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let conditions = match workflow.conditions {
            Some(conditions) => conditions,
            None => return Ok(true),
        };

        let snapshot = self
            .store
            .get_lead_snapshot(lead_id)
            .await?
            .ok_or(EngineError::LeadNotFound(lead_id))?;

        Ok(evaluate_group(&conditions, &snapshot.as_payload()))
    }
}
