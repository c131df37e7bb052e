// Lead Snapshot - Immutable projection of a lead captured at execution
// creation time. Template rendering and condition evaluation both read the
// snapshot, never the live record, so a mid-run lead edit cannot change
// what an execution sends and replays stay reproducible.

use nurture_shared::{Developer, Lead, Property};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub lead_id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub score: i32,
    pub priority_tier: String,
    pub next_best_action: Option<String>,
    pub property_id: Option<Uuid>,
    pub property_title: Option<String>,
    pub property_type: Option<String>,
    pub price: Option<Decimal>,
    pub developer_name: Option<String>,
    pub locality: Option<String>,
    pub city: Option<String>,
    pub bedrooms: Option<i32>,
    pub area_sqft: Option<i32>,
}

impl LeadSnapshot {
    pub fn from_parts(lead: &Lead, property: Option<&Property>, developer: Option<&Developer>) -> Self {
        Self {
            lead_id: lead.id,
            name: lead.name.clone(),
            email: lead.email.clone(),
            phone: lead.phone.clone(),
            score: lead.score,
            priority_tier: lead.priority_tier.clone(),
            next_best_action: lead.next_best_action.clone(),
            property_id: property.map(|p| p.id),
            property_title: property.map(|p| p.title.clone()),
            property_type: property.map(|p| p.property_type.clone()),
            price: property.and_then(|p| p.price),
            developer_name: developer
                .map(|d| d.company_name.clone().unwrap_or_else(|| d.name.clone())),
            locality: property.and_then(|p| p.locality.clone()),
            city: property.and_then(|p| p.city.clone()),
            bedrooms: property.and_then(|p| p.bedrooms),
            area_sqft: property.and_then(|p| p.area_sqft),
        }
    }

    /// The lead's first name, falling back to a neutral greeting target.
    pub fn first_name(&self) -> String {
        self.name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or("there")
            .to_string()
    }

    /// JSON view of the snapshot, used by condition evaluation.
    pub fn as_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
