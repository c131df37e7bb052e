// Template Renderer - Literal {{variable}} substitution against a lead
// snapshot. Unknown placeholders pass through verbatim; callers rely on
// seeing the raw placeholder in the output rather than an error.

use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::snapshot::LeadSnapshot;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{([a-zA-Z0-9_.]+)\}\}").expect("valid pattern"))
}

/// Render a message template against a lead snapshot.
pub fn render(template: &str, snapshot: &LeadSnapshot) -> String {
    if template.is_empty() {
        return String::new();
    }

    let variables = variables_for(snapshot);
    let mut result = template.to_string();

    for capture in placeholder_pattern().captures_iter(template) {
        let name = &capture[1];
        if let Some(value) = variables.get(name) {
            result = result.replace(&capture[0], value);
        }
    }

    result
}

/// The fixed variable vocabulary available to message templates.
fn variables_for(snapshot: &LeadSnapshot) -> HashMap<&'static str, String> {
    let mut vars = HashMap::new();

    let lead_name = snapshot.name.clone().unwrap_or_else(|| "there".to_string());
    vars.insert("lead_name", lead_name);
    vars.insert("first_name", snapshot.first_name());
    vars.insert(
        "property_title",
        snapshot
            .property_title
            .clone()
            .unwrap_or_else(|| "the property".to_string()),
    );
    vars.insert(
        "property_type",
        snapshot
            .property_type
            .clone()
            .unwrap_or_else(|| "property".to_string()),
    );
    vars.insert("property_price", format_price(snapshot.price));
    vars.insert(
        "developer_name",
        snapshot
            .developer_name
            .clone()
            .unwrap_or_else(|| "the developer".to_string()),
    );
    vars.insert("score", snapshot.score.to_string());
    vars.insert("priority_tier", snapshot.priority_tier.clone());
    vars.insert(
        "next_action",
        snapshot
            .next_best_action
            .clone()
            .unwrap_or_else(|| "Contact us".to_string()),
    );
    vars.insert(
        "location",
        snapshot
            .locality
            .clone()
            .or_else(|| snapshot.city.clone())
            .unwrap_or_else(|| "the area".to_string()),
    );
    vars.insert(
        "bedrooms",
        snapshot
            .bedrooms
            .map(|b| b.to_string())
            .unwrap_or_else(|| "N/A".to_string()),
    );
    vars.insert(
        "area_sqft",
        snapshot
            .area_sqft
            .map(|a| a.to_string())
            .unwrap_or_else(|| "N/A".to_string()),
    );

    vars
}

/// Rupee format with thousands separators, no paise.
fn format_price(price: Option<Decimal>) -> String {
    let rupees = price.and_then(|p| p.round().to_i128()).unwrap_or(0);
    let digits = rupees.unsigned_abs().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if rupees < 0 {
        format!("-₹{grouped}")
    } else {
        format!("₹{grouped}")
    }
}
