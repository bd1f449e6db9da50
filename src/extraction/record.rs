//! Validated offer records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_DESCRIPTION: usize = 60;
pub const MAX_FULL_DESCRIPTION: usize = 160;
pub const OFFER_TYPE_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// One structured record extracted from a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop: Option<String>,
    pub domain: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_end: Option<String>,
    pub offer_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Keys the model returned that have no dedicated field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const KNOWN_FIELDS: &[&str] = &[
    "shop",
    "domain",
    "description",
    "full_description",
    "code",
    "date_start",
    "date_end",
    "offer_type",
    "target_url",
    "click_url",
    "discount",
    "categories",
];

fn ellipsize(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn offer_type(value: Option<&Value>) -> u8 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) => n.clamp(
            *OFFER_TYPE_RANGE.start() as i64,
            *OFFER_TYPE_RANGE.end() as i64,
        ) as u8,
        None => *OFFER_TYPE_RANGE.start(),
    }
}

fn categories(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar).collect(),
        Some(other) => scalar(other).into_iter().collect(),
        None => Vec::new(),
    }
}

impl Record {
    /// Validate one raw object. Returns `None` when it has no description.
    pub fn from_object(object: &Map<String, Value>, domain: &str) -> Option<Self> {
        let text = |key: &str| object.get(key).and_then(scalar);

        let description = text("description")?;
        let extra = object
            .iter()
            .filter(|(k, _)| !KNOWN_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            shop: text("shop"),
            domain: text("domain").unwrap_or_else(|| domain.to_string()),
            description: ellipsize(&description, MAX_DESCRIPTION),
            full_description: text("full_description")
                .map(|s| ellipsize(&s, MAX_FULL_DESCRIPTION)),
            code: text("code"),
            date_start: text("date_start"),
            date_end: text("date_end"),
            offer_type: offer_type(object.get("offer_type")),
            target_url: text("target_url"),
            click_url: text("click_url"),
            discount: text("discount"),
            categories: categories(object.get("categories")),
            extra,
        })
    }
}
