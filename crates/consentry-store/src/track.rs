//! Consent-gated event capture.
//!
//! Events are built only when the gating category is granted, carry the
//! consent version they were captured under, and never include known PII
//! property keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use consentry_core::ConsentRecord;

/// Property keys stripped from every captured event.
pub const PII_PROPERTY_KEYS: &[&str] = &["email", "name", "phone", "ip", "password"];

/// The consent state an event was captured under.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentStamp {
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// An event that passed the consent gate.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvent {
    pub id: String,
    pub name: String,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub consent: ConsentStamp,
}

/// Drop known PII keys from event properties.
pub fn sanitize_properties(
    properties: BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, serde_json::Value> {
    properties
        .into_iter()
        .filter(|(key, _)| !PII_PROPERTY_KEYS.contains(&key.as_str()))
        .collect()
}

pub(crate) fn build_event(
    name: &str,
    properties: BTreeMap<String, serde_json::Value>,
    category: &str,
    record: &ConsentRecord,
    session_id: Option<String>,
    now: DateTime<Utc>,
) -> CapturedEvent {
    CapturedEvent {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        properties: sanitize_properties(properties),
        category: category.to_string(),
        timestamp: now,
        session_id,
        consent: ConsentStamp {
            version: record.version.clone(),
            timestamp: record.timestamp,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_pii_keys() {
        let mut props = BTreeMap::new();
        props.insert("email".to_string(), serde_json::json!("user@example.com"));
        props.insert("password".to_string(), serde_json::json!("hunter2"));
        props.insert("page".to_string(), serde_json::json!("/pricing"));

        let sanitized = sanitize_properties(props);
        assert_eq!(sanitized.len(), 1);
        assert!(sanitized.contains_key("page"));
    }

    #[test]
    fn test_sanitize_keeps_everything_else() {
        let mut props = BTreeMap::new();
        props.insert("duration_ms".to_string(), serde_json::json!(120));
        assert_eq!(sanitize_properties(props).len(), 1);
    }
}
