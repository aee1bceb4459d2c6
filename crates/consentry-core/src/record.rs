//! Consent and session records — the persisted wire contract.
//!
//! Field names are shared with host frontends reading the same storage, so
//! they are camelCase on the wire. Consent values serialize as the original
//! tri-state `true` / `false` / `null`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Schema version written by `save`.
pub const RECORD_VERSION: &str = "2.0";
/// Schema version assigned to records reconstructed from the cookie fallback.
pub const COOKIE_RECORD_VERSION: &str = "1.0";

/// Tri-state consent decision for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum ConsentValue {
    Granted,
    Denied,
    /// The user has not decided yet.
    Unset,
}

impl ConsentValue {
    pub fn is_granted(self) -> bool {
        self == ConsentValue::Granted
    }

    pub fn from_bool(granted: bool) -> Self {
        if granted {
            ConsentValue::Granted
        } else {
            ConsentValue::Denied
        }
    }
}

impl From<Option<bool>> for ConsentValue {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => ConsentValue::Granted,
            Some(false) => ConsentValue::Denied,
            None => ConsentValue::Unset,
        }
    }
}

impl From<ConsentValue> for Option<bool> {
    fn from(value: ConsentValue) -> Self {
        match value {
            ConsentValue::Granted => Some(true),
            ConsentValue::Denied => Some(false),
            ConsentValue::Unset => None,
        }
    }
}

/// Provenance of a single category decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetadata {
    pub timestamp: DateTime<Utc>,
    /// How the decision was made, e.g. `user_interaction`, `accept_all`.
    pub source: String,
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DecisionMetadata {
    pub fn new(timestamp: DateTime<Utc>, source: &str) -> Self {
        Self {
            timestamp,
            source: source.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// The durable record of a user's per-category decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// Opaque id, regenerated on every save.
    #[serde(rename = "consentId")]
    pub consent_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub consents: BTreeMap<String, ConsentValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, DecisionMetadata>,
}

impl ConsentRecord {
    /// Parse a persisted blob. Anything that fails to parse or is missing
    /// required fields is reported as `MalformedRecord`; callers treat that
    /// as "no consent yet".
    pub fn parse(raw: &str) -> Result<Self> {
        let record: ConsentRecord = serde_json::from_str(raw)
            .map_err(|e| Error::MalformedRecord(e.to_string()))?;
        if record.consent_id.is_empty() {
            return Err(Error::MalformedRecord("empty consentId".into()));
        }
        if record.version.is_empty() {
            return Err(Error::MalformedRecord("empty version".into()));
        }
        Ok(record)
    }

    /// Serialize for the primary store.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The lightweight form carried by the cookie fallback.
    pub fn to_cookie_record(&self) -> CookieRecord {
        CookieRecord {
            consents: self.consents.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Cookie-backed fallback form: consents and timestamp only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub consents: BTreeMap<String, ConsentValue>,
    pub timestamp: DateTime<Utc>,
}

impl CookieRecord {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::MalformedRecord(e.to_string()))
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reconstruct a full record from the fallback form. The caller supplies
    /// the consent id since the cookie does not carry one.
    pub fn into_record(self, consent_id: String) -> ConsentRecord {
        ConsentRecord {
            consent_id,
            timestamp: self.timestamp,
            version: COOKIE_RECORD_VERSION.to_string(),
            consents: self.consents,
            metadata: BTreeMap::new(),
        }
    }
}

/// Ephemeral session identifier, contingent on essential consent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created: DateTime<Utc>,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::MalformedRecord(e.to_string()))
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ConsentRecord {
        let mut consents = BTreeMap::new();
        consents.insert("essential".to_string(), ConsentValue::Granted);
        consents.insert("analytics".to_string(), ConsentValue::Denied);
        consents.insert("marketing".to_string(), ConsentValue::Unset);

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "analytics".to_string(),
            DecisionMetadata::new(Utc::now(), "user_interaction"),
        );

        ConsentRecord {
            consent_id: "abc-123".to_string(),
            timestamp: Utc::now(),
            version: RECORD_VERSION.to_string(),
            consents,
            metadata,
        }
    }

    #[test]
    fn test_record_round_trip() {
        let record = sample_record();
        let raw = record.serialize().unwrap();
        let parsed = ConsentRecord::parse(&raw).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_wire_field_names_and_tristate() {
        let record = sample_record();
        let value: serde_json::Value =
            serde_json::from_str(&record.serialize().unwrap()).unwrap();
        assert!(value["consentId"].is_string());
        assert!(value["timestamp"].is_string());
        assert_eq!(value["consents"]["essential"], serde_json::json!(true));
        assert_eq!(value["consents"]["analytics"], serde_json::json!(false));
        assert_eq!(value["consents"]["marketing"], serde_json::Value::Null);
        assert!(value["metadata"]["analytics"]["source"].is_string());
    }

    #[test]
    fn test_corrupt_blob_is_malformed() {
        assert!(matches!(
            ConsentRecord::parse("{not json"),
            Err(Error::MalformedRecord(_))
        ));
        assert!(matches!(
            ConsentRecord::parse(r#"{"consents":{}}"#),
            Err(Error::MalformedRecord(_))
        ));
        assert!(matches!(
            ConsentRecord::parse(
                r#"{"consentId":"","timestamp":"2026-01-01T00:00:00Z","version":"2.0","consents":{}}"#
            ),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_cookie_record_reconstruction() {
        let record = sample_record();
        let slim = record.to_cookie_record();
        let raw = slim.serialize().unwrap();
        let parsed = CookieRecord::parse(&raw).unwrap();
        let rebuilt = parsed.into_record("cookie_1".to_string());
        assert_eq!(rebuilt.version, COOKIE_RECORD_VERSION);
        assert_eq!(rebuilt.consents, record.consents);
        assert!(rebuilt.metadata.is_empty());
    }

    #[test]
    fn test_session_record_round_trip() {
        let session = SessionRecord {
            id: "s-1".to_string(),
            created: Utc::now(),
            last_activity: Utc::now(),
        };
        let raw = session.serialize().unwrap();
        assert!(raw.contains("lastActivity"));
        assert_eq!(SessionRecord::parse(&raw).unwrap(), session);
    }
}
