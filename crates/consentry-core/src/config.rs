//! Store configuration with per-field defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::ConsentValue;

/// The category whose grant gates session tracking.
pub const ESSENTIAL_CATEGORY: &str = "essential";

/// Which persistence backends the store writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Cookie,
    Local,
    Both,
}

/// Initial state applied to optional categories before the user decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultConsentPolicy {
    Unset,
    AllGranted,
    AllDenied,
    EssentialOnly,
}

/// A single consent category as configured by the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Display name shown by consent UI.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Required categories are always granted and cannot be toggled.
    #[serde(default)]
    pub required: bool,
}

impl CategoryConfig {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
        }
    }
}

/// Store configuration. Every field has a default; hosts override what they
/// need and the rest resolves once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentConfig {
    #[serde(default = "default_categories")]
    pub categories: BTreeMap<String, CategoryConfig>,
    #[serde(default = "default_storage_mode")]
    pub storage_mode: StorageMode,
    /// Key under which the full record is kept in the primary store.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_domain: Option<String>,
    /// Consent record lifetime in days.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    /// Key under which the session record is kept.
    #[serde(default = "default_session_key")]
    pub session_key: String,
    /// Inactivity window after which a session id is replaced.
    #[serde(default = "default_session_window_minutes")]
    pub session_window_minutes: u32,
    /// Persisted session lifetime in days, independent of the consent TTL.
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u32,
    #[serde(default = "default_consent_policy")]
    pub default_consent: DefaultConsentPolicy,
}

fn default_categories() -> BTreeMap<String, CategoryConfig> {
    let mut categories = BTreeMap::new();
    categories.insert(
        ESSENTIAL_CATEGORY.to_string(),
        CategoryConfig::required(
            "Essential",
            "Required for the platform to work (login, preferences, security)",
        ),
    );
    categories.insert(
        "analytics".to_string(),
        CategoryConfig::optional(
            "Analytics & Performance",
            "Usage patterns that help improve performance and user experience",
        ),
    );
    categories.insert(
        "marketing".to_string(),
        CategoryConfig::optional(
            "Marketing & Personalization",
            "Personalized content and relevant feature suggestions",
        ),
    );
    categories.insert(
        "ai_training".to_string(),
        CategoryConfig::optional(
            "AI Training Participation",
            "Anonymized content used to improve models",
        ),
    );
    categories
}

fn default_storage_mode() -> StorageMode {
    StorageMode::Both
}
fn default_storage_key() -> String {
    "consentry_privacy_consent".into()
}
fn default_cookie_name() -> String {
    "consentry_consent".into()
}
fn default_ttl_days() -> u32 {
    365
}
fn default_session_key() -> String {
    "consentry_session".into()
}
fn default_session_window_minutes() -> u32 {
    30
}
fn default_session_ttl_days() -> u32 {
    1
}
fn default_consent_policy() -> DefaultConsentPolicy {
    DefaultConsentPolicy::Unset
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            storage_mode: StorageMode::Both,
            storage_key: default_storage_key(),
            cookie_name: default_cookie_name(),
            cookie_domain: None,
            ttl_days: 365,
            session_key: default_session_key(),
            session_window_minutes: 30,
            session_ttl_days: 1,
            default_consent: DefaultConsentPolicy::Unset,
        }
    }
}

impl ConsentConfig {
    /// Look up a configured category.
    pub fn category(&self, key: &str) -> Option<&CategoryConfig> {
        self.categories.get(key)
    }

    /// Whether a category exists and is marked required.
    pub fn is_required(&self, key: &str) -> bool {
        self.categories.get(key).map(|c| c.required).unwrap_or(false)
    }

    /// Configured category keys, in stable order.
    pub fn category_keys(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(|k| k.as_str())
    }

    /// Reject category keys that are absent from the configuration.
    pub fn ensure_known(&self, key: &str) -> Result<()> {
        if self.categories.contains_key(key) {
            Ok(())
        } else {
            Err(Error::InvalidCategory(key.to_string()))
        }
    }

    /// Consent map for a user who has not decided yet, per the configured
    /// default policy. Required categories are granted under every policy.
    pub fn initial_consents(&self) -> BTreeMap<String, ConsentValue> {
        self.categories
            .iter()
            .map(|(key, category)| {
                let value = if category.required {
                    ConsentValue::Granted
                } else {
                    match self.default_consent {
                        DefaultConsentPolicy::Unset => ConsentValue::Unset,
                        DefaultConsentPolicy::AllGranted => ConsentValue::Granted,
                        DefaultConsentPolicy::AllDenied
                        | DefaultConsentPolicy::EssentialOnly => ConsentValue::Denied,
                    }
                };
                (key.clone(), value)
            })
            .collect()
    }
}
