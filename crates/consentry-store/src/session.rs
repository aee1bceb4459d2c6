//! Ephemeral session tracking, gated by essential consent.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use consentry_core::config::ESSENTIAL_CATEGORY;
use consentry_core::{can_act, ConsentConfig, ConsentRecord, SessionRecord};

use crate::backend::StorageBackend;

/// Derives and renews the session identifier. A session exists only while
/// the essential category is granted; it is renewed on activity inside the
/// inactivity window and replaced otherwise.
pub struct SessionTracker {
    storage: Arc<dyn StorageBackend>,
    config: ConsentConfig,
}

impl SessionTracker {
    pub fn new(storage: Arc<dyn StorageBackend>, config: ConsentConfig) -> Self {
        Self { storage, config }
    }

    fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.config.session_window_minutes))
    }

    fn ttl(&self) -> Duration {
        Duration::days(i64::from(self.config.session_ttl_days))
    }

    /// The current session id at `now`, or `None` without essential consent.
    ///
    /// Activity inside the window keeps the id and bumps `lastActivity`;
    /// anything else mints a fresh session.
    pub fn current_session(
        &self,
        record: Option<&ConsentRecord>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if !can_act(&self.config, record, ESSENTIAL_CATEGORY) {
            return None;
        }

        if let Some(raw) = self.storage.get(&self.config.session_key) {
            match SessionRecord::parse(&raw) {
                Ok(mut session) => {
                    let idle = now.signed_duration_since(session.last_activity);
                    let age = now.signed_duration_since(session.created);
                    if idle <= self.window() && age <= self.ttl() {
                        session.last_activity = now;
                        self.persist(&session);
                        return Some(session.id);
                    }
                }
                Err(e) => warn!("discarding invalid session record: {e}"),
            }
        }

        let session = SessionRecord {
            id: Uuid::new_v4().to_string(),
            created: now,
            last_activity: now,
        };
        self.persist(&session);
        Some(session.id)
    }

    /// The stored session record, without renewing it. Used for data export.
    pub fn peek(&self) -> Option<SessionRecord> {
        let raw = self.storage.get(&self.config.session_key)?;
        SessionRecord::parse(&raw).ok()
    }

    /// Drop any persisted session state.
    pub fn clear(&self) {
        self.storage.remove(&self.config.session_key);
    }

    fn persist(&self, session: &SessionRecord) {
        let serialized = match session.serialize() {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to serialize session record: {e}");
                return;
            }
        };
        if let Err(e) = self.storage.set(&self.config.session_key, &serialized) {
            warn!("failed to persist session record: {e}");
        }
    }
}
