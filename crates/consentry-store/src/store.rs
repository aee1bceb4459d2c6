//! The consent store — canonical record ownership, persistence, and change
//! notification.
//!
//! A `ConsentStore` is constructed explicitly by the host's composition root
//! and handed to consumers; there is no process-wide singleton. Writes are
//! last-write-wins across contexts sharing the same storage.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use consentry_core::record::RECORD_VERSION;
use consentry_core::{
    can_act, has_any_decision, CategoryConfig, ConsentConfig, ConsentRecord, ConsentValue,
    CookieRecord, DecisionMetadata, Result, StorageMode,
};

use crate::backend::{MemoryBackend, StorageBackend};
use crate::bus::{ChangeEvent, ChangeKind, InProcessBus, SignalBus, SubscriberId};
use crate::cookie::{CookieAttributes, CookieJar};
use crate::session::SessionTracker;
use crate::track::{self, CapturedEvent};

/// Handle returned by [`ConsentStore::subscribe`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Everything sessions and data-portability requests need, bundled.
#[derive(Debug, Clone, Serialize)]
pub struct ExportBundle {
    pub consent: Option<ConsentRecord>,
    pub session: Option<consentry_core::SessionRecord>,
    pub exported: DateTime<Utc>,
    pub version: String,
}

struct Inner {
    config: ConsentConfig,
    primary: Option<Arc<dyn StorageBackend>>,
    cookie: Option<Arc<CookieJar>>,
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
    /// Last record seen by this context. The only state left when every
    /// backend is unavailable.
    cached: Mutex<Option<ConsentRecord>>,
    durable: bool,
}

impl Inner {
    fn read_backends(&self) -> Option<ConsentRecord> {
        if let Some(primary) = &self.primary {
            if let Some(raw) = primary.get(&self.config.storage_key) {
                match ConsentRecord::parse(&raw) {
                    Ok(record) => return Some(record),
                    Err(e) => warn!("discarding malformed consent record: {e}"),
                }
            }
        }
        if let Some(jar) = &self.cookie {
            if let Some(raw) = jar.get(&self.config.cookie_name) {
                match CookieRecord::parse(&raw) {
                    Ok(slim) => {
                        // The cookie carries no consentId; derive a stable one
                        // from the write timestamp.
                        let id = format!("cookie_{}", slim.timestamp.timestamp_millis());
                        return Some(slim.into_record(id));
                    }
                    Err(e) => warn!("discarding malformed consent cookie: {e}"),
                }
            }
        }
        None
    }

    fn load(&self) -> Option<ConsentRecord> {
        let record = match self.read_backends() {
            Some(record) => Some(record),
            None if !self.durable => self.cached.lock().clone(),
            None => None,
        };
        *self.cached.lock() = record.clone();
        record
    }

    fn persist(&self, record: &ConsentRecord) {
        if let Some(primary) = &self.primary {
            match record.serialize() {
                Ok(raw) => {
                    if let Err(e) = primary.set(&self.config.storage_key, &raw) {
                        warn!("primary consent write failed: {e}");
                    }
                }
                Err(e) => warn!("failed to serialize consent record: {e}"),
            }
        }
        if let Some(jar) = &self.cookie {
            match record.to_cookie_record().serialize() {
                Ok(raw) => {
                    if let Err(e) = jar.set(&self.config.cookie_name, &raw) {
                        warn!("consent cookie write failed: {e}");
                    }
                }
                Err(e) => warn!("failed to serialize consent cookie: {e}"),
            }
        }
    }

    /// Invoke every listener, isolating failures per listener.
    fn notify(&self, event: &ChangeEvent) {
        let listeners: Vec<(ListenerId, Listener)> = self
            .listeners
            .lock()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(listener = id, "consent listener panicked");
            }
        }
    }

    /// Handle a change made in another context: refresh local state from the
    /// shared storage, then re-notify local listeners.
    fn apply_remote(&self, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::ConsentUpdated => {
                let refreshed = self
                    .read_backends()
                    .or_else(|| serde_json::from_value(event.data.clone()).ok());
                *self.cached.lock() = refreshed;
            }
            ChangeKind::DataCleared => {
                *self.cached.lock() = None;
            }
            // Captured events are local-only; nothing should broadcast them.
            ChangeKind::EventCaptured => return,
        }
        self.notify(event);
    }
}

/// Owns the canonical consent record for one browsing context.
pub struct ConsentStore {
    inner: Arc<Inner>,
    bus: Arc<dyn SignalBus>,
    bus_id: SubscriberId,
    session: SessionTracker,
}

impl ConsentStore {
    /// Convenience constructor: in-memory primary store, modeled cookie jar,
    /// private in-process bus. Hosts that need durability or cross-context
    /// sync use [`ConsentStore::with_parts`].
    pub fn new(config: ConsentConfig) -> Self {
        let jar = Arc::new(CookieJar::new(CookieAttributes {
            domain: config.cookie_domain.clone(),
            expire_days: config.ttl_days,
            ..CookieAttributes::default()
        }));
        Self::with_parts(
            config,
            Some(Arc::new(MemoryBackend::new())),
            Some(jar),
            Arc::new(InProcessBus::new()),
        )
    }

    /// Construct from injected parts. The storage mode in `config` decides
    /// which of the supplied backends are engaged; each engaged backend is
    /// probed once and dropped with a warning if unavailable.
    pub fn with_parts(
        config: ConsentConfig,
        primary: Option<Arc<dyn StorageBackend>>,
        cookie: Option<Arc<CookieJar>>,
        bus: Arc<dyn SignalBus>,
    ) -> Self {
        let primary = match config.storage_mode {
            StorageMode::Cookie => None,
            _ => primary.filter(|p| {
                let ok = p.available();
                if !ok {
                    warn!("primary storage unavailable; consent persistence degraded");
                }
                ok
            }),
        };
        let cookie = match config.storage_mode {
            StorageMode::Local => None,
            _ => cookie.filter(|jar| {
                let ok = jar.available();
                if !ok {
                    warn!("cookie storage unavailable; consent persistence degraded");
                }
                ok
            }),
        };

        let durable = primary.is_some() || cookie.is_some();
        if !durable {
            warn!("no storage backend available; consent state is memory-only");
        }

        let session_storage: Arc<dyn StorageBackend> = match (&cookie, &primary) {
            (Some(jar), _) => Arc::clone(jar) as Arc<dyn StorageBackend>,
            (None, Some(primary)) => Arc::clone(primary),
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        let session = SessionTracker::new(session_storage, config.clone());

        let inner = Arc::new(Inner {
            config,
            primary,
            cookie,
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
            cached: Mutex::new(None),
            durable,
        });

        let handler_inner = Arc::clone(&inner);
        let bus_id = bus.attach(Arc::new(move |event| handler_inner.apply_remote(event)));

        Self {
            inner,
            bus,
            bus_id,
            session,
        }
    }

    pub fn config(&self) -> &ConsentConfig {
        &self.inner.config
    }

    /// The configured categories, for consent UI to render.
    pub fn categories(&self) -> &BTreeMap<String, CategoryConfig> {
        &self.inner.config.categories
    }

    /// Whether at least one persistence backend survived the availability
    /// probe. When false, state does not outlive this context.
    pub fn is_durable(&self) -> bool {
        self.inner.durable
    }

    /// Read the persisted record: primary store first, cookie fallback
    /// second. Malformed data is discarded and reads as "no consent yet".
    pub fn load(&self) -> Option<ConsentRecord> {
        self.inner.load()
    }

    /// Persist a full consent map and notify listeners.
    ///
    /// Every key must be a configured category. Required categories are
    /// forced to granted; categories recorded by an older configuration are
    /// carried forward untouched.
    pub fn save(
        &self,
        consents: &BTreeMap<String, bool>,
        source: Option<&str>,
    ) -> Result<ConsentRecord> {
        for key in consents.keys() {
            self.inner.config.ensure_known(key)?;
        }
        let source = source.unwrap_or("bulk_update");
        let values: BTreeMap<String, ConsentValue> = consents
            .iter()
            .map(|(k, v)| (k.clone(), ConsentValue::from_bool(*v)))
            .collect();
        let sources: BTreeMap<String, String> = consents
            .keys()
            .map(|k| (k.clone(), source.to_string()))
            .collect();
        Ok(self.commit(values, sources))
    }

    /// Change a single category and persist.
    ///
    /// Required categories cannot be toggled: with an existing record this
    /// is a pure no-op returning that record; on a fresh store it seeds the
    /// initial record, in which the category is granted anyway.
    pub fn update(
        &self,
        category: &str,
        granted: bool,
        source: Option<&str>,
    ) -> Result<ConsentRecord> {
        self.inner.config.ensure_known(category)?;

        if self.inner.config.is_required(category) {
            if let Some(existing) = self.inner.load() {
                return Ok(existing);
            }
        }

        let mut consents = self
            .inner
            .load()
            .map(|r| r.consents)
            .unwrap_or_else(|| self.inner.config.initial_consents());
        if !self.inner.config.is_required(category) {
            consents.insert(category.to_string(), ConsentValue::from_bool(granted));
        }

        let mut sources = BTreeMap::new();
        sources.insert(
            category.to_string(),
            source.unwrap_or("user_interaction").to_string(),
        );
        Ok(self.commit(consents, sources))
    }

    /// Grant every configured category.
    pub fn accept_all(&self) -> ConsentRecord {
        let values: BTreeMap<String, ConsentValue> = self
            .inner
            .config
            .categories
            .keys()
            .map(|k| (k.clone(), ConsentValue::Granted))
            .collect();
        let sources = values
            .keys()
            .map(|k| (k.clone(), "accept_all".to_string()))
            .collect();
        self.commit(values, sources)
    }

    /// Deny everything optional, keeping required categories granted.
    pub fn reject_all(&self) -> ConsentRecord {
        let values: BTreeMap<String, ConsentValue> = self
            .inner
            .config
            .categories
            .iter()
            .map(|(k, category)| {
                let value = if category.required {
                    ConsentValue::Granted
                } else {
                    ConsentValue::Denied
                };
                (k.clone(), value)
            })
            .collect();
        let sources = values
            .keys()
            .map(|k| (k.clone(), "reject_all".to_string()))
            .collect();
        self.commit(values, sources)
    }

    /// Remove all persisted consent and session state and notify listeners.
    pub fn clear(&self) {
        if let Some(primary) = &self.inner.primary {
            primary.remove(&self.inner.config.storage_key);
        }
        if let Some(jar) = &self.inner.cookie {
            jar.remove(&self.inner.config.cookie_name);
        }
        self.session.clear();
        *self.inner.cached.lock() = None;
        info!("cleared consent and session state");

        let event = ChangeEvent::data_cleared();
        self.inner.notify(&event);
        self.bus.publish(self.bus_id, &event);
    }

    /// Register a listener invoked once per local change, and once per
    /// change observed from another context. A panicking listener is logged
    /// and does not affect other listeners or the triggering operation.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.lock().remove(&id);
    }

    /// Whether an action gated on `category` is currently permitted.
    pub fn can_act(&self, category: &str) -> bool {
        can_act(&self.inner.config, self.inner.load().as_ref(), category)
    }

    /// Whether the user has made at least one explicit decision.
    pub fn has_any_decision(&self) -> bool {
        self.inner
            .load()
            .map(|r| has_any_decision(&r))
            .unwrap_or(false)
    }

    /// Whether the banner should be shown again: no record, or a record
    /// older than the configured TTL.
    pub fn needs_renewal(&self) -> bool {
        match self.inner.load() {
            None => true,
            Some(record) => {
                Utc::now().signed_duration_since(record.timestamp)
                    > Duration::days(i64::from(self.inner.config.ttl_days))
            }
        }
    }

    /// The current session id at `now`, renewing activity. `None` without
    /// essential consent.
    pub fn current_session(&self, now: DateTime<Utc>) -> Option<String> {
        self.session.current_session(self.inner.load().as_ref(), now)
    }

    /// Capture a consent-gated event. Returns `None` (and touches nothing)
    /// when the category is not granted; otherwise strips PII property keys,
    /// stamps the session and consent version, and notifies listeners.
    pub fn capture(
        &self,
        name: &str,
        properties: BTreeMap<String, serde_json::Value>,
        category: &str,
        now: DateTime<Utc>,
    ) -> Option<CapturedEvent> {
        let record = self.inner.load()?;
        if !can_act(&self.inner.config, Some(&record), category) {
            return None;
        }
        let session_id = self.session.current_session(Some(&record), now);
        let event = track::build_event(name, properties, category, &record, session_id, now);
        let payload = serde_json::to_value(&event).unwrap_or_default();
        self.inner.notify(&ChangeEvent::event_captured(payload));
        Some(event)
    }

    /// The full persisted record plus session state, for data-portability
    /// requests.
    pub fn export_record(&self) -> ExportBundle {
        info!("exporting consent data");
        ExportBundle {
            consent: self.inner.load(),
            session: self.session.peek(),
            exported: Utc::now(),
            version: RECORD_VERSION.to_string(),
        }
    }

    /// Build, persist, and announce a new record. All writes funnel through
    /// here so the save invariants hold everywhere.
    fn commit(
        &self,
        mut consents: BTreeMap<String, ConsentValue>,
        sources: BTreeMap<String, String>,
    ) -> ConsentRecord {
        let previous = self.inner.load();

        // Timestamps never go backwards for the same storage key.
        let mut now = Utc::now();
        if let Some(prev) = &previous {
            if prev.timestamp > now {
                now = prev.timestamp;
            }
        }

        for (key, category) in &self.inner.config.categories {
            if category.required {
                consents.insert(key.clone(), ConsentValue::Granted);
            }
        }
        // Preserve decisions recorded under an older category configuration.
        if let Some(prev) = &previous {
            for (key, value) in &prev.consents {
                if !self.inner.config.categories.contains_key(key) {
                    consents.entry(key.clone()).or_insert(*value);
                }
            }
        }

        let mut metadata = previous
            .as_ref()
            .map(|p| p.metadata.clone())
            .unwrap_or_default();
        for (key, source) in sources {
            metadata.insert(key, DecisionMetadata::new(now, &source));
        }

        let record = ConsentRecord {
            consent_id: Uuid::new_v4().to_string(),
            timestamp: now,
            version: RECORD_VERSION.to_string(),
            consents,
            metadata,
        };

        self.inner.persist(&record);
        *self.inner.cached.lock() = Some(record.clone());

        let payload = serde_json::to_value(&record).unwrap_or_default();
        let event = ChangeEvent::consent_updated(payload);
        self.inner.notify(&event);
        self.bus.publish(self.bus_id, &event);

        record
    }
}

impl Drop for ConsentStore {
    fn drop(&mut self) {
        self.bus.detach(self.bus_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use consentry_core::Error;

    fn consents(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_fresh_store_loads_empty() {
        let store = ConsentStore::new(ConsentConfig::default());
        assert!(store.load().is_none());
        assert!(store.needs_renewal());
        assert!(!store.has_any_decision());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let store = ConsentStore::new(ConsentConfig::default());
        let saved = store
            .save(&consents(&[("essential", true), ("analytics", true)]), None)
            .unwrap();
        assert_eq!(
            saved.consents["essential"],
            ConsentValue::Granted
        );
        assert_eq!(saved.consents["analytics"], ConsentValue::Granted);
        assert!(!saved.consent_id.is_empty());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_consent_id_changes_per_save() {
        let store = ConsentStore::new(ConsentConfig::default());
        let first = store.save(&consents(&[("analytics", true)]), None).unwrap();
        let second = store.save(&consents(&[("analytics", false)]), None).unwrap();
        assert_ne!(first.consent_id, second.consent_id);
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn test_required_category_cannot_be_denied() {
        let store = ConsentStore::new(ConsentConfig::default());
        // Explicitly denying a required category in a bulk save is overridden.
        let saved = store.save(&consents(&[("essential", false)]), None).unwrap();
        assert_eq!(saved.consents["essential"], ConsentValue::Granted);

        // A single-category update is a no-op.
        let before = store.load().unwrap();
        let after = store.update("essential", false, None).unwrap();
        assert_eq!(after, before);
        assert!(store.can_act("essential"));
    }

    #[test]
    fn test_update_unknown_category_rejected_without_state_change() {
        let store = ConsentStore::new(ConsentConfig::default());
        store.save(&consents(&[("analytics", true)]), None).unwrap();
        let before = store.load();

        let err = store.update("telemetry", true, None).unwrap_err();
        assert!(matches!(err, Error::InvalidCategory(_)));
        assert_eq!(store.load(), before);

        let err = store
            .save(&consents(&[("analytics", true), ("telemetry", true)]), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCategory(_)));
        assert_eq!(store.load(), before);
    }

    #[test]
    fn test_update_sets_metadata_source() {
        let store = ConsentStore::new(ConsentConfig::default());
        let record = store.update("analytics", true, None).unwrap();
        assert_eq!(record.metadata["analytics"].source, "user_interaction");

        let record = store.update("marketing", true, Some("dashboard")).unwrap();
        assert_eq!(record.metadata["marketing"].source, "dashboard");
        // Earlier metadata is preserved.
        assert_eq!(record.metadata["analytics"].source, "user_interaction");
    }

    #[test]
    fn test_accept_and_reject_all() {
        let store = ConsentStore::new(ConsentConfig::default());
        let all = store.accept_all();
        assert!(all.consents.values().all(|v| v.is_granted()));
        assert_eq!(all.metadata["analytics"].source, "accept_all");

        let minimal = store.reject_all();
        assert_eq!(minimal.consents["essential"], ConsentValue::Granted);
        assert_eq!(minimal.consents["analytics"], ConsentValue::Denied);
        assert_eq!(minimal.metadata["analytics"].source, "reject_all");
    }

    #[test]
    fn test_clear_then_load_is_empty() {
        let store = ConsentStore::new(ConsentConfig::default());
        store.save(&consents(&[("analytics", true)]), None).unwrap();
        store.clear();
        assert!(store.load().is_none());
        assert!(!store.can_act("analytics"));
    }

    #[test]
    fn test_listener_fires_once_per_change() {
        let store = ConsentStore::new(ConsentConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&seen);
        let id = store.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        store.save(&consents(&[("analytics", true)]), None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        store.clear();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        store.unsubscribe(id);
        store.save(&consents(&[("analytics", false)]), None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_does_not_abort_save() {
        let store = ConsentStore::new(ConsentConfig::default());
        store.subscribe(|_| panic!("listener bug"));
        let seen = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&seen);
        store.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let record = store.save(&consents(&[("analytics", true)]), None).unwrap();
        assert_eq!(record.consents["analytics"], ConsentValue::Granted);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_memory_only_degradation() {
        let store = ConsentStore::with_parts(
            ConsentConfig::default(),
            None,
            None,
            Arc::new(InProcessBus::new()),
        );
        assert!(!store.is_durable());

        let seen = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&seen);
        store.subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let saved = store.save(&consents(&[("analytics", true)]), None).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.load().unwrap(), saved);
        assert!(store.can_act("analytics"));
    }

    #[test]
    fn test_legacy_categories_survive_saves_but_fail_closed() {
        let mut config = ConsentConfig::default();
        config.storage_mode = StorageMode::Local;
        let backend = Arc::new(MemoryBackend::new());

        // A record written under an older configuration with a category the
        // active one no longer knows.
        backend
            .set(
                &config.storage_key,
                r#"{"consentId":"old","timestamp":"2026-01-01T00:00:00Z","version":"2.0","consents":{"essential":true,"telemetry":true}}"#,
            )
            .unwrap();

        let store = ConsentStore::with_parts(
            config,
            Some(backend),
            None,
            Arc::new(InProcessBus::new()),
        );
        assert!(!store.can_act("telemetry"));

        let record = store.update("analytics", true, None).unwrap();
        assert_eq!(record.consents["telemetry"], ConsentValue::Granted);
        assert!(!store.can_act("telemetry"));
    }
}
