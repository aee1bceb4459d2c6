//! Consentry Store — durable consent persistence, cross-context sync,
//! session tracking.
//!
//! The store owns the canonical [`ConsentRecord`](consentry_core::ConsentRecord),
//! writes it to injected storage backends (primary key/value store plus a
//! cookie-jar fallback), notifies local listeners synchronously, and
//! broadcasts changes to other browsing contexts over a [`SignalBus`].

pub mod backend;
pub mod bus;
pub mod cookie;
pub mod session;
pub mod store;
pub mod track;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use bus::{ChangeEvent, ChangeKind, InProcessBus, SignalBus, SubscriberId};
pub use cookie::{CookieAttributes, CookieJar};
pub use session::SessionTracker;
pub use store::{ConsentStore, ExportBundle, ListenerId};
pub use track::{CapturedEvent, ConsentStamp, PII_PROPERTY_KEYS};
