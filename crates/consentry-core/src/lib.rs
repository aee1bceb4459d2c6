//! Consentry Core — consent data model, configuration, gating decisions.
//!
//! Pure data and decision logic: the persisted record shapes (wire contract
//! shared with host frontends), the explicit configuration struct with
//! per-field defaults, and the fail-closed `can_act` gate. Persistence and
//! cross-context sync live in `consentry-store`.

pub mod config;
pub mod error;
pub mod gate;
pub mod record;

pub use config::{CategoryConfig, ConsentConfig, DefaultConsentPolicy, StorageMode};
pub use error::{Error, Result};
pub use gate::{can_act, has_any_decision};
pub use record::{
    ConsentRecord, ConsentValue, CookieRecord, DecisionMetadata, SessionRecord,
};
