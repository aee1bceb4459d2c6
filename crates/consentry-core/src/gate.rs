//! Pure consent gating decisions.

use crate::config::ConsentConfig;
use crate::record::{ConsentRecord, ConsentValue};

/// Whether an action gated on `category` is permitted by `record`.
///
/// Fails closed: no record, a category absent from the configuration, a
/// category absent from the record, `unset`, and `denied` all yield `false`.
pub fn can_act(config: &ConsentConfig, record: Option<&ConsentRecord>, category: &str) -> bool {
    if config.category(category).is_none() {
        return false;
    }
    let Some(record) = record else {
        return false;
    };
    record
        .consents
        .get(category)
        .map(|v| v.is_granted())
        .unwrap_or(false)
}

/// Whether the user has made at least one explicit decision.
pub fn has_any_decision(record: &ConsentRecord) -> bool {
    record.consents.values().any(|v| *v != ConsentValue::Unset)
}
