//! Value comparison used by the needs-update check and delivery reconciliation.

use serde_json::Value;

/// Deep structural inequality between two optional values.
///
/// `None` (field absent) and `Value::Null` are treated as equal: a relation
/// field cleared locally may read back as either depending on code path, and
/// that must not count as a change. Object comparison is key-order
/// insensitive.
pub fn is_different(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        (Some(v), None) | (None, Some(v)) => !v.is_null(),
    }
}
