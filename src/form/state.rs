//! FormState — the in-memory editable representation of one entity instance.
//!
//! Field values plus per-field synchronization metadata, behind interior
//! mutability so subscription callbacks, timers, and UI code can all hold
//! `&FormState`. Change listeners use snapshot-on-emit semantics: the lock
//! is never held while a listener runs, so listeners may freely read the
//! state or register/remove other listeners.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{ValidationError, ValidationErrors};

// ============================================================================
// FieldMeta
// ============================================================================

/// Synchronization metadata carried alongside each field value.
#[derive(Debug, Clone, Default)]
pub struct FieldMeta {
    /// True once the field's value is confirmed to match the last known
    /// remote value; false immediately after a local edit pending a write.
    pub synced: bool,
    /// Candidate related entities for relation fields, refreshed by the
    /// picker subscription. Empty for scalar fields.
    pub data: Vec<Value>,
    /// Current structural validation errors for this field.
    pub errors: Vec<ValidationError>,
    /// True once the user has edited the field locally.
    pub dirty: bool,
}

// ============================================================================
// FormState
// ============================================================================

/// Listener id for change callbacks.
pub type ListenerId = u64;

/// Closure type for change listeners: `(field name, new value)`.
pub type ChangeFn = dyn Fn(&str, &Value) + Send + Sync;

struct StateInner {
    values: BTreeMap<String, Value>,
    meta: BTreeMap<String, FieldMeta>,
}

pub struct FormState {
    inner: Mutex<StateInner>,
    listeners: Mutex<Vec<(ListenerId, Arc<ChangeFn>)>>,
    next_listener_id: AtomicU64,
}

impl FormState {
    /// Create form state seeded with `defaults`. Every field starts
    /// unsynced; the first subscription delivery confirms it.
    pub fn new(defaults: BTreeMap<String, Value>) -> Self {
        let meta = defaults
            .keys()
            .map(|k| (k.clone(), FieldMeta::default()))
            .collect();
        Self {
            inner: Mutex::new(StateInner {
                values: defaults,
                meta,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    pub fn value(&self, name: &str) -> Option<Value> {
        self.inner.lock().values.get(name).cloned()
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.inner.lock().values.clone()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.inner.lock().values.keys().cloned().collect()
    }

    /// Set a field value and notify change listeners.
    pub fn set_value(&self, name: &str, value: Value) {
        {
            let mut st = self.inner.lock();
            st.values.insert(name.to_string(), value.clone());
            st.meta.entry(name.to_string()).or_default();
        }
        self.emit_change(name, &value);
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn meta(&self, name: &str) -> FieldMeta {
        self.inner.lock().meta.get(name).cloned().unwrap_or_default()
    }

    pub fn set_synced(&self, name: &str, synced: bool) {
        self.inner
            .lock()
            .meta
            .entry(name.to_string())
            .or_default()
            .synced = synced;
    }

    pub fn set_picker_data(&self, name: &str, data: Vec<Value>) {
        self.inner
            .lock()
            .meta
            .entry(name.to_string())
            .or_default()
            .data = data;
    }

    pub fn mark_dirty(&self, name: &str) {
        self.inner
            .lock()
            .meta
            .entry(name.to_string())
            .or_default()
            .dirty = true;
    }

    /// Replace every field's error list from a whole-form validation pass.
    /// Errors are grouped by the root field of their path.
    pub fn apply_validation(&self, errors: &ValidationErrors) {
        let mut st = self.inner.lock();
        for meta in st.meta.values_mut() {
            meta.errors.clear();
        }
        for error in &errors.0 {
            st.meta
                .entry(error.root_field().to_string())
                .or_default()
                .errors
                .push(error.clone());
        }
    }

    pub fn field_errors(&self, name: &str) -> Vec<ValidationError> {
        self.meta(name).errors
    }

    pub fn has_errors(&self) -> bool {
        self.inner
            .lock()
            .meta
            .values()
            .any(|m| !m.errors.is_empty())
    }

    // -----------------------------------------------------------------------
    // Change listeners
    // -----------------------------------------------------------------------

    pub fn on_change(&self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Does nothing if `id` is not present.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn emit_change(&self, name: &str, value: &Value) {
        // Snapshot Arc references under the lock, fire outside it.
        let snapshot: Vec<Arc<ChangeFn>> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            cb(name, value);
        }
    }
}
