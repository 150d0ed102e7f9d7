//! The external database client seam.
//!
//! The real-time database is an external collaborator: it delivers query
//! results over push-based subscriptions and accepts batched mutation
//! operations. This module defines the narrow trait the form layer consumes
//! plus the data types crossing that boundary. Transport, storage, and
//! consistency are entirely the client's problem.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::TransactError;

// ============================================================================
// Query
// ============================================================================

/// A query shape in the client's own format: top-level keys are entity
/// names, sub-keys of an entity are the relations to include, and the
/// reserved `"$"` key carries query modifiers (filters, paging).
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    shape: Value,
}

impl Query {
    pub fn new(shape: Value) -> Self {
        Self { shape }
    }

    /// `{ "<entity>": {} }` — all instances of one entity type. The default
    /// relation-picker query.
    pub fn entity(name: &str) -> Self {
        let mut root = Map::new();
        root.insert(name.to_string(), Value::Object(Map::new()));
        Self {
            shape: Value::Object(root),
        }
    }

    pub fn shape(&self) -> &Value {
        &self.shape
    }

    /// The relation names the query includes for `entity` — its sub-keys
    /// other than the reserved `"$"` modifier key.
    pub fn link_names(&self, entity: &str) -> Vec<String> {
        self.shape
            .get(entity)
            .and_then(Value::as_object)
            .map(|shape| {
                shape
                    .keys()
                    .filter(|k| k.as_str() != "$")
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ============================================================================
// QueryResponse
// ============================================================================

/// One subscription delivery: either an error or result rows per entity.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub error: Option<String>,
    pub data: Option<BTreeMap<String, Vec<Value>>>,
}

impl QueryResponse {
    pub fn ok(entity: &str, instances: Vec<Value>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(entity.to_string(), instances);
        Self {
            error: None,
            data: Some(data),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            data: None,
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// One mutation in a transaction batch, scoped to a single entity instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Set scalar fields to new values.
    Update {
        entity: String,
        id: String,
        fields: Map<String, Value>,
    },
    /// Establish links on a relation field. For cardinality "one" the store
    /// auto-replaces any existing link.
    Link {
        entity: String,
        id: String,
        field: String,
        ids: Vec<String>,
    },
    /// Remove links from a relation field.
    Unlink {
        entity: String,
        id: String,
        field: String,
        ids: Vec<String>,
    },
}

// ============================================================================
// DbClient
// ============================================================================

/// An owned one-shot closure that removes a subscription when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Closure type for subscription deliveries.
pub type SubscribeCallback = dyn Fn(QueryResponse) + Send + Sync;

/// The real-time database client the form layer talks to.
///
/// Subscriptions are push-based and unbounded: the callback fires on every
/// remote change until the returned [`Unsubscribe`] handle is invoked.
/// `transact` is atomic per batch — all operations apply or none do.
#[async_trait]
pub trait DbClient: Send + Sync {
    fn subscribe(&self, query: &Query, callback: Arc<SubscribeCallback>) -> Unsubscribe;

    async fn transact(&self, ops: Vec<Operation>) -> Result<(), TransactError>;

    /// A fresh globally-unique identifier for entity creation.
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
