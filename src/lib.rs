//! formlink — keep an editable form in sync with one entity in a
//! schema-defined real-time database.
//!
//! The database client is an external collaborator behind the
//! [`client::DbClient`] trait: it delivers query results over push-based
//! subscriptions and accepts batched mutation operations. This crate owns
//! everything in between — building a validator and defaults from the
//! entity schema, reconciling inbound deliveries into form state without
//! clobbering in-flight edits, diffing relation links against the last
//! remote snapshot, and debouncing/throttling/coalescing outbound writes.

pub mod client;
pub mod compare;
pub mod error;
pub mod form;
pub mod relation;
pub mod schema;

pub use error::{FormError, Result};
pub use form::sync::{EntityForm, FormOptions, FormType};
