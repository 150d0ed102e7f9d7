//! Relation Diff Engine — link/unlink deltas for one relation field.
//!
//! Identity is by `id` only: pickers return full entity objects but only the
//! identifier is transactionally meaningful. The prior set MUST be the last
//! value confirmed from the remote subscription, never the form's pre-edit
//! value. Two rapid edits (unlink A, then add C before the first write
//! lands) would otherwise lose the unlink of A, because the local form no
//! longer remembers A was ever a member.

use serde_json::Value;

use crate::schema::entity::Cardinality;

// ============================================================================
// LinkDelta
// ============================================================================

/// The minimal link/unlink operations needed to move a relation field from
/// the prior membership to the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkDelta {
    pub to_link: Vec<String>,
    pub to_unlink: Vec<String>,
}

impl LinkDelta {
    pub fn is_empty(&self) -> bool {
        self.to_link.is_empty() && self.to_unlink.is_empty()
    }
}

// ============================================================================
// Public API
// ============================================================================

/// The identifier of a related-entity reference, if it carries one.
pub fn entity_id(value: &Value) -> Option<&str> {
    value
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Compute the link/unlink delta for one relation field.
///
/// Cardinality "one": establishing a new link implicitly replaces the old
/// one in the store's semantics, so only a link is ever emitted — when the
/// new identifier differs from the prior one (including prior being absent).
/// Clearing a single link locally produces no delta.
///
/// Cardinality "many": members of the prior set missing from the new set
/// are unlinked; members of the new set missing from the prior set are
/// linked. Array ordering is irrelevant. Entries without an identifier
/// (e.g. null placeholders from a partially filled picker) are ignored.
pub fn diff_links(
    cardinality: Cardinality,
    prior: Option<&Value>,
    next: Option<&Value>,
) -> LinkDelta {
    match cardinality {
        Cardinality::One => {
            let prior_id = prior.and_then(entity_id);
            let next_id = next.and_then(entity_id);
            match next_id {
                Some(id) if prior_id != Some(id) => LinkDelta {
                    to_link: vec![id.to_string()],
                    to_unlink: vec![],
                },
                _ => LinkDelta::default(),
            }
        }
        Cardinality::Many => {
            let prior_ids = member_ids(prior);
            let next_ids = member_ids(next);

            let to_unlink = prior_ids
                .iter()
                .filter(|id| !next_ids.contains(id))
                .cloned()
                .collect();
            let to_link = next_ids
                .iter()
                .filter(|id| !prior_ids.contains(id))
                .cloned()
                .collect();

            LinkDelta { to_link, to_unlink }
        }
    }
}

/// Member identifiers of a many-cardinality value. Non-arrays (including the
/// `""` display substitute for an empty relation) count as empty.
fn member_ids(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(entity_id)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
