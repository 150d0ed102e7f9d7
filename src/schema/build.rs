//! Validation Schema Builder — turns an entity's attribute and link
//! definitions into (a) a structural rule per field and (b) a default value
//! per field. Pure: never fails, never touches the database.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::entity::{AttributeDef, Cardinality, EntityDef, LinkDef, ValueKind};
use super::rule::{rule_default, Rule};

// ============================================================================
// FormSchema
// ============================================================================

/// The validator + defaults pair a form is constructed from.
#[derive(Debug, Clone)]
pub struct FormSchema {
    pub rules: BTreeMap<String, Rule>,
    pub defaults: BTreeMap<String, Value>,
}

// ============================================================================
// Value-Kind Fallbacks
// ============================================================================

/// Rule synthesized from the value kind when an attribute carries no custom
/// rule. Timestamps are epoch milliseconds, so they validate as numbers.
fn kind_rule(attr: &AttributeDef) -> Rule {
    let base = match attr.kind {
        ValueKind::Text => Rule::Text,
        ValueKind::Number | ValueKind::Timestamp => Rule::Number,
        ValueKind::Boolean => Rule::Boolean,
        ValueKind::Json => Rule::Any,
    };
    if attr.required {
        base
    } else {
        base.optional()
    }
}

/// Default value used when no custom default exists.
fn kind_default(kind: ValueKind) -> Value {
    match kind {
        ValueKind::Boolean => json!(false),
        ValueKind::Text | ValueKind::Json => json!(""),
        ValueKind::Number => json!(0),
        ValueKind::Timestamp => json!(chrono::Utc::now().timestamp_millis()),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Build the rule map and defaults for `entity`, scoped to `links` (the
/// subset of the entity's relations the form actually uses).
pub fn build_form_schema(entity: &EntityDef, links: &BTreeMap<String, LinkDef>) -> FormSchema {
    let mut rules = BTreeMap::new();
    let mut defaults = BTreeMap::new();

    for (name, attr) in &entity.attrs {
        match &attr.rule {
            Some(custom) => match rule_default(custom) {
                // Custom rule with a working default: use both.
                Some(Ok(value)) => {
                    rules.insert(name.clone(), custom.clone());
                    defaults.insert(name.clone(), value);
                }
                // The default computation failed: discard the custom rule
                // entirely and fall back to the kind, so a broken
                // user-authored rule can never break form construction.
                Some(Err(_)) => {
                    rules.insert(name.clone(), kind_rule(attr));
                    defaults.insert(name.clone(), kind_default(attr.kind));
                }
                // Custom rule without a default.
                None => {
                    rules.insert(name.clone(), custom.clone());
                    defaults.insert(name.clone(), kind_default(attr.kind));
                }
            },
            None => {
                rules.insert(name.clone(), kind_rule(attr));
                defaults.insert(name.clone(), kind_default(attr.kind));
            }
        }
    }

    for (name, link) in links {
        let (default, synthesized) = match link.cardinality {
            Cardinality::One => (
                Value::Null,
                Rule::Optional(Box::new(Rule::EntityRef { message: None })),
            ),
            Cardinality::Many => (
                json!([]),
                Rule::Array(Box::new(Rule::Optional(Box::new(Rule::EntityRef {
                    message: None,
                })))),
            ),
        };
        defaults.insert(name.clone(), default);
        rules.insert(
            name.clone(),
            link.rule.clone().unwrap_or(synthesized),
        );
    }

    FormSchema { rules, defaults }
}
