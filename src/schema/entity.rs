use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::rule::Rule;

// ============================================================================
// Value Kinds & Cardinality
// ============================================================================

/// The storage type of a scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Text,
    Number,
    Boolean,
    /// Epoch milliseconds.
    Timestamp,
    /// Opaque/untyped JSON.
    Json,
}

/// Whether a relation holds at most one related instance or a set of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
}

// ============================================================================
// Attribute & Link Definitions
// ============================================================================

/// One scalar field of an entity type. Immutable once declared.
#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub kind: ValueKind,
    pub required: bool,
    /// Custom structural rule; when present it takes precedence over the
    /// rule synthesized from `kind`.
    pub rule: Option<Rule>,
}

impl AttributeDef {
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rule = Some(rule);
        self
    }
}

/// One relation field of an entity type. Immutable once declared.
#[derive(Debug, Clone)]
pub struct LinkDef {
    /// Name of the related entity type.
    pub entity: String,
    pub cardinality: Cardinality,
    /// Custom structural rule (e.g. "at least one link required").
    pub rule: Option<Rule>,
}

// ============================================================================
// Entity & Schema Definitions
// ============================================================================

/// An entity type: its scalar attributes and its relation fields.
#[derive(Debug, Clone, Default)]
pub struct EntityDef {
    pub attrs: BTreeMap<String, AttributeDef>,
    pub links: BTreeMap<String, LinkDef>,
}

impl EntityDef {
    pub fn new(
        attrs: BTreeMap<String, AttributeDef>,
        links: BTreeMap<String, LinkDef>,
    ) -> Self {
        Self { attrs, links }
    }

    /// All field names, attributes first, then links.
    pub fn field_names(&self) -> Vec<String> {
        self.attrs
            .keys()
            .chain(self.links.keys())
            .cloned()
            .collect()
    }
}

/// A whole database schema: entity types by name.
#[derive(Debug, Clone, Default)]
pub struct SchemaDef {
    pub entities: BTreeMap<String, EntityDef>,
}

impl SchemaDef {
    pub fn new(entities: BTreeMap<String, EntityDef>) -> Self {
        Self { entities }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.get(name)
    }

    pub fn entity_names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }
}

// ============================================================================
// Builder Helpers (`attr` module)
// ============================================================================

/// Attribute builder helpers. Usage: `attr::text()`, `attr::number().optional()`.
pub mod attr {
    use super::{AttributeDef, ValueKind};

    fn base(kind: ValueKind) -> AttributeDef {
        AttributeDef {
            kind,
            required: true,
            rule: None,
        }
    }

    pub fn text() -> AttributeDef {
        base(ValueKind::Text)
    }

    pub fn number() -> AttributeDef {
        base(ValueKind::Number)
    }

    pub fn boolean() -> AttributeDef {
        base(ValueKind::Boolean)
    }

    pub fn timestamp() -> AttributeDef {
        base(ValueKind::Timestamp)
    }

    pub fn json() -> AttributeDef {
        base(ValueKind::Json)
    }
}

/// A relation to a single instance of `entity` (or none).
pub fn link_one(entity: impl Into<String>) -> LinkDef {
    LinkDef {
        entity: entity.into(),
        cardinality: Cardinality::One,
        rule: None,
    }
}

/// A relation to a set of instances of `entity`.
pub fn link_many(entity: impl Into<String>) -> LinkDef {
    LinkDef {
        entity: entity.into(),
        cardinality: Cardinality::Many,
        rule: None,
    }
}

/// Attach a non-empty structural rule to a link: cardinality "one" requires
/// a linked entity, "many" requires at least one member.
pub fn make_link_required(link: &mut LinkDef, message: Option<&str>) {
    let message = message.unwrap_or("This relation is required").to_string();
    link.rule = Some(match link.cardinality {
        Cardinality::One => Rule::EntityRef {
            message: Some(message),
        },
        Cardinality::Many => Rule::MinItems(
            Box::new(Rule::Array(Box::new(Rule::EntityRef { message: None }))),
            1,
            Some(message),
        ),
    });
}
