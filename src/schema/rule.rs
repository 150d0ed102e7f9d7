use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ValidationError, ValidationErrors};

// ============================================================================
// Rule Types
// ============================================================================

/// Closure type for computed defaults. Fallible: a user-authored default
/// expression must never crash form construction (the builder falls back to
/// the value-kind default instead).
pub type DefaultFn =
    dyn Fn() -> std::result::Result<Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync;

/// Source of a rule-attached default value.
#[derive(Clone)]
pub enum RuleDefault {
    Value(Value),
    Compute(Arc<DefaultFn>),
}

impl std::fmt::Debug for RuleDefault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleDefault::Value(v) => f.debug_tuple("Value").field(v).finish(),
            RuleDefault::Compute(_) => f.debug_tuple("Compute").field(&"<fn>").finish(),
        }
    }
}

/// A structural rule describing the shape a form value must have.
#[derive(Debug, Clone)]
pub enum Rule {
    Text,
    Number,
    Boolean,
    /// Unconstrained — accepts anything.
    Any,
    /// Null and the empty-string relation stand-in are "absent"; any other
    /// value is checked against the inner rule.
    Optional(Box<Rule>),
    Array(Box<Rule>),
    /// Inner rule plus a minimum length requirement, with an optional
    /// custom message.
    MinItems(Box<Rule>, usize, Option<String>),
    /// An object carrying at least a non-empty string `id` field — the shape
    /// of a related-entity reference. Extra properties pass through.
    EntityRef { message: Option<String> },
    Object(BTreeMap<String, Rule>),
    /// Inner rule with an attached default, read by the schema builder.
    WithDefault(Box<Rule>, RuleDefault),
}

impl Rule {
    pub fn optional(self) -> Rule {
        Rule::Optional(Box::new(self))
    }

    pub fn with_default(self, value: Value) -> Rule {
        Rule::WithDefault(Box::new(self), RuleDefault::Value(value))
    }

    pub fn with_computed_default(
        self,
        f: impl Fn() -> std::result::Result<Value, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> Rule {
        Rule::WithDefault(Box::new(self), RuleDefault::Compute(Arc::new(f)))
    }
}

/// Evaluate the default attached to the outermost layer of `rule`, if any.
///
/// Returns `None` when the rule carries no default; `Some(Err(_))` when a
/// computed default fails (the caller falls back to the value-kind default).
pub fn rule_default(
    rule: &Rule,
) -> Option<std::result::Result<Value, Box<dyn std::error::Error + Send + Sync>>> {
    match rule {
        Rule::WithDefault(_, d) => Some(match d {
            RuleDefault::Value(v) => Ok(v.clone()),
            RuleDefault::Compute(f) => f(),
        }),
        _ => None,
    }
}

// ============================================================================
// Validation Context
// ============================================================================

struct ValidationContext {
    errors: Vec<ValidationError>,
    path: Vec<String>,
}

impl ValidationContext {
    fn new() -> Self {
        Self {
            errors: vec![],
            path: vec![],
        }
    }

    fn push_key(&mut self, key: impl Into<String>) {
        self.path.push(key.into());
    }

    fn push_index(&mut self, idx: usize) {
        self.path.push(format!("[{idx}]"));
    }

    fn pop(&mut self) {
        self.path.pop();
    }

    /// Join path segments, collapsing `".[0]"` → `"[0]"`.
    fn current_path(&self) -> String {
        self.path.join(".").replace(".[", "[")
    }

    fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(ValidationError {
            path: self.current_path(),
            message: message.into(),
        });
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const MAX_DEPTH: usize = 64;

// ============================================================================
// Core Walker
// ============================================================================

fn walk(rule: &Rule, value: &Value, ctx: &mut ValidationContext, depth: usize) {
    if depth > MAX_DEPTH {
        ctx.add_error(format!("maximum rule nesting depth exceeded ({MAX_DEPTH})"));
        return;
    }

    match rule {
        Rule::Text => {
            if !value.is_string() {
                ctx.add_error(format!("expected string, received {}", type_name(value)));
            }
        }

        Rule::Number => {
            if !value.is_number() {
                ctx.add_error(format!("expected number, received {}", type_name(value)));
            }
        }

        Rule::Boolean => {
            if !value.is_boolean() {
                ctx.add_error(format!("expected boolean, received {}", type_name(value)));
            }
        }

        Rule::Any => {}

        Rule::Optional(inner) => {
            let absent = value.is_null() || value.as_str() == Some("");
            if !absent {
                walk(inner, value, ctx, depth + 1);
            }
        }

        Rule::Array(element) => match value.as_array() {
            None => {
                ctx.add_error(format!("expected array, received {}", type_name(value)));
            }
            Some(arr) => {
                for (i, item) in arr.iter().enumerate() {
                    ctx.push_index(i);
                    walk(element, item, ctx, depth + 1);
                    ctx.pop();
                }
            }
        },

        Rule::MinItems(inner, min, message) => {
            walk(inner, value, ctx, depth + 1);
            if let Some(arr) = value.as_array() {
                if arr.len() < *min {
                    match message {
                        Some(m) => ctx.add_error(m.clone()),
                        None => ctx.add_error(format!(
                            "expected at least {min} items, received {}",
                            arr.len()
                        )),
                    }
                }
            }
        }

        Rule::EntityRef { message } => {
            let id_ok = value
                .get("id")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            if !id_ok {
                match message {
                    Some(m) => ctx.add_error(m.clone()),
                    None => ctx.add_error(format!(
                        "expected entity reference with an id, received {}",
                        type_name(value)
                    )),
                }
            }
        }

        Rule::Object(props) => match value.as_object() {
            None => {
                ctx.add_error(format!("expected object, received {}", type_name(value)));
            }
            Some(map) => {
                for (key, prop_rule) in props {
                    ctx.push_key(key);
                    let prop_value = map.get(key).unwrap_or(&Value::Null);
                    walk(prop_rule, prop_value, ctx, depth + 1);
                    ctx.pop();
                }
            }
        },

        Rule::WithDefault(inner, _) => walk(inner, value, ctx, depth + 1),
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Validate `value` against `rule`.
pub fn validate(rule: &Rule, value: &Value) -> Result<(), ValidationErrors> {
    let mut ctx = ValidationContext::new();
    walk(rule, value, &mut ctx, 0);
    if ctx.errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors(ctx.errors))
    }
}

/// Validate one named field: the field name becomes the error path root.
pub fn validate_field(name: &str, rule: &Rule, value: &Value) -> Vec<ValidationError> {
    let mut ctx = ValidationContext::new();
    ctx.push_key(name);
    walk(rule, value, &mut ctx, 0);
    ctx.errors
}

/// Validate a whole rule map against a value-lookup function. Missing values
/// are checked as `Null`.
pub fn validate_fields<'a>(
    rules: &BTreeMap<String, Rule>,
    lookup: impl Fn(&str) -> Option<&'a Value>,
) -> ValidationErrors {
    let mut all = Vec::new();
    for (name, rule) in rules {
        let value = lookup(name).unwrap_or(&Value::Null);
        all.extend(validate_field(name, rule, value));
    }
    ValidationErrors(all)
}
