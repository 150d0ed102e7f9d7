//! EntityForm — a form bound to one entity instance, kept in sync with the
//! database in both directions.
//!
//! Update mode subscribes to the instance query; every delivery becomes the
//! new diff baseline (the snapshot) and overwrites diverging local values.
//! Local edits flow the other way through the [`UpdateScheduler`], which
//! rebuilds operations against the snapshot at fire time. Create mode skips
//! the instance subscription entirely and batches the whole form into a
//! single transaction on [`EntityForm::handle_create`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::client::{DbClient, Operation, Query, QueryResponse, Unsubscribe};
use crate::compare::is_different;
use crate::error::{FormError, Result};
use crate::relation::diff::{diff_links, entity_id};
use crate::schema::build::build_form_schema;
use crate::schema::entity::{Cardinality, LinkDef, SchemaDef};
use crate::schema::rule::{validate_fields, Rule};

use super::scheduler::{OpsBuilder, SchedulerOptions, UpdateScheduler, WriteErrorFn};
use super::state::{FieldMeta, FormState};

// ============================================================================
// FormType & FormOptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormType {
    /// Edit an existing instance; writes stream out per field.
    Update,
    /// Stage a new instance locally; nothing writes until `handle_create`.
    Create,
}

impl FormType {
    fn as_str(self) -> &'static str {
        match self {
            FormType::Update => "update",
            FormType::Create => "create",
        }
    }
}

/// Everything needed to construct an [`EntityForm`].
pub struct FormOptions {
    pub form_type: FormType,
    pub schema: SchemaDef,
    pub entity: String,
    /// The instance query (update mode). Its relation sub-keys scope which
    /// of the entity's links the form manages.
    pub query: Option<Query>,
    /// Overrides for the per-relation candidate queries. Defaults to all
    /// instances of the related entity type.
    pub link_picker_queries: BTreeMap<String, Query>,
    /// Overrides merged over the schema-derived defaults.
    pub default_values: BTreeMap<String, Value>,
    pub server_debounce_fields: BTreeMap<String, u64>,
    pub server_throttle_fields: BTreeMap<String, u64>,
    /// Observes rejected update-path writes, which are otherwise
    /// fire-and-forget. Create-mode failures surface through
    /// [`EntityForm::handle_create`] instead.
    pub on_write_error: Option<Arc<WriteErrorFn>>,
    pub debug: bool,
}

impl FormOptions {
    pub fn update(schema: SchemaDef, entity: impl Into<String>, query: Query) -> Self {
        Self::base(FormType::Update, schema, entity.into(), Some(query))
    }

    pub fn create(schema: SchemaDef, entity: impl Into<String>) -> Self {
        Self::base(FormType::Create, schema, entity.into(), None)
    }

    fn base(form_type: FormType, schema: SchemaDef, entity: String, query: Option<Query>) -> Self {
        Self {
            form_type,
            schema,
            entity,
            query,
            link_picker_queries: BTreeMap::new(),
            default_values: BTreeMap::new(),
            server_debounce_fields: BTreeMap::new(),
            server_throttle_fields: BTreeMap::new(),
            on_write_error: None,
            debug: false,
        }
    }

    pub fn with_default(mut self, field: impl Into<String>, value: Value) -> Self {
        self.default_values.insert(field.into(), value);
        self
    }

    pub fn with_debounce(mut self, field: impl Into<String>, ms: u64) -> Self {
        self.server_debounce_fields.insert(field.into(), ms);
        self
    }

    pub fn with_throttle(mut self, field: impl Into<String>, ms: u64) -> Self {
        self.server_throttle_fields.insert(field.into(), ms);
        self
    }

    pub fn with_picker_query(mut self, field: impl Into<String>, query: Query) -> Self {
        self.link_picker_queries.insert(field.into(), query);
        self
    }

    pub fn with_write_error_handler(
        mut self,
        f: impl Fn(crate::error::TransactError) + Send + Sync + 'static,
    ) -> Self {
        self.on_write_error = Some(Arc::new(f));
        self
    }

    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }
}

// ============================================================================
// FormCore
// ============================================================================

/// The parts of a form shared with subscription callbacks and timers.
struct FormCore {
    entity: String,
    links: BTreeMap<String, LinkDef>,
    rules: BTreeMap<String, Rule>,
    state: FormState,
    /// The last instance value delivered by the subscription — the diff
    /// baseline for all outgoing writes. Never the form's pre-edit value:
    /// with in-flight writes the form no longer remembers what the store
    /// holds, and only the snapshot does.
    snapshot: Mutex<Option<Value>>,
    debug: bool,
}

impl FormCore {
    /// The UI-facing stand-in for an empty relation: `""` for cardinality
    /// one, `[]` for many. Scalars pass through as-is.
    fn display_value(&self, field: &str, raw: Option<&Value>) -> Option<Value> {
        match self.links.get(field) {
            Some(link) => Some(match raw {
                None | Some(Value::Null) => match link.cardinality {
                    Cardinality::One => json!(""),
                    Cardinality::Many => json!([]),
                },
                Some(v) => v.clone(),
            }),
            None => raw.cloned(),
        }
    }

    fn revalidate(&self) {
        let values = self.state.values();
        let errors = validate_fields(&self.rules, |name| values.get(name));
        self.state.apply_validation(&errors);
    }

    /// Whether `field` currently diverges from the snapshot, with relation
    /// values compared in display form so a `""`/`[]` stand-in never counts
    /// as a change.
    fn diverges(&self, field: &str, snapshot: &Value) -> bool {
        let remote = self.display_value(field, snapshot.get(field));
        let local = self.state.value(field);
        is_different(remote.as_ref(), local.as_ref())
    }
}

/// Fold one subscription delivery into the form: refresh the snapshot,
/// overwrite diverging local values, confirm sync, re-validate.
fn apply_delivery(core: &FormCore, response: QueryResponse) {
    if let Some(message) = response.error {
        tracing::warn!(entity = %core.entity, error = %message, "instance query failed");
        return;
    }
    let instance = response
        .data
        .as_ref()
        .and_then(|data| data.get(&core.entity))
        .and_then(|rows| rows.first());
    let instance = match instance {
        Some(v) => v.clone(),
        None => {
            if core.debug {
                tracing::debug!(entity = %core.entity, "delivery without instance, ignoring");
            }
            return;
        }
    };

    *core.snapshot.lock() = Some(instance.clone());

    for field in core.rules.keys() {
        let raw = instance.get(field);
        // A relation absent from the delivery means "no linked entity" and
        // gets its display stand-in; a scalar absent from the delivery was
        // simply not returned, so its local value stays unconfirmed.
        if raw.is_none() && !core.links.contains_key(field) {
            continue;
        }
        let remote = core.display_value(field, raw);
        let local = core.state.value(field);
        if is_different(remote.as_ref(), local.as_ref()) {
            if core.debug {
                tracing::debug!(field = %field, "remote value differs, overwriting local");
            }
            if let Some(value) = remote {
                core.state.set_value(field, value);
            }
        }
        core.state.set_synced(field, true);
    }

    core.revalidate();
}

/// Build the write batch bringing `field` of the stored instance up to the
/// form's current value. Empty when there is no divergence, no snapshot yet,
/// or the field currently fails validation.
fn build_update_ops(core: &FormCore, field: &str) -> Vec<Operation> {
    let snapshot = match core.snapshot.lock().clone() {
        Some(s) => s,
        None => return Vec::new(),
    };
    let id = match entity_id(&snapshot) {
        Some(id) => id.to_string(),
        None => return Vec::new(),
    };
    if !core.state.field_errors(field).is_empty() {
        return Vec::new();
    }
    if !core.diverges(field, &snapshot) {
        return Vec::new();
    }

    let local = core.state.value(field);
    match core.links.get(field) {
        Some(link) => {
            // Diff against the raw snapshot value, not the display form.
            let delta = diff_links(link.cardinality, snapshot.get(field), local.as_ref());
            let mut ops = Vec::new();
            if !delta.to_unlink.is_empty() {
                ops.push(Operation::Unlink {
                    entity: core.entity.clone(),
                    id: id.clone(),
                    field: field.to_string(),
                    ids: delta.to_unlink,
                });
            }
            if !delta.to_link.is_empty() {
                ops.push(Operation::Link {
                    entity: core.entity.clone(),
                    id,
                    field: field.to_string(),
                    ids: delta.to_link,
                });
            }
            ops
        }
        None => {
            let mut fields = Map::new();
            fields.insert(field.to_string(), local.unwrap_or(Value::Null));
            vec![Operation::Update {
                entity: core.entity.clone(),
                id,
                fields,
            }]
        }
    }
}

// ============================================================================
// EntityForm
// ============================================================================

pub struct EntityForm {
    client: Arc<dyn DbClient>,
    core: Arc<FormCore>,
    scheduler: UpdateScheduler,
    form_type: FormType,
    defaults: BTreeMap<String, Value>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
    disposed: AtomicBool,
}

impl EntityForm {
    /// Construct a form and open its subscriptions. Must run inside a tokio
    /// runtime; the scheduler spawns its timers there.
    pub fn new(client: Arc<dyn DbClient>, options: FormOptions) -> Result<Self> {
        let entity_def = options
            .schema
            .entity(&options.entity)
            .ok_or_else(|| FormError::UnknownEntity(options.entity.clone()))?;

        // The instance query scopes which relations the form manages; with
        // no query (create mode), all of the entity's relations are in play.
        let links: BTreeMap<String, LinkDef> = match &options.query {
            Some(query) => {
                let scoped = query.link_names(&options.entity);
                entity_def
                    .links
                    .iter()
                    .filter(|(name, _)| scoped.contains(name))
                    .map(|(name, def)| (name.clone(), def.clone()))
                    .collect()
            }
            None => entity_def.links.clone(),
        };

        let schema = build_form_schema(entity_def, &links);
        let mut defaults = schema.defaults;
        for (field, value) in &options.default_values {
            defaults.insert(field.clone(), value.clone());
        }

        let core = Arc::new(FormCore {
            entity: options.entity.clone(),
            links,
            rules: schema.rules,
            state: FormState::new(defaults.clone()),
            snapshot: Mutex::new(None),
            debug: options.debug,
        });

        let build_ops: Arc<OpsBuilder> = {
            let core = Arc::clone(&core);
            Arc::new(move |field: &str| build_update_ops(&core, field))
        };
        let scheduler = UpdateScheduler::new(
            Arc::clone(&client),
            build_ops,
            SchedulerOptions {
                debounce: options.server_debounce_fields,
                throttle: options.server_throttle_fields,
                debug: options.debug,
                on_write_error: options.on_write_error,
            },
        );

        let mut subscriptions = Vec::new();

        if options.form_type == FormType::Update {
            // Guarded by the constructor: update mode always carries a query.
            if let Some(query) = &options.query {
                let core_cb = Arc::clone(&core);
                subscriptions.push(client.subscribe(
                    query,
                    Arc::new(move |response| apply_delivery(&core_cb, response)),
                ));
            }
        }

        for (name, link) in &core.links {
            let query = options
                .link_picker_queries
                .get(name)
                .cloned()
                .unwrap_or_else(|| Query::entity(&link.entity));
            let core_cb = Arc::clone(&core);
            let field = name.clone();
            let related = link.entity.clone();
            subscriptions.push(client.subscribe(
                &query,
                Arc::new(move |response: QueryResponse| {
                    if let Some(message) = response.error {
                        tracing::warn!(field = %field, error = %message, "picker query failed");
                        return;
                    }
                    let rows = response
                        .data
                        .and_then(|mut data| data.remove(&related))
                        .unwrap_or_default();
                    core_cb.state.set_picker_data(&field, rows);
                }),
            ));
        }

        Ok(Self {
            client,
            core,
            scheduler,
            form_type: options.form_type,
            defaults,
            subscriptions: Mutex::new(subscriptions),
            disposed: AtomicBool::new(false),
        })
    }

    // -----------------------------------------------------------------------
    // Editing
    // -----------------------------------------------------------------------

    /// Apply a local edit. In update mode this also schedules the write.
    pub fn handle_change(&self, field: &str, value: Value) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.core.state.set_value(field, value);
        self.core.state.mark_dirty(field);
        self.core.revalidate();

        if self.form_type == FormType::Update {
            self.handle_update();
        }
    }

    /// Schedule writes for every field diverging from the snapshot. Called
    /// automatically from `handle_change` in update mode; public so callers
    /// can re-trigger after programmatic state changes.
    pub fn handle_update(&self) {
        if self.form_type != FormType::Update || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let snapshot = match self.core.snapshot.lock().clone() {
            Some(s) => s,
            None => return,
        };

        let changed: Vec<String> = self
            .core
            .rules
            .keys()
            .filter(|field| self.core.diverges(field, &snapshot))
            .cloned()
            .collect();
        if changed.is_empty() {
            return;
        }

        for field in &changed {
            self.core.state.set_synced(field, false);
        }
        self.scheduler.apply(changed);
    }

    /// Persist the staged instance as one atomic transaction and return its
    /// generated id. Create mode only; validation failures block the write.
    pub async fn handle_create(&self) -> Result<String> {
        if self.form_type != FormType::Create {
            return Err(FormError::WrongMode {
                expected: FormType::Create.as_str(),
                actual: self.form_type.as_str(),
            });
        }
        if self.disposed.load(Ordering::SeqCst) {
            return Err(FormError::Disposed);
        }

        let values = self.core.state.values();
        let errors = validate_fields(&self.core.rules, |name| values.get(name));
        if !errors.is_empty() {
            self.core.state.apply_validation(&errors);
            return Err(errors.into());
        }

        let id = self.client.generate_id();
        let mut fields = Map::new();
        let mut link_ops = Vec::new();

        for name in self.core.rules.keys() {
            let value = values.get(name).cloned().unwrap_or(Value::Null);
            match self.core.links.get(name) {
                Some(link) => {
                    let ids: Vec<String> = match link.cardinality {
                        Cardinality::One => entity_id(&value)
                            .map(|id| vec![id.to_string()])
                            .unwrap_or_default(),
                        Cardinality::Many => value
                            .as_array()
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(entity_id)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    };
                    if !ids.is_empty() {
                        link_ops.push(Operation::Link {
                            entity: self.core.entity.clone(),
                            id: id.clone(),
                            field: name.clone(),
                            ids,
                        });
                    }
                }
                None => {
                    fields.insert(name.clone(), value);
                }
            }
        }

        let mut ops = vec![Operation::Update {
            entity: self.core.entity.clone(),
            id: id.clone(),
            fields,
        }];
        ops.extend(link_ops);

        if self.core.debug {
            tracing::debug!(entity = %self.core.entity, id = %id, op_count = ops.len(), "creating instance");
        }
        self.client.transact(ops).await?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    pub fn field<'a>(&'a self, name: &'a str) -> FieldHandle<'a> {
        FieldHandle { form: self, name }
    }

    /// Run `render` with a bound field handle. Sugar for call sites that
    /// build UI per field.
    pub fn with_field<R>(&self, name: &str, render: impl FnOnce(FieldHandle<'_>) -> R) -> R {
        render(self.field(name))
    }

    pub fn value(&self, field: &str) -> Option<Value> {
        self.core.state.value(field)
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.core.state.values()
    }

    /// The structural rules the form validates against.
    pub fn validator(&self) -> &BTreeMap<String, Rule> {
        &self.core.rules
    }

    /// The resolved per-field defaults (schema-derived plus overrides).
    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Tear down subscriptions and cancel pending writes. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for unsubscribe in self.subscriptions.lock().drain(..) {
            unsubscribe();
        }
        self.scheduler.dispose();
    }
}

impl Drop for EntityForm {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// FieldHandle
// ============================================================================

/// A field-scoped view of the form, for wiring one input control.
pub struct FieldHandle<'a> {
    form: &'a EntityForm,
    name: &'a str,
}

impl FieldHandle<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn value(&self) -> Option<Value> {
        self.form.value(self.name)
    }

    pub fn meta(&self) -> FieldMeta {
        self.form.core.state.meta(self.name)
    }

    pub fn synced(&self) -> bool {
        self.meta().synced
    }

    pub fn dirty(&self) -> bool {
        self.meta().dirty
    }

    /// Picker candidates for relation fields; empty for scalars.
    pub fn data(&self) -> Vec<Value> {
        self.meta().data
    }

    pub fn errors(&self) -> Vec<crate::error::ValidationError> {
        self.meta().errors
    }

    /// The first validation error, suppressed until the user has actually
    /// touched the field — pristine forms show no red.
    pub fn error_message(&self) -> Option<String> {
        let meta = self.meta();
        if !meta.dirty {
            return None;
        }
        meta.errors.first().map(|e| e.message.clone())
    }

    pub fn handle_change(&self, value: Value) {
        self.form.handle_change(self.name, value);
    }
}
