//! EntityForm tests — delivery folding, outgoing writes, create mode, and
//! lifecycle, against a mock database client.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use formlink::client::{
    DbClient, Operation, Query, QueryResponse, SubscribeCallback, Unsubscribe,
};
use formlink::error::{FormError, TransactError};
use formlink::form::sync::{EntityForm, FormOptions};
use formlink::schema::entity::{attr, link_many, link_one, EntityDef, SchemaDef};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

// ============================================================================
// Mock infrastructure
// ============================================================================

struct MockClient {
    inner: Mutex<MockInner>,
    unsubscribed: Arc<AtomicUsize>,
}

struct MockInner {
    subscriptions: Vec<(Query, Arc<SubscribeCallback>)>,
    transactions: Vec<Vec<Operation>>,
    fail_with: Option<String>,
}

impl MockClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MockInner {
                subscriptions: Vec::new(),
                transactions: Vec::new(),
                fail_with: None,
            }),
            unsubscribed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Fire every subscription whose query mentions `entity` at top level.
    fn deliver(&self, entity: &str, response: QueryResponse) {
        let targets: Vec<Arc<SubscribeCallback>> = self
            .inner
            .lock()
            .subscriptions
            .iter()
            .filter(|(query, _)| query.shape().get(entity).is_some())
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in targets {
            cb(response.clone());
        }
    }

    fn transactions(&self) -> Vec<Vec<Operation>> {
        self.inner.lock().transactions.clone()
    }

    fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    fn unsubscribe_count(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    fn fail_transactions(&self, message: &str) {
        self.inner.lock().fail_with = Some(message.to_string());
    }
}

#[async_trait]
impl DbClient for MockClient {
    fn subscribe(&self, query: &Query, callback: Arc<SubscribeCallback>) -> Unsubscribe {
        self.inner
            .lock()
            .subscriptions
            .push((query.clone(), callback));
        let counter = self.unsubscribed.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn transact(&self, ops: Vec<Operation>) -> Result<(), TransactError> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.fail_with.clone() {
            return Err(TransactError::new(message));
        }
        inner.transactions.push(ops);
        Ok(())
    }

    fn generate_id(&self) -> String {
        "new-item-1".to_string()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn schema() -> SchemaDef {
    let mut attrs = BTreeMap::new();
    attrs.insert("name".to_string(), attr::text());
    attrs.insert("count".to_string(), attr::number().optional());
    let mut links = BTreeMap::new();
    links.insert("owner".to_string(), link_one("persons"));
    links.insert("tags".to_string(), link_many("labels"));

    let mut entities = BTreeMap::new();
    entities.insert("items".to_string(), EntityDef::new(attrs, links));
    entities.insert("persons".to_string(), EntityDef::default());
    entities.insert("labels".to_string(), EntityDef::default());
    SchemaDef::new(entities)
}

fn item_query() -> Query {
    Query::new(json!({
        "items": { "owner": {}, "tags": {}, "$": { "where": { "id": "i1" } } }
    }))
}

fn instance() -> Value {
    json!({
        "id": "i1",
        "name": "Remote",
        "count": 2,
        "owner": { "id": "p1", "name": "Ana" },
        "tags": [ { "id": "t1" }, { "id": "t2" } ]
    })
}

fn update_form(client: Arc<MockClient>) -> EntityForm {
    EntityForm::new(client, FormOptions::update(schema(), "items", item_query()))
        .expect("form should construct")
}

fn create_form(client: Arc<MockClient>) -> EntityForm {
    EntityForm::new(client, FormOptions::create(schema(), "items"))
        .expect("form should construct")
}

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn unknown_entity_is_rejected() {
    let client = MockClient::new();
    let result = EntityForm::new(
        client,
        FormOptions::create(schema(), "widgets"),
    );
    assert!(matches!(result, Err(FormError::UnknownEntity(ref e)) if e == "widgets"));
}

#[tokio::test]
async fn defaults_come_from_schema_with_overrides() {
    let client = MockClient::new();
    let form = EntityForm::new(
        client,
        FormOptions::create(schema(), "items").with_default("name", json!("Untitled")),
    )
    .expect("form should construct");

    assert_eq!(form.value("name"), Some(json!("Untitled")));
    assert_eq!(form.value("count"), Some(json!(0)));
    assert_eq!(form.value("owner"), Some(Value::Null));
    assert_eq!(form.value("tags"), Some(json!([])));
}

#[tokio::test]
async fn update_form_opens_instance_and_picker_subscriptions() {
    let client = MockClient::new();
    let _form = update_form(client.clone());
    // One instance query plus one picker per relation.
    assert_eq!(client.subscription_count(), 3);
}

// ============================================================================
// Incoming deliveries
// ============================================================================

#[tokio::test]
async fn delivery_overwrites_local_values_and_marks_synced() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    assert!(!form.field("name").synced());

    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    assert_eq!(form.value("name"), Some(json!("Remote")));
    assert_eq!(form.value("count"), Some(json!(2)));
    assert_eq!(form.value("owner"), Some(json!({ "id": "p1", "name": "Ana" })));
    assert!(form.field("name").synced());
    assert!(form.field("tags").synced());
}

#[tokio::test]
async fn delivery_substitutes_display_values_for_empty_links() {
    let client = MockClient::new();
    let form = update_form(client.clone());

    let bare = json!({ "id": "i1", "name": "Remote", "count": 1 });
    client.deliver("items", QueryResponse::ok("items", vec![bare]));

    assert_eq!(form.value("owner"), Some(json!("")));
    assert_eq!(form.value("tags"), Some(json!([])));
}

#[tokio::test]
async fn scalar_absent_from_a_delivery_stays_unsynced() {
    let client = MockClient::new();
    let form = update_form(client.clone());

    // The delivery carries no "count": the local default is neither
    // confirmed nor overwritten.
    let partial = json!({ "id": "i1", "name": "Remote" });
    client.deliver("items", QueryResponse::ok("items", vec![partial]));

    assert_eq!(form.value("count"), Some(json!(0)));
    assert!(!form.field("count").synced());
    assert!(form.field("name").synced());
}

#[tokio::test]
async fn failed_delivery_leaves_the_form_untouched() {
    let client = MockClient::new();
    let form = update_form(client.clone());

    client.deliver("items", QueryResponse::failed("query blew up"));
    assert_eq!(form.value("name"), Some(json!("")));

    // No snapshot yet, so edits stay local.
    form.handle_change("name", json!("x"));
    sleep(Duration::from_millis(20)).await;
    assert!(client.transactions().is_empty());
}

#[tokio::test]
async fn picker_deliveries_feed_field_data() {
    let client = MockClient::new();
    let form = update_form(client.clone());

    client.deliver(
        "persons",
        QueryResponse::ok("persons", vec![json!({ "id": "p1" }), json!({ "id": "p2" })]),
    );

    assert_eq!(form.field("owner").data().len(), 2);
    assert!(form.field("tags").data().is_empty());
}

// ============================================================================
// Outgoing writes
// ============================================================================

#[tokio::test]
async fn scalar_edit_writes_an_update_op() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.handle_change("name", json!("Edited"));
    assert!(!form.field("name").synced());
    sleep(Duration::from_millis(20)).await;

    let txs = client.transactions();
    assert_eq!(txs.len(), 1);
    match &txs[0][0] {
        Operation::Update { entity, id, fields } => {
            assert_eq!(entity, "items");
            assert_eq!(id, "i1");
            assert_eq!(fields["name"], json!("Edited"));
        }
        other => panic!("expected update op, got {other:?}"),
    }
}

#[tokio::test]
async fn echoed_value_writes_nothing() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.handle_change("name", json!("Remote"));
    sleep(Duration::from_millis(20)).await;
    assert!(client.transactions().is_empty());
    assert!(form.field("name").synced());
}

#[tokio::test]
async fn many_link_edit_unlinks_and_links() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.handle_change("tags", json!([{ "id": "t2" }, { "id": "t3" }]));
    sleep(Duration::from_millis(20)).await;

    let txs = client.transactions();
    assert_eq!(txs.len(), 1);
    assert_eq!(
        txs[0],
        vec![
            Operation::Unlink {
                entity: "items".to_string(),
                id: "i1".to_string(),
                field: "tags".to_string(),
                ids: vec!["t1".to_string()],
            },
            Operation::Link {
                entity: "items".to_string(),
                id: "i1".to_string(),
                field: "tags".to_string(),
                ids: vec!["t3".to_string()],
            },
        ]
    );
}

#[tokio::test]
async fn rapid_edits_diff_against_the_last_delivery() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.handle_change("tags", json!([]));
    sleep(Duration::from_millis(20)).await;

    // Second edit before any fresh delivery: the baseline is still the last
    // delivered membership, so the unlinks are carried again rather than
    // lost to the in-flight first write.
    form.handle_change("tags", json!([{ "id": "t3" }]));
    sleep(Duration::from_millis(20)).await;

    let txs = client.transactions();
    assert_eq!(txs.len(), 2);
    match &txs[1][..] {
        [Operation::Unlink { ids: unlink, .. }, Operation::Link { ids: link, .. }] => {
            assert_eq!(unlink, &vec!["t1".to_string(), "t2".to_string()]);
            assert_eq!(link, &vec!["t3".to_string()]);
        }
        other => panic!("expected unlink+link, got {other:?}"),
    }
}

#[tokio::test]
async fn clearing_a_one_link_writes_nothing() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.handle_change("owner", json!(""));
    sleep(Duration::from_millis(20)).await;
    assert!(client.transactions().is_empty());
}

#[tokio::test]
async fn invalid_value_blocks_the_write() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.handle_change("name", json!(5));
    sleep(Duration::from_millis(20)).await;

    assert!(client.transactions().is_empty());
    assert_eq!(
        form.field("name").error_message(),
        Some("expected string, received number".to_string())
    );
    // Untouched fields never surface messages.
    assert_eq!(form.field("count").error_message(), None);
}

#[tokio::test]
async fn rejected_update_write_reaches_the_error_handler() {
    let client = MockClient::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let form = EntityForm::new(
        client.clone(),
        FormOptions::update(schema(), "items", item_query())
            .with_write_error_handler(move |e| sink.lock().push(e.to_string())),
    )
    .expect("form should construct");
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));
    client.fail_transactions("server unavailable");

    form.handle_change("name", json!("Edited"));
    sleep(Duration::from_millis(20)).await;

    assert_eq!(
        seen.lock().clone(),
        vec!["Transaction failed: server unavailable".to_string()]
    );
}

// ============================================================================
// Create mode
// ============================================================================

#[tokio::test]
async fn create_stages_locally_and_writes_one_batch() {
    let client = MockClient::new();
    let form = create_form(client.clone());

    form.handle_change("name", json!("New item"));
    form.handle_change("owner", json!({ "id": "p1" }));
    form.handle_change("tags", json!([{ "id": "t1" }, { "id": "t2" }]));
    sleep(Duration::from_millis(20)).await;
    assert!(client.transactions().is_empty());

    let id = form.handle_create().await.expect("create should succeed");
    assert_eq!(id, "new-item-1");

    let txs = client.transactions();
    assert_eq!(txs.len(), 1);
    match &txs[0][0] {
        Operation::Update { entity, id, fields } => {
            assert_eq!(entity, "items");
            assert_eq!(id, "new-item-1");
            assert_eq!(fields["name"], json!("New item"));
            assert_eq!(fields["count"], json!(0));
            assert!(!fields.contains_key("owner"));
            assert!(!fields.contains_key("tags"));
        }
        other => panic!("expected update op, got {other:?}"),
    }
    assert!(txs[0].contains(&Operation::Link {
        entity: "items".to_string(),
        id: "new-item-1".to_string(),
        field: "owner".to_string(),
        ids: vec!["p1".to_string()],
    }));
    assert!(txs[0].contains(&Operation::Link {
        entity: "items".to_string(),
        id: "new-item-1".to_string(),
        field: "tags".to_string(),
        ids: vec!["t1".to_string(), "t2".to_string()],
    }));
}

#[tokio::test]
async fn create_rejects_an_invalid_form() {
    let client = MockClient::new();
    let form = create_form(client.clone());

    form.handle_change("name", json!(5));
    let result = form.handle_create().await;
    assert!(matches!(result, Err(FormError::Validation(_))));
    assert!(client.transactions().is_empty());
}

#[tokio::test]
async fn create_skips_empty_links() {
    let client = MockClient::new();
    let form = create_form(client.clone());

    form.handle_change("name", json!("Bare"));
    form.handle_create().await.expect("create should succeed");

    let txs = client.transactions();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].len(), 1, "no link ops expected: {:?}", txs[0]);
}

#[tokio::test]
async fn handle_create_requires_create_mode() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    let result = form.handle_create().await;
    assert!(matches!(result, Err(FormError::WrongMode { .. })));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn dispose_unsubscribes_and_freezes_the_form() {
    let client = MockClient::new();
    let form = update_form(client.clone());
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.dispose();
    assert_eq!(client.unsubscribe_count(), 3);

    form.handle_change("name", json!("after"));
    sleep(Duration::from_millis(20)).await;
    assert!(client.transactions().is_empty());

    // Idempotent, including the drop-time call.
    form.dispose();
    drop(form);
    assert_eq!(client.unsubscribe_count(), 3);
}

#[tokio::test]
async fn debounced_field_batches_with_immediate_one() {
    let client = MockClient::new();
    let form = EntityForm::new(
        client.clone(),
        FormOptions::update(schema(), "items", item_query()).with_debounce("name", 50),
    )
    .expect("form should construct");
    client.deliver("items", QueryResponse::ok("items", vec![instance()]));

    form.handle_change("name", json!("typing"));
    sleep(Duration::from_millis(10)).await;
    assert!(client.transactions().is_empty());

    // An edit to an unpaced field flushes the pending one in the same batch.
    form.handle_change("count", json!(9));
    sleep(Duration::from_millis(100)).await;

    let txs = client.transactions();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].len(), 2);
}
