//! Record operation tests for StorageClient over the memory engine

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::{json, Value};
use stow_core::{
    Direction, ErrorKind, IndexOptions, IndexQuery, Key, KeyRange, MemoryEngine, MemorySettings,
    OperationContext, RecordPropertySpec, RequestOp, StorageClient, StoreError, StoreOptions,
    StoreTemplate, TransactionMode,
};

/// Helper to create a client with a `notes` store (auto-increment `id`,
/// indexes on `tag`, `priority` and multi-entry `labels`) and a `files`
/// store keyed by `path`.
fn create_test_client() -> StorageClient<MemoryEngine> {
    stow_core::logging::init_for_tests("debug");
    let client = StorageClient::new(MemoryEngine::new(), MemorySettings::new());
    client.add_store_templates([
        (
            "notes",
            StoreTemplate::new(StoreOptions::auto_increment("id"))
                .field("tag", RecordPropertySpec::indexed())
                .field("priority", RecordPropertySpec::indexed())
                .field(
                    "labels",
                    RecordPropertySpec::indexed_with(IndexOptions {
                        unique: false,
                        multi_entry: true,
                    }),
                ),
        ),
        (
            "files",
            StoreTemplate::new(StoreOptions {
                key_path: Some("path".into()),
                auto_increment: false,
            })
            .field("kind", RecordPropertySpec::indexed()),
        ),
    ]);
    client.set_database("crud", Some(1));
    client
}

fn note(tag: &str, priority: i64) -> Value {
    json!({ "tag": tag, "priority": priority, "labels": [] })
}

fn stored_ids(client: &StorageClient<MemoryEngine>, store: &str) -> Vec<Key> {
    client
        .engine()
        .records("crud", store)
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}

#[tokio::test]
async fn test_store_and_lookup() {
    let client = create_test_client();

    let keys = client
        .store_items(&[note("a", 1), note("b", 2), note("a", 3)], "notes")
        .await
        .unwrap();
    assert_eq!(keys, vec![Key::Int(1), Key::Int(2), Key::Int(3)]);

    let found = client.lookup_items("tag", "a", "notes").await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["id"], json!(1));
    assert_eq!(found[1]["id"], json!(3));
}

#[tokio::test]
async fn test_default_store_is_first_template() {
    let client = create_test_client();

    let key = client
        .store_item(&note("a", 1), OperationContext::new())
        .await
        .unwrap();
    assert_eq!(key, Key::Int(1));
    assert_eq!(stored_ids(&client, "notes"), vec![Key::Int(1)]);
}

#[tokio::test]
async fn test_store_empty_issues_no_request() {
    let client = create_test_client();

    let nothing: [Value; 0] = [];
    let keys = client.store_items(&nothing, "notes").await.unwrap();
    assert!(keys.is_empty());
    assert_eq!(client.engine().request_count(RequestOp::Add), 0);
    assert!(client.engine().journal().is_empty());
}

#[tokio::test]
async fn test_store_batch_resolves_once_after_all_adds() {
    let client = create_test_client();
    let items: Vec<Value> = (0..5).map(|i| note("batch", i)).collect();

    let keys = client.store_items(&items, "notes").await.unwrap();
    assert_eq!(keys.len(), 5);
    assert_eq!(client.engine().request_count(RequestOp::Add), 5);
    assert_eq!(stored_ids(&client, "notes").len(), 5);
}

#[tokio::test]
async fn test_failed_add_rolls_back_batch() {
    let client = create_test_client();
    client
        .store_item(&json!({"path": "/a", "kind": "text"}), "files")
        .await
        .unwrap();

    let batch = [
        json!({"path": "/b", "kind": "text"}),
        json!({"path": "/a", "kind": "text"}),
        json!({"path": "/c", "kind": "text"}),
    ];
    let err = client.store_items(&batch, "files").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Request);
    assert!(matches!(
        err,
        StoreError::Request {
            operation: "add",
            source: stow_core::EngineError::Constraint(_)
        }
    ));
    assert_eq!(stored_ids(&client, "files"), vec![Key::from("/a")]);
}

#[tokio::test]
async fn test_fetch_items_visits_in_key_order() {
    let client = create_test_client();
    client
        .store_items(&[note("x", 3), note("y", 1), note("z", 2)], "notes")
        .await
        .unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let visited = client
        .fetch_items(
            move |key: &Key, value: &Value, position: usize| {
                sink.borrow_mut()
                    .push((key.clone(), value["tag"].clone(), position));
            },
            "notes",
        )
        .await
        .unwrap();

    assert_eq!(visited, 3);
    assert_eq!(
        *seen.borrow(),
        vec![
            (Key::Int(1), json!("x"), 0),
            (Key::Int(2), json!("y"), 1),
            (Key::Int(3), json!("z"), 2),
        ]
    );
}

#[tokio::test]
async fn test_fetch_empty_store() {
    let client = create_test_client();
    let visited = client
        .fetch_items(|_: &Key, _: &Value, _: usize| {}, "notes")
        .await
        .unwrap();
    assert_eq!(visited, 0);
}

#[tokio::test]
async fn test_count_and_keys() {
    let client = create_test_client();
    client
        .store_items(
            &[note("a", 1), note("a", 5), note("b", 3), note("c", 4)],
            "notes",
        )
        .await
        .unwrap();

    assert_eq!(client.count_items("tag", "a", "notes").await.unwrap(), 2);
    assert_eq!(client.count_items("tag", "none", "notes").await.unwrap(), 0);

    let in_range = client
        .count_items("priority", KeyRange::bound(3i64, 4i64), "notes")
        .await
        .unwrap();
    assert_eq!(in_range, 2);

    let keys = client.lookup_store_keys("tag", "a", "notes").await.unwrap();
    assert_eq!(keys, vec![Key::Int(1), Key::Int(2)]);
}

#[tokio::test]
async fn test_lookup_with_direction_and_count() {
    let client = create_test_client();
    client
        .store_items(&[note("a", 1), note("a", 2), note("a", 3)], "notes")
        .await
        .unwrap();

    let query = IndexQuery::new("tag")
        .value("a")
        .direction(Direction::Prev)
        .count(2);
    let found = client.lookup_items_with(query, "notes").await.unwrap();
    let ids: Vec<Value> = found.iter().map(|record| record["id"].clone()).collect();
    assert_eq!(ids, vec![json!(3), json!(2)]);

    // count ignores limits
    let query = IndexQuery::new("tag").value("a").count(1);
    assert_eq!(client.count_items_with(query, "notes").await.unwrap(), 3);
}

#[tokio::test]
async fn test_multi_entry_lookup() {
    let client = create_test_client();
    client
        .store_items(
            &[
                json!({"tag": "a", "priority": 1, "labels": ["red", "blue"]}),
                json!({"tag": "b", "priority": 2, "labels": ["blue"]}),
            ],
            "notes",
        )
        .await
        .unwrap();

    assert_eq!(client.count_items("labels", "blue", "notes").await.unwrap(), 2);
    assert_eq!(client.count_items("labels", "red", "notes").await.unwrap(), 1);
}

#[derive(Debug, Deserialize, PartialEq)]
struct Note {
    id: i64,
    tag: String,
    priority: i64,
}

#[tokio::test]
async fn test_lookup_records_typed() {
    let client = create_test_client();
    client
        .store_items(&[note("a", 7), note("b", 8)], "notes")
        .await
        .unwrap();

    let notes: Vec<Note> = client.lookup_records("tag", "b", "notes").await.unwrap();
    assert_eq!(
        notes,
        vec![Note {
            id: 2,
            tag: "b".into(),
            priority: 8,
        }]
    );
}

#[tokio::test]
async fn test_delete_coalesces_integer_keys() {
    let client = create_test_client();
    let items: Vec<Value> = (1..=10)
        .map(|i| {
            let tag = if [1, 2, 3, 7, 8, 10].contains(&i) { "old" } else { "new" };
            note(tag, i)
        })
        .collect();
    client.store_items(&items, "notes").await.unwrap();

    let removed = client.delete_items("tag", "old", "notes").await.unwrap();

    assert_eq!(removed, 6);
    assert_eq!(client.engine().request_count(RequestOp::Delete), 3);
    assert_eq!(
        stored_ids(&client, "notes"),
        vec![Key::Int(4), Key::Int(5), Key::Int(6), Key::Int(9)]
    );
}

#[tokio::test]
async fn test_delete_without_matches_issues_no_delete() {
    let client = create_test_client();
    client.store_item(&note("a", 1), "notes").await.unwrap();

    let removed = client.delete_items("tag", "missing", "notes").await.unwrap();

    assert_eq!(removed, 0);
    assert_eq!(client.engine().request_count(RequestOp::Delete), 0);
    assert_eq!(stored_ids(&client, "notes"), vec![Key::Int(1)]);
}

#[tokio::test]
async fn test_delete_text_keys_one_by_one() {
    let client = create_test_client();
    client
        .store_items(
            &[
                json!({"path": "/a", "kind": "tmp"}),
                json!({"path": "/b", "kind": "tmp"}),
                json!({"path": "/c", "kind": "keep"}),
            ],
            "files",
        )
        .await
        .unwrap();

    let removed = client.delete_items("kind", "tmp", "files").await.unwrap();

    assert_eq!(removed, 2);
    assert_eq!(client.engine().request_count(RequestOp::Delete), 2);
    assert_eq!(stored_ids(&client, "files"), vec![Key::from("/c")]);
}

#[tokio::test]
async fn test_clear_keeps_key_generator() {
    let client = create_test_client();
    client
        .store_items(&[note("a", 1), note("a", 2)], "notes")
        .await
        .unwrap();

    client.clear_object_store(Some("notes")).await.unwrap();
    assert!(stored_ids(&client, "notes").is_empty());

    let key = client.store_item(&note("a", 3), "notes").await.unwrap();
    assert_eq!(key, Key::Int(3));
}

#[tokio::test]
async fn test_unknown_store() {
    let client = create_test_client();

    let err = client
        .lookup_items("tag", "a", "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownStore(ref name) if name == "missing"));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // the sentinel the caller falls back to
    let found = client
        .lookup_items("tag", "a", "missing")
        .await
        .unwrap_or_default();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_unknown_index() {
    let client = create_test_client();
    let err = client
        .count_items("colour", "red", "notes")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);
    assert!(err.to_string().starts_with("count request failed"));
}

#[tokio::test]
async fn test_read_only_context_rejects_writes() {
    let client = create_test_client();
    let err = client
        .store_item(&note("a", 1), OperationContext::read_only("notes"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Request {
            source: stow_core::EngineError::ReadOnly(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_shared_transaction_spans_stores() {
    let client = create_test_client();
    let connection = client.open_object_store(None).await.unwrap();
    let transaction = connection
        .transaction(&["notes", "files"], TransactionMode::ReadWrite)
        .unwrap();

    client
        .store_item(
            &note("a", 1),
            OperationContext::new().transaction(transaction.clone()),
        )
        .await
        .unwrap();
    client
        .store_item(
            &json!({"path": "/a", "kind": "text"}),
            OperationContext::new()
                .transaction(transaction.clone())
                .store_name("files"),
        )
        .await
        .unwrap();
    assert_eq!(stored_ids(&client, "notes").len(), 1);
    assert_eq!(stored_ids(&client, "files").len(), 1);

    transaction.abort().unwrap();
    assert!(stored_ids(&client, "notes").is_empty());
    assert!(stored_ids(&client, "files").is_empty());
}

#[tokio::test]
async fn test_abort_keeps_other_transactions_writes() {
    let client = create_test_client();
    let connection = client.open_object_store(None).await.unwrap();
    let held = connection
        .transaction(&["files", "notes"], TransactionMode::ReadWrite)
        .unwrap();

    client
        .store_item(
            &json!({"path": "/held", "kind": "text"}),
            OperationContext::new()
                .transaction(held.clone())
                .store_name("files"),
        )
        .await
        .unwrap();
    client
        .store_item(&note("held", 1), OperationContext::new().transaction(held.clone()))
        .await
        .unwrap();

    client
        .store_item(&json!({"path": "/b", "kind": "text"}), "files")
        .await
        .unwrap();
    let committed = client.store_item(&note("b", 2), "notes").await.unwrap();
    assert_eq!(committed, Key::Int(2));

    held.abort().unwrap();
    assert_eq!(stored_ids(&client, "files"), vec![Key::from("/b")]);
    assert_eq!(stored_ids(&client, "notes"), vec![Key::Int(2)]);

    let next = client.store_item(&note("c", 3), "notes").await.unwrap();
    assert_eq!(next, Key::Int(3));
}

#[tokio::test]
async fn test_store_handle_context() {
    let client = create_test_client();
    let resolved = client
        .resolve_context(OperationContext::from("notes"))
        .await
        .unwrap();

    client
        .store_items(&[note("a", 1), note("b", 2)], resolved.store.clone())
        .await
        .unwrap();
    let count = client
        .count_items("tag", "a", resolved.store.clone())
        .await
        .unwrap();
    assert_eq!(count, 1);
}
