//! Connection lifecycle tests for StorageClient over the memory engine

use std::rc::Rc;

use pretty_assertions::assert_eq;
use serde_json::json;
use stow_core::{
    ClientConfig, ConnectionPhase, Engine, EngineError, EngineEvent, ErrorKind, MemoryEngine,
    MemorySettings, RecordPropertySpec, SchemaUpgrade, SettingsStore, StorageClient, StoreError,
    StoreOptions, StoreTemplate,
};

fn notes_template() -> StoreTemplate {
    StoreTemplate::new(StoreOptions::auto_increment("id"))
        .field("tag", RecordPropertySpec::indexed())
}

/// Helper to create a client sharing `engine` and `settings` with a `notes`
/// store registered.
fn create_client(engine: &MemoryEngine, settings: &MemorySettings) -> StorageClient<MemoryEngine> {
    stow_core::logging::init_for_tests("debug");
    let client = StorageClient::new(engine.clone(), settings.clone());
    client.add_store_template("notes", notes_template());
    client
}

fn position(journal: &[EngineEvent], matches: impl Fn(&EngineEvent) -> bool) -> usize {
    journal
        .iter()
        .position(matches)
        .expect("event not in journal")
}

#[tokio::test]
async fn test_open_creates_registered_stores() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());
    client.add_store_template("files", StoreTemplate::default());

    let connection = client.open_object_store(None).await.unwrap();

    assert_eq!(connection.name(), "stow");
    assert_eq!(connection.version(), 1);
    assert_eq!(engine.store_names("stow"), vec!["files", "notes"]);
    assert_eq!(client.phase(), ConnectionPhase::Open);
}

#[tokio::test]
async fn test_open_reuses_live_handle() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());

    let first = client.open_object_store(None).await.unwrap();
    let second = client.open_object_store(Some("notes")).await.unwrap();

    assert!(Rc::ptr_eq(&first, &second));
    let opens = engine
        .journal()
        .iter()
        .filter(|event| matches!(event, EngineEvent::Opened { .. }))
        .count();
    assert_eq!(opens, 1);
}

#[tokio::test]
async fn test_reopen_closes_prior_handle_first() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());

    client.set_database("one", None);
    let first = client.open_object_store(None).await.unwrap();
    client.set_database("two", None);
    let second = client.open_object_store(None).await.unwrap();

    assert!(first.is_closed());
    assert!(!second.is_closed());

    let journal = engine.journal();
    let closed = position(&journal, |event| {
        matches!(event, EngineEvent::Closed { database, .. } if database == "one")
    });
    let opened = position(&journal, |event| {
        matches!(event, EngineEvent::Opened { database, .. } if database == "two")
    });
    assert!(closed < opened);
}

#[tokio::test]
async fn test_version_bump_upgrades_same_database() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());
    client.set_database("notes", Some(1));
    client.store_item(&json!({"tag": "a"}), "notes").await.unwrap();

    client.add_store_template("files", StoreTemplate::default());
    client.set_database("notes", Some(2));
    let connection = client.open_object_store(None).await.unwrap();

    assert_eq!(connection.version(), 2);
    assert_eq!(engine.store_names("notes"), vec!["files", "notes"]);
    assert_eq!(engine.records("notes", "notes").len(), 1);
    assert!(engine.journal().contains(&EngineEvent::Upgraded {
        database: "notes".into(),
        old_version: 1,
        new_version: 2,
    }));
}

#[tokio::test]
async fn test_upgrade_continues_after_failed_store() {
    let engine = MemoryEngine::new();
    let client = StorageClient::new(engine.clone(), MemorySettings::new());
    client.add_store_templates([
        ("first", StoreTemplate::default()),
        (
            "broken",
            StoreTemplate::new(StoreOptions {
                key_path: Some(String::new()),
                auto_increment: true,
            }),
        ),
        ("last", StoreTemplate::default()),
    ]);

    client.open_object_store(None).await.unwrap();

    assert_eq!(engine.store_names("stow"), vec!["first", "last"]);
}

#[tokio::test]
async fn test_settings_survive_new_client() {
    let engine = MemoryEngine::new();
    let settings = MemorySettings::new();

    let client = create_client(&engine, &settings);
    client.set_database("journal", Some(3));
    client.open_object_store(None).await.unwrap();
    client.close_database("test");

    assert_eq!(settings.get("stow.database").as_deref(), Some("journal"));
    assert_eq!(settings.get("stow.versions").as_deref(), Some(r#"{"journal":3}"#));

    let reloaded = create_client(&engine, &settings);
    let props = reloaded.properties();
    assert_eq!(props.name, "journal");
    assert_eq!(props.version, 3);

    let connection = reloaded.open_object_store(None).await.unwrap();
    assert_eq!(connection.version(), 3);
}

#[tokio::test]
async fn test_custom_settings_keys() {
    let settings = MemorySettings::new();
    let config = ClientConfig::from_json(
        r#"{"database_key": "app.db", "versions_key": "app.versions", "default_database": "app"}"#,
    )
    .unwrap();
    let client = StorageClient::with_config(MemoryEngine::new(), settings.clone(), config);

    assert_eq!(client.database_name(), "app");
    client.set_database("other", Some(5));
    assert_eq!(settings.get("app.db").as_deref(), Some("other"));
    assert_eq!(settings.get("app.versions").as_deref(), Some(r#"{"other":5}"#));
}

#[tokio::test]
async fn test_second_client_upgrade_is_blocked() {
    let engine = MemoryEngine::new();
    let holder = create_client(&engine, &MemorySettings::new());
    holder.set_database("shared", Some(1));
    let held = holder.open_object_store(None).await.unwrap();

    let upgrader = create_client(&engine, &MemorySettings::new());
    upgrader.set_database("shared", Some(2));
    let err = upgrader.open_object_store(None).await.unwrap_err();

    assert!(matches!(
        err,
        StoreError::Blocked { ref name, version: 2 } if name == "shared"
    ));
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(upgrader.phase(), ConnectionPhase::Closed);
    assert!(upgrader.database().is_none());

    // the holder logged the version change and kept its handle
    assert!(!held.is_closed());
    assert_eq!(holder.phase(), ConnectionPhase::Open);
    assert_eq!(engine.version("shared"), Some(1));
    assert!(engine.journal().contains(&EngineEvent::Blocked {
        database: "shared".into(),
        version: Some(2),
    }));

    // once the holder lets go the upgrade goes through
    holder.close_database("test");
    let connection = upgrader.open_object_store(None).await.unwrap();
    assert_eq!(connection.version(), 2);
}

#[tokio::test]
async fn test_open_older_version_fails() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());
    client.set_database("db", Some(2));
    client.open_object_store(None).await.unwrap();
    client.close_database("test");

    client.set_database("db", Some(1));
    let err = client.open_object_store(None).await.unwrap_err();

    assert!(matches!(
        err,
        StoreError::Open {
            source: EngineError::Version {
                requested: 1,
                existing: 2
            },
            ..
        }
    ));
    assert_eq!(client.phase(), ConnectionPhase::Closed);
}

#[tokio::test]
async fn test_operations_open_on_demand() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());
    assert!(client.database().is_none());

    let count = client.count_items("tag", "a", "notes").await.unwrap();

    assert_eq!(count, 0);
    assert!(client.database().is_some());
    assert_eq!(client.phase(), ConnectionPhase::Open);
}

#[tokio::test]
async fn test_open_missing_store_still_succeeds() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());

    let connection = client.open_object_store(Some("unregistered")).await.unwrap();
    assert_eq!(connection.store_names(), vec!["notes"]);
}

#[tokio::test]
async fn test_close_untracked_handle_keeps_active_connection() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());
    let active = client.open_object_store(None).await.unwrap();

    let stray = engine
        .open("stow", 1, Rc::new(SchemaUpgrade::default()))
        .await
        .unwrap();
    client.close_handle(&stray, "test");

    assert!(stray.is_closed());
    assert!(!active.is_closed());
    assert!(client.database().is_some());

    client.close_handle(&active, "test");
    assert!(active.is_closed());
    assert!(client.database().is_none());
    assert_eq!(client.phase(), ConnectionPhase::Closed);
}

#[tokio::test]
async fn test_delete_database_closes_active_handle() {
    let engine = MemoryEngine::new();
    let client = create_client(&engine, &MemorySettings::new());
    let connection = client.open_object_store(None).await.unwrap();

    client.delete_database(None).await.unwrap();

    assert!(connection.is_closed());
    assert_eq!(engine.version("stow"), None);
    assert!(engine.journal().contains(&EngineEvent::Deleted {
        database: "stow".into(),
    }));

    // reopening recreates the stores
    client.open_object_store(None).await.unwrap();
    assert_eq!(engine.store_names("stow"), vec!["notes"]);
}
