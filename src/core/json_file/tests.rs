use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{create_json_file_persister, JsonFileOptions, JsonFilePersister, ListenMode};
use crate::adapters::config::FixedBase;
use crate::adapters::watcher::FileChangeBus;
use crate::core::persister::{PersistError, PersisterAdapter, PersisterState, ReloadListener};
use crate::core::ports::fs::FsPort;
use crate::core::ports::notify::FileChangePort;
use crate::core::store::TableStore;
use crate::core::table::{ChangedTables, Row, TableChanges};
use crate::core::testing::{FailingSettings, MemoryFs};

const BASE: &str = "/settings";

fn file_path() -> PathBuf {
    PathBuf::from(BASE).join("templates.json")
}

fn options() -> JsonFileOptions {
    JsonFileOptions::new("templates", "templates.json", "TemplatePersister")
}

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object")
}

fn adapter(fs: Arc<MemoryFs>, options: JsonFileOptions) -> Arc<JsonFilePersister> {
    Arc::new(JsonFilePersister::new(
        options,
        Arc::new(FixedBase::new(BASE)),
        fs,
        None,
    ))
}

fn channel_listener() -> (ReloadListener, mpsc::UnboundedReceiver<TableChanges>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: ReloadListener = Arc::new(move |changes| {
        let _ = tx.send(changes);
    });
    (listener, rx)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn load_delivers_file_as_delta() {
    let fs = Arc::new(MemoryFs::default());
    fs.put(file_path(), r#"{"t1": {"title": "Weekly"}}"#);

    let changes = adapter(fs, options()).load().await.expect("content");
    match changes {
        TableChanges::Delta(tables) => {
            assert_eq!(tables["templates"]["t1"], row(json!({"title": "Weekly"})));
        }
        other => panic!("expected delta, got {:?}", other),
    }
}

#[tokio::test]
async fn rows_that_are_not_objects_are_skipped() {
    let fs = Arc::new(MemoryFs::default());
    fs.put(
        file_path(),
        r#"{"t1": {"title": "Weekly"}, "broken": "oops", "t2": {"title": "1:1"}}"#,
    );

    let changes = adapter(fs, options()).load().await.expect("content");
    let templates = &changes.tables()["templates"];
    assert_eq!(templates.keys().collect::<Vec<_>>(), vec!["t1", "t2"]);
}

#[tokio::test]
async fn load_of_missing_or_malformed_file_is_a_no_op() {
    let fs = Arc::new(MemoryFs::default());
    let persister = adapter(Arc::clone(&fs), options());
    assert!(persister.load().await.is_none());

    fs.put(file_path(), "{ not json");
    assert!(persister.load().await.is_none());
}

#[tokio::test]
async fn settings_failure_aborts_load_and_save() {
    let fs = Arc::new(MemoryFs::default());
    let persister = JsonFilePersister::new(
        options(),
        Arc::new(FailingSettings),
        Arc::clone(&fs) as Arc<dyn FsPort>,
        None,
    );
    let store = TableStore::new();
    store.set_row("templates", "t1", row(json!({"title": "x"})));

    assert!(persister.load().await.is_none());
    persister.save(&store, None).await;
    assert_eq!(fs.write_count(), 0);
}

#[tokio::test]
async fn save_skips_when_table_is_not_in_changed_set() {
    let fs = Arc::new(MemoryFs::default());
    let persister = adapter(Arc::clone(&fs), options());
    let store = TableStore::new();
    store.set_row("templates", "t1", row(json!({"title": "x"})));

    let mut changed = ChangedTables::new();
    changed.entry("sessions".to_string()).or_default().insert("s1".to_string());
    persister.save(&store, Some(&changed)).await;
    assert_eq!(fs.write_count(), 0);

    changed.entry("templates".to_string()).or_default().insert("t1".to_string());
    persister.save(&store, Some(&changed)).await;
    assert_eq!(fs.write_count(), 1);

    let written: Value =
        serde_json::from_str(&fs.get(file_path()).expect("written")).expect("valid json");
    assert_eq!(written, json!({"t1": {"title": "x"}}));
}

#[tokio::test]
async fn save_without_changed_set_writes_current_table() {
    let fs = Arc::new(MemoryFs::default());
    let persister = adapter(Arc::clone(&fs), options());
    let store = TableStore::new();

    persister.save(&store, None).await;
    assert_eq!(fs.write_count(), 1);
    assert_eq!(fs.get(file_path()).as_deref(), Some("{}"));
}

#[tokio::test(start_paused = true)]
async fn poll_mode_reloads_once_per_elapsed_interval() {
    let fs = Arc::new(MemoryFs::default());
    fs.put(file_path(), r#"{"t1": {"title": "v1"}}"#);
    let persister = adapter(
        Arc::clone(&fs),
        options()
            .listen_mode(ListenMode::Poll)
            .poll_interval(Duration::from_millis(1000)),
    );

    let (listener, mut rx) = channel_listener();
    let mut handle = persister.add_listener(listener).await.expect("listener");
    assert!(handle.has_interval());
    assert!(!handle.has_unlisten());

    settle().await;
    assert!(rx.try_recv().is_err());

    fs.put(file_path(), r#"{"t1": {"title": "v2"}}"#);
    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;

    let changes = rx.try_recv().expect("first reload");
    assert_eq!(
        changes.tables()["templates"]["t1"],
        row(json!({"title": "v2"}))
    );
    assert!(rx.try_recv().is_err());

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());

    handle.dispose();
    tokio::time::advance(Duration::from_millis(5000)).await;
    settle().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn notify_mode_reloads_on_matching_path_only() {
    let fs = Arc::new(MemoryFs::default());
    fs.put(file_path(), r#"{"t1": {"title": "v1"}}"#);
    let bus = FileChangeBus::default();
    let persister = Arc::new(JsonFilePersister::new(
        options().listen_mode(ListenMode::Notify),
        Arc::new(FixedBase::new(BASE)),
        fs,
        Some(Arc::new(bus.clone()) as Arc<dyn FileChangePort>),
    ));

    let (listener, mut rx) = channel_listener();
    let mut handle = persister.add_listener(listener).await.expect("listener");
    assert!(handle.has_unlisten());
    assert!(!handle.has_interval());

    bus.publish("chats/g1/messages.json");
    settle().await;
    assert!(rx.try_recv().is_err());

    bus.publish("templates.json");
    let changes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("reload in time")
        .expect("changes");
    assert!(changes.tables()["templates"].contains_key("t1"));

    handle.dispose();
    handle.dispose();
    assert!(handle.is_closed());
}

#[tokio::test]
async fn notify_mode_without_channel_fails_setup() {
    let fs = Arc::new(MemoryFs::default());
    let persister = adapter(fs, options().listen_mode(ListenMode::Both));
    let (listener, _rx) = channel_listener();

    let error = persister
        .add_listener(listener)
        .await
        .expect_err("setup must fail");
    assert!(matches!(error, PersistError::ListenerSetup { .. }));
}

#[tokio::test]
async fn auto_persisting_round_trips_through_the_store() {
    let fs = Arc::new(MemoryFs::default());
    fs.put(file_path(), r#"{"t1": {"title": "Weekly"}}"#);
    let bus = FileChangeBus::default();
    let store = Arc::new(TableStore::new());
    let persister = create_json_file_persister(
        Arc::clone(&store),
        Arc::new(FixedBase::new(BASE)),
        Arc::clone(&fs) as Arc<dyn FsPort>,
        Some(Arc::new(bus.clone()) as Arc<dyn FileChangePort>),
        options().listen_mode(ListenMode::Notify),
    );
    assert_eq!(persister.state(), PersisterState::Uninitialized);

    persister.start_auto_persisting().await.expect("start");
    assert_eq!(persister.state(), PersisterState::Listening);
    assert_eq!(
        store.get_row("templates", "t1"),
        Some(row(json!({"title": "Weekly"})))
    );
    assert_eq!(fs.write_count(), 0);

    store.set_row("templates", "t2", row(json!({"title": "1:1"})));
    for _ in 0..50 {
        if fs.write_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fs.write_count(), 1);
    let written: Value =
        serde_json::from_str(&fs.get(file_path()).expect("written")).expect("valid json");
    assert!(written.get("t2").is_some());

    store.set_row("sessions", "s1", row(json!({"title": "unrelated"})));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fs.write_count(), 1);

    persister.stop();
    assert_eq!(persister.state(), PersisterState::Idle);
}
