use std::{collections::HashSet, sync::Arc, time::Duration};

use noteflow::{
    Config, ConnectionState, NewNote, NewTodo, NotePatch, Priority, RecordKind, RecordStore,
    StoreError, TodoPatch,
};
use tempfile::TempDir;

fn open_store() -> (TempDir, RecordStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = RecordStore::new(Config::with_data_dir(dir.path()));
    (dir, store)
}

#[tokio::test]
async fn ids_are_pairwise_distinct() {
    let (_dir, store) = open_store();
    let mut ids = HashSet::new();
    for i in 0..25 {
        let note = store
            .add_note(NewNote::new(format!("note {}", i), ""))
            .await
            .unwrap();
        let todo = store.add_todo(NewTodo::new(format!("todo {}", i))).await.unwrap();
        assert!(ids.insert(note.id));
        assert!(ids.insert(todo.id));
    }
    assert_eq!(ids.len(), 50);
}

#[tokio::test]
async fn updates_advance_updated_at_and_keep_created_at() {
    let (_dir, store) = open_store();
    let note = store.add_note(NewNote::new("a", "")).await.unwrap();
    let mut previous = note.clone();
    for i in 0..5 {
        let updated = store
            .update_note(&note.id, NotePatch::content(format!("v{}", i)))
            .await
            .unwrap();
        assert!(updated.updated_at > previous.updated_at);
        assert_eq!(updated.created_at, note.created_at);
        previous = updated;
    }
}

#[tokio::test]
async fn updating_a_missing_record_is_not_found() {
    let (_dir, store) = open_store();
    let err = store
        .update_note("never-added", NotePatch::title("x"))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::not_found(RecordKind::Note, "never-added"));
    assert!(store.get_all_notes().await.unwrap().is_empty());

    let todo = store.add_todo(NewTodo::new("gone")).await.unwrap();
    store.delete_todo(&todo.id).await.unwrap();
    let err = store
        .update_todo(&todo.id, TodoPatch::completed(true))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { kind: RecordKind::Todo, .. }));
    assert!(store.get_all_todos().await.unwrap().is_empty());
}

#[tokio::test]
async fn partial_update_only_touches_named_fields() {
    let (_dir, store) = open_store();
    let note = store
        .add_note(
            NewNote::new("old", "body")
                .with_tags(["work"])
                .with_color("#ffcc00"),
        )
        .await
        .unwrap();

    let updated = store
        .update_note(&note.id, NotePatch::title("X"))
        .await
        .unwrap();
    assert_eq!(updated.title, "X");
    assert_eq!(updated.content, note.content);
    assert_eq!(updated.tags, note.tags);
    assert_eq!(updated.color, note.color);
    assert_eq!(updated.id, note.id);
}

#[tokio::test]
async fn search_matches_title_body_and_tags_ignoring_case() {
    let (_dir, store) = open_store();
    let by_title = store.add_note(NewNote::new("FOOd plan", "")).await.unwrap();
    let by_content = store.add_note(NewNote::new("x", "a Foo b")).await.unwrap();
    let by_tag = store
        .add_note(NewNote::new("y", "").with_tags(["foobar"]))
        .await
        .unwrap();
    store.add_note(NewNote::new("unrelated", "bar")).await.unwrap();

    let mut found: Vec<String> = store
        .search_notes("foo")
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    found.sort();
    let mut expected = vec![by_title.id, by_content.id, by_tag.id];
    expected.sort();
    assert_eq!(found, expected);

    assert_eq!(store.search_notes("").await.unwrap().len(), 4);

    store
        .add_todo(NewTodo::new("call").with_description("Ask about FOO"))
        .await
        .unwrap();
    store.add_todo(NewTodo::new("other")).await.unwrap();
    assert_eq!(store.search_todos("foo").await.unwrap().len(), 1);
    assert_eq!(store.search_todos("").await.unwrap().len(), 2);
}

#[tokio::test]
async fn completed_index_matches_a_full_scan() {
    let (_dir, store) = open_store();
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(store.add_todo(NewTodo::new(format!("t{}", i))).await.unwrap().id);
    }
    for id in ids.iter().step_by(2) {
        store
            .update_todo(id, TodoPatch::completed(true))
            .await
            .unwrap();
    }
    store
        .update_todo(&ids[0], TodoPatch::completed(false))
        .await
        .unwrap();

    let mut from_index: Vec<String> = store
        .get_completed_todos()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    let mut from_scan: Vec<String> = store
        .get_all_todos()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.completed)
        .map(|t| t.id)
        .collect();
    from_index.sort();
    from_scan.sort();
    assert_eq!(from_index, from_scan);
    assert_eq!(from_index.len(), 2);
    assert_eq!(store.get_pending_todos().await.unwrap().len(), 4);
}

#[tokio::test]
async fn deleted_records_disappear_and_repeat_deletes_succeed() {
    let (_dir, store) = open_store();
    let note = store.add_note(NewNote::new("bye", "")).await.unwrap();
    store.delete_note(&note.id).await.unwrap();
    assert!(store
        .get_all_notes()
        .await
        .unwrap()
        .iter()
        .all(|n| n.id != note.id));
    store.delete_note(&note.id).await.unwrap();
    assert_eq!(store.get_note(&note.id).await.unwrap(), None);
}

#[tokio::test]
async fn grocery_note_is_found_by_its_content() {
    let (_dir, store) = open_store();
    let note = store
        .add_note(NewNote::new("Grocery", "milk, eggs"))
        .await
        .unwrap();
    assert!(!note.id.is_empty());
    assert_eq!(note.created_at, note.updated_at);

    assert_eq!(store.search_notes("milk").await.unwrap(), vec![note]);
    assert!(store.search_notes("bread").await.unwrap().is_empty());
}

#[tokio::test]
async fn completing_a_todo_keeps_its_priority() {
    let (_dir, store) = open_store();
    let todo = store
        .add_todo(NewTodo::new("Pay rent").with_priority(Priority::High))
        .await
        .unwrap();
    store
        .update_todo(&todo.id, TodoPatch::completed(true))
        .await
        .unwrap();

    let completed = store.get_completed_todos().await.unwrap();
    assert!(completed.iter().any(|t| t.id == todo.id));
    let high = store.get_todos_by_priority(Priority::High).await.unwrap();
    assert!(high.iter().any(|t| t.id == todo.id && t.completed));
}

#[tokio::test]
async fn overlapping_inits_share_one_connection() {
    let (_dir, store) = open_store();
    let other = store.clone();
    let (a, b) = tokio::join!(store.init(), other.init());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(store.state(), ConnectionState::Ready);
    assert_eq!(a.version(), noteflow::schema::LATEST_VERSION);
}

#[tokio::test]
async fn second_opener_is_blocked_until_the_first_closes() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        blocked_retry_ms: 10,
        ..Config::with_data_dir(dir.path())
    };
    let first = RecordStore::new(config.clone());
    first.add_note(NewNote::new("held", "")).await.unwrap();

    let second = RecordStore::new(config);
    let mut states = second.subscribe_state();
    let opener = {
        let second = second.clone();
        tokio::spawn(async move { second.init().await.map(|_| ()) })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while *states.borrow_and_update() != ConnectionState::Blocked {
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("second opener never reported Blocked");

    first.close().await;
    tokio::time::timeout(Duration::from_secs(5), opener)
        .await
        .expect("second opener never finished")
        .unwrap()
        .unwrap();
    assert_eq!(second.state(), ConnectionState::Ready);
    assert_eq!(second.get_all_notes().await.unwrap().len(), 1);
}

#[tokio::test]
async fn records_survive_reopening() {
    let (dir, store) = open_store();
    let note = store
        .add_note(NewNote::new("keep", "me").with_tags(["Home"]))
        .await
        .unwrap();
    let due = noteflow::parse_timestamp("2030-05-01").unwrap();
    let todo = store
        .add_todo(NewTodo::new("file taxes").with_due_date(due))
        .await
        .unwrap();
    store.close().await;

    let reopened = RecordStore::new(Config::with_data_dir(dir.path()));
    assert_eq!(reopened.get_note(&note.id).await.unwrap(), Some(note));
    assert_eq!(reopened.get_notes_by_tag("home").await.unwrap().len(), 1);
    let before = noteflow::parse_timestamp("2031-01-01").unwrap();
    assert_eq!(
        reopened.get_todos_due_before(before).await.unwrap(),
        vec![todo]
    );
}

#[tokio::test]
async fn opening_at_an_older_version_than_stored_is_refused() {
    let (dir, store) = open_store();
    store.init().await.unwrap();
    store.close().await;

    let old = RecordStore::new(Config {
        schema_version: 1,
        ..Config::with_data_dir(dir.path())
    });
    let err = old.init().await.unwrap_err();
    assert!(matches!(err, StoreError::Initialization { .. }));
    assert!(matches!(old.state(), ConnectionState::Failed(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn lock_left_by_a_dead_process_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        blocked_retry_ms: 10,
        ..Config::with_data_dir(dir.path())
    };

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let db_dir = config.database_dir();
    std::fs::create_dir_all(&db_dir).unwrap();
    let stale = noteflow::LockMeta {
        pid: dead_pid,
        opened_at: chrono::Utc::now(),
    };
    std::fs::write(db_dir.join("LOCK"), serde_json::to_vec(&stale).unwrap()).unwrap();

    let store = RecordStore::new(config);
    tokio::time::timeout(Duration::from_secs(5), store.init())
        .await
        .expect("open stayed blocked on a dead holder")
        .unwrap();
    assert_eq!(store.state(), ConnectionState::Ready);

    store.add_note(NewNote::new("after crash", "")).await.unwrap();
    store.close().await;
    assert!(!db_dir.join("LOCK").exists());
}
