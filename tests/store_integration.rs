//! Session persistence round-trips through the on-disk blob.

use claude_conductor::session::{Message, Session, SessionManager, SessionStore};

#[tokio::test]
async fn save_then_load_round_trips_sessions_and_pointer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sessions.json");
    let store = SessionStore::new(&path);

    let mut first = Session::new();
    first.title = Some("First".to_string());
    first.messages.push(Message::user("hello"));
    first.resume_token = Some("tok-abc".to_string());
    let second = Session::new();
    let current = second.id;

    store
        .save(&[first.clone(), second.clone()], Some(current))
        .await
        .unwrap();

    let state = store.load().await.unwrap().expect("blob should exist");
    assert_eq!(state.sessions.len(), 2);
    assert_eq!(state.current, Some(current));
    assert_eq!(state.sessions[0].title.as_deref(), Some("First"));
    assert_eq!(state.sessions[0].messages[0].content, "hello");
    assert_eq!(state.sessions[0].resume_token.as_deref(), Some("tok-abc"));
}

#[tokio::test]
async fn missing_blob_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("absent.json"));
    assert!(store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn manager_restores_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");

    let created = {
        let store = SessionStore::new(&path);
        let mut manager = SessionManager::with_store(store).await.unwrap();
        let id = manager.start_new_session();
        manager.rename_session(id, "Persisted");
        manager.save().await.unwrap();
        id
    };

    let store = SessionStore::new(&path);
    let manager = SessionManager::with_store(store).await.unwrap();
    assert_eq!(manager.current_id(), created);
    assert_eq!(manager.current().title.as_deref(), Some("Persisted"));
    assert_eq!(manager.sessions().len(), 2);
}

#[tokio::test]
async fn queues_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("sessions.json"));

    let mut session = Session::new();
    let _ = session.queue.push("pending", Default::default());
    store.save(&[session], None).await.unwrap();

    let state = store.load().await.unwrap().unwrap();
    assert!(state.sessions[0].queue.is_empty());
}
