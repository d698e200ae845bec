use super::*;
use crate::protocol::Outbound;
use crate::state::test_helpers::{self, MockAgent};
use std::time::Duration;
use tokio::sync::mpsc;

fn session(user_id: UserId) -> (SessionInfo, mpsc::Receiver<Outbound>) {
    let (outbox, rx) = mpsc::channel(64);
    (SessionInfo { user_id, user_name: format!("user{user_id}"), outbox }, rx)
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(serde_json::from_str(&message).unwrap());
    }
    out
}

#[tokio::test]
async fn create_table_writes_board_genesis() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    assert_eq!(id.len(), TABLE_ID_LEN);
    assert!(is_valid_name(&id));
    let text = std::fs::read_to_string(dir.path().join(&id)).unwrap();
    assert_eq!(text, "{\"act\":{\"board\":\"B1\"}}\n");
}

#[tokio::test]
async fn create_table_fork_points_into_parent() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let parent = create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let child = create_table(&state, Genesis::Fork { table: parent.clone(), line: 0 }).await.unwrap();
    let text = std::fs::read_to_string(dir.path().join(&child)).unwrap();
    assert_eq!(text, format!("{{\"prev\":{{\"line\":0,\"file\":\"{parent}\"}}}}\n"));

    let table = load(&state, &child).await.unwrap();
    assert_eq!(table.lock().await.board(), "B1");
}

#[tokio::test]
async fn create_table_fork_of_unknown_table_fails() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let result = create_table(&state, Genesis::Fork { table: "nope".into(), line: 0 }).await;
    assert!(matches!(result, Err(RegistryError::NotFound(_))));
    let result = create_table(&state, Genesis::Fork { table: "../etc".into(), line: 0 }).await;
    assert!(matches!(result, Err(RegistryError::InvalidId(_))));
}

#[tokio::test]
async fn load_is_cached_and_announced_once() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state_with_agent(dir.path(), MockAgent::default().with_table("t1", "B9"));
    let (feed_tx, mut feed_rx) = mpsc::channel(16);
    state.feed.insert(100, feed_tx);

    let first = load(&state, "t1").await.unwrap();
    let second = load(&state, "t1").await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.lock().await.board(), "B9");

    let announcements = drain(&mut feed_rx);
    assert_eq!(announcements.len(), 1);
    assert_eq!(announcements[0]["addTable"]["id"], "t1");
    assert_eq!(announcements[0]["addTable"]["name"], "table t1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_loads_share_one_table_and_leave_registry_readable() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let loaded = create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let fresh = create_table(&state, Genesis::Board("B2".into())).await.unwrap();
    let third = create_table(&state, Genesis::Board("B3".into())).await.unwrap();
    load(&state, &loaded).await.unwrap();

    let loading = state.loading.lock().await;
    let pending = tokio::spawn({
        let (state, fresh) = (state.clone(), fresh.clone());
        async move { load(&state, &fresh).await.map(|_| ()) }
    });
    // A load in progress blocks neither lookups nor the registry read lock.
    let cached = tokio::time::timeout(Duration::from_secs(1), load(&state, &loaded)).await;
    assert!(cached.unwrap().is_ok());
    assert_eq!(subscriptions_num(&state).await, 0);
    drop(loading);
    pending.await.unwrap().unwrap();

    let (a, b) = tokio::join!(load(&state, &third), load(&state, &third));
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(state.tables.read().await.len(), 3);
}

#[tokio::test]
async fn load_unknown_or_malformed_table_fails() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    assert!(matches!(load(&state, "missing").await, Err(RegistryError::NotFound(_))));
    assert!(matches!(load(&state, "a/b").await, Err(RegistryError::InvalidId(_))));
}

#[tokio::test]
async fn load_with_broken_chain_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("t1"), "{\"prev\":{\"line\":0,\"file\":\"gone\"}}\n").unwrap();
    let state = test_helpers::test_app_state(dir.path());
    assert!(matches!(load(&state, "t1").await, Err(RegistryError::Journal(_))));
    assert!(state.tables.read().await.is_empty());
}

#[tokio::test]
async fn subscribe_table_adds_member_with_granted_role() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = create_table(&state, Genesis::Board("B1".into())).await.unwrap();

    let (info, mut rx) = session(7);
    let table = subscribe_table(&state, info, None, &id, Some("spectator")).await.unwrap();
    assert_eq!(table.lock().await.role_of(7), Some(Role::Spectator));
    let welcome = drain(&mut rx);
    assert_eq!(welcome[0]["yourId"], 7);
    assert_eq!(welcome[0]["tableInfo"]["board"], "B1");
    assert_eq!(subscriptions_num(&state).await, 1);
    assert_eq!(active_players_num(&state).await, 0);
}

#[tokio::test]
async fn subscribe_table_denied_or_unknown_role_fails() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state_with_agent(dir.path(), MockAgent::default().with_table("t1", "B1"));
    let (info, _rx) = session(1);
    let result = subscribe_table(&state, info, None, "t1", Some("player")).await;
    assert!(matches!(result, Err(RegistryError::Denied)));

    let state = test_helpers::test_app_state_with_agent(
        dir.path(),
        MockAgent::default().with_table("t1", "B1").granting("emperor"),
    );
    let (info, _rx) = session(1);
    let result = subscribe_table(&state, info, None, "t1", None).await;
    assert!(matches!(result, Err(RegistryError::Denied)));
}

#[tokio::test]
async fn subscribe_list_returns_loaded_tables_and_joins_feed() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let (info, _member_rx) = session(1);
    subscribe_table(&state, info, None, &id, Some("player")).await.unwrap();

    let (outbox, mut rx) = mpsc::channel(16);
    let tables = subscribe_list(&state, 2, outbox).await;
    assert_eq!(tables["tables"][0]["id"], id.as_str());
    assert_eq!(tables["tables"][0]["players"][0]["id"], 1);

    unload(&state, &id).await;
    assert_eq!(drain(&mut rx), vec![json!({ "removeTable": { "id": id } })]);
}

#[tokio::test]
async fn set_global_quality_reaches_loaded_tables() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let table = load(&state, &id).await.unwrap();

    set_global_quality(&state, 1).await;
    assert_eq!(state.global_quality(), 1);
    assert_eq!(table.lock().await.local_quality(), 1);
}

#[tokio::test]
async fn idle_tables_are_evicted_only_after_delay() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let (info, _rx) = session(1);
    let table = subscribe_table(&state, info, None, &id, Some("player")).await.unwrap();

    let later = Instant::now() + state.config.table_removal_delay + Duration::from_secs(1);
    assert!(!unload_if_idle(&state, &id, later).await);

    table.lock().await.remove_user(1);
    assert!(!unload_if_idle(&state, &id, Instant::now()).await);
    let later = Instant::now() + state.config.table_removal_delay + Duration::from_secs(1);
    assert!(unload_if_idle(&state, &id, later).await);
    assert!(state.tables.read().await.is_empty());
}
