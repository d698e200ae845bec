use super::*;
use crate::config::ServerConfig;
use crate::routes;
use crate::services::agent::StandaloneAgent;
use crate::services::housekeeping;
use crate::services::registry::Genesis;
use crate::state::test_helpers::{self, MockAgent};
use futures::{SinkExt, StreamExt};
use std::future::IntoFuture;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite;

// =============================================================================
// HELPERS
// =============================================================================

fn new_session(user_id: UserId) -> (Session, mpsc::Receiver<Outbound>) {
    let (outbox, rx) = mpsc::channel(64);
    (Session::new(user_id, outbox, None), rx)
}

fn decode(reply: &Outbound) -> Value {
    serde_json::from_str(reply).unwrap()
}

async fn recv_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
    let message = timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("outbox receive timed out")
        .expect("outbox closed unexpectedly");
    decode(&message)
}

fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(decode(&message));
    }
    out
}

type ClientSocket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(ws: &mut ClientSocket) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send(state: &AppState, session: &mut Session, message: Value) -> Vec<Value> {
    process_inbound_text(state, session, &message.to_string()).await.iter().map(decode).collect()
}

// =============================================================================
// REGISTRY KEYS
// =============================================================================

#[tokio::test]
async fn keep_alive_is_echoed_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let (mut session, _rx) = new_session(1);
    let replies = process_inbound_text(&state, &mut session, "{}").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(&*replies[0], "{}");
}

#[tokio::test]
async fn malformed_message_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let (mut session, _rx) = new_session(1);
    assert!(process_inbound_text(&state, &mut session, "{not json").await.is_empty());
    assert!(process_inbound_text(&state, &mut session, "[1,2]").await.is_empty());
}

#[tokio::test]
async fn nick_and_request_echo() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let (mut session, _rx) = new_session(1);
    let replies = send(&state, &mut session, json!({ "nick": "alice", "request": { "n": 3 } })).await;
    assert_eq!(session.user_name, "alice");
    assert_eq!(replies, vec![json!({ "request": { "n": 3 } })]);
}

#[tokio::test]
async fn monitor_and_delays_feed_stats() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    state.stats.register(1);
    let (mut session, _rx) = new_session(1);
    send(&state, &mut session, json!({ "monitor": true, "delays": [10.0, 30.0] })).await;
    assert_eq!(state.monitors.len(), 1);
    assert_eq!(state.stats.take().average_delay(), Some(20.0));

    disconnect(&state, &mut session).await;
    assert!(state.monitors.is_empty());
    assert_eq!(state.stats.connections(), 0);
}

#[tokio::test]
async fn subscribe_lists_tables_and_receives_feed() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let (mut watcher, mut watcher_rx) = new_session(1);
    let replies = send(&state, &mut watcher, json!({ "subscribe": true })).await;
    assert_eq!(replies, vec![json!({ "tables": [] })]);

    let id = registry::create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let (mut player, _player_rx) = new_session(2);
    send(&state, &mut player, json!({ "nick": "bob", "subscribeTable": { "id": id, "roleRequest": "player" } })).await;

    let feed = drain(&mut watcher_rx);
    assert_eq!(feed[0]["addTable"]["id"], id.as_str());
    assert_eq!(feed[1]["addPlayer"]["player"], json!({ "id": 2, "name": "bob" }));
}

// =============================================================================
// TABLE KEYS
// =============================================================================

#[tokio::test]
async fn subscribe_table_then_act() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = registry::create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let (mut session, mut rx) = new_session(5);

    let replies = send(&state, &mut session, json!({ "subscribeTable": { "id": id } })).await;
    assert!(replies.is_empty());
    assert_eq!(session.table_id(), Some(id.as_str()));
    let welcome = recv_json(&mut rx).await;
    assert_eq!(welcome["yourId"], 5);
    drain(&mut rx);

    send(&state, &mut session, json!({ "getUtil": { "left": 1, "top": 2, "res": "dice" } })).await;
    let added = recv_json(&mut rx).await;
    assert_eq!(added["addContent"][0]["res"], "dice");
    assert_eq!(added["addContent"][0]["id"], 0);
}

#[tokio::test]
async fn unknown_table_replies_table_false() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let (mut session, _rx) = new_session(1);
    let replies = send(&state, &mut session, json!({ "subscribeTable": { "id": "nope" } })).await;
    assert_eq!(replies, vec![json!({ "table": false })]);
    assert!(session.table_id().is_none());
}

#[tokio::test]
async fn table_keys_without_table_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let (mut session, mut rx) = new_session(1);
    let replies = send(&state, &mut session, json!({ "flipObjs": [0], "undo": 1 })).await;
    assert!(replies.is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn army_is_fetched_before_the_table_runs_it() {
    let dir = tempfile::tempdir().unwrap();
    let agent = MockAgent::default().with_table("t1", "B1").granting("player").with_army(3);
    let state = test_helpers::test_app_state_with_agent(dir.path(), agent);
    let (mut session, mut rx) = new_session(1);
    send(&state, &mut session, json!({ "subscribeTable": { "id": "t1" } })).await;
    drain(&mut rx);

    send(&state, &mut session, json!({ "getArmySpawner": { "name": "orcs", "left": 0, "top": 0 } })).await;
    let added = recv_json(&mut rx).await;
    assert_eq!(added["addContent"][0]["tokens"].as_array().unwrap().len(), 3);

    housekeeping::run_once(&state, std::time::Instant::now()).await;
    registry::load(&state, "t1").await.unwrap().lock().await.journal_synced().await;
    let journal = std::fs::read_to_string(dir.path().join("t1")).unwrap();
    assert!(journal.contains("\"addObjs\""));
    assert!(!journal.contains("getArmySpawner"));
}

#[tokio::test]
async fn switching_tables_leaves_the_previous_one() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let first = registry::create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let second = registry::create_table(&state, Genesis::Board("B2".into())).await.unwrap();
    let (mut session, _rx) = new_session(1);

    send(&state, &mut session, json!({ "subscribeTable": { "id": first } })).await;
    send(&state, &mut session, json!({ "subscribeTable": { "id": second } })).await;
    let first_table = registry::load(&state, &first).await.unwrap();
    assert_eq!(first_table.lock().await.subscribers(), 0);
    assert_eq!(session.table_id(), Some(second.as_str()));

    disconnect(&state, &mut session).await;
    assert_eq!(registry::subscriptions_num(&state).await, 0);
}

// =============================================================================
// END TO END
// =============================================================================

#[tokio::test]
async fn websocket_round_trip_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = registry::create_table(&state, Genesis::Board("B1".into())).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, routes::app(state)).into_future());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({ "account": false }));

    ws.send(tungstenite::Message::Text("{}".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({}));

    let join = json!({ "nick": "carol", "subscribeTable": { "id": id, "roleRequest": "owner" }, "request": 1 });
    ws.send(tungstenite::Message::Text(join.to_string().into())).await.unwrap();

    let mut seen_welcome = false;
    let mut seen_echo = false;
    while !(seen_welcome && seen_echo) {
        let value = next_json(&mut ws).await;
        if value.get("yourId").is_some() {
            assert_eq!(value["tableInfo"]["board"], "B1");
            assert_eq!(value["addUsers"][0]["userName"], "carol");
            seen_welcome = true;
        }
        if value.get("request").is_some() {
            assert_eq!(value["request"], 1);
            seen_echo = true;
        }
    }
    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn silent_client_is_dropped_after_missed_pings() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        enable_timeout: true,
        ping_interval: Duration::from_millis(50),
        ping_allowed_failures: 2,
        ..test_helpers::test_config(dir.path())
    };
    let state = AppState::new(config, Arc::new(StandaloneAgent::new(dir.path())));
    let id = registry::create_table(&state, Genesis::Board("B1".into())).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, routes::app(state.clone())).into_future());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({ "account": false }));
    let join = json!({ "subscribeTable": { "id": id, "roleRequest": "player" } });
    ws.send(tungstenite::Message::Text(join.to_string().into())).await.unwrap();
    while next_json(&mut ws).await.get("yourId").is_none() {}
    assert_eq!(state.stats.connections(), 1);

    // Stop polling the socket so pings go unanswered.
    let dropped = timeout(Duration::from_secs(2), async {
        while state.stats.connections() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "connection outlived its missed pings");
    assert_eq!(registry::subscriptions_num(&state).await, 0);

    let ended = timeout(Duration::from_secs(2), async {
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket stayed open after the timeout");
}
