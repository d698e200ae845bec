//! WebSocket handler: one client connection of the table protocol.
//!
//! DESIGN
//! ======
//! On upgrade, assigns a user id and enters a `select!` loop:
//! - Incoming client messages → parse once into [`ClientMessage`] → dispatch
//! - Messages queued on the connection's outbox by tables and audiences →
//!   forward to the client
//! - Heartbeat tick → ping, or drop the connection after too many misses
//!
//! Replies meant only for the sender are returned from
//! [`process_inbound_text`] and written directly; everything fanned out by a
//! table goes through the outbox.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `{account:false}`, register stats counters
//! 2. Client messages → registry keys, then table keys, then `request` echo
//! 3. Close / timeout → leave table and audiences → `connectionClose` event

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, Outbound, Outbox, SubscribeTable, TableRequest, UserId, encode};
use crate::services::table::SessionInfo;
use crate::services::{events, registry, stats};
use crate::state::{AppState, SharedTable};

const OUTBOX_CAPACITY: usize = 256;
/// Keep-alive message, echoed verbatim.
const KEEP_ALIVE: &str = "{}";

// =============================================================================
// SESSION
// =============================================================================

/// Per-connection state owned by the socket loop.
pub struct Session {
    pub user_id: UserId,
    pub user_name: String,
    pub cookie: Option<String>,
    outbox: Outbox,
    table: Option<(String, SharedTable)>,
}

impl Session {
    #[must_use]
    pub fn new(user_id: UserId, outbox: Outbox, cookie: Option<String>) -> Self {
        Self { user_id, user_name: String::new(), cookie, outbox, table: None }
    }

    /// Id of the table this connection is a member of.
    #[must_use]
    pub fn table_id(&self) -> Option<&str> {
        self.table.as_ref().map(|(id, _)| id.as_str())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo { user_id: self.user_id, user_name: self.user_name.clone(), outbox: self.outbox.clone() }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let cookie = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()).map(str::to_owned);
    ws.on_upgrade(move |socket| run_ws(socket, state, cookie))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, cookie: Option<String>) {
    let user_id = state.next_user_id();
    let (outbox, mut outbox_rx) = mpsc::channel::<Outbound>(OUTBOX_CAPACITY);
    let mut session = Session::new(user_id, outbox, cookie);

    state.stats.register(user_id);
    stats::ensure_running(&state);
    info!(%user_id, "ws: client connected");

    let ping_period = state.config.ping_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
    let mut missed_pings = 0u32;

    let reason = if send_text(&mut socket, &state, user_id, &encode(&json!({ "account": false }))).await.is_err() {
        "send failed"
    } else {
        loop {
            tokio::select! {
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break "closed" };
                    missed_pings = 0;
                    match msg {
                        Message::Text(text) => {
                            state.stats.record_received(user_id, text.as_str().len());
                            let replies = process_inbound_text(&state, &mut session, text.as_str()).await;
                            let mut failed = false;
                            for reply in replies {
                                if send_text(&mut socket, &state, user_id, &reply).await.is_err() {
                                    failed = true;
                                    break;
                                }
                            }
                            if failed {
                                break "send failed";
                            }
                        }
                        Message::Pong(_) => state.stats.record_pong(user_id),
                        Message::Close(_) => break "closed",
                        _ => {}
                    }
                }
                Some(out) = outbox_rx.recv() => {
                    if send_text(&mut socket, &state, user_id, &out).await.is_err() {
                        break "send failed";
                    }
                }
                _ = heartbeat.tick(), if state.config.enable_timeout => {
                    if missed_pings >= state.config.ping_allowed_failures {
                        events::log("connectionTimeout", json!({ "userId": user_id }));
                        break "timeout";
                    }
                    missed_pings += 1;
                    if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                        break "send failed";
                    }
                    state.stats.record_ping(user_id);
                }
            }
        }
    };

    disconnect(&state, &mut session).await;
    events::log("connectionClose", json!({ "userId": user_id, "reason": reason }));
    info!(%user_id, reason, "ws: client disconnected");
}

/// Leave the current table and every audience.
pub async fn disconnect(state: &AppState, session: &mut Session) {
    leave_table(session).await;
    state.feed.remove(session.user_id);
    state.monitors.remove(session.user_id);
    state.stats.unregister(session.user_id);
}

async fn leave_table(session: &mut Session) {
    if let Some((table_id, table)) = session.table.take() {
        table.lock().await.remove_user(session.user_id);
        debug!(user_id = %session.user_id, %table_id, "ws: left table");
    }
}

async fn send_text(socket: &mut WebSocket, state: &AppState, user_id: UserId, text: &str) -> Result<(), axum::Error> {
    socket.send(Message::Text(text.to_owned().into())).await?;
    state.stats.record_sent(user_id, text.len());
    Ok(())
}

// =============================================================================
// MESSAGE DISPATCH
// =============================================================================

/// Handle one inbound text message and return the replies for the sender.
///
/// Panics while handling are caught here so a single bad message cannot take
/// the connection down.
pub async fn process_inbound_text(state: &AppState, session: &mut Session, text: &str) -> Vec<Outbound> {
    if text == KEEP_ALIVE {
        return vec![Arc::from(KEEP_ALIVE)];
    }
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(user_id = %session.user_id, error = %e, "ws: invalid inbound message");
            return Vec::new();
        }
    };

    let user_id = session.user_id;
    match AssertUnwindSafe(handle_message(state, session, message)).catch_unwind().await {
        Ok(replies) => replies,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            warn!(%user_id, %detail, "ws: panic while handling message");
            events::log(
                "unhandledException",
                json!({ "place": "socket onMessage handler", "userId": user_id, "err": detail }),
            );
            Vec::new()
        }
    }
}

async fn handle_message(state: &AppState, session: &mut Session, message: ClientMessage) -> Vec<Outbound> {
    let ClientMessage { nick, monitor, subscribe, subscribe_table, delays, request, table } = message;
    let mut replies = Vec::new();

    if let Some(nick) = nick {
        session.user_name = nick;
    }
    if monitor.as_ref().and_then(Value::as_bool) == Some(true) {
        state.monitors.insert(session.user_id, session.outbox.clone());
    }
    if subscribe.is_some() {
        let tables = registry::subscribe_list(state, session.user_id, session.outbox.clone()).await;
        replies.push(encode(&tables));
    }
    if let Some(target) = subscribe_table {
        if let Some(reply) = join_table(state, session, target).await {
            replies.push(reply);
        }
    }
    if let Some(delays) = delays {
        state.stats.record_delays(session.user_id, &delays);
    }
    handle_table_request(state, session, table).await;
    if let Some(request) = request {
        replies.push(encode(&json!({ "request": request })));
    }
    replies
}

/// Join `target`, leaving the current table first. Returns `{table:false}`
/// if the join fails.
async fn join_table(state: &AppState, session: &mut Session, target: SubscribeTable) -> Option<Outbound> {
    leave_table(session).await;
    let SubscribeTable { id, role_request } = target;
    match registry::subscribe_table(state, session.info(), session.cookie.as_deref(), &id, role_request.as_deref())
        .await
    {
        Ok(table) => {
            session.table = Some((id, table));
            None
        }
        Err(e) => {
            info!(user_id = %session.user_id, table_id = %id, error = %e, "ws: table subscription refused");
            Some(encode(&json!({ "table": false })))
        }
    }
}

async fn handle_table_request(state: &AppState, session: &Session, mut request: TableRequest) {
    let Some((_, table)) = &session.table else {
        return;
    };
    // Army content is fetched before the table lock is taken.
    if let Some(army) = request.action.get_army_spawner.as_mut() {
        if army.data.is_none() {
            match state.agent.get_army(&army.name).await {
                Ok(info) => army.data = Some(info),
                Err(e) => warn!(user_id = %session.user_id, army = %army.name, error = %e, "ws: army lookup failed"),
            }
        }
    }
    table.lock().await.handle_request(session.user_id, request);
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

