//! Table registry: loading, joining, creating and evicting tables.
//!
//! DESIGN
//! ======
//! Tables are loaded lazily on the first join: metadata comes from the main
//! server agent, content from the table's journal. Journal replay runs on the
//! blocking pool under the loading lock, with a second lookup, so concurrent
//! joins of the same unknown table load it once while joins of loaded tables
//! and the stats loop keep going. The registry write lock is only taken to
//! insert or remove. Lock order is loading, registry, table.
//!
//! Table-list subscribers (the feed) hear about tables appearing
//! (`addTable`) and disappearing (`removeTable`); tables themselves publish
//! player changes to the same feed.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::protocol::{Outbox, Role, UserId};
use crate::services::action::Action;
use crate::services::agent::AgentError;
use crate::services::events;
use crate::services::journal::{Journal, JournalError, Pointer, Record, is_valid_name};
use crate::services::table::{SessionInfo, Table};
use crate::state::{AppState, SharedTable};

const TABLE_ID_LEN: usize = 12;
const CREATE_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("table not found: {0}")]
    NotFound(String),
    #[error("invalid table id: {0:?}")]
    InvalidId(String),
    #[error("role request denied")]
    Denied,
    #[error("no free table id after {CREATE_ATTEMPTS} attempts")]
    IdExhausted,
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("journal task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// =============================================================================
// LOAD / UNLOAD
// =============================================================================

/// Return table `id`, loading it from its journal if needed.
///
/// # Errors
///
/// Fails if the id is malformed, the main server does not know the table, or
/// its journal cannot be replayed.
pub async fn load(state: &AppState, id: &str) -> Result<SharedTable, RegistryError> {
    if let Some(table) = state.tables.read().await.get(id) {
        return Ok(table.clone());
    }
    if !is_valid_name(id) {
        return Err(RegistryError::InvalidId(id.to_owned()));
    }
    let meta = state
        .agent
        .get_table_by_id(id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;

    let _loading = state.loading.lock().await;
    if let Some(table) = state.tables.read().await.get(id) {
        return Ok(table.clone());
    }
    let dir = state.config.tables_dir.clone();
    let owned_id = id.to_owned();
    let env = state.table_env();
    let global = state.global_quality();
    let debounce = state.config.journal_flush_debounce;
    let table = tokio::task::spawn_blocking(move || Table::open(&dir, &owned_id, meta, env, global, debounce))
        .await?
        .inspect_err(|e| events::log("tableLoading", json!({ "tableId": id, "error": e.to_string() })))?;

    let info = table.info();
    let shared = Arc::new(Mutex::new(table));
    state.tables.write().await.insert(id.to_owned(), shared.clone());

    state.feed.publish(&json!({ "addTable": info }));
    info!(table_id = %id, "table loaded into registry");
    Ok(shared)
}

/// Close and forget table `id`.
pub async fn unload(state: &AppState, id: &str) {
    let _loading = state.loading.lock().await;
    let Some(table) = state.tables.write().await.remove(id) else {
        return;
    };
    let closed = table.lock().await.close();
    closed.await;
    state.feed.publish(&json!({ "removeTable": { "id": id } }));
    info!(table_id = %id, "table unloaded");
}

/// Unload table `id` if it has been empty for at least the removal delay.
/// Returns whether it was unloaded.
pub async fn unload_if_idle(state: &AppState, id: &str, now: Instant) -> bool {
    let _loading = state.loading.lock().await;
    let mut tables = state.tables.write().await;
    let Some(table) = tables.get(id).cloned() else {
        return false;
    };
    let mut guard = table.lock().await;
    if !guard.is_idle(now, state.config.table_removal_delay) {
        return false;
    }
    tables.remove(id);
    drop(tables);
    let closed = guard.close();
    drop(guard);
    closed.await;

    state.feed.publish(&json!({ "removeTable": { "id": id } }));
    info!(table_id = %id, "idle table evicted");
    true
}

/// Close every table; used on shutdown.
pub async fn unload_all(state: &AppState) {
    let ids: Vec<String> = state.tables.read().await.keys().cloned().collect();
    for id in ids {
        unload(state, &id).await;
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Authorize the session for table `id` and add it as a member.
///
/// # Errors
///
/// Fails if authorization is denied or unavailable, or the table cannot be
/// loaded.
pub async fn subscribe_table(
    state: &AppState,
    session: SessionInfo,
    cookie: Option<&str>,
    id: &str,
    role_request: Option<&str>,
) -> Result<SharedTable, RegistryError> {
    let auth = state.agent.authorize_role_request(cookie, id, role_request).await?;
    let role = auth
        .result
        .then(|| auth.role.as_deref().and_then(Role::from_name))
        .flatten()
        .ok_or(RegistryError::Denied)?;

    load(state, id).await?;
    // Hold the registry read lock so the table cannot be evicted before the
    // member is in.
    let tables = state.tables.read().await;
    let table = tables.get(id).cloned().ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
    table.lock().await.add_user(session, role);
    Ok(table)
}

/// Subscribe a connection to the table list feed. Returns the `tables`
/// message with the current list.
pub async fn subscribe_list(state: &AppState, user_id: UserId, outbox: Outbox) -> Value {
    let tables: Vec<SharedTable> = state.tables.read().await.values().cloned().collect();
    let mut infos = Vec::with_capacity(tables.len());
    for table in tables {
        infos.push(table.lock().await.info());
    }
    state.feed.insert(user_id, outbox);
    json!({ "tables": infos })
}

pub async fn subscriptions_num(state: &AppState) -> usize {
    let tables: Vec<SharedTable> = state.tables.read().await.values().cloned().collect();
    let mut total = 0;
    for table in tables {
        total += table.lock().await.subscribers();
    }
    total
}

pub async fn active_players_num(state: &AppState) -> usize {
    let tables: Vec<SharedTable> = state.tables.read().await.values().cloned().collect();
    let mut total = 0;
    for table in tables {
        total += table.lock().await.players();
    }
    total
}

/// Store the new global quality and push it to every loaded table.
pub async fn set_global_quality(state: &AppState, level: usize) {
    state.store_global_quality(level);
    let tables: Vec<SharedTable> = state.tables.read().await.values().cloned().collect();
    for table in tables {
        table.lock().await.set_global_quality(level);
    }
}

// =============================================================================
// CREATE
// =============================================================================

/// Where a new table starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Genesis {
    /// Empty table on `board`.
    Board(String),
    /// Continue table `table` as it was at journal `line`.
    Fork { table: String, line: i64 },
}

fn random_id() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(TABLE_ID_LEN).map(char::from).collect()
}

/// Create a new table journal and return the table id.
///
/// # Errors
///
/// Fails if the fork source does not exist or the journal cannot be written.
pub async fn create_table(state: &AppState, genesis: Genesis) -> Result<String, RegistryError> {
    let record = match genesis {
        Genesis::Board(board) => Record { prev: None, act: Some(Action::Board(board).into()) },
        Genesis::Fork { table, line } => {
            if !is_valid_name(&table) {
                return Err(RegistryError::InvalidId(table));
            }
            let exists = tokio::fs::try_exists(state.config.tables_dir.join(&table))
                .await
                .map_err(JournalError::from)?;
            if !exists {
                return Err(RegistryError::NotFound(table));
            }
            Record { prev: Some(Pointer::in_file(line, table)), act: None }
        }
    };

    for _ in 0..CREATE_ATTEMPTS {
        let id = random_id();
        let dir = state.config.tables_dir.clone();
        let (name, genesis) = (id.clone(), record.clone());
        if tokio::task::spawn_blocking(move || Journal::create(&dir, &name, &genesis)).await?? {
            info!(table_id = %id, "table created");
            return Ok(id);
        }
        warn!(table_id = %id, "table id collision");
    }
    Err(RegistryError::IdExhausted)
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
