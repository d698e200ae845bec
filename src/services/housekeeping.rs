//! Housekeeping service: debounced journal flushes and idle table eviction.
//!
//! DESIGN
//! ======
//! A background task wakes every `housekeeping_interval`. For each loaded
//! table it flushes journal records whose debounce window has passed, then
//! evicts tables that have had no members for `table_removal_delay`. Records
//! marked important are flushed by the table itself as they are written, so
//! this loop only bounds how long ordinary records can sit in memory.

use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::services::registry;
use crate::state::{AppState, SharedTable};

/// Spawn the background housekeeping task. Returns a handle for shutdown.
pub fn spawn_housekeeping_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.housekeeping_interval);
        loop {
            interval.tick().await;
            run_once(&state, Instant::now()).await;
        }
    })
}

/// One housekeeping pass. Returns the ids of evicted tables.
pub async fn run_once(state: &AppState, now: Instant) -> Vec<String> {
    // Snapshot the registry, then release it before touching tables.
    let tables: Vec<(String, SharedTable)> =
        state.tables.read().await.iter().map(|(id, table)| (id.clone(), table.clone())).collect();

    let mut idle = Vec::new();
    for (id, table) in tables {
        let mut table = table.lock().await;
        table.flush_if_due(now);
        if table.is_idle(now, state.config.table_removal_delay) {
            idle.push(id);
        }
    }

    let mut evicted = Vec::with_capacity(idle.len());
    for id in idle {
        if registry::unload_if_idle(state, &id, now).await {
            evicted.push(id);
        }
    }
    if !evicted.is_empty() {
        debug!(count = evicted.len(), "housekeeping evicted tables");
    }
    evicted
}

#[cfg(test)]
#[path = "housekeeping_test.rs"]
mod tests;
