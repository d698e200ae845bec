//! Stats service: per-connection traffic counters and the periodic stats tick.
//!
//! DESIGN
//! ======
//! Every connection owns a slot of counters that the websocket loop bumps as
//! it sends, receives and pings. A background task wakes every
//! `stats_interval` while at least one connection exists: it takes and
//! resets all counters, records a `stat` event, pushes the record to
//! monitors, and feeds the average client delay into the
//! [`QualityController`]. The task stops itself when the last connection is
//! gone and is restarted by the next one.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::protocol::UserId;
use crate::services::quality::QualityController;
use crate::services::{events, registry};
use crate::state::AppState;

// =============================================================================
// COUNTERS
// =============================================================================

/// Traffic of one connection since the last tick.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConnectionCounters {
    /// Round-trip samples reported by the client, in milliseconds.
    pub delays: Vec<f64>,
    pub sent: u64,
    pub sent_bytes: u64,
    pub received: u64,
    pub received_bytes: u64,
    pub pinged: u64,
    pub pongs: u64,
}

#[derive(Clone, Default)]
pub struct ConnectionStats {
    slots: Arc<Mutex<HashMap<UserId, ConnectionCounters>>>,
}

impl ConnectionStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slot(&self, user_id: UserId, f: impl FnOnce(&mut ConnectionCounters)) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(&user_id) {
            f(slot);
        }
    }

    pub fn register(&self, user_id: UserId) {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).entry(user_id).or_default();
    }

    pub fn unregister(&self, user_id: UserId) {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).remove(&user_id);
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn record_sent(&self, user_id: UserId, bytes: usize) {
        self.with_slot(user_id, |c| {
            c.sent += 1;
            c.sent_bytes += bytes as u64;
        });
    }

    pub fn record_received(&self, user_id: UserId, bytes: usize) {
        self.with_slot(user_id, |c| {
            c.received += 1;
            c.received_bytes += bytes as u64;
        });
    }

    pub fn record_ping(&self, user_id: UserId) {
        self.with_slot(user_id, |c| c.pinged += 1);
    }

    pub fn record_pong(&self, user_id: UserId) {
        self.with_slot(user_id, |c| c.pongs += 1);
    }

    pub fn record_delays(&self, user_id: UserId, delays: &[f64]) {
        self.with_slot(user_id, |c| c.delays.extend(delays.iter().copied().filter(|d| d.is_finite())));
    }

    /// Sum all slots and reset them.
    pub fn take(&self) -> Tick {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tick = Tick { connections: slots.len(), ..Tick::default() };
        for slot in slots.values_mut() {
            let counters = std::mem::take(slot);
            tick.sent += counters.sent;
            tick.sent_bytes += counters.sent_bytes;
            tick.received += counters.received;
            tick.received_bytes += counters.received_bytes;
            tick.pinged += counters.pinged;
            tick.pongs += counters.pongs;
            tick.delays.extend(counters.delays);
        }
        tick
    }
}

/// Aggregated counters of one stats interval.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Tick {
    pub connections: usize,
    pub delays: Vec<f64>,
    pub sent: u64,
    pub sent_bytes: u64,
    pub received: u64,
    pub received_bytes: u64,
    pub pinged: u64,
    pub pongs: u64,
}

impl Tick {
    /// Mean reported delay, `None` without samples.
    #[must_use]
    pub fn average_delay(&self) -> Option<f64> {
        (!self.delays.is_empty()).then(|| self.delays.iter().sum::<f64>() / self.delays.len() as f64)
    }

    fn min_delay(&self) -> f64 {
        self.delays.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    fn max_delay(&self) -> f64 {
        self.delays.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// The `stat` record.
    #[must_use]
    pub fn to_record(&self, subscriptions: usize, players: usize, quality: usize) -> Value {
        json!({
            "activeWsConnections": self.connections,
            "tableSubscriptions": subscriptions,
            "activePlayers": players,
            "handledRequests": self.delays.len(),
            "avgDelay": self.average_delay().unwrap_or(0.0),
            "minDelay": self.min_delay(),
            "maxDelay": self.max_delay(),
            "sentMes": self.sent,
            "sentBytes": self.sent_bytes,
            "receivedMes": self.received,
            "receivedBytes": self.received_bytes,
            "pings": self.pinged,
            "pongs": self.pongs,
            "serviceQuality": quality,
        })
    }
}

// =============================================================================
// STATS LOOP
// =============================================================================

/// Start the stats task unless it is already running.
pub fn ensure_running(state: &AppState) -> Option<JoinHandle<()>> {
    if state.config.stats_interval.is_zero() || state.stats_running.swap(true, Ordering::AcqRel) {
        return None;
    }
    let state = state.clone();
    Some(tokio::spawn(async move {
        let period = state.config.stats_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut controller = QualityController::new(state.config.quality);
        if controller.level() != state.global_quality() {
            registry::set_global_quality(&state, controller.level()).await;
        }
        info!("stats service started");
        loop {
            interval.tick().await;
            if !run_tick(&state, &mut controller).await {
                break;
            }
        }
        info!("stats service stopped");
    }))
}

/// One stats interval. Returns whether the loop should keep running.
pub async fn run_tick(state: &AppState, controller: &mut QualityController) -> bool {
    let tick = state.stats.take();
    if tick.connections == 0 {
        state.stats_running.store(false, Ordering::Release);
        // A connection may have registered after the take.
        if state.stats.connections() > 0 {
            return !state.stats_running.swap(true, Ordering::AcqRel);
        }
        return false;
    }

    let average = tick.average_delay();
    let quality = adjust_quality(state, controller, tick.connections, average).await;
    let record = tick.to_record(
        registry::subscriptions_num(state).await,
        registry::active_players_num(state).await,
        quality,
    );
    debug!(connections = tick.connections, ?average, quality, "stats tick");
    events::log("stat", record.clone());
    state.monitors.publish(&json!({ "stats": [record] }));
    true
}

async fn adjust_quality(
    state: &AppState,
    controller: &mut QualityController,
    connections: usize,
    average: Option<f64>,
) -> usize {
    let previous = controller.level();
    if let Some(level) = controller.tick(connections, average) {
        events::log("serviceQualityChange", json!({ "from": previous, "to": level }));
        registry::set_global_quality(state, level).await;
    } else if previous == 0 && average.is_some_and(|d| d > state.config.quality.decrease_threshold) {
        events::log("requestedToLowQuality", Value::Null);
    }
    controller.level()
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod tests;
