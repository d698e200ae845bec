use super::*;
use crate::services::registry::{self, Genesis};
use crate::state::test_helpers;
use tokio::sync::mpsc;

const QUALITY_LEVELS_TOP: usize = crate::config::QUALITY_LEVELS.len() - 1;

#[test]
fn take_sums_and_resets_counters() {
    let stats = ConnectionStats::new();
    stats.register(1);
    stats.register(2);
    stats.record_sent(1, 10);
    stats.record_sent(2, 5);
    stats.record_received(1, 3);
    stats.record_ping(2);
    stats.record_pong(2);
    stats.record_delays(1, &[100.0, f64::NAN]);
    stats.record_delays(2, &[300.0]);
    stats.record_sent(9, 100);

    let tick = stats.take();
    assert_eq!(tick.connections, 2);
    assert_eq!((tick.sent, tick.sent_bytes), (2, 15));
    assert_eq!((tick.received, tick.received_bytes), (1, 3));
    assert_eq!((tick.pinged, tick.pongs), (1, 1));
    assert_eq!(tick.average_delay(), Some(200.0));

    let next = stats.take();
    assert_eq!(next, Tick { connections: 2, ..Tick::default() });
    assert_eq!(next.average_delay(), None);
}

#[test]
fn record_reports_delay_spread() {
    let tick = Tick { connections: 3, delays: vec![50.0, 150.0], sent: 4, ..Tick::default() };
    let record = tick.to_record(2, 1, 7);
    assert_eq!(record["activeWsConnections"], 3);
    assert_eq!(record["handledRequests"], 2);
    assert_eq!(record["avgDelay"], 100.0);
    assert_eq!(record["minDelay"], 50.0);
    assert_eq!(record["maxDelay"], 150.0);
    assert_eq!(record["sentMes"], 4);
    assert_eq!(record["serviceQuality"], 7);

    let empty = Tick::default().to_record(0, 0, 0);
    assert_eq!(empty["minDelay"], 0.0);
}

#[tokio::test]
async fn tick_without_connections_stops_loop() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    state.stats_running.store(true, Ordering::Release);
    let mut controller = QualityController::new(state.config.quality);
    assert!(!run_tick(&state, &mut controller).await);
    assert!(!state.stats_running.load(Ordering::Acquire));
}

#[tokio::test]
async fn tick_pushes_record_to_monitors() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let (tx, mut rx) = mpsc::channel(8);
    state.monitors.insert(1, tx);
    state.stats.register(1);
    state.stats.record_delays(1, &[20.0]);

    let mut controller = QualityController::new(state.config.quality);
    assert!(run_tick(&state, &mut controller).await);
    let pushed: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(pushed["stats"][0]["activeWsConnections"], 1);
    assert_eq!(pushed["stats"][0]["avgDelay"], 20.0);
}

#[tokio::test]
async fn sustained_delay_lowers_quality_of_loaded_tables() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_helpers::test_app_state(dir.path());
    let id = registry::create_table(&state, Genesis::Board("B1".into())).await.unwrap();
    let table = registry::load(&state, &id).await.unwrap();

    let busy = state.config.quality.connection_threshold + 1;
    for user_id in 0..busy as u64 {
        state.stats.register(user_id);
    }
    let max = state.config.quality.max_global();
    let mut controller = QualityController::new(state.config.quality);
    state.stats.record_delays(0, &[10_000.0]);
    assert!(run_tick(&state, &mut controller).await);

    assert_eq!(state.global_quality(), max - 2);
    assert_eq!(table.lock().await.local_quality(), (max - 2).min(QUALITY_LEVELS_TOP));
}
