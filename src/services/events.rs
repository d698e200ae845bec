//! Operational event log.
//!
//! Notable server events (startup, table load failures, quality changes,
//! stats ticks, ...) are `tracing` events on [`EVENT_TARGET`] carrying an
//! `event` name and a JSON `data` field. They reach the console like any
//! other log line; [`file_layer`] additionally routes that target, and only
//! that target, to a JSON-lines file through a non-blocking appender.

use std::path::Path;

use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{Layer, Registry, fmt};

pub const EVENT_TARGET: &str = "table_events";

const DEFAULT_FILE_NAME: &str = "table_events.jsonl";

pub fn log(kind: &str, data: Value) {
    info!(target: EVENT_TARGET, event = kind, data = %data, "server event");
}

/// JSON-lines layer writing [`EVENT_TARGET`] events to `path`.
///
/// The returned guard flushes pending lines when dropped and must be kept
/// alive for as long as events should reach the file.
///
/// # Errors
///
/// Returns the appender error if the file cannot be created.
pub fn file_layer(path: &Path) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, WorkerGuard), InitError> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path.file_name().map_or_else(|| DEFAULT_FILE_NAME.to_owned(), |n| n.to_string_lossy().into_owned());
    let appender = RollingFileAppender::builder().rotation(Rotation::NEVER).filename_prefix(file_name).build(dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(writer)
        .with_filter(filter_fn(|meta| meta.target() == EVENT_TARGET));
    Ok((Box::new(layer), guard))
}
