//! Server configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Every knob has a compiled-in default and can be overridden through the
//! environment (or a `.env` file loaded by `dotenvy` at startup). Parsing is
//! lenient: an unparsable value falls back to its default instead of
//! aborting the process.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

// =============================================================================
// QUALITY STEP TABLE
// =============================================================================

/// One throttling tier sent to clients as `qualityInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityLevel {
    /// Minimum interval between cursor sync messages in ms; `-1` disables them.
    #[serde(rename = "mouseUpdateCoolDown")]
    pub mouse_sync_interval: i64,
    /// `(emotes allowed, per window in ms)`.
    #[serde(rename = "emotesCoolDown")]
    pub emote_rate_limit: (u32, u64),
}

/// Ascending quality tiers. Index 0 is the most throttled.
pub const QUALITY_LEVELS: [QualityLevel; 6] = [
    QualityLevel { mouse_sync_interval: -1, emote_rate_limit: (0, 0) },
    QualityLevel { mouse_sync_interval: -1, emote_rate_limit: (1, 5000) },
    QualityLevel { mouse_sync_interval: 500, emote_rate_limit: (3, 10000) },
    QualityLevel { mouse_sync_interval: 250, emote_rate_limit: (9, 20000) },
    QualityLevel { mouse_sync_interval: 150, emote_rate_limit: (20, 20000) },
    QualityLevel { mouse_sync_interval: 100, emote_rate_limit: (20, 20000) },
];

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_TABLES_DIR: &str = "tables";
const DEFAULT_EVENT_LOG_PATH: &str = "table_logs.jsonl";
const DEFAULT_PING_INTERVAL_MS: u64 = 5000;
const DEFAULT_PING_ALLOWED_FAILURES: u32 = 3;
const DEFAULT_STATS_INTERVAL_MS: u64 = 5000;
const DEFAULT_TABLE_REMOVAL_DELAY_SECS: u64 = 60 * 60;
const DEFAULT_JOURNAL_FLUSH_DEBOUNCE_MS: u64 = 10_000;
const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 1000;
const DEFAULT_ARMY_TOKENS_LIMIT: usize = 100;
const DEFAULT_ARMY_BASES_LIMIT: usize = 10;
const DEFAULT_ARMY_MARKERS_LIMIT: usize = 100;
const DEFAULT_TABLE_MAX_OBJECTS: usize = 500;
const DEFAULT_INCREASE_QUALITY_THRESHOLD: f64 = 200.0;
const DEFAULT_DECREASE_QUALITY_THRESHOLD: f64 = 300.0;
const DEFAULT_DOUBLE_DECREASE_QUALITY_THRESHOLD: f64 = 500.0;
const DEFAULT_CONNECTION_THRESHOLD: usize = 8;
const DEFAULT_INCREASE_INSENSITIVITY: u32 = 2;
const DEFAULT_DECREASE_INSENSITIVITY: u32 = 3;
const DEFAULT_ADDITIONAL_QUALITY: usize = 2;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Timer period in milliseconds. Zero is raised to 1 ms since tokio
/// intervals reject a zero period.
fn env_period(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms).max(1))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Ceilings applied to resource-amplifying actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionLimits {
    pub army_tokens: usize,
    pub army_bases: usize,
    pub army_markers: usize,
    /// Maximum number of live objects on one table.
    pub table_objects: usize,
}

impl Default for ActionLimits {
    fn default() -> Self {
        Self {
            army_tokens: DEFAULT_ARMY_TOKENS_LIMIT,
            army_bases: DEFAULT_ARMY_BASES_LIMIT,
            army_markers: DEFAULT_ARMY_MARKERS_LIMIT,
            table_objects: DEFAULT_TABLE_MAX_OBJECTS,
        }
    }
}

/// Hysteresis settings for the global quality controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityConfig {
    pub enabled: bool,
    /// Average delay (ms) below which a tick counts towards raising quality.
    pub increase_threshold: f64,
    /// Average delay (ms) above which a tick counts towards lowering quality.
    pub decrease_threshold: f64,
    /// Average delay (ms) above which quality drops by two levels at once.
    pub double_decrease_threshold: f64,
    /// With at most this many connections the quality is pinned to the maximum.
    pub connection_threshold: usize,
    pub increase_insensitivity: u32,
    pub decrease_insensitivity: u32,
    /// Global levels above the top of the step table, absorbed by crowded tables.
    pub additional_levels: usize,
}

impl QualityConfig {
    /// Highest global quality level.
    #[must_use]
    pub fn max_global(&self) -> usize {
        QUALITY_LEVELS.len() + self.additional_levels - 1
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            increase_threshold: DEFAULT_INCREASE_QUALITY_THRESHOLD,
            decrease_threshold: DEFAULT_DECREASE_QUALITY_THRESHOLD,
            double_decrease_threshold: DEFAULT_DOUBLE_DECREASE_QUALITY_THRESHOLD,
            connection_threshold: DEFAULT_CONNECTION_THRESHOLD,
            increase_insensitivity: DEFAULT_INCREASE_INSENSITIVITY,
            decrease_insensitivity: DEFAULT_DECREASE_INSENSITIVITY,
            additional_levels: DEFAULT_ADDITIONAL_QUALITY,
        }
    }
}

// =============================================================================
// SERVER CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory holding one journal file per table.
    pub tables_dir: PathBuf,
    /// Base URL of the main application server. `None` runs standalone.
    pub main_server_url: Option<String>,
    pub serve_static: Option<PathBuf>,
    pub event_log_path: Option<PathBuf>,
    /// Whether idle connections are pinged and dropped.
    pub enable_timeout: bool,
    pub ping_interval: Duration,
    pub ping_allowed_failures: u32,
    pub stats_interval: Duration,
    pub table_removal_delay: Duration,
    pub journal_flush_debounce: Duration,
    pub housekeeping_interval: Duration,
    pub limits: ActionLimits,
    pub quality: QualityConfig,
}

impl ServerConfig {
    /// Build the configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT", defaults.port),
            tables_dir: env_path("TABLES_DIR").unwrap_or(defaults.tables_dir),
            main_server_url: std::env::var("MAIN_SERVER_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            serve_static: env_path("SERVE_STATIC"),
            event_log_path: env_path("EVENT_LOG_PATH").or(defaults.event_log_path),
            enable_timeout: env_parse("ENABLE_TIMEOUT", defaults.enable_timeout),
            ping_interval: env_period("PING_INTERVAL_MS", DEFAULT_PING_INTERVAL_MS),
            ping_allowed_failures: env_parse("PING_ALLOWED_FAILURES", defaults.ping_allowed_failures),
            stats_interval: env_period("STATS_INTERVAL_MS", DEFAULT_STATS_INTERVAL_MS),
            table_removal_delay: Duration::from_secs(env_parse(
                "TABLE_REMOVAL_DELAY_SECS",
                DEFAULT_TABLE_REMOVAL_DELAY_SECS,
            )),
            journal_flush_debounce: Duration::from_millis(env_parse(
                "JOURNAL_FLUSH_DEBOUNCE_MS",
                DEFAULT_JOURNAL_FLUSH_DEBOUNCE_MS,
            )),
            housekeeping_interval: env_period("HOUSEKEEPING_INTERVAL_MS", DEFAULT_HOUSEKEEPING_INTERVAL_MS),
            limits: ActionLimits {
                army_tokens: env_parse("ARMY_TOKENS_LIMIT", defaults.limits.army_tokens),
                army_bases: env_parse("ARMY_BASES_LIMIT", defaults.limits.army_bases),
                army_markers: env_parse("ARMY_MARKERS_LIMIT", defaults.limits.army_markers),
                table_objects: env_parse("TABLE_MAX_OBJECTS", defaults.limits.table_objects),
            },
            quality: QualityConfig {
                enabled: env_parse("ADJUST_SERVICE_QUALITY", defaults.quality.enabled),
                increase_threshold: env_parse("INCREASE_QUALITY_THRESHOLD", defaults.quality.increase_threshold),
                decrease_threshold: env_parse("DECREASE_QUALITY_THRESHOLD", defaults.quality.decrease_threshold),
                double_decrease_threshold: env_parse(
                    "DOUBLE_DECREASE_QUALITY_THRESHOLD",
                    defaults.quality.double_decrease_threshold,
                ),
                connection_threshold: env_parse(
                    "ADJUST_SERVICE_CONNECTION_THRESHOLD",
                    defaults.quality.connection_threshold,
                ),
                increase_insensitivity: env_parse(
                    "ADJUST_SERVICE_INCREASE_INSENSITIVITY",
                    defaults.quality.increase_insensitivity,
                ),
                decrease_insensitivity: env_parse(
                    "ADJUST_SERVICE_DECREASE_INSENSITIVITY",
                    defaults.quality.decrease_insensitivity,
                ),
                additional_levels: env_parse("ADDITIONAL_QUALITY", defaults.quality.additional_levels),
            },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tables_dir: PathBuf::from(DEFAULT_TABLES_DIR),
            main_server_url: None,
            serve_static: None,
            event_log_path: Some(PathBuf::from(DEFAULT_EVENT_LOG_PATH)),
            enable_timeout: true,
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            ping_allowed_failures: DEFAULT_PING_ALLOWED_FAILURES,
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            table_removal_delay: Duration::from_secs(DEFAULT_TABLE_REMOVAL_DELAY_SECS),
            journal_flush_debounce: Duration::from_millis(DEFAULT_JOURNAL_FLUSH_DEBOUNCE_MS),
            housekeeping_interval: Duration::from_millis(DEFAULT_HOUSEKEEPING_INTERVAL_MS),
            limits: ActionLimits::default(),
            quality: QualityConfig::default(),
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
