//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! cloned into background tasks. It holds the configuration, the registry of
//! loaded tables, the list-feed and monitor audiences, the main-server agent
//! and the process-wide counters. Each table sits behind its own
//! `tokio::sync::Mutex`; the registry map is only locked to find, insert or
//! evict tables, never while a journal is read. Loads and evictions are
//! serialized by a separate lock so a journal is never read while it is
//! still being closed. Lock order: loading, registry, table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, RwLock};

use crate::config::ServerConfig;
use crate::protocol::{Audience, UserId};
use crate::services::agent::MainAgent;
use crate::services::stats::ConnectionStats;
use crate::services::table::{Table, TableEnv};

pub type SharedTable = Arc<Mutex<Table>>;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Loaded tables keyed by id.
    pub tables: Arc<RwLock<HashMap<String, SharedTable>>>,
    /// Held while a table is loaded or evicted.
    pub loading: Arc<Mutex<()>>,
    /// Connections subscribed to the table list.
    pub feed: Audience,
    /// Connections receiving stats records.
    pub monitors: Audience,
    pub agent: Arc<dyn MainAgent>,
    pub stats: ConnectionStats,
    pub stats_running: Arc<AtomicBool>,
    global_quality: Arc<AtomicUsize>,
    next_user_id: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(config: ServerConfig, agent: Arc<dyn MainAgent>) -> Self {
        let global_quality = config.quality.max_global();
        Self {
            config: Arc::new(config),
            tables: Arc::new(RwLock::new(HashMap::new())),
            loading: Arc::new(Mutex::new(())),
            feed: Audience::new(),
            monitors: Audience::new(),
            agent,
            stats: ConnectionStats::new(),
            stats_running: Arc::new(AtomicBool::new(false)),
            global_quality: Arc::new(AtomicUsize::new(global_quality)),
            next_user_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fresh id for a new connection.
    pub fn next_user_id(&self) -> UserId {
        self.next_user_id.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn global_quality(&self) -> usize {
        self.global_quality.load(Ordering::Acquire)
    }

    pub(crate) fn store_global_quality(&self, level: usize) {
        self.global_quality.store(level, Ordering::Release);
    }

    /// Collaborators handed to every table on load.
    #[must_use]
    pub fn table_env(&self) -> TableEnv {
        TableEnv { limits: self.config.limits, feed: self.feed.clone() }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;
    use crate::services::agent::{AgentError, Authorization, StandaloneAgent, TableMeta};
    use crate::services::army::{ArmyEntry, ArmyInfo};

    /// Config pointing at `tables_dir`, with short timers.
    #[must_use]
    pub fn test_config(tables_dir: &Path) -> ServerConfig {
        ServerConfig {
            tables_dir: tables_dir.to_path_buf(),
            event_log_path: None,
            journal_flush_debounce: std::time::Duration::ZERO,
            ..ServerConfig::default()
        }
    }

    /// A standalone `AppState` over `tables_dir`.
    #[must_use]
    pub fn test_app_state(tables_dir: &Path) -> AppState {
        AppState::new(test_config(tables_dir), Arc::new(StandaloneAgent::new(tables_dir)))
    }

    /// An `AppState` backed by [`MockAgent`].
    #[must_use]
    pub fn test_app_state_with_agent(tables_dir: &Path, agent: MockAgent) -> AppState {
        AppState::new(test_config(tables_dir), Arc::new(agent))
    }

    /// Main-server stand-in: known tables, a single army and a fixed role answer.
    #[derive(Default)]
    pub struct MockAgent {
        pub tables: HashMap<String, TableMeta>,
        pub army: Option<ArmyInfo>,
        pub role: Option<String>,
    }

    impl MockAgent {
        #[must_use]
        pub fn with_table(mut self, id: &str, board: &str) -> Self {
            self.tables.insert(
                id.to_owned(),
                TableMeta { name: format!("table {id}"), def_num_of_players: 2, board: board.to_owned() },
            );
            self
        }

        #[must_use]
        pub fn granting(mut self, role: &str) -> Self {
            self.role = Some(role.to_owned());
            self
        }

        #[must_use]
        pub fn with_army(mut self, tokens: usize) -> Self {
            self.army = Some(ArmyInfo {
                tokens: vec![ArmyEntry { name: "t".into(), q: tokens, secret: None }],
                bases: Vec::new(),
                markers: Vec::new(),
                def_back_img: "b.jpg".into(),
            });
            self
        }
    }

    #[async_trait]
    impl MainAgent for MockAgent {
        async fn get_table_by_id(&self, id: &str) -> Result<Option<TableMeta>, AgentError> {
            Ok(self.tables.get(id).cloned())
        }

        async fn get_army(&self, _name: &str) -> Result<ArmyInfo, AgentError> {
            self.army.clone().ok_or(AgentError::Status { status: 404 })
        }

        async fn authorize_role_request(
            &self,
            _cookie: Option<&str>,
            _table_id: &str,
            _role_request: Option<&str>,
        ) -> Result<Authorization, AgentError> {
            Ok(match &self.role {
                Some(role) => Authorization { result: true, role: Some(role.clone()) },
                None => Authorization::denied(),
            })
        }
    }
}
