//! Main-server agent: table metadata, army content and role authorization.
//!
//! DESIGN
//! ======
//! Accounts, table metadata and army definitions live in the main application
//! server. [`MainAgent`] is the seam; [`HttpMainAgent`] talks to the main
//! server over HTTP and [`StandaloneAgent`] serves a table server running on
//! its own, resolving tables from local journals and granting every role
//! request. Every call degrades to a refusal on failure; callers never see
//! transport details beyond the logged [`AgentError`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::army::ArmyInfo;
use crate::services::journal::is_valid_name;

const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PLAYERS_NUM: u32 = 2;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to build http client: {0}")]
    HttpClientBuild(String),
    #[error("main server request failed: {0}")]
    Request(String),
    #[error("main server returned {status}")]
    Status { status: u16 },
    #[error("not available without a main server: {0}")]
    Unavailable(&'static str),
    #[error("invalid main server url: {0}")]
    InvalidUrl(String),
}

/// Table metadata owned by the main server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_players_num")]
    pub def_num_of_players: u32,
    #[serde(default)]
    pub board: String,
}

fn default_players_num() -> u32 {
    DEFAULT_PLAYERS_NUM
}

/// Answer to a role request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub result: bool,
    #[serde(default)]
    pub role: Option<String>,
}

impl Authorization {
    #[must_use]
    pub fn denied() -> Self {
        Self { result: false, role: None }
    }
}

/// Collaborator owning accounts, tables and armies.
#[async_trait::async_trait]
pub trait MainAgent: Send + Sync {
    /// Metadata of table `id`, `None` if it is unknown.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] if the lookup could not be performed.
    async fn get_table_by_id(&self, id: &str) -> Result<Option<TableMeta>, AgentError>;

    /// Army definition by name.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] if the army could not be fetched.
    async fn get_army(&self, name: &str) -> Result<ArmyInfo, AgentError>;

    /// Decide which role the holder of `cookie` gets on `table_id`.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] if the decision could not be obtained.
    async fn authorize_role_request(
        &self,
        cookie: Option<&str>,
        table_id: &str,
        role_request: Option<&str>,
    ) -> Result<Authorization, AgentError>;
}

// =============================================================================
// HTTP AGENT
// =============================================================================

pub struct HttpMainAgent {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoleRequestBody<'a> {
    table_id: &'a str,
    role_request: Option<&'a str>,
}

impl HttpMainAgent {
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AgentError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: base_url.into() })
    }

    /// `base_url` followed by `segments`, each percent-encoded as a single
    /// path segment, with a trailing slash.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, AgentError> {
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
            return Err(AgentError::InvalidUrl(segments.join("/")));
        }
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|e| AgentError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| AgentError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments)
            .push("");
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, segments: &[&str]) -> Result<Option<T>, AgentError> {
        let response = self
            .http
            .get(self.endpoint(segments)?)
            .send()
            .await
            .map_err(|e| AgentError::Request(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AgentError::Status { status: response.status().as_u16() });
        }
        response.json().await.map(Some).map_err(|e| AgentError::Request(e.to_string()))
    }
}

#[async_trait::async_trait]
impl MainAgent for HttpMainAgent {
    async fn get_table_by_id(&self, id: &str) -> Result<Option<TableMeta>, AgentError> {
        self.get_json(&["tables", id, "info"]).await
    }

    async fn get_army(&self, name: &str) -> Result<ArmyInfo, AgentError> {
        self.get_json(&["armies", name, "info"])
            .await?
            .ok_or(AgentError::Status { status: 404 })
    }

    async fn authorize_role_request(
        &self,
        cookie: Option<&str>,
        table_id: &str,
        role_request: Option<&str>,
    ) -> Result<Authorization, AgentError> {
        let mut request = self
            .http
            .post(self.endpoint(&["authorizeRoleRequest"])?)
            .json(&RoleRequestBody { table_id, role_request });
        if let Some(cookie) = cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        let response = request.send().await.map_err(|e| AgentError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AgentError::Status { status: response.status().as_u16() });
        }
        response.json().await.map_err(|e| AgentError::Request(e.to_string()))
    }
}

// =============================================================================
// STANDALONE AGENT
// =============================================================================

/// Agent for a table server without a main server.
pub struct StandaloneAgent {
    tables_dir: PathBuf,
}

impl StandaloneAgent {
    #[must_use]
    pub fn new(tables_dir: impl Into<PathBuf>) -> Self {
        Self { tables_dir: tables_dir.into() }
    }
}

#[async_trait::async_trait]
impl MainAgent for StandaloneAgent {
    async fn get_table_by_id(&self, id: &str) -> Result<Option<TableMeta>, AgentError> {
        if !is_valid_name(id) {
            return Ok(None);
        }
        let exists = tokio::fs::try_exists(self.tables_dir.join(id))
            .await
            .map_err(|e| AgentError::Request(e.to_string()))?;
        // The board name is restored from the journal's genesis record.
        Ok(exists.then(|| TableMeta { name: id.to_owned(), def_num_of_players: DEFAULT_PLAYERS_NUM, board: String::new() }))
    }

    async fn get_army(&self, _name: &str) -> Result<ArmyInfo, AgentError> {
        Err(AgentError::Unavailable("army definitions must be supplied by the client"))
    }

    async fn authorize_role_request(
        &self,
        _cookie: Option<&str>,
        _table_id: &str,
        role_request: Option<&str>,
    ) -> Result<Authorization, AgentError> {
        let role = role_request.unwrap_or("player");
        Ok(Authorization { result: true, role: Some(role.to_owned()) })
    }
}
