//! Table creation endpoint used by the main server.

use axum::Json;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::warn;

use crate::services::registry::{self, Genesis, RegistryError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTableForm {
    #[serde(default)]
    pub board: String,
    /// Fork the new table from this table's journal.
    pub clone_of: Option<String>,
    /// Journal line of `clone_of` to fork at.
    pub clone_line: Option<i64>,
}

impl CreateTableForm {
    fn genesis(self) -> Result<Genesis, StatusCode> {
        match (self.clone_of, self.clone_line) {
            (Some(table), Some(line)) => Ok(Genesis::Fork { table, line }),
            (None, None) => Ok(Genesis::Board(self.board)),
            _ => Err(StatusCode::BAD_REQUEST),
        }
    }
}

/// `POST /tables/`: create a table journal and return its id.
pub async fn create_table(
    State(state): State<AppState>,
    Form(form): Form<CreateTableForm>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let genesis = form.genesis()?;
    let table_id = registry::create_table(&state, genesis).await.map_err(|e| {
        warn!(error = %e, "table creation failed");
        registry_error_to_status(&e)
    })?;
    Ok(Json(serde_json::json!({ "tableId": table_id })))
}

pub(crate) fn registry_error_to_status(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::InvalidId(_) => StatusCode::BAD_REQUEST,
        RegistryError::Denied => StatusCode::FORBIDDEN,
        RegistryError::Agent(_) => StatusCode::BAD_GATEWAY,
        RegistryError::IdExhausted | RegistryError::Journal(_) | RegistryError::Task(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "tables_test.rs"]
mod tests;
