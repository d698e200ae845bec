//! Table actions: the reversible operations a table executes.
//!
//! DESIGN
//! ======
//! On the wire an action is an object keyed by its kind (`{"flipObjs":[1]}`),
//! and one object may carry several kinds at once because clients batch
//! requests. [`RawAction`] mirrors that shape; [`RawAction::into_actions`]
//! turns it into typed [`Action`]s in a fixed order so the table can match
//! exhaustively. Journal records reuse the same shape for their `act` field.

use serde::{Deserialize, Serialize};

use crate::services::army::ArmyRequest;
use crate::services::content::{GameObject, ObjId, ObjectDraft, ObjectPatch};
use crate::services::journal::Pointer;

// =============================================================================
// ERRORS
// =============================================================================

/// Recoverable rejection of a client request. Reported only to the requester.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("Error: too many objects has been created on this table. Clear it or create new table.")]
    TooManyObjects,
    #[error("Error in army config: it has too many {0}.")]
    ArmyLimit(&'static str),
    #[error("Error in army config: it has invalid removedTokens param")]
    InvalidRemovedTokens,
    #[error("Error: unable to load army {0}.")]
    ArmyUnavailable(String),
}

// =============================================================================
// HISTORY CONTEXT
// =============================================================================

/// Why an action is being executed. Decides how history and journal react.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryContext {
    /// A new action from a client.
    Do,
    /// Re-applying an undone action recorded at the given place.
    Redo(Pointer),
    /// Reverting the action recorded at the given place.
    Undo(Pointer),
    /// Replaying the journal record at the given place.
    Load(Pointer),
}

// =============================================================================
// ACTIONS
// =============================================================================

/// Draw request for `nextToken`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawRequest {
    pub spawner_id: ObjId,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
    /// Specific resource to take instead of a random one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
}

/// Objects moving between a spawner and the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnerTransfer<T> {
    pub spawner_id: ObjId,
    pub objs: Vec<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Genesis record naming the board. Not reversible.
    Board(String),
    ClearTable,
    SetTable(Vec<GameObject>),
    UpdateContent(Vec<ObjectPatch>),
    Move(Vec<ObjectPatch>),
    GetArmySpawner(ArmyRequest),
    NextToken(DrawRequest),
    GetUtil(ObjectDraft),
    DelObjs(Vec<ObjId>),
    ReturnObjs(Vec<ObjId>),
    FlipObjs(Vec<ObjId>),
    RotateLeftObjs(Vec<ObjId>),
    RotateRightObjs(Vec<ObjId>),
    /// Put concrete objects (and their secret resources) on the table.
    AddObjs { objs: Vec<GameObject>, secrets: Vec<(ObjId, String)> },
    /// Return units into a spawner.
    PopulateSpawner { spawner_id: ObjId, objs: Vec<ObjId> },
    /// Take concrete units out of a spawner.
    DepopulateSpawner { spawner_id: ObjId, objs: Vec<GameObject> },
}

impl Action {
    /// Whether a client may request this action directly. The remaining
    /// variants only appear as reverses or in journal replay.
    #[must_use]
    pub fn is_client_issuable(&self) -> bool {
        !matches!(
            self,
            Self::Board(_) | Self::AddObjs { .. } | Self::PopulateSpawner { .. } | Self::DepopulateSpawner { .. }
        )
    }
}

// =============================================================================
// WIRE SHAPE
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_table: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_table: Option<Vec<GameObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_content: Option<Vec<ObjectPatch>>,
    #[serde(rename = "move", default, skip_serializing_if = "Option::is_none")]
    pub move_objs: Option<Vec<ObjectPatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_army_spawner: Option<ArmyRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<DrawRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_util: Option<ObjectDraft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub del_objs: Option<Vec<ObjId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_objs: Option<Vec<ObjId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flip_objs: Option<Vec<ObjId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_left_objs: Option<Vec<ObjId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_right_objs: Option<Vec<ObjId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_objs: Option<Vec<GameObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_info: Option<Vec<(ObjId, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub populate_spawner: Option<SpawnerTransfer<ObjId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depopulate_spawner: Option<SpawnerTransfer<GameObject>>,
}

impl RawAction {
    /// Typed actions in execution order.
    #[must_use]
    pub fn into_actions(self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(board) = self.board {
            actions.push(Action::Board(board));
        }
        if self.clear_table.is_some() {
            actions.push(Action::ClearTable);
        }
        if let Some(objs) = self.set_table {
            actions.push(Action::SetTable(objs));
        }
        if let Some(patches) = self.update_content {
            actions.push(Action::UpdateContent(patches));
        }
        if let Some(patches) = self.move_objs {
            actions.push(Action::Move(patches));
        }
        if let Some(request) = self.get_army_spawner {
            actions.push(Action::GetArmySpawner(request));
        }
        if let Some(request) = self.next_token {
            actions.push(Action::NextToken(request));
        }
        if let Some(draft) = self.get_util {
            actions.push(Action::GetUtil(draft));
        }
        if let Some(ids) = self.del_objs {
            actions.push(Action::DelObjs(ids));
        }
        if let Some(ids) = self.return_objs {
            actions.push(Action::ReturnObjs(ids));
        }
        if let Some(ids) = self.flip_objs {
            actions.push(Action::FlipObjs(ids));
        }
        if let Some(ids) = self.rotate_left_objs {
            actions.push(Action::RotateLeftObjs(ids));
        }
        if let Some(ids) = self.rotate_right_objs {
            actions.push(Action::RotateRightObjs(ids));
        }
        if self.add_objs.is_some() || self.secrets_info.is_some() {
            actions.push(Action::AddObjs {
                objs: self.add_objs.unwrap_or_default(),
                secrets: self.secrets_info.unwrap_or_default(),
            });
        }
        if let Some(transfer) = self.populate_spawner {
            actions.push(Action::PopulateSpawner { spawner_id: transfer.spawner_id, objs: transfer.objs });
        }
        if let Some(transfer) = self.depopulate_spawner {
            actions.push(Action::DepopulateSpawner { spawner_id: transfer.spawner_id, objs: transfer.objs });
        }
        actions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        let mut raw = Self::default();
        match action {
            Action::Board(board) => raw.board = Some(board),
            Action::ClearTable => raw.clear_table = Some(serde_json::Value::Bool(true)),
            Action::SetTable(objs) => raw.set_table = Some(objs),
            Action::UpdateContent(patches) => raw.update_content = Some(patches),
            Action::Move(patches) => raw.move_objs = Some(patches),
            Action::GetArmySpawner(request) => raw.get_army_spawner = Some(request),
            Action::NextToken(request) => raw.next_token = Some(request),
            Action::GetUtil(draft) => raw.get_util = Some(draft),
            Action::DelObjs(ids) => raw.del_objs = Some(ids),
            Action::ReturnObjs(ids) => raw.return_objs = Some(ids),
            Action::FlipObjs(ids) => raw.flip_objs = Some(ids),
            Action::RotateLeftObjs(ids) => raw.rotate_left_objs = Some(ids),
            Action::RotateRightObjs(ids) => raw.rotate_right_objs = Some(ids),
            Action::AddObjs { objs, secrets } => {
                raw.add_objs = Some(objs);
                if !secrets.is_empty() {
                    raw.secrets_info = Some(secrets);
                }
            }
            Action::PopulateSpawner { spawner_id, objs } => {
                raw.populate_spawner = Some(SpawnerTransfer { spawner_id, objs });
            }
            Action::DepopulateSpawner { spawner_id, objs } => {
                raw.depopulate_spawner = Some(SpawnerTransfer { spawner_id, objs });
            }
        }
        raw
    }
}

#[cfg(test)]
#[path = "action_test.rs"]
mod tests;
