//! Army expansion: turns an army description into concrete table objects.
//!
//! The layout is a spawner above the drop point holding every drawable token,
//! the base units at the drop point, and marker tokens in centred rows of
//! eight below it. Expansion is pure; the caller assigns ids.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::ActionLimits;
use crate::services::action::ActionError;
use crate::services::content::{ObjectDraft, ObjectKind};

const SPAWNER_OFFSET_Y: f64 = -100.0;
const MARKERS_OFFSET_Y: f64 = 120.0;
const MARKER_ROW_HEIGHT: f64 = 60.0;
const MARKER_COLUMN_WIDTH: f64 = 40.0;
const MARKERS_PER_ROW: usize = 8;

fn default_back_img() -> String {
    "b.jpg".to_owned()
}

fn one() -> usize {
    1
}

/// One line of an army description, repeated `q` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmyEntry {
    pub name: String,
    #[serde(default = "one")]
    pub q: usize,
    /// Decoy resource shown instead of `name` until revealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmyInfo {
    #[serde(default)]
    pub tokens: Vec<ArmyEntry>,
    #[serde(default)]
    pub bases: Vec<ArmyEntry>,
    #[serde(default)]
    pub markers: Vec<ArmyEntry>,
    #[serde(default = "default_back_img")]
    pub def_back_img: String,
}

/// `getArmySpawner` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmyRequest {
    pub name: String,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_tokens: Vec<String>,
    /// Army description supplied by the caller; fetched from the main server when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ArmyInfo>,
}

/// An object to place plus the true resource when it is placed face-down.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub draft: ObjectDraft,
    pub secret: Option<String>,
}

fn repeat<'a>(
    entries: &'a [ArmyEntry],
    limit: usize,
    category: &'static str,
) -> Result<Vec<&'a ArmyEntry>, ActionError> {
    let count = entries
        .iter()
        .try_fold(0usize, |total, e| total.checked_add(e.q))
        .ok_or(ActionError::ArmyLimit(category))?;
    if count > limit {
        return Err(ActionError::ArmyLimit(category));
    }
    Ok(entries
        .iter()
        .flat_map(|e| std::iter::repeat_n(e, e.q))
        .collect())
}

/// Horizontal offset of marker `k` out of `n`, centred within its row.
fn marker_offset(k: usize, n: usize) -> f64 {
    let row = k / MARKERS_PER_ROW;
    let in_row = (n - 1 - row * MARKERS_PER_ROW).min(MARKERS_PER_ROW - 1);
    ((k % MARKERS_PER_ROW) as f64 - in_row as f64 / 2.0) * MARKER_COLUMN_WIDTH
}

/// Expand `request` against `info` into placements, spawner first.
///
/// # Errors
///
/// Fails when a category exceeds its ceiling or `removedTokens` names a
/// token the army does not contain. Nothing is placed on error.
pub fn expand<R: Rng + ?Sized>(
    request: &ArmyRequest,
    info: &ArmyInfo,
    limits: &ActionLimits,
    rng: &mut R,
) -> Result<Vec<Placement>, ActionError> {
    let prefix = format!("armies/{}/", request.name);

    let mut tokens: Vec<String> = repeat(&info.tokens, limits.army_tokens, "tokens")?
        .into_iter()
        .map(|e| format!("{prefix}{}", e.name))
        .collect();
    for removed in &request.removed_tokens {
        let index = tokens
            .iter()
            .position(|t| t == removed)
            .ok_or(ActionError::InvalidRemovedTokens)?;
        tokens.remove(index);
    }

    let bases = repeat(&info.bases, limits.army_bases, "bases")?;
    let mut markers = repeat(&info.markers, limits.army_markers, "markers")?;
    if markers.iter().any(|m| m.secret.is_some()) {
        markers.shuffle(rng);
    }

    let mut placements = Vec::with_capacity(1 + bases.len() + markers.len());
    placements.push(Placement {
        draft: ObjectDraft::spawner(tokens, request.left, request.top + SPAWNER_OFFSET_Y),
        secret: None,
    });
    for base in bases {
        placements.push(Placement {
            draft: ObjectDraft::unit(format!("{prefix}{}", base.name), request.left, request.top),
            secret: None,
        });
    }
    let n = markers.len();
    for (k, marker) in markers.into_iter().enumerate() {
        let left = request.left + marker_offset(k, n);
        let top = request.top + MARKERS_OFFSET_Y + (k / MARKERS_PER_ROW) as f64 * MARKER_ROW_HEIGHT;
        let res = format!("{prefix}{}", marker.name);
        let placement = match &marker.secret {
            Some(decoy) => Placement {
                draft: ObjectDraft {
                    left,
                    top,
                    kind: ObjectKind::Token { res: format!("{prefix}{decoy}"), secret: true },
                },
                secret: Some(res),
            },
            None => Placement { draft: ObjectDraft::token(res, left, top), secret: None },
        };
        placements.push(placement);
    }
    Ok(placements)
}

#[cfg(test)]
#[path = "army_test.rs"]
mod tests;
