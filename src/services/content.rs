//! Content model: game objects and the id-addressed arena holding them.
//!
//! DESIGN
//! ======
//! Objects travel as flat JSON: the variant is chosen by which fields are
//! present (`flipped` → unit, `tokens` → spawner, otherwise token) and a
//! numeric `type` is added on the way out for clients. The arena is a
//! growable list of slots; a deleted object leaves a tombstone, so the next
//! id is always the slot count and ids are never handed out twice.

use serde::{Deserialize, Serialize};

/// Object identifier within one table.
pub type ObjId = u64;

const TYPE_UNIT: u8 = 1;
const TYPE_TOKEN: u8 = 2;
const TYPE_SPAWNER: u8 = 3;

// =============================================================================
// OBJECTS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    /// Flippable, rotatable piece, possibly drawn from a spawner.
    Unit { res: String, flipped: bool, angle: i64, spawner_id: Option<ObjId> },
    /// Static marker. When `secret` is set, `res` is a decoy.
    Token { res: String, secret: bool },
    /// Container of drawable token resources.
    Spawner { tokens: Vec<String> },
}

/// An object that has not been given an id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireObject", into = "WireObject")]
pub struct ObjectDraft {
    pub left: f64,
    pub top: f64,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireObject", into = "WireObject")]
pub struct GameObject {
    pub id: ObjId,
    pub left: f64,
    pub top: f64,
    pub kind: ObjectKind,
}

impl ObjectDraft {
    #[must_use]
    pub fn unit(res: impl Into<String>, left: f64, top: f64) -> Self {
        Self { left, top, kind: ObjectKind::Unit { res: res.into(), flipped: false, angle: 0, spawner_id: None } }
    }

    #[must_use]
    pub fn token(res: impl Into<String>, left: f64, top: f64) -> Self {
        Self { left, top, kind: ObjectKind::Token { res: res.into(), secret: false } }
    }

    #[must_use]
    pub fn spawner(tokens: Vec<String>, left: f64, top: f64) -> Self {
        Self { left, top, kind: ObjectKind::Spawner { tokens } }
    }

    #[must_use]
    pub fn with_id(self, id: ObjId) -> GameObject {
        GameObject { id, left: self.left, top: self.top, kind: self.kind }
    }
}

impl GameObject {
    /// Resource path as advertised to clients.
    #[must_use]
    pub fn res(&self) -> Option<&str> {
        match &self.kind {
            ObjectKind::Unit { res, .. } | ObjectKind::Token { res, .. } => Some(res),
            ObjectKind::Spawner { .. } => None,
        }
    }

    #[must_use]
    pub fn spawner_id(&self) -> Option<ObjId> {
        match &self.kind {
            ObjectKind::Unit { spawner_id, .. } => *spawner_id,
            _ => None,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self.kind, ObjectKind::Unit { .. })
    }

    /// Apply a property patch, returning a patch that restores the old values.
    pub fn apply_patch(&mut self, patch: &ObjectPatch) -> ObjectPatch {
        let mut previous = ObjectPatch { id: self.id, ..ObjectPatch::default() };
        if let Some(left) = patch.left {
            previous.left = Some(self.left);
            self.left = left;
        }
        if let Some(top) = patch.top {
            previous.top = Some(self.top);
            self.top = top;
        }
        if let ObjectKind::Unit { flipped, angle, .. } = &mut self.kind {
            if let Some(value) = patch.flipped {
                previous.flipped = Some(*flipped);
                *flipped = value;
            }
            if let Some(value) = patch.angle {
                previous.angle = Some(*angle);
                *angle = value;
            }
        }
        previous
    }
}

/// Partial update of one object (`updateContent` / `move` entries).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub id: ObjId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<i64>,
}

// =============================================================================
// WIRE FORMAT
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<ObjId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind_code: Option<u8>,
    #[serde(default)]
    left: f64,
    #[serde(default)]
    top: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    res: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flipped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    angle: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spawner_id: Option<ObjId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tokens: Option<Vec<String>>,
}

impl TryFrom<WireObject> for ObjectDraft {
    type Error = String;

    fn try_from(wire: WireObject) -> Result<Self, Self::Error> {
        let kind = if let Some(flipped) = wire.flipped {
            ObjectKind::Unit {
                res: wire.res.ok_or("unit without res")?,
                flipped,
                angle: wire.angle.unwrap_or(0),
                spawner_id: wire.spawner_id,
            }
        } else if let Some(tokens) = wire.tokens {
            ObjectKind::Spawner { tokens }
        } else if let Some(res) = wire.res {
            ObjectKind::Token { res, secret: wire.secret.unwrap_or(false) }
        } else {
            return Err("object has neither flipped, tokens nor res".into());
        };
        Ok(Self { left: wire.left, top: wire.top, kind })
    }
}

impl TryFrom<WireObject> for GameObject {
    type Error = String;

    fn try_from(wire: WireObject) -> Result<Self, Self::Error> {
        let id = wire.id.ok_or("object without id")?;
        ObjectDraft::try_from(wire).map(|draft| draft.with_id(id))
    }
}

fn to_wire(id: Option<ObjId>, left: f64, top: f64, kind: ObjectKind) -> WireObject {
    let mut wire = WireObject { id, left, top, ..WireObject::default() };
    match kind {
        ObjectKind::Unit { res, flipped, angle, spawner_id } => {
            wire.kind_code = Some(TYPE_UNIT);
            wire.res = Some(res);
            wire.flipped = Some(flipped);
            wire.angle = Some(angle);
            wire.spawner_id = spawner_id;
        }
        ObjectKind::Token { res, secret } => {
            wire.kind_code = Some(TYPE_TOKEN);
            wire.res = Some(res);
            wire.secret = secret.then_some(true);
        }
        ObjectKind::Spawner { tokens } => {
            wire.kind_code = Some(TYPE_SPAWNER);
            wire.tokens = Some(tokens);
        }
    }
    wire
}

impl From<GameObject> for WireObject {
    fn from(obj: GameObject) -> Self {
        to_wire(Some(obj.id), obj.left, obj.top, obj.kind)
    }
}

impl From<ObjectDraft> for WireObject {
    fn from(draft: ObjectDraft) -> Self {
        to_wire(None, draft.left, draft.top, draft.kind)
    }
}

// =============================================================================
// ARENA
// =============================================================================

/// Id-indexed object storage with tombstones.
#[derive(Debug, Default, Clone)]
pub struct Arena {
    slots: Vec<Option<GameObject>>,
}

impl Arena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next inserted object will receive.
    #[must_use]
    pub fn next_id(&self) -> ObjId {
        self.slots.len() as ObjId
    }

    /// Place a new object under a fresh id.
    pub fn insert(&mut self, draft: ObjectDraft) -> ObjId {
        let id = self.next_id();
        self.slots.push(Some(draft.with_id(id)));
        id
    }

    /// Put an object back into its own slot, growing the arena if needed.
    pub fn restore(&mut self, obj: GameObject) {
        let Ok(index) = usize::try_from(obj.id) else {
            return;
        };
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(obj);
    }

    pub fn remove(&mut self, id: ObjId) -> Option<GameObject> {
        let index = usize::try_from(id).ok()?;
        self.slots.get_mut(index).and_then(Option::take)
    }

    #[must_use]
    pub fn get(&self, id: ObjId) -> Option<&GameObject> {
        let index = usize::try_from(id).ok()?;
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut GameObject> {
        let index = usize::try_from(id).ok()?;
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Live objects in id order.
    pub fn live(&self) -> impl Iterator<Item = &GameObject> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Tombstone every slot and return what was live.
    pub fn clear(&mut self) -> Vec<GameObject> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<GameObject> {
        self.live().cloned().collect()
    }
}

#[cfg(test)]
#[path = "content_test.rs"]
mod tests;
