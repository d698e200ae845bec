//! Table service: the authoritative state machine of one table.
//!
//! DESIGN
//! ======
//! A table owns its content arena, the secret resources of face-down tokens,
//! its members and their roles, the undo/redo stacks and its journal. It is
//! shared as `Arc<tokio::sync::Mutex<Table>>` and every method here is
//! synchronous, so a handler body runs atomically with respect to the table;
//! anything that needs the network (authorization, army lookup) happens
//! before the lock is taken.
//!
//! HISTORY
//! =======
//! Each handler applies its action, broadcasts the delta, and records the
//! reverse action through `add_history`. What happens there depends
//! on why the action ran ([`HistoryContext`]):
//!
//! - `Do`: reverse goes on the history stack, the forward action is appended
//!   to the journal, and the redo stack is cleared.
//! - `Undo`: reverse goes on the redo stack; the journal gets a pointer to
//!   the new top of history.
//! - `Redo`: reverse goes back on history; the journal gets a pointer to the
//!   redone record.
//! - `Load`: reverse goes on history; nothing is written.
//!
//! Recoverable failures ([`ActionError`]) are detected before anything is
//! mutated and are reported to the requester only.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{ActionLimits, QUALITY_LEVELS};
use crate::protocol::{Audience, Hint, Outbox, Role, StatusEntry, TableRequest, UserId, encode};
use crate::services::action::{Action, ActionError, DrawRequest, HistoryContext};
use crate::services::agent::TableMeta;
use crate::services::army::{self, ArmyRequest};
use crate::services::content::{Arena, GameObject, ObjId, ObjectDraft, ObjectKind, ObjectPatch};
use crate::services::journal::{Journal, JournalError, Pointer, Replay};
use crate::services::quality::local_quality;

const ROTATION_STEP: i64 = 60;

// =============================================================================
// TYPES
// =============================================================================

/// Process-wide collaborators every table needs.
#[derive(Clone, Default)]
pub struct TableEnv {
    pub limits: ActionLimits,
    /// Table-list subscribers, told about players joining and leaving.
    pub feed: Audience,
}

/// A connection asking to join.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user_id: UserId,
    pub user_name: String,
    pub outbox: Outbox,
}

struct Member {
    user_name: String,
    role: Role,
    active: bool,
    /// Objects the member is currently dragging.
    grab: Option<Vec<ObjId>>,
    outbox: Outbox,
}

/// Reverse action plus the journal place of the action it undoes.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub place: Pointer,
    pub action: Action,
}

pub struct Table {
    id: String,
    name: String,
    def_players_num: u32,
    board: String,
    arena: Arena,
    secrets: HashMap<ObjId, String>,
    history: Vec<HistoryEntry>,
    future: Vec<HistoryEntry>,
    /// Place of the record naming the board; the chain base while history is empty.
    genesis: Option<Pointer>,
    members: BTreeMap<UserId, Member>,
    global_quality: usize,
    local_quality: usize,
    journal: Journal,
    env: TableEnv,
    /// When the last member left; `None` while occupied.
    empty_since: Option<Instant>,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl Table {
    #[must_use]
    pub fn new(id: &str, meta: TableMeta, journal: Journal, env: TableEnv, global_quality: usize) -> Self {
        Self {
            id: id.to_owned(),
            name: meta.name,
            def_players_num: meta.def_num_of_players,
            board: meta.board,
            arena: Arena::new(),
            secrets: HashMap::new(),
            history: Vec::new(),
            future: Vec::new(),
            genesis: None,
            members: BTreeMap::new(),
            global_quality,
            local_quality: local_quality(global_quality, 0),
            journal,
            env,
            empty_since: Some(Instant::now()),
        }
    }

    /// Open the journal `dir/id` and rebuild the table from it.
    ///
    /// # Errors
    ///
    /// Returns the journal error if the chain cannot be loaded.
    pub fn open(
        dir: &Path,
        id: &str,
        meta: TableMeta,
        env: TableEnv,
        global_quality: usize,
        flush_debounce: Duration,
    ) -> Result<Self, JournalError> {
        let (journal, replay) = Journal::open(dir, id, flush_debounce)?;
        let mut table = Self::new(id, meta, journal, env, global_quality);
        table.replay(replay);
        Ok(table)
    }

    fn replay(&mut self, replay: Replay) {
        let count = replay.entries.len();
        for (place, raw) in replay.entries {
            for action in raw.into_actions() {
                if let Err(e) = self.execute(action, &HistoryContext::Load(place.clone())) {
                    warn!(table_id = %self.id, line = place.line, error = %e, "skipping journal record");
                }
            }
        }
        if !replay.clean {
            // Point the journal at the last good record so the damaged tail is skipped next time.
            let top = self.chain_top();
            self.journal.dump(&top, true, None);
        }
        info!(table_id = %self.id, records = count, objects = self.arena.live_count(), clean = replay.clean, "table loaded");
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn board(&self) -> &str {
        &self.board
    }

    #[must_use]
    pub fn content(&self) -> Vec<GameObject> {
        self.arena.snapshot()
    }

    #[must_use]
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    #[must_use]
    pub fn future(&self) -> &[HistoryEntry] {
        &self.future
    }

    #[cfg(test)]
    #[must_use]
    pub fn secret_of(&self, id: ObjId) -> Option<&str> {
        self.secrets.get(&id).map(String::as_str)
    }

    #[must_use]
    pub fn local_quality(&self) -> usize {
        self.local_quality
    }

    #[must_use]
    pub fn role_of(&self, user_id: UserId) -> Option<Role> {
        self.members.get(&user_id).map(|m| m.role)
    }

    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn players(&self) -> usize {
        self.members.values().filter(|m| m.role.can_play()).count()
    }

    /// Entry of the table list feed.
    #[must_use]
    pub fn info(&self) -> Value {
        let players: Vec<Value> = self
            .members
            .iter()
            .filter(|(_, m)| m.role.can_play())
            .map(|(id, m)| json!({ "id": id, "name": m.user_name }))
            .collect();
        json!({
            "id": self.id,
            "name": self.name,
            "defPlayersNum": self.def_players_num,
            "players": players,
        })
    }

    /// Whether the table has been empty for at least `delay`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, delay: Duration) -> bool {
        self.empty_since.is_some_and(|since| now.duration_since(since) >= delay)
    }

    pub fn flush_if_due(&mut self, now: Instant) {
        self.journal.flush_if_due(now);
    }

    /// Tell members the table is going away and close the journal. The
    /// returned future resolves once the journal file is complete.
    pub fn close(&mut self) -> impl Future<Output = ()> + Send + 'static {
        self.send_all(&json!({ "close": true }));
        self.journal.close()
    }

    /// Resolves once every flushed journal record is on disk.
    #[cfg(test)]
    pub fn journal_synced(&self) -> impl Future<Output = ()> + Send + 'static {
        self.journal.synced()
    }

    pub fn set_global_quality(&mut self, global: usize) {
        self.global_quality = global;
        self.adjust_local_quality();
    }

    fn adjust_local_quality(&mut self) {
        let level = local_quality(self.global_quality, self.members.len());
        if level != self.local_quality {
            self.local_quality = level;
            debug!(table_id = %self.id, level, "table quality changed");
            self.send_all(&json!({ "qualityInfo": QUALITY_LEVELS[level] }));
        }
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

impl Table {
    fn send_where(&self, message: &Value, filter: impl Fn(UserId, &Member) -> bool) {
        let encoded = encode(message);
        for (user_id, member) in &self.members {
            if !filter(*user_id, member) {
                continue;
            }
            // Best-effort: a full outbox drops the message for that member only.
            if member.outbox.try_send(encoded.clone()).is_err() {
                debug!(table_id = %self.id, %user_id, "member outbox full or closed");
            }
        }
    }

    fn send_all(&self, message: &Value) {
        self.send_where(message, |_, _| true);
    }

    fn send_others(&self, except: UserId, message: &Value, only_active: bool) {
        self.send_where(message, |id, m| id != except && (!only_active || m.active));
    }

    fn send_to(&self, user_id: UserId, message: &Value) {
        self.send_where(message, |id, _| id == user_id);
    }

    fn warn(&self, content: &str) {
        self.send_all(&json!({ "warn": { "content": content } }));
    }
}

// =============================================================================
// MEMBERS
// =============================================================================

fn user_json(user_id: UserId, member: &Member) -> Value {
    json!({
        "userId": user_id,
        "userName": member.user_name,
        "role": member.role,
        "active": member.active,
    })
}

impl Table {
    /// Register an authorized session and send it the full table state.
    pub fn add_user(&mut self, session: SessionInfo, role: Role) {
        let member = Member { user_name: session.user_name, role, active: true, grab: None, outbox: session.outbox };
        let user_id = session.user_id;
        self.send_all(&json!({ "addUsers": [user_json(user_id, &member)] }));
        if role.can_play() {
            self.publish_player_added(user_id, &member.user_name);
        }
        self.members.insert(user_id, member);

        let users: Vec<Value> = self.members.iter().map(|(id, m)| user_json(*id, m)).collect();
        self.send_to(
            user_id,
            &json!({
                "yourId": user_id,
                "addContent": self.arena.snapshot(),
                "addUsers": users,
                "qualityInfo": QUALITY_LEVELS[self.local_quality],
                "tableInfo": { "board": self.board },
            }),
        );
        self.adjust_local_quality();
        self.empty_since = None;
        info!(table_id = %self.id, %user_id, ?role, members = self.members.len(), "user joined table");
    }

    pub fn remove_user(&mut self, user_id: UserId) {
        let Some(member) = self.members.remove(&user_id) else {
            return;
        };
        if member.role.can_play() {
            self.publish_player_removed(user_id);
        }
        self.send_all(&json!({ "delUsers": [user_json(user_id, &member)] }));
        self.adjust_local_quality();
        if self.members.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        info!(table_id = %self.id, %user_id, members = self.members.len(), "user left table");
    }

    fn publish_player_added(&self, user_id: UserId, user_name: &str) {
        self.env
            .feed
            .publish(&json!({ "addPlayer": { "tableId": self.id, "player": { "id": user_id, "name": user_name } } }));
    }

    fn publish_player_removed(&self, user_id: UserId) {
        self.env.feed.publish(&json!({ "removePlayer": { "tableId": self.id, "playerId": user_id } }));
    }

    fn set_role(&mut self, user_id: UserId, role: Role) {
        let Some(member) = self.members.get_mut(&user_id) else {
            return;
        };
        let was_player = member.role.can_play();
        member.role = role;
        let name = member.user_name.clone();
        match (was_player, role.can_play()) {
            (false, true) => self.publish_player_added(user_id, &name),
            (true, false) => self.publish_player_removed(user_id),
            _ => {}
        }
        self.send_all(&json!({ "updateUsers": [{ "userId": user_id, "role": role }] }));
    }

    fn promote(&mut self, user_id: UserId) {
        match self.role_of(user_id) {
            Some(Role::Player) => self.set_role(user_id, Role::Owner),
            Some(Role::Spectator) => self.set_role(user_id, Role::Player),
            Some(Role::Owner) | None => {}
        }
    }

    fn demote(&mut self, user_id: UserId) {
        match self.role_of(user_id) {
            Some(Role::Player | Role::Spectator) => self.set_role(user_id, Role::Spectator),
            Some(Role::Owner) | None => {}
        }
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

impl Table {
    /// Handle the table part of a member's message. Keys the member's role
    /// does not allow are ignored; an [`ActionError`] stops processing and is
    /// reported back as `warn`.
    pub fn handle_request(&mut self, user_id: UserId, request: TableRequest) {
        let Some(role) = self.role_of(user_id) else {
            return;
        };
        if let Err(e) = self.dispatch(user_id, role, request) {
            debug!(table_id = %self.id, %user_id, error = %e, "action rejected");
            self.send_to(user_id, &json!({ "warn": { "content": e.to_string() } }));
        }
    }

    fn dispatch(&mut self, user_id: UserId, role: Role, request: TableRequest) -> Result<(), ActionError> {
        let TableRequest { promote_user, demote_user, reveal_objs, hint, emote, undo, redo, update_status, text, action } =
            request;

        if role == Role::Owner {
            if let Some(target) = promote_user {
                self.promote(target);
            }
            if let Some(target) = demote_user {
                self.demote(target);
            }
        }

        if role.can_play() {
            for action in action.into_actions() {
                if !action.is_client_issuable() {
                    debug!(table_id = %self.id, %user_id, ?action, "ignoring internal action from client");
                    continue;
                }
                let action = match action {
                    Action::NextToken(request) => Action::NextToken(DrawRequest { user_id: Some(user_id), ..request }),
                    other => other,
                };
                self.execute(action, &HistoryContext::Do)?;
            }
            if let Some(ids) = reveal_objs {
                self.reveal(user_id, &ids);
            }
            if let Some(hint) = hint {
                self.hint(user_id, hint);
            }
            if let Some(emote) = emote {
                self.emote(emote);
            }
            if undo.is_some() {
                self.undo()?;
            }
            if redo.is_some() {
                self.redo()?;
            }
            if let Some(entries) = update_status {
                self.update_status(user_id, &entries);
            }
        }

        if let Some(text) = text {
            self.chat(user_id, text.content);
        }
        Ok(())
    }

    pub fn undo(&mut self) -> Result<(), ActionError> {
        let Some(entry) = self.history.pop() else {
            return Ok(());
        };
        let context = HistoryContext::Undo(entry.place.clone());
        if let Err(e) = self.execute(entry.action.clone(), &context) {
            self.history.push(entry);
            return Err(e);
        }
        Ok(())
    }

    pub fn redo(&mut self) -> Result<(), ActionError> {
        let Some(entry) = self.future.pop() else {
            return Ok(());
        };
        let context = HistoryContext::Redo(entry.place.clone());
        if let Err(e) = self.execute(entry.action.clone(), &context) {
            self.future.push(entry);
            return Err(e);
        }
        Ok(())
    }

    fn reveal(&self, user_id: UserId, ids: &[ObjId]) {
        let details: Vec<Value> = ids
            .iter()
            .filter_map(|id| self.secrets.get(id).map(|res| json!({ "id": id, "data": res })))
            .collect();
        if details.is_empty() {
            return;
        }
        self.send_to(user_id, &json!({ "revealObjsDetails": details }));
        let name = self.members.get(&user_id).map_or("", |m| m.user_name.as_str());
        self.warn(&format!("Warning: Player {name} has revealed secret(s)."));
        self.send_all(&json!({ "revealObjs": ids }));
    }

    fn hint(&mut self, user_id: UserId, hint: Hint) {
        if let Some(pos) = hint.mouse_pos {
            self.send_others(
                user_id,
                &json!({ "hint": { "mousePos": { "userId": user_id, "left": pos.left, "top": pos.top } } }),
                true,
            );
        }
        if let Some(objs) = hint.grab {
            self.send_others(user_id, &json!({ "hint": { "grab": { "userId": user_id, "objs": objs } } }), true);
            if let Some(member) = self.members.get_mut(&user_id) {
                member.grab = Some(objs);
            }
        }
        if hint.drop.is_some() {
            if let Some(member) = self.members.get_mut(&user_id) {
                member.grab = None;
            }
            self.send_others(user_id, &json!({ "hint": { "drop": { "userId": user_id } } }), true);
        }
    }

    fn emote(&self, mut emote: Value) {
        let images = emote.pointer("/type/image").and_then(Value::as_array).map_or(0, Vec::len);
        let randomness = if images > 0 { rand::rng().random_range(0..images) } else { 0 };
        if let Some(fields) = emote.as_object_mut() {
            fields.insert("randomness".to_owned(), json!(randomness));
        }
        self.send_all(&json!({ "emote": emote }));
    }

    fn update_status(&mut self, user_id: UserId, entries: &[StatusEntry]) {
        for entry in entries {
            let Some(member) = self.members.get_mut(&user_id) else {
                return;
            };
            if member.active != entry.active {
                member.active = entry.active;
                self.send_others(user_id, &json!({ "updateStatus": [{ "userId": user_id, "active": entry.active }] }), false);
            }
        }
    }

    fn chat(&self, user_id: UserId, content: String) {
        let Some(member) = self.members.get(&user_id) else {
            return;
        };
        self.send_all(&json!({ "text": { "autor": member.user_name, "content": content } }));
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

impl Table {
    /// Apply one action under the given history context.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] when the action would exceed a limit or is
    /// malformed; the table is left unmodified.
    pub fn execute(&mut self, action: Action, context: &HistoryContext) -> Result<(), ActionError> {
        match action {
            Action::Board(board) => {
                if let HistoryContext::Load(place) = context {
                    self.genesis = Some(place.clone());
                }
                self.board = board;
            }
            Action::ClearTable => self.clear_table(context),
            Action::SetTable(objs) => self.set_table(context, objs)?,
            Action::UpdateContent(patches) => self.update_content(context, patches, false),
            Action::Move(patches) => self.update_content(context, patches, true),
            Action::GetArmySpawner(request) => self.add_army(context, &request)?,
            Action::NextToken(request) => self.next_token(context, &request)?,
            Action::GetUtil(draft) => self.add_util(context, draft)?,
            Action::DelObjs(ids) => self.del_objs(context, &ids),
            Action::ReturnObjs(ids) => self.return_objs(context, &ids),
            Action::FlipObjs(ids) => self.flip_objs(context, ids),
            Action::RotateLeftObjs(ids) => self.rotate_objs(context, ids, -ROTATION_STEP),
            Action::RotateRightObjs(ids) => self.rotate_objs(context, ids, ROTATION_STEP),
            Action::AddObjs { objs, secrets } => self.add_objs(context, objs, secrets)?,
            Action::PopulateSpawner { spawner_id, objs } => self.populate_spawner(context, spawner_id, &objs),
            Action::DepopulateSpawner { spawner_id, objs } => self.depopulate_spawner(context, spawner_id, objs),
        }
        Ok(())
    }

    /// Place the current state follows from.
    fn chain_top(&self) -> Pointer {
        self.history
            .last()
            .map(|e| e.place.clone())
            .or_else(|| self.genesis.clone())
            .unwrap_or(Pointer::ORIGIN)
    }

    fn add_history(&mut self, context: &HistoryContext, forward: Action, reverse: Action, important: bool) {
        match context {
            HistoryContext::Do => {
                let prev = self.chain_top();
                let place = self.journal.current_place();
                self.history.push(HistoryEntry { place, action: reverse });
                self.journal.dump(&prev, important, Some(forward.into()));
                self.future.clear();
            }
            HistoryContext::Undo(place) => {
                self.future.push(HistoryEntry { place: place.clone(), action: reverse });
                let top = self.chain_top();
                self.journal.dump(&top, important, None);
            }
            HistoryContext::Redo(place) => {
                self.history.push(HistoryEntry { place: place.clone(), action: reverse });
                self.journal.dump(place, important, None);
            }
            HistoryContext::Load(place) => {
                self.history.push(HistoryEntry { place: place.clone(), action: reverse });
            }
        }
    }

    /// Object ceiling, enforced for new actions only so undo, redo and replay
    /// can always restore an earlier state.
    fn ensure_capacity(&self, context: &HistoryContext, adding: usize) -> Result<(), ActionError> {
        if matches!(context, HistoryContext::Do) && self.arena.live_count() + adding > self.env.limits.table_objects {
            return Err(ActionError::TooManyObjects);
        }
        Ok(())
    }

    fn clear_table(&mut self, context: &HistoryContext) {
        if self.arena.is_empty() {
            return;
        }
        let objs = self.arena.clear();
        let mut secrets: Vec<(ObjId, String)> = self.secrets.drain().collect();
        secrets.sort_unstable_by_key(|(id, _)| *id);
        self.send_all(&json!({ "clearTable": "" }));
        self.add_history(context, Action::ClearTable, Action::AddObjs { objs, secrets }, false);
    }

    /// Replace the whole table: clear, then add `objs` under fresh ids.
    fn set_table(&mut self, context: &HistoryContext, objs: Vec<GameObject>) -> Result<(), ActionError> {
        if matches!(context, HistoryContext::Do) && objs.len() > self.env.limits.table_objects {
            return Err(ActionError::TooManyObjects);
        }
        self.clear_table(context);

        let base = self.arena.next_id();
        let remap: HashMap<ObjId, ObjId> = objs.iter().zip(base..).map(|(obj, id)| (obj.id, id)).collect();
        let objs = objs
            .into_iter()
            .zip(base..)
            .map(|(mut obj, id)| {
                obj.id = id;
                if let ObjectKind::Unit { spawner_id, .. } = &mut obj.kind {
                    *spawner_id = spawner_id.and_then(|old| remap.get(&old).copied());
                }
                obj
            })
            .collect();
        self.add_objs(context, objs, Vec::new())
    }

    fn add_objs(
        &mut self,
        context: &HistoryContext,
        objs: Vec<GameObject>,
        secrets: Vec<(ObjId, String)>,
    ) -> Result<(), ActionError> {
        let adding = objs.iter().filter(|o| self.arena.get(o.id).is_none()).count();
        self.ensure_capacity(context, adding)?;

        for obj in &objs {
            self.arena.restore(obj.clone());
        }
        for (id, res) in &secrets {
            self.secrets.insert(*id, res.clone());
        }
        self.send_all(&json!({ "addContent": objs }));
        let ids = objs.iter().map(|o| o.id).collect();
        let important = !secrets.is_empty();
        self.add_history(context, Action::AddObjs { objs, secrets }, Action::DelObjs(ids), important);
        Ok(())
    }

    fn add_util(&mut self, context: &HistoryContext, draft: ObjectDraft) -> Result<(), ActionError> {
        self.ensure_capacity(context, 1)?;
        let id = self.arena.insert(draft);
        let objs: Vec<GameObject> = self.arena.get(id).cloned().into_iter().collect();
        self.send_all(&json!({ "addContent": objs }));
        self.add_history(context, Action::AddObjs { objs, secrets: Vec::new() }, Action::DelObjs(vec![id]), false);
        Ok(())
    }

    fn add_army(&mut self, context: &HistoryContext, request: &ArmyRequest) -> Result<(), ActionError> {
        let info = request.data.as_ref().ok_or_else(|| ActionError::ArmyUnavailable(request.name.clone()))?;
        let placements = army::expand(request, info, &self.env.limits, &mut rand::rng())?;
        self.ensure_capacity(context, placements.len())?;

        let mut objs = Vec::with_capacity(placements.len());
        let mut secrets = Vec::new();
        for placement in placements {
            let id = self.arena.insert(placement.draft);
            if let Some(res) = placement.secret {
                self.secrets.insert(id, res.clone());
                secrets.push((id, res));
            }
            objs.extend(self.arena.get(id).cloned());
        }
        self.send_all(&json!({ "addContent": objs }));
        let ids = objs.iter().map(|o| o.id).collect();
        let important = !secrets.is_empty();
        self.add_history(context, Action::AddObjs { objs, secrets }, Action::DelObjs(ids), important);
        Ok(())
    }

    /// Draw a token out of a spawner as a new unit.
    fn next_token(&mut self, context: &HistoryContext, request: &DrawRequest) -> Result<(), ActionError> {
        let Some(ObjectKind::Spawner { tokens }) = self.arena.get(request.spawner_id).map(|o| &o.kind) else {
            return Ok(());
        };
        if tokens.is_empty() {
            return Ok(());
        }
        let index = match &request.res {
            Some(res) => match tokens.iter().position(|t| t == res) {
                Some(index) => index,
                None => return Ok(()),
            },
            None => rand::rng().random_range(0..tokens.len()),
        };
        self.ensure_capacity(context, 1)?;

        let Some(ObjectKind::Spawner { tokens }) = self.arena.get_mut(request.spawner_id).map(|o| &mut o.kind) else {
            return Ok(());
        };
        let res = tokens.remove(index);
        let mut draft = ObjectDraft::unit(res, request.left, request.top);
        if let ObjectKind::Unit { spawner_id, .. } = &mut draft.kind {
            *spawner_id = Some(request.spawner_id);
        }
        let new_id = self.arena.insert(draft);
        let units: Vec<GameObject> = self.arena.get(new_id).cloned().into_iter().collect();

        self.send_all(&json!({
            "nextToken": {
                "spawnerId": request.spawner_id,
                "tokenId": index,
                "left": request.left,
                "top": request.top,
                "newId": new_id,
                "userId": request.user_id,
            }
        }));
        self.add_history(
            context,
            Action::DepopulateSpawner { spawner_id: request.spawner_id, objs: units },
            Action::PopulateSpawner { spawner_id: request.spawner_id, objs: vec![new_id] },
            true,
        );
        if request.res.is_some() {
            self.warn("Warning: Player has selected token from a spawner.");
        }
        Ok(())
    }

    /// Put units back into a spawner.
    fn populate_spawner(&mut self, context: &HistoryContext, spawner_id: ObjId, ids: &[ObjId]) {
        match context {
            HistoryContext::Redo(_) => self.warn("Warning: Player has redone returning token to a spawner."),
            HistoryContext::Undo(_) => self.warn("Warning: Player has undone drawing random token from a spawner."),
            HistoryContext::Do | HistoryContext::Load(_) => {}
        }
        if !matches!(self.arena.get(spawner_id).map(|o| &o.kind), Some(ObjectKind::Spawner { .. })) {
            return;
        }

        let mut returned = Vec::new();
        for &id in ids {
            if id == spawner_id || self.arena.get(id).and_then(GameObject::res).is_none() {
                continue;
            }
            if let Some(obj) = self.arena.remove(id) {
                returned.push(obj);
            }
        }
        if let Some(ObjectKind::Spawner { tokens }) = self.arena.get_mut(spawner_id).map(|o| &mut o.kind) {
            tokens.extend(returned.iter().filter_map(|o| o.res().map(str::to_owned)));
        }

        let ids: Vec<ObjId> = returned.iter().map(|o| o.id).collect();
        self.send_all(&json!({ "populateSpawner": { "spawnerId": spawner_id, "objs": ids } }));
        self.add_history(
            context,
            Action::PopulateSpawner { spawner_id, objs: ids },
            Action::DepopulateSpawner { spawner_id, objs: returned },
            false,
        );
    }

    /// Take specific units out of a spawner.
    fn depopulate_spawner(&mut self, context: &HistoryContext, spawner_id: ObjId, objs: Vec<GameObject>) {
        match context {
            HistoryContext::Redo(_) => self.warn(
                "Warning: Player has redone drawing token from spawner. Obtained token isn't selected at random. Instead token from the previous draw is obtained.",
            ),
            HistoryContext::Undo(_) => self.warn("Warning: Player has undone returning token to a spawner."),
            HistoryContext::Do | HistoryContext::Load(_) => {}
        }
        let Some(ObjectKind::Spawner { tokens }) = self.arena.get_mut(spawner_id).map(|o| &mut o.kind) else {
            return;
        };

        let mut taken = Vec::new();
        for obj in objs {
            let Some(index) = obj.res().and_then(|res| tokens.iter().position(|t| t == res)) else {
                continue;
            };
            tokens.remove(index);
            taken.push(obj);
        }
        for obj in &taken {
            self.arena.restore(obj.clone());
        }

        self.send_all(&json!({ "depopulateSpawner": { "spawnerId": spawner_id, "objs": taken } }));
        let ids = taken.iter().map(|o| o.id).collect();
        self.add_history(
            context,
            Action::DepopulateSpawner { spawner_id, objs: taken },
            Action::PopulateSpawner { spawner_id, objs: ids },
            false,
        );
    }

    fn return_objs(&mut self, context: &HistoryContext, ids: &[ObjId]) {
        for &id in ids {
            if let Some(spawner_id) = self.arena.get(id).and_then(GameObject::spawner_id) {
                self.populate_spawner(context, spawner_id, &[id]);
            }
        }
        self.warn("Warning: Player has returned token(s) to spawner.");
    }

    fn update_content(&mut self, context: &HistoryContext, patches: Vec<ObjectPatch>, is_move: bool) {
        let mut applied = Vec::with_capacity(patches.len());
        let mut inverse = Vec::with_capacity(patches.len());
        for patch in patches {
            if let Some(obj) = self.arena.get_mut(patch.id) {
                inverse.push(obj.apply_patch(&patch));
                applied.push(patch);
            }
        }
        // Later patches to the same object must be undone first.
        inverse.reverse();

        let key = if is_move { "move" } else { "updateContent" };
        self.send_all(&json!({ key: applied }));
        let forward = if is_move { Action::Move(applied) } else { Action::UpdateContent(applied) };
        self.add_history(context, forward, Action::UpdateContent(inverse), false);
    }

    fn del_objs(&mut self, context: &HistoryContext, ids: &[ObjId]) {
        let mut objs = Vec::new();
        let mut secrets = Vec::new();
        for &id in ids {
            if let Some(obj) = self.arena.remove(id) {
                if let Some(res) = self.secrets.remove(&id) {
                    secrets.push((id, res));
                }
                objs.push(obj);
            }
        }
        let removed: Vec<ObjId> = objs.iter().map(|o| o.id).collect();
        self.send_all(&json!({ "delObjs": removed }));
        self.add_history(context, Action::DelObjs(removed), Action::AddObjs { objs, secrets }, false);
    }

    fn flip_objs(&mut self, context: &HistoryContext, ids: Vec<ObjId>) {
        let mut changes = Vec::new();
        for &id in &ids {
            if let Some(ObjectKind::Unit { flipped, .. }) = self.arena.get_mut(id).map(|o| &mut o.kind) {
                *flipped = !*flipped;
                changes.push(json!({ "id": id, "flipped": *flipped }));
            }
        }
        self.send_all(&json!({ "updateContent": changes }));
        self.add_history(context, Action::FlipObjs(ids.clone()), Action::FlipObjs(ids), false);
    }

    fn rotate_objs(&mut self, context: &HistoryContext, ids: Vec<ObjId>, delta: i64) {
        let mut changes = Vec::new();
        for &id in &ids {
            if let Some(ObjectKind::Unit { angle, .. }) = self.arena.get_mut(id).map(|o| &mut o.kind) {
                *angle = angle.wrapping_add(delta);
                changes.push(json!({ "id": id, "angle": *angle }));
            }
        }
        self.send_all(&json!({ "updateContent": changes }));
        let (forward, reverse) = if delta < 0 {
            (Action::RotateLeftObjs(ids.clone()), Action::RotateRightObjs(ids))
        } else {
            (Action::RotateRightObjs(ids.clone()), Action::RotateLeftObjs(ids))
        };
        self.add_history(context, forward, reverse, false);
    }
}

#[cfg(test)]
#[path = "table_test.rs"]
mod tests;
