pub mod registry;
pub mod session;

use shared::{
    domain::{
        Comment, CommentId, Direction, Instance, InstanceId, ListName, Reaction, Statement,
        StatementId,
    },
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use storage::Storage;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use registry::Registry;
use session::SessionTable;

pub use session::{ConnectionHandle, ConnectionId, SessionRecord};

/// The live-instance state manager. Owns the volatile registry and the
/// session table behind one lock: each inbound action is handled to
/// completion (mutation, write-through dispatch, broadcast) before the next
/// one on the same engine is admitted.
pub struct Engine {
    storage: Storage,
    live: Mutex<LiveState>,
}

#[derive(Default)]
struct LiveState {
    registry: Registry,
    sessions: SessionTable,
}

/// What a mutation handler decided; delivery happens afterwards, outside the
/// instance borrow.
enum Outcome {
    /// State changed: write through and push the snapshot to every user.
    Broadcast,
    /// The caller acted on stale state (index or id no longer matches); send
    /// it the current snapshot and change nothing.
    Resync,
    /// Rejected with a user-facing reason; no state change.
    Reject(ApiError),
    /// Malformed payload content; drop it without a reply.
    Ignore,
}

impl Engine {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            live: Mutex::new(LiveState::default()),
        }
    }

    /// Handle one inbound action to completion.
    pub async fn dispatch(
        &self,
        session: &mut SessionRecord,
        handle: &ConnectionHandle,
        request: ClientRequest,
    ) {
        match request {
            ClientRequest::Create {
                title,
                votes_allowed,
                negative_votes_allowed,
                owner,
                emoji_allowed,
            } => {
                self.create(
                    session,
                    handle,
                    title,
                    votes_allowed,
                    negative_votes_allowed,
                    owner,
                    emoji_allowed,
                )
                .await
            }
            ClientRequest::Join { instance_id, name } => {
                self.join(session, handle, instance_id, name).await
            }
            ClientRequest::Ping { payload } => debug!(?payload, "ping"),
            other => self.apply(session, handle, other).await,
        }
    }

    async fn create(
        &self,
        session: &mut SessionRecord,
        handle: &ConnectionHandle,
        title: String,
        votes_allowed: i64,
        negative_votes_allowed: bool,
        owner: String,
        emoji_allowed: bool,
    ) {
        let Ok(votes_allowed) = u32::try_from(votes_allowed) else {
            handle.send(ServerEvent::Rejected(ApiError::new(
                ErrorCode::Validation,
                "votes allowed must not be negative",
            )));
            return;
        };
        if title.is_empty() || title.contains(char::is_whitespace) {
            handle.send(ServerEvent::Rejected(ApiError::new(
                ErrorCode::Validation,
                "the title must be non-empty and contain no whitespace",
            )));
            return;
        }

        let mut guard = self.live.lock().await;
        let state = &mut *guard;

        let instance_id = InstanceId(title);
        if state.registry.contains(&instance_id) {
            handle.send(ServerEvent::Rejected(ApiError::new(
                ErrorCode::Conflict,
                "that instance has already been created",
            )));
            return;
        }

        let instance = Instance::new(
            instance_id,
            owner.clone(),
            votes_allowed,
            negative_votes_allowed,
            emoji_allowed,
        );
        match self.storage.create_instance(&instance).await {
            Ok(true) => {
                session.bound_name = Some(owner.clone());
                session.bound_instance_id = Some(instance.id.clone());
                state.sessions.bind(owner.clone(), handle.clone());
                state.registry.insert(instance.clone());
                handle.send(ServerEvent::CreatedInstance {
                    instance,
                    name: owner,
                });
            }
            Ok(false) => handle.send(ServerEvent::Rejected(ApiError::new(
                ErrorCode::Conflict,
                "that instance has already been created",
            ))),
            Err(error) => {
                warn!(instance = %instance.id, %error, "failed to create instance");
                handle.send(ServerEvent::Rejected(ApiError::new(
                    ErrorCode::Internal,
                    "something went wrong creating that instance",
                )));
            }
        }
    }

    async fn join(
        &self,
        session: &mut SessionRecord,
        handle: &ConnectionHandle,
        instance_id: InstanceId,
        name: String,
    ) {
        let mut guard = self.live.lock().await;
        let state = &mut *guard;

        if !state.registry.contains(&instance_id) {
            match self.storage.load_instance(&instance_id).await {
                Ok(Some(mut loaded)) => {
                    // the persisted presence list reflects a previous session
                    loaded.users.clear();
                    state.registry.insert(loaded);
                }
                Ok(None) => {
                    handle.send(ServerEvent::Rejected(ApiError::new(
                        ErrorCode::NotFound,
                        "that instance does not exist",
                    )));
                    return;
                }
                Err(error) => {
                    warn!(instance = %instance_id, %error, "failed to load instance");
                    handle.send(ServerEvent::Rejected(ApiError::new(
                        ErrorCode::Internal,
                        "something went wrong loading that instance",
                    )));
                    return;
                }
            }
        }

        let Some(instance) = state.registry.resolve_live(&instance_id) else {
            handle.send(ServerEvent::ResetSession);
            return;
        };

        if !instance.users.iter().any(|user| user == &name) {
            instance.users.push(name.clone());
        }
        // an existing entry is a valid "no votes left" state and stays put;
        // only a participant with no entry at all gets the full budget
        if !instance.votes.contains_key(&name) {
            instance.votes.insert(name.clone(), instance.votes_allowed);
        }
        let snapshot = instance.clone();

        session.bound_name = Some(name.clone());
        session.bound_instance_id = Some(instance_id);
        state.sessions.bind(name.clone(), handle.clone());

        handle.send(ServerEvent::NameConfirmed { name });
        self.persist(&snapshot);
        broadcast(&state.sessions, &snapshot);
    }

    /// All in-board mutations share the `is_active` precondition and the
    /// persist-then-broadcast epilogue.
    async fn apply(
        &self,
        session: &SessionRecord,
        handle: &ConnectionHandle,
        request: ClientRequest,
    ) {
        let mut guard = self.live.lock().await;
        let state = &mut *guard;

        let Some((name, instance_id)) = active_identity(&state.sessions, session, handle) else {
            handle.send(ServerEvent::ResetSession);
            return;
        };
        let Some(instance) = state.registry.resolve_live(&instance_id) else {
            handle.send(ServerEvent::ResetSession);
            return;
        };

        match mutate(instance, &name, request) {
            Outcome::Broadcast => {
                let snapshot = instance.clone();
                self.persist(&snapshot);
                broadcast(&state.sessions, &snapshot);
            }
            Outcome::Resync => handle.send(ServerEvent::InstanceSnapshot {
                instance: instance.clone(),
            }),
            Outcome::Reject(error) => handle.send(ServerEvent::Rejected(error)),
            Outcome::Ignore => {}
        }
    }

    /// Transport-level: the socket closed. Remove presence, unbind, tell the
    /// rest of the board. Locks and ledgers stay untouched.
    pub async fn disconnect(&self, session: &mut SessionRecord, handle: &ConnectionHandle) {
        let mut guard = self.live.lock().await;
        let state = &mut *guard;

        let Some(name) = session.bound_name.take() else {
            return;
        };
        let instance_id = session.bound_instance_id.take();

        // a displaced connection (same name, newer socket) must not unbind
        // its replacement
        match state.sessions.resolve(&name) {
            Some(bound) if bound.id() == handle.id() => state.sessions.unbind(&name),
            _ => return,
        }

        let Some(instance_id) = instance_id else {
            return;
        };
        let Some(instance) = state.registry.resolve_live(&instance_id) else {
            return;
        };
        if let Some(at) = instance.users.iter().position(|user| user == &name) {
            instance.users.remove(at);
        }
        let snapshot = instance.clone();
        self.persist(&snapshot);
        broadcast(&state.sessions, &snapshot);
    }

    /// Fire-and-forget write-through of the state as of now. Failures are
    /// logged and never surfaced to participants; the live copy stays
    /// authoritative regardless.
    fn persist(&self, instance: &Instance) {
        let storage = self.storage.clone();
        let snapshot = instance.clone();
        tokio::spawn(async move {
            if let Err(error) = storage.save_instance(&snapshot).await {
                warn!(instance = %snapshot.id, %error, "instance write-through failed");
            }
        });
    }
}

/// The `is_active` precondition: the session is bound, the binding for that
/// name still points at this connection (a reconnect displaces it), and the
/// instance is expected live. Registry presence is checked by the caller's
/// resolve.
fn active_identity(
    sessions: &SessionTable,
    session: &SessionRecord,
    handle: &ConnectionHandle,
) -> Option<(String, InstanceId)> {
    let name = session.bound_name.clone()?;
    let instance_id = session.bound_instance_id.clone()?;
    let bound = sessions.resolve(&name)?;
    if bound.id() != handle.id() {
        return None;
    }
    Some((name, instance_id))
}

/// Full-state push to every present participant; names with no bound
/// connection are skipped. No diffing: every mutation re-sends the whole
/// instance, so a client that missed an update converges on the next one.
fn broadcast(sessions: &SessionTable, instance: &Instance) {
    for user in &instance.users {
        if let Some(handle) = sessions.resolve(user) {
            handle.send(ServerEvent::InstanceSnapshot {
                instance: instance.clone(),
            });
        }
    }
}

fn mutate(instance: &mut Instance, name: &str, request: ClientRequest) -> Outcome {
    match request {
        ClientRequest::AddItem { list, text } => add_item(instance, name, list, text),
        ClientRequest::MoveItem {
            last_list,
            last_index,
            next_list,
            next_index,
            item_id,
        } => move_item(instance, last_list, last_index, next_list, next_index, &item_id),
        ClientRequest::Trash {
            last_list,
            last_index,
            next_index,
            item_id,
        } => trash_item(instance, last_list, last_index, next_index, &item_id),
        ClientRequest::HardDelete { index } => hard_delete(instance, index),
        ClientRequest::HardDeleteAll => hard_delete_all(instance),
        ClientRequest::Vote {
            direction,
            statement_id,
        } => vote(instance, name, direction, &statement_id),
        ClientRequest::UnVote {
            direction,
            statement_id,
        } => un_vote(instance, name, direction, &statement_id),
        ClientRequest::CommentVote {
            direction,
            statement_id,
            comment_id,
        } => comment_vote(instance, name, direction, &statement_id, &comment_id),
        ClientRequest::UnCommentVote {
            direction,
            statement_id,
            comment_id,
        } => un_comment_vote(instance, name, direction, &statement_id, &comment_id),
        ClientRequest::Comment { statement_id, text } => {
            add_comment(instance, name, &statement_id, text)
        }
        ClientRequest::EditComment {
            statement_id,
            comment_id,
            text,
        } => edit_comment(instance, &statement_id, &comment_id, text),
        ClientRequest::DeleteComment {
            statement_id,
            comment_id,
        } => delete_comment(instance, &statement_id, &comment_id),
        ClientRequest::Edit { statement_id, text } => edit_statement(instance, &statement_id, text),
        ClientRequest::React {
            statement_id,
            emoji,
        } => react(instance, name, &statement_id, &emoji),
        ClientRequest::CommentReact {
            statement_id,
            comment_id,
            emoji,
        } => comment_react(instance, name, &statement_id, &comment_id, &emoji),
        ClientRequest::ToggleLock => toggle_lock(instance, name),
        ClientRequest::ToggleTrashLock => toggle_trash_lock(instance, name),
        // routed before this point
        ClientRequest::Create { .. } | ClientRequest::Join { .. } | ClientRequest::Ping { .. } => {
            Outcome::Ignore
        }
    }
}

fn locked_rejection() -> Outcome {
    Outcome::Reject(ApiError::new(ErrorCode::Permission, "the board is locked"))
}

fn add_item(instance: &mut Instance, name: &str, list: ListName, text: String) -> Outcome {
    if instance.locked {
        return locked_rejection();
    }
    if list == ListName::Trash {
        return Outcome::Reject(ApiError::new(
            ErrorCode::Validation,
            "items cannot be added directly to the trash",
        ));
    }
    instance.list_mut(list).push(Statement::new(text, name));
    Outcome::Broadcast
}

/// Optimistic-concurrency guard shared by move and trash: the source slot
/// must still hold the item the caller last observed. On mismatch nothing is
/// spliced; the caller is re-synchronized instead.
fn source_slot_matches(
    instance: &Instance,
    list: ListName,
    index: usize,
    item_id: &StatementId,
) -> bool {
    matches!(instance.list(list).get(index), Some(statement) if statement.id == *item_id)
}

fn move_item(
    instance: &mut Instance,
    last_list: ListName,
    last_index: usize,
    next_list: ListName,
    next_index: usize,
    item_id: &StatementId,
) -> Outcome {
    if instance.locked {
        return locked_rejection();
    }
    if !source_slot_matches(instance, last_list, last_index, item_id) {
        return Outcome::Resync;
    }
    let item = instance.list_mut(last_list).remove(last_index);
    let target = instance.list_mut(next_list);
    let at = next_index.min(target.len());
    target.insert(at, item);
    Outcome::Broadcast
}

fn trash_item(
    instance: &mut Instance,
    last_list: ListName,
    last_index: usize,
    next_index: usize,
    item_id: &StatementId,
) -> Outcome {
    if instance.locked {
        return locked_rejection();
    }
    if !source_slot_matches(instance, last_list, last_index, item_id) {
        return Outcome::Resync;
    }
    let mut item = instance.list_mut(last_list).remove(last_index);
    if last_list == ListName::Trash {
        // a reorder within trash keeps the recorded origin
        let at = next_index.min(instance.trash.len());
        instance.trash.insert(at, item);
    } else {
        item.from = Some(last_list);
        instance.trash.insert(0, item);
    }
    Outcome::Broadcast
}

fn trash_gate(instance: &Instance) -> Option<Outcome> {
    if instance.trash_is_locked {
        return Some(Outcome::Reject(ApiError::new(
            ErrorCode::Permission,
            "the trash is locked",
        )));
    }
    if instance.locked {
        return Some(locked_rejection());
    }
    None
}

fn hard_delete(instance: &mut Instance, index: usize) -> Outcome {
    if let Some(outcome) = trash_gate(instance) {
        return outcome;
    }
    if index >= instance.trash.len() {
        return Outcome::Resync;
    }
    let statement = instance.trash.remove(index);
    for voter in statement.recorded_votes() {
        instance.credit_vote(&voter);
    }
    Outcome::Broadcast
}

fn hard_delete_all(instance: &mut Instance) -> Outcome {
    if let Some(outcome) = trash_gate(instance) {
        return outcome;
    }
    let discarded: Vec<Statement> = instance.trash.drain(..).collect();
    for statement in &discarded {
        for voter in statement.recorded_votes() {
            instance.credit_vote(&voter);
        }
    }
    Outcome::Broadcast
}

fn vote_gate(instance: &Instance, name: &str, direction: Direction) -> Option<Outcome> {
    if direction == Direction::Down && !instance.negative_votes_allowed {
        return Some(Outcome::Reject(ApiError::new(
            ErrorCode::Permission,
            "negative votes are not allowed on this board",
        )));
    }
    if instance.remaining_votes(name) == 0 {
        return Some(Outcome::Reject(ApiError::new(
            ErrorCode::Validation,
            "you are out of votes",
        )));
    }
    None
}

fn debit_vote(instance: &mut Instance, name: &str) {
    if let Some(balance) = instance.votes.get_mut(name) {
        *balance -= 1;
    }
}

fn vote(
    instance: &mut Instance,
    name: &str,
    direction: Direction,
    statement_id: &StatementId,
) -> Outcome {
    if let Some(outcome) = vote_gate(instance, name, direction) {
        return outcome;
    }
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    // a name sits on at most one side of a statement; a repeat means the
    // caller is behind
    if statement.ups.iter().any(|voter| voter == name)
        || statement.downs.iter().any(|voter| voter == name)
    {
        return Outcome::Resync;
    }
    statement.side_mut(direction).push(name.to_string());
    debit_vote(instance, name);
    Outcome::Broadcast
}

fn un_vote(
    instance: &mut Instance,
    name: &str,
    direction: Direction,
    statement_id: &StatementId,
) -> Outcome {
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    let side = statement.side_mut(direction);
    let Some(at) = side.iter().position(|voter| voter == name) else {
        return Outcome::Resync;
    };
    side.remove(at);
    instance.credit_vote(name);
    Outcome::Broadcast
}

fn comment_vote(
    instance: &mut Instance,
    name: &str,
    direction: Direction,
    statement_id: &StatementId,
    comment_id: &CommentId,
) -> Outcome {
    if let Some(outcome) = vote_gate(instance, name, direction) {
        return outcome;
    }
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    let Some(comment) = statement
        .comments
        .iter_mut()
        .find(|comment| comment.id == *comment_id)
    else {
        return Outcome::Resync;
    };
    if comment.ups.iter().any(|voter| voter == name)
        || comment.downs.iter().any(|voter| voter == name)
    {
        return Outcome::Resync;
    }
    comment.side_mut(direction).push(name.to_string());
    debit_vote(instance, name);
    Outcome::Broadcast
}

fn un_comment_vote(
    instance: &mut Instance,
    name: &str,
    direction: Direction,
    statement_id: &StatementId,
    comment_id: &CommentId,
) -> Outcome {
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    let Some(comment) = statement
        .comments
        .iter_mut()
        .find(|comment| comment.id == *comment_id)
    else {
        return Outcome::Resync;
    };
    let side = comment.side_mut(direction);
    let Some(at) = side.iter().position(|voter| voter == name) else {
        return Outcome::Resync;
    };
    side.remove(at);
    instance.credit_vote(name);
    Outcome::Broadcast
}

fn add_comment(
    instance: &mut Instance,
    name: &str,
    statement_id: &StatementId,
    text: String,
) -> Outcome {
    if instance.locked {
        return locked_rejection();
    }
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    statement.comments.push(Comment::new(text, name));
    Outcome::Broadcast
}

fn edit_statement(instance: &mut Instance, statement_id: &StatementId, text: String) -> Outcome {
    if instance.locked {
        return locked_rejection();
    }
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    statement.text = text;
    statement.is_edited = true;
    Outcome::Broadcast
}

fn edit_comment(
    instance: &mut Instance,
    statement_id: &StatementId,
    comment_id: &CommentId,
    text: String,
) -> Outcome {
    if instance.locked {
        return locked_rejection();
    }
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    let Some(comment) = statement
        .comments
        .iter_mut()
        .find(|comment| comment.id == *comment_id)
    else {
        return Outcome::Resync;
    };
    comment.text = text;
    comment.is_edited = true;
    Outcome::Broadcast
}

fn delete_comment(
    instance: &mut Instance,
    statement_id: &StatementId,
    comment_id: &CommentId,
) -> Outcome {
    if instance.locked {
        return locked_rejection();
    }
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    let Some(at) = statement
        .comments
        .iter()
        .position(|comment| comment.id == *comment_id)
    else {
        return Outcome::Resync;
    };
    let comment = statement.comments.remove(at);
    // the comment's own votes come back; the parent statement's stay spent
    for voter in comment.ups.iter().chain(comment.downs.iter()) {
        instance.credit_vote(voter);
    }
    Outcome::Broadcast
}

fn react(instance: &mut Instance, name: &str, statement_id: &StatementId, emoji: &str) -> Outcome {
    let Some(code) = reaction_code(instance, emoji) else {
        return emoji_outcome(instance);
    };
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    toggle_reaction(&mut statement.emoji, &code, name);
    Outcome::Broadcast
}

fn comment_react(
    instance: &mut Instance,
    name: &str,
    statement_id: &StatementId,
    comment_id: &CommentId,
    emoji: &str,
) -> Outcome {
    let Some(code) = reaction_code(instance, emoji) else {
        return emoji_outcome(instance);
    };
    let Some(statement) = instance.statement_mut(statement_id) else {
        return Outcome::Resync;
    };
    let Some(comment) = statement
        .comments
        .iter_mut()
        .find(|comment| comment.id == *comment_id)
    else {
        return Outcome::Resync;
    };
    toggle_reaction(&mut comment.emoji, &code, name);
    Outcome::Broadcast
}

fn reaction_code(instance: &Instance, emoji: &str) -> Option<String> {
    if !instance.emoji_allowed {
        return None;
    }
    let code = emoji.trim();
    if code.is_empty() {
        return None;
    }
    Some(code.to_string())
}

fn emoji_outcome(instance: &Instance) -> Outcome {
    if instance.emoji_allowed {
        // a blank reaction code is malformed and dropped
        Outcome::Ignore
    } else {
        Outcome::Reject(ApiError::new(
            ErrorCode::Permission,
            "emoji reactions are not enabled on this board",
        ))
    }
}

/// Toggle `name` on the entry for `code`: present names are removed (and the
/// entry dropped once empty), absent names added, missing entries created.
fn toggle_reaction(reactions: &mut Vec<Reaction>, code: &str, name: &str) {
    if let Some(pos) = reactions.iter().position(|reaction| reaction.emoji == code) {
        let reaction = &mut reactions[pos];
        if let Some(at) = reaction.names.iter().position(|n| n == name) {
            reaction.names.remove(at);
            if reaction.names.is_empty() {
                reactions.remove(pos);
            }
        } else {
            reaction.names.push(name.to_string());
        }
    } else {
        reactions.push(Reaction {
            emoji: code.to_string(),
            names: vec![name.to_string()],
        });
    }
}

fn toggle_lock(instance: &mut Instance, name: &str) -> Outcome {
    if name != instance.owner {
        return Outcome::Reject(ApiError::new(
            ErrorCode::Permission,
            "only the owner can lock or unlock this board",
        ));
    }
    instance.locked = !instance.locked;
    Outcome::Broadcast
}

fn toggle_trash_lock(instance: &mut Instance, name: &str) -> Outcome {
    if name != instance.owner {
        return Outcome::Reject(ApiError::new(
            ErrorCode::Permission,
            "only the owner can lock or unlock the trash",
        ));
    }
    instance.trash_is_locked = !instance.trash_is_locked;
    Outcome::Broadcast
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
