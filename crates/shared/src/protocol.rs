use serde::{Deserialize, Serialize};

use crate::{
    domain::{CommentId, Direction, Instance, InstanceId, ListName, StatementId},
    error::ApiError,
};

/// Every inbound participant action, one variant per action name. Payload
/// shapes are validated at the boundary; frames that do not parse into this
/// enum are dropped by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Create {
        title: String,
        votes_allowed: i64,
        #[serde(default)]
        negative_votes_allowed: bool,
        owner: String,
        #[serde(default)]
        emoji_allowed: bool,
    },
    Join {
        instance_id: InstanceId,
        name: String,
    },
    AddItem {
        list: ListName,
        text: String,
    },
    MoveItem {
        last_list: ListName,
        last_index: usize,
        next_list: ListName,
        next_index: usize,
        item_id: StatementId,
    },
    Trash {
        last_list: ListName,
        last_index: usize,
        next_index: usize,
        item_id: StatementId,
    },
    HardDelete {
        index: usize,
    },
    HardDeleteAll,
    Vote {
        direction: Direction,
        statement_id: StatementId,
    },
    UnVote {
        direction: Direction,
        statement_id: StatementId,
    },
    CommentVote {
        direction: Direction,
        statement_id: StatementId,
        comment_id: CommentId,
    },
    UnCommentVote {
        direction: Direction,
        statement_id: StatementId,
        comment_id: CommentId,
    },
    Comment {
        statement_id: StatementId,
        text: String,
    },
    EditComment {
        statement_id: StatementId,
        comment_id: CommentId,
        text: String,
    },
    DeleteComment {
        statement_id: StatementId,
        comment_id: CommentId,
    },
    Edit {
        statement_id: StatementId,
        text: String,
    },
    React {
        statement_id: StatementId,
        emoji: String,
    },
    CommentReact {
        statement_id: StatementId,
        comment_id: CommentId,
        emoji: String,
    },
    ToggleLock,
    ToggleTrashLock,
    Ping {
        #[serde(default)]
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to a successful `create`; the creator is already joined.
    CreatedInstance { instance: Instance, name: String },
    /// Reply to a successful `join`, confirming the bound display name.
    NameConfirmed { name: String },
    /// Full-state push. Sent to every present participant after a mutation,
    /// or to a single caller to re-synchronize it after a stale request.
    InstanceSnapshot { instance: Instance },
    Rejected(ApiError),
    /// The caller's local identity or instance reference is stale; it must
    /// re-join before issuing further actions.
    ResetSession,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn client_request_uses_tagged_wire_shape() {
        let raw = r#"{"type":"vote","payload":{"direction":"up","statement_id":"id-1"}}"#;
        let request: ClientRequest = serde_json::from_str(raw).expect("request");
        assert!(matches!(
            request,
            ClientRequest::Vote {
                direction: Direction::Up,
                ..
            }
        ));
    }

    #[test]
    fn unit_variants_need_no_payload() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"type":"toggle_lock"}"#).expect("request");
        assert!(matches!(request, ClientRequest::ToggleLock));
    }

    #[test]
    fn create_defaults_optional_toggles_off() {
        let raw = r#"{"type":"create","payload":{"title":"sprint1","votes_allowed":3,"owner":"alice"}}"#;
        let request: ClientRequest = serde_json::from_str(raw).expect("request");
        match request {
            ClientRequest::Create {
                negative_votes_allowed,
                emoji_allowed,
                ..
            } => {
                assert!(!negative_votes_allowed);
                assert!(!emoji_allowed);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn rejected_event_serializes_error_payload() {
        let event = ServerEvent::Rejected(ApiError::new(ErrorCode::Permission, "no"));
        let raw = serde_json::to_string(&event).expect("json");
        assert!(raw.contains(r#""type":"rejected""#));
        assert!(raw.contains(r#""code":"permission""#));
    }

    #[test]
    fn unknown_action_is_rejected_at_the_boundary() {
        let raw = r#"{"type":"self_destruct","payload":{}}"#;
        assert!(serde_json::from_str::<ClientRequest>(raw).is_err());
    }
}
