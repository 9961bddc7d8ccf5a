// ── Deskline Atoms: Domain & Wire Types ────────────────────────────────────
// Pure data shapes shared across the crate:
//   - transcript entries, feedback annotations, conversation summaries
//   - inbound/outbound socket frames (tagged JSON)
//   - REST DTOs for the collaborator surface
//   - the event stream surfaced to embedders
// No I/O here; behavior lives in engine/.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::atoms::constants::{
    LOCAL_ID_PREFIX, META_HUMAN_RELAYED, PROCESSING_AGENT, SESSION_ID_PREFIX,
};

pub type Metadata = serde_json::Map<String, Value>;

// ── Identifiers ────────────────────────────────────────────────────────────

/// True when `id` is a canonical UUID, i.e. assigned by the collaborator's
/// persistence layer. Only durable ids can carry feedback.
pub fn is_durable_id(id: &str) -> bool {
    Uuid::try_parse(id).is_ok()
}

/// Mint an ephemeral transcript-entry id (`local-<millis>-<hex>`).
pub(crate) fn mint_local_id() -> String {
    mint_prefixed_id(LOCAL_ID_PREFIX)
}

/// Mint a local conversation id (`session-<millis>-<hex>`). The collaborator
/// materializes the conversation on first message; until then the id only
/// exists client-side.
pub(crate) fn mint_session_id() -> String {
    mint_prefixed_id(SESSION_ID_PREFIX)
}

fn mint_prefixed_id(prefix: &str) -> String {
    let entropy = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        chrono::Utc::now().timestamp_millis(),
        &entropy[..8]
    )
}

// ── Transcript entries ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One transcript entry. `content` is the only field that mutates after
/// creation (streaming appends, then wholesale replacement at finalization);
/// `timestamp` is set once and never touched again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
    /// Backend persona that produced the message. `processing` while a
    /// stream is in flight; never `processing` after finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Opaque collaborator bag (ticket markers, human-support flags, …).
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ChatMessage {
    /// Build a locally-minted entry with an ephemeral id and a fresh
    /// timestamp.
    pub fn local(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            id: mint_local_id(),
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            agent: None,
            metadata: Metadata::new(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.agent.as_deref() == Some(PROCESSING_AGENT)
    }

    pub fn has_durable_id(&self) -> bool {
        is_durable_id(&self.id)
    }

    pub fn is_human_relayed(&self) -> bool {
        metadata_flag(&self.metadata, META_HUMAN_RELAYED)
    }
}

/// Read a boolean flag out of a metadata bag. Absent or non-boolean keys
/// read as false.
pub(crate) fn metadata_flag(metadata: &Metadata, key: &str) -> bool {
    metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
}

// ── Feedback annotations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Like,
    Dislike,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Feedback {
    /// An entry with neither reaction nor comment is conceptually absent.
    pub fn is_empty(&self) -> bool {
        self.reaction.is_none() && self.comment.as_deref().map_or(true, |c| c.is_empty())
    }
}

// ── Conversations ──────────────────────────────────────────────────────────

/// One chat thread as listed in the conversation directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: String,
}

impl Conversation {
    /// Create a thread locally, before the collaborator knows about it.
    pub fn new_local(title: impl Into<String>) -> Self {
        Conversation {
            id: mint_session_id(),
            title: title.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ── Socket frames ──────────────────────────────────────────────────────────

/// Inbound frames, tagged by `type`. Unknown or malformed frames fail to
/// parse and are dropped by the connection layer (logged, no state change).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// A streamed turn is beginning.
    #[serde(rename = "stream_start")]
    StreamStart { agent: Option<String> },

    /// One increment of streamed text.
    #[serde(rename = "stream")]
    StreamToken {
        token: String,
        agent: Option<String>,
    },

    /// Authoritative end of a streamed turn.
    #[serde(rename = "stream_end")]
    StreamEnd {
        #[serde(default)]
        message: String,
        agent: Option<String>,
        #[serde(default)]
        metadata: Metadata,
        id: Option<String>,
    },

    /// Complete reply delivered in one frame (non-streaming fallback).
    #[serde(rename = "response")]
    Response {
        message: String,
        agent: Option<String>,
        #[serde(default)]
        metadata: Metadata,
    },

    /// Collaborator-side failure for the current turn.
    #[serde(rename = "error")]
    Error { message: String },
}

/// The single outbound frame shape.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub message: String,
    pub user_id: String,
}

// ── REST DTOs ──────────────────────────────────────────────────────────────

/// `GET /conversations` row.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub title: String,
    pub timestamp: String,
}

impl From<ConversationRecord> for Conversation {
    fn from(rec: ConversationRecord) -> Self {
        Conversation {
            id: rec.id,
            title: rec.title,
            created_at: rec.timestamp,
        }
    }
}

/// `GET /conversations/{id}/messages` row. The collaborator distinguishes
/// only `user` and `bot`; human-relayed entries come back as `bot` rows with
/// the relay flag in metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl From<StoredMessage> for ChatMessage {
    fn from(row: StoredMessage) -> Self {
        let role = if row.kind == "user" {
            Role::User
        } else {
            Role::Assistant
        };
        ChatMessage {
            id: row.id,
            role,
            content: row.content,
            timestamp: row.timestamp,
            agent: row.agent,
            metadata: row.metadata.unwrap_or_default(),
        }
    }
}

/// `POST /feedbacks/messages` body. Always the full current annotation,
/// never a partial patch.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackSubmission {
    pub interaction_id: String,
    pub session_id: String,
    pub bot_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

// ── Embedder event surface ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// History fetch failed; the conversation opened with an empty
    /// transcript.
    HistoryUnavailable,
    /// `send` was refused because the connection is not open.
    SendRefused,
    /// A feedback submission failed; local state was kept.
    FeedbackFailed,
    /// The 60s safety timeout fired with no finalization frame.
    StreamTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl NoticeKind {
    pub fn severity(self) -> Severity {
        match self {
            NoticeKind::HistoryUnavailable | NoticeKind::FeedbackFailed => Severity::Error,
            NoticeKind::SendRefused | NoticeKind::StreamTimeout => Severity::Warning,
        }
    }
}

/// Coarse push notifications for embedders. Full state is pulled via
/// `ChatClient::snapshot()`; these only say that something changed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientEvent {
    ConnectionChanged { state: ConnectionState },
    ConversationsChanged,
    TranscriptChanged,
    LoadingChanged { loading: bool },
    TitleChanged { conversation_id: String, title: String },
    Notice {
        notice: NoticeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::atoms::constants::META_SILENT;

    #[test]
    fn durable_id_accepts_canonical_uuid() {
        assert!(is_durable_id("a1b2c3d4-e5f6-4789-8abc-def012345678"));
        assert!(!is_durable_id("local-1700000000000-ab12cd34"));
        assert!(!is_durable_id(""));
        assert!(!is_durable_id("not-a-uuid"));
    }

    #[test]
    fn minted_ids_carry_their_prefix() {
        assert!(mint_local_id().starts_with("local-"));
        assert!(mint_session_id().starts_with("session-"));
        assert_ne!(mint_local_id(), mint_local_id());
    }

    #[test]
    fn parses_stream_start_frame() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type": "stream_start", "agent": "triage"}"#).unwrap();
        match frame {
            ServerFrame::StreamStart { agent } => assert_eq!(agent.as_deref(), Some("triage")),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn parses_token_frame_without_agent() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type": "stream", "token": "Hel"}"#).unwrap();
        match frame {
            ServerFrame::StreamToken { token, agent } => {
                assert_eq!(token, "Hel");
                assert!(agent.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn parses_stream_end_with_metadata_and_id() {
        let raw = r#"{
            "type": "stream_end",
            "message": "All set.",
            "agent": "human_support",
            "metadata": {"human_relayed": true, "responder": "sam"},
            "id": "a1b2c3d4-e5f6-4789-8abc-def012345678"
        }"#;
        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ServerFrame::StreamEnd {
                message,
                agent,
                metadata,
                id,
            } => {
                assert_eq!(message, "All set.");
                assert_eq!(agent.as_deref(), Some("human_support"));
                assert!(metadata_flag(&metadata, META_HUMAN_RELAYED));
                assert!(!metadata_flag(&metadata, META_SILENT));
                assert!(id.map(|i| is_durable_id(&i)).unwrap_or(false));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn stream_end_tolerates_missing_message_and_metadata() {
        let frame: ServerFrame = serde_json::from_str(r#"{"type": "stream_end"}"#).unwrap();
        match frame {
            ServerFrame::StreamEnd {
                message, metadata, ..
            } => {
                assert!(message.is_empty());
                assert!(metadata.is_empty());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_frame_type() {
        assert!(serde_json::from_str::<ServerFrame>(r#"{"type": "typing"}"#).is_err());
        assert!(serde_json::from_str::<ServerFrame>("not json").is_err());
    }

    #[test]
    fn outbound_frame_shape() {
        let frame = OutboundFrame {
            message: "printer broken".into(),
            user_id: "web-user".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["message"], "printer broken");
        assert_eq!(json["user_id"], "web-user");
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn stored_bot_row_maps_to_assistant() {
        let row: StoredMessage = serde_json::from_str(
            r#"{
                "id": "a1b2c3d4-e5f6-4789-8abc-def012345678",
                "type": "bot",
                "content": "Try restarting it.",
                "timestamp": "2024-06-01T10:00:00Z",
                "agent": "triage"
            }"#,
        )
        .unwrap();
        let msg: ChatMessage = row.into();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.agent.as_deref(), Some("triage"));
        assert!(msg.metadata.is_empty());
        assert!(msg.has_durable_id());
    }

    #[test]
    fn feedback_emptiness() {
        assert!(Feedback::default().is_empty());
        assert!(Feedback {
            reaction: None,
            comment: Some(String::new()),
        }
        .is_empty());
        assert!(!Feedback {
            reaction: Some(Reaction::Like),
            comment: None,
        }
        .is_empty());
    }

    #[test]
    fn feedback_submission_omits_empty_fields() {
        let body = FeedbackSubmission {
            interaction_id: "a1b2c3d4-e5f6-4789-8abc-def012345678".into(),
            session_id: "session-1-aa".into(),
            bot_message: "Try restarting it.".into(),
            reaction: Some(Reaction::Like),
            comment: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["reaction"], "like");
        assert!(json.get("comment").is_none());
    }
}
