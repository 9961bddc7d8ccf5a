// Deskline Chat Engine — History Loader
//
// One-shot fetch of a conversation's durable transcript plus the feedback
// annotations for its durable assistant messages. Degrades to an empty
// result on any fetch failure — the conversation opens blank with a notice
// instead of blocking.
//
// Activation bookkeeping lives in the client loop: it invokes this at most
// once per activation and discards results whose conversation id no longer
// matches the active one when they resolve.

use std::collections::HashMap;

use log::{info, warn};

use crate::atoms::error::ClientResult;
use crate::atoms::types::{ChatMessage, Feedback, Role};
use crate::engine::api::ApiClient;

/// Result of one history load. `degraded` marks a load that failed and came
/// back empty; the client surfaces a notice for it.
#[derive(Debug)]
pub struct HistoryLoad {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    pub feedback: HashMap<String, Feedback>,
    pub degraded: bool,
}

/// Ids eligible for feedback: assistant messages persisted under a
/// canonical UUID. Ephemeral and user/system entries cannot carry feedback.
fn durable_assistant_ids(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant && m.has_durable_id())
        .map(|m| m.id.clone())
        .collect()
}

async fn fetch(
    api: &ApiClient,
    conversation_id: &str,
) -> ClientResult<(Vec<ChatMessage>, HashMap<String, Feedback>)> {
    let messages = api.conversation_messages(conversation_id).await?;
    let ids = durable_assistant_ids(&messages);
    let feedback = api.feedback_batch(&ids).await?;
    Ok((messages, feedback))
}

/// Load transcript + feedback for one conversation. Never fails: a fetch
/// error yields an empty, `degraded` load. No automatic retry.
pub async fn load_history(api: &ApiClient, conversation_id: &str) -> HistoryLoad {
    match fetch(api, conversation_id).await {
        Ok((messages, feedback)) => {
            info!(
                "[history] Loaded {} message(s), {} feedback entr(ies) for {}",
                messages.len(),
                feedback.len(),
                conversation_id
            );
            HistoryLoad {
                conversation_id: conversation_id.to_string(),
                messages,
                feedback,
                degraded: false,
            }
        }
        Err(e) => {
            warn!(
                "[history] Load failed for {} ({}); opening empty",
                conversation_id, e
            );
            HistoryLoad {
                conversation_id: conversation_id.to_string(),
                messages: Vec::new(),
                feedback: HashMap::new(),
                degraded: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, role: Role) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            role,
            content: "text".into(),
            timestamp: "2024-06-01T10:00:00Z".into(),
            agent: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn feedback_filter_keeps_only_durable_assistant_ids() {
        let messages = vec![
            stored("a1b2c3d4-e5f6-4789-8abc-def012345678", Role::Assistant),
            stored("b1b2c3d4-e5f6-4789-8abc-def012345678", Role::User),
            stored("local-1700000000000-ab12cd34", Role::Assistant),
            stored("c1b2c3d4-e5f6-4789-8abc-def012345678", Role::Assistant),
        ];
        let ids = durable_assistant_ids(&messages);
        assert_eq!(
            ids,
            vec![
                "a1b2c3d4-e5f6-4789-8abc-def012345678".to_string(),
                "c1b2c3d4-e5f6-4789-8abc-def012345678".to_string(),
            ]
        );
    }

    #[test]
    fn feedback_filter_empty_for_blank_history() {
        assert!(durable_assistant_ids(&[]).is_empty());
    }
}
