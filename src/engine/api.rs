// Deskline Chat Engine — Collaborator REST Client
//
// Thin authenticated wrapper over the collaborator HTTP surface:
//   - conversation directory + per-conversation message history
//   - idempotent title rename
//   - feedback batch fetch and full-object submission
// No retries here: callers decide whether a failure degrades or surfaces.

use std::collections::HashMap;

use log::debug;

use crate::atoms::error::{ClientError, ClientResult};
use crate::atoms::types::{
    ChatMessage, Conversation, ConversationRecord, Feedback, FeedbackSubmission, StoredMessage,
};
use crate::engine::config::ClientConfig;

// How much of an error body survives into the error message.
const BODY_SNIPPET_CHARS: usize = 300;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    credential: Option<String>,
}

impl ApiClient {
    pub fn new(cfg: &ClientConfig) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            base: cfg.rest_base().to_string(),
            credential: cfg.credential.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    /// Turn a non-success response into `ClientError::Api`, keeping a short
    /// body snippet for the log line.
    async fn check(resp: reqwest::Response) -> ClientResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::api(status.as_u16(), body_snippet(&body)))
    }

    // ── Conversations ──────────────────────────────────────────────────

    pub async fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        let resp = self
            .authorize(self.http.get(self.endpoint("/conversations")))
            .send()
            .await?;
        let records: Vec<ConversationRecord> = Self::check(resp).await?.json().await?;
        debug!("[api] Listed {} conversation(s)", records.len());
        Ok(records.into_iter().map(Conversation::from).collect())
    }

    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> ClientResult<Vec<ChatMessage>> {
        let url = self.endpoint(&format!("/conversations/{}/messages", conversation_id));
        let resp = self.authorize(self.http.get(url)).send().await?;
        let rows: Vec<StoredMessage> = Self::check(resp).await?.json().await?;
        debug!(
            "[api] Fetched {} stored message(s) for {}",
            rows.len(),
            conversation_id
        );
        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }

    /// Idempotent rename; the collaborator upserts the title.
    pub async fn rename_conversation(&self, conversation_id: &str, title: &str) -> ClientResult<()> {
        let url = self.endpoint(&format!("/conversations/{}/title", conversation_id));
        let resp = self
            .authorize(self.http.post(url).query(&[("title", title)]))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    // ── Feedback ───────────────────────────────────────────────────────

    /// Batch-fetch annotations for a set of durable message ids. Ids the
    /// collaborator has nothing for are simply absent from the map.
    pub async fn feedback_batch(
        &self,
        interaction_ids: &[String],
    ) -> ClientResult<HashMap<String, Feedback>> {
        if interaction_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let resp = self
            .authorize(
                self.http
                    .post(self.endpoint("/feedbacks/messages/batch"))
                    .json(&serde_json::json!({ "interaction_ids": interaction_ids })),
            )
            .send()
            .await?;
        let map: HashMap<String, Feedback> = Self::check(resp).await?.json().await?;
        debug!(
            "[api] Feedback batch: {} requested, {} returned",
            interaction_ids.len(),
            map.len()
        );
        Ok(map)
    }

    /// Fetch the annotation for a single durable id (batch of one).
    pub async fn fetch_feedback(&self, interaction_id: &str) -> ClientResult<Option<Feedback>> {
        let mut map = self.feedback_batch(&[interaction_id.to_string()]).await?;
        Ok(map.remove(interaction_id))
    }

    /// Submit the full current annotation for one message.
    pub async fn submit_feedback(&self, submission: &FeedbackSubmission) -> ClientResult<()> {
        let resp = self
            .authorize(
                self.http
                    .post(self.endpoint("/feedbacks/messages"))
                    .json(submission),
            )
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

fn body_snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_SNIPPET_CHARS {
        return trimmed.to_string();
    }
    let mut cut = BODY_SNIPPET_CHARS;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::ClientConfig;

    fn client() -> ApiClient {
        ApiClient::new(&ClientConfig {
            api_base: "http://localhost:8000/".into(),
            ..ClientConfig::default()
        })
    }

    #[test]
    fn endpoints_join_without_double_slash() {
        let api = client();
        assert_eq!(api.endpoint("/conversations"), "http://localhost:8000/conversations");
        assert_eq!(
            api.endpoint("/conversations/abc/messages"),
            "http://localhost:8000/conversations/abc/messages"
        );
    }

    #[test]
    fn body_snippet_truncates_long_bodies() {
        let short = body_snippet("  plain error  ");
        assert_eq!(short, "plain error");

        let long = "x".repeat(1000);
        let snip = body_snippet(&long);
        assert!(snip.chars().count() <= BODY_SNIPPET_CHARS + 1);
        assert!(snip.ends_with('…'));
    }

    #[test]
    fn body_snippet_respects_char_boundaries() {
        let body = "é".repeat(400);
        let snip = body_snippet(&body);
        assert!(snip.ends_with('…'));
    }
}
