// Deskline Chat Engine — Stream Reconciliation
//
// The authoritative in-memory transcript of the active conversation and the
// state machine that folds socket frames into it:
//   - one in-flight assistant message at a time, tracked by a streaming
//     pointer (Idle → Streaming → Idle)
//   - token batching through a per-turn buffer (idle-window or size flush)
//   - idempotent finalization with key-based dedup, placeholder purging and
//     echo suppression
//   - human-relayed messages that arrive without a stream_start
//   - derived conversation titles, propagated once per change
//
// Thread-safety: NOT internally synchronized; the client loop owns one
// Transcript per activation and drives it from a single task. Deadlines
// (token flush, safety timeout) are scheduled by the caller; this struct
// only says when they should be armed.

use std::collections::HashSet;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::atoms::constants::{
    DEDUP_PREFIX_CHARS, ECHO_DEDUP_MIN_CHARS, META_HUMAN_RELAYED, META_SILENT, PROCESSING_AGENT,
    STREAM_FLUSH_THRESHOLD_CHARS, STREAM_STALL_TIMEOUT_SECS, TITLE_MAX_CHARS,
};
use crate::atoms::types::{
    is_durable_id, metadata_flag, mint_local_id, ChatMessage, Metadata, Role,
};

// ── Outcomes handed back to the driving loop ───────────────────────────

/// What to do with the flush deadline after buffering one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPush {
    /// Token buffered; (re-)arm the idle flush deadline.
    Buffered,
    /// Size threshold crossed and the buffer already flushed; clear any
    /// pending deadline.
    Flushed,
}

/// Result of applying a finalization frame.
#[derive(Debug, Default)]
pub struct FinalizeOutcome {
    /// The finalization ran to completion (pointer/buffer/loading cleared).
    /// False when the frame was discarded as an already-seen duplicate.
    pub completed: bool,
    /// Transcript entries were added, replaced, or removed.
    pub changed: bool,
    /// Durable id whose feedback should be fetched (best-effort).
    pub feedback_lookup: Option<String>,
}

// ── Transcript ─────────────────────────────────────────────────────────

pub struct Transcript {
    conversation_id: String,
    messages: Vec<ChatMessage>,
    streaming_id: Option<String>,
    token_buffer: String,
    /// Agent announced by token frames, used if a message has to be
    /// synthesized during a flush.
    pending_agent: Option<String>,
    /// Dedup keys of finalizations already applied in this conversation.
    finalized_keys: HashSet<String>,
    loading: bool,
    /// Last title handed to the collaborator, so rederiving is a no-op.
    propagated_title: Option<String>,
}

impl Transcript {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Transcript {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            streaming_id: None,
            token_buffer: String::new(),
            pending_agent: None,
            finalized_keys: HashSet::new(),
            loading: false,
            propagated_title: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_id.is_some()
    }

    // ── Initial state ──────────────────────────────────────────────────

    /// Install the History Loader's result as the initial transcript.
    pub fn commit_history(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    /// Synthesize the welcome banner into an empty transcript.
    pub fn push_welcome(&mut self, text: &str) {
        let mut banner = ChatMessage::local(Role::Assistant, text);
        banner.agent = Some("system".into());
        self.messages.push(banner);
    }

    // ── Outbound user turn ─────────────────────────────────────────────

    /// Optimistic local append of the user's message; the caller sends the
    /// frame and arms the safety timeout.
    pub fn push_user(&mut self, content: &str) {
        self.messages
            .push(ChatMessage::local(Role::User, content));
        self.loading = true;
    }

    // ── Streamed turn lifecycle ────────────────────────────────────────

    /// `stream_start`: open the in-flight placeholder. A duplicate start
    /// while one is already open is swallowed.
    pub fn begin_stream(&mut self, agent: Option<&str>) -> bool {
        if self.streaming_id.is_some() {
            debug!("[transcript] Duplicate stream_start; ignoring");
            return false;
        }
        let mut placeholder = ChatMessage::local(Role::Assistant, "");
        placeholder.agent = Some(PROCESSING_AGENT.into());
        debug!(
            "[transcript] Stream open ({}) announced by agent {:?}",
            placeholder.id, agent
        );
        self.streaming_id = Some(placeholder.id.clone());
        self.messages.push(placeholder);
        self.loading = true;
        true
    }

    /// `stream` token: buffer only; content lands at flush time.
    pub fn push_token(&mut self, token: &str, agent: Option<&str>) -> TokenPush {
        self.token_buffer.push_str(token);
        if let Some(a) = agent {
            self.pending_agent = Some(a.to_string());
        }
        if self.token_buffer.chars().count() > STREAM_FLUSH_THRESHOLD_CHARS {
            self.flush_tokens();
            TokenPush::Flushed
        } else {
            TokenPush::Buffered
        }
    }

    /// Move the buffered tokens into the in-flight message. Synthesizes the
    /// message first if the pointer is unset (missed or out-of-order
    /// stream_start). Returns whether any content moved.
    pub fn flush_tokens(&mut self) -> bool {
        if self.token_buffer.is_empty() {
            return false;
        }
        let chunk = std::mem::take(&mut self.token_buffer);
        let pointer = self.streaming_id.clone();
        match pointer.and_then(|id| self.messages.iter_mut().find(|m| m.id == id)) {
            Some(msg) => msg.content.push_str(&chunk),
            None => {
                warn!("[transcript] Token flush without an open stream; synthesizing message");
                let mut msg = ChatMessage::local(Role::Assistant, chunk);
                msg.agent = Some(
                    self.pending_agent
                        .take()
                        .unwrap_or_else(|| PROCESSING_AGENT.into()),
                );
                self.streaming_id = Some(msg.id.clone());
                self.messages.push(msg);
            }
        }
        true
    }

    /// `stream_end`: authoritative finalization.
    pub fn finalize_stream(
        &mut self,
        final_text: &str,
        agent: Option<String>,
        metadata: Metadata,
        frame_id: Option<String>,
    ) -> FinalizeOutcome {
        let trimmed = final_text.trim().to_string();
        let relayed = metadata_flag(&metadata, META_HUMAN_RELAYED);

        // Relayed frames dedup by durable id when they carry one; everything
        // else by a prefix-hash of the final text. Redelivered finalizations
        // die here.
        let key = match frame_id.as_deref() {
            Some(id) if relayed => format!("id:{}", id),
            _ => format!("text:{}", dedup_hash(&trimmed)),
        };
        if self.finalized_keys.contains(&key) {
            debug!("[transcript] Already-finalized frame ({}); discarding", key);
            self.loading = false;
            return FinalizeOutcome::default();
        }
        self.finalized_keys.insert(key);

        let mut changed = false;
        let mut resulting_id: Option<String> = None;

        let pointer_idx = self
            .streaming_id
            .as_deref()
            .and_then(|id| self.messages.iter().position(|m| m.id == id));

        if let Some(idx) = pointer_idx {
            // In-flight message: wholesale replacement, then a cleanup pass
            // over the rest of the transcript.
            let msg = &mut self.messages[idx];
            msg.content = final_text.to_string();
            msg.agent = agent;
            msg.metadata = metadata;
            if let Some(fid) = frame_id.as_deref() {
                if is_durable_id(fid) {
                    debug!("[transcript] Promoting {} to durable id {}", msg.id, fid);
                    msg.id = fid.to_string();
                }
            }
            resulting_id = Some(self.messages[idx].id.clone());
            self.purge_superseded(idx, &trimmed);
            changed = true;
        } else if relayed {
            // Human-relayed messages may arrive with no preceding start. An
            // empty, silent one exists only to clear the loading flag.
            let silent = metadata_flag(&metadata, META_SILENT);
            if trimmed.is_empty() && silent {
                debug!("[transcript] Silent relay frame; clearing loading only");
            } else {
                let id = frame_id
                    .filter(|fid| is_durable_id(fid))
                    .unwrap_or_else(mint_local_id);
                self.messages.push(ChatMessage {
                    id: id.clone(),
                    role: Role::Assistant,
                    content: final_text.to_string(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    agent,
                    metadata,
                });
                resulting_id = Some(id);
                changed = true;
            }
        } else {
            // No pointer, no relay: reconcile against existing assistant
            // content. User and system entries are never dedup candidates.
            let found = if trimmed.is_empty() {
                None
            } else {
                self.messages
                    .iter()
                    .position(|m| m.role == Role::Assistant && m.content.trim() == trimmed)
            };
            match found {
                Some(idx) if self.messages[idx].is_processing() => {
                    // Abandoned placeholder that already holds the final
                    // text: upgrade it in place.
                    let msg = &mut self.messages[idx];
                    msg.agent = agent;
                    msg.metadata = metadata;
                    if let Some(fid) = frame_id.as_deref() {
                        if is_durable_id(fid) {
                            msg.id = fid.to_string();
                        }
                    }
                    resulting_id = Some(self.messages[idx].id.clone());
                    changed = true;
                }
                Some(idx) => {
                    // Content-based dedup is a heuristic; a genuinely new
                    // turn with identical text would be lost here, so every
                    // such drop is flagged.
                    warn!(
                        "[transcript] Finalization matches settled message {} by content; \
                         dropping as duplicate",
                        self.messages[idx].id
                    );
                }
                None => {
                    let id = frame_id
                        .filter(|fid| is_durable_id(fid))
                        .unwrap_or_else(mint_local_id);
                    self.messages.push(ChatMessage {
                        id: id.clone(),
                        role: Role::Assistant,
                        content: final_text.to_string(),
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        agent,
                        metadata,
                    });
                    resulting_id = Some(id);
                    changed = true;
                }
            }
        }

        let feedback_lookup = resulting_id.filter(|id| is_durable_id(id));

        self.streaming_id = None;
        self.token_buffer.clear();
        self.pending_agent = None;
        self.loading = false;

        FinalizeOutcome {
            completed: true,
            changed,
            feedback_lookup,
        }
    }

    /// Drop leftovers superseded by the finalized message at `keep_idx`:
    /// any other still-processing placeholder, and any earlier assistant
    /// message with byte-identical trimmed content (echo duplicates), short
    /// texts exempted. A user message repeating the final text is the
    /// user's own content, never an echo.
    fn purge_superseded(&mut self, keep_idx: usize, trimmed: &str) {
        let mut keep_idx = keep_idx;
        let echo_eligible = trimmed.chars().count() > ECHO_DEDUP_MIN_CHARS;
        let mut removed = 0usize;
        let mut i = 0usize;
        while i < self.messages.len() {
            if i == keep_idx {
                i += 1;
                continue;
            }
            let msg = &self.messages[i];
            let abandoned = msg.is_processing();
            let echo = echo_eligible
                && i < keep_idx
                && msg.role == Role::Assistant
                && msg.content.trim() == trimmed;
            if !(abandoned || echo) {
                i += 1;
                continue;
            }
            if echo && !abandoned {
                warn!(
                    "[transcript] Dropping echo duplicate {} of finalized content",
                    msg.id
                );
            }
            self.messages.remove(i);
            removed += 1;
            if i < keep_idx {
                keep_idx -= 1;
            }
        }
        if removed > 0 {
            info!(
                "[transcript] Removed {} superseded message(s) during finalization",
                removed
            );
        }
    }

    // ── Non-streaming frames ───────────────────────────────────────────

    /// `response`: single-frame reply. Appends unless an assistant entry
    /// with identical trimmed content already exists.
    pub fn apply_response(
        &mut self,
        message: &str,
        agent: Option<String>,
        metadata: Metadata,
    ) -> bool {
        self.loading = false;
        let trimmed = message.trim();
        if self
            .messages
            .iter()
            .any(|m| m.role == Role::Assistant && m.content.trim() == trimmed)
        {
            debug!("[transcript] Duplicate response frame; dropping");
            return false;
        }
        let mut msg = ChatMessage::local(Role::Assistant, message);
        msg.agent = agent;
        msg.metadata = metadata;
        self.messages.push(msg);
        true
    }

    /// `error`: surfaced inline as a system entry.
    pub fn apply_error(&mut self, message: &str) {
        self.loading = false;
        self.messages
            .push(ChatMessage::local(Role::System, message));
    }

    // ── Stall handling ─────────────────────────────────────────────────

    /// Safety-timeout fire: abandon the turn. Any partial message stays in
    /// the transcript (a later finalization purges it); the pointer,
    /// buffer, and loading flag are discarded. No-op when nothing is
    /// pending.
    pub fn stall_timeout(&mut self) -> bool {
        if self.streaming_id.is_none() && !self.loading {
            return false;
        }
        warn!(
            "[transcript] No finalization within {}s for {}; abandoning turn",
            STREAM_STALL_TIMEOUT_SECS, self.conversation_id
        );
        self.streaming_id = None;
        self.token_buffer.clear();
        self.pending_agent = None;
        self.loading = false;
        true
    }

    // ── Title derivation ───────────────────────────────────────────────

    /// Derive the conversation title from the first user message. Returns
    /// the new title when it differs from the last propagated one; the
    /// caller pushes it to the collaborator.
    pub fn title_update(&mut self) -> Option<String> {
        let first_user = self.messages.iter().find(|m| m.role == Role::User)?;
        let derived = derive_title(&first_user.content);
        if self.propagated_title.as_deref() == Some(derived.as_str()) {
            return None;
        }
        self.propagated_title = Some(derived.clone());
        Some(derived)
    }
}

fn derive_title(content: &str) -> String {
    if content.chars().count() > TITLE_MAX_CHARS {
        let head: String = content.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

/// Key for text-based finalization dedup: SHA-256 over the leading prefix
/// of the trimmed final text.
fn dedup_hash(trimmed: &str) -> String {
    let prefix: String = trimmed.chars().take(DEDUP_PREFIX_CHARS).collect();
    let digest = Sha256::digest(prefix.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
