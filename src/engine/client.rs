// Deskline Chat Engine — Client Loop
//
// The single task that owns all mutable chat state. Commands from the
// embedder, frames from the socket, deadline fires, and completions of
// spawned HTTP futures all funnel into one select loop; handlers mutate
// the active session synchronously and publish a fresh snapshot.
//
// Per-conversation state lives in a Session object that is replaced
// wholesale on switch: its connection is closed first, then its frame
// channel, deadlines, transcript, and feedback book die with it. Results
// of spawned work carry the conversation id they were started for and are
// discarded when they resolve after a switch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::atoms::constants::{STREAM_FLUSH_IDLE_MS, STREAM_STALL_TIMEOUT_SECS};
use crate::atoms::types::{
    ChatMessage, ClientEvent, ConnectionState, Conversation, Feedback, FeedbackSubmission,
    NoticeKind, OutboundFrame, Reaction, Role, ServerFrame, Severity,
};
use crate::engine::api::ApiClient;
use crate::engine::config::ClientConfig;
use crate::engine::connection::{CloseReason, Connection};
use crate::engine::feedback::FeedbackBook;
use crate::engine::history::{load_history, HistoryLoad};
use crate::engine::transcript::{TokenPush, Transcript};

// ── Public surface ─────────────────────────────────────────────────────

/// Point-in-time copy of everything an embedder renders.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub conversations: Vec<Conversation>,
    pub active: Option<Conversation>,
    pub messages: Vec<ChatMessage>,
    pub feedback: HashMap<String, Feedback>,
    pub connection: ConnectionState,
    pub loading: bool,
}

impl Default for ClientSnapshot {
    fn default() -> Self {
        ClientSnapshot {
            conversations: Vec::new(),
            active: None,
            messages: Vec::new(),
            feedback: HashMap::new(),
            connection: ConnectionState::Closed,
            loading: false,
        }
    }
}

/// Running chat client. Commands are fire-and-forget; state comes back
/// through `snapshot()` and the event stream.
pub struct ChatClient {
    commands_tx: mpsc::UnboundedSender<Command>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    snapshot: Arc<Mutex<ClientSnapshot>>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Validate the config and start the client loop. The loop immediately
    /// refreshes the conversation directory; nothing else happens until a
    /// conversation is activated.
    pub fn start(cfg: ClientConfig) -> crate::atoms::error::ClientResult<ChatClient> {
        cfg.validate()?;
        let api = ApiClient::new(&cfg);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(Mutex::new(ClientSnapshot::default()));

        let task = tokio::spawn(
            ClientLoop {
                cfg,
                api,
                conversations: Vec::new(),
                session: None,
                commands_rx,
                completions_tx,
                completions_rx,
                events_tx,
                snapshot: Arc::clone(&snapshot),
            }
            .run(),
        );

        Ok(ChatClient {
            commands_tx,
            events_rx,
            snapshot,
            task,
        })
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        self.snapshot.lock().clone()
    }

    /// Next push notification; `None` after shutdown.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events_rx.recv().await
    }

    pub fn activate(&self, conversation_id: &str) {
        self.command(Command::Activate {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Mint a local conversation and switch to it. The collaborator learns
    /// about it when the first message is sent.
    pub fn new_conversation(&self) {
        self.command(Command::NewConversation);
    }

    pub fn refresh_conversations(&self) {
        self.command(Command::RefreshConversations);
    }

    pub fn send_message(&self, text: &str) {
        self.command(Command::Send {
            text: text.to_string(),
        });
    }

    /// `Some` toggles the reaction (repeating the active one clears it);
    /// `None` clears whatever is set.
    pub fn set_reaction(&self, message_id: &str, reaction: Option<Reaction>) {
        self.command(Command::SetReaction {
            message_id: message_id.to_string(),
            reaction,
        });
    }

    pub fn set_comment(&self, message_id: &str, comment: &str) {
        self.command(Command::SetComment {
            message_id: message_id.to_string(),
            comment: comment.to_string(),
        });
    }

    /// Close the connection and stop the loop.
    pub async fn shutdown(self) {
        let _ = self.commands_tx.send(Command::Shutdown);
        let _ = self.task.await;
    }

    fn command(&self, cmd: Command) {
        if self.commands_tx.send(cmd).is_err() {
            warn!("[client] Command dropped; loop is gone");
        }
    }
}

// ── Loop plumbing ──────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Activate { conversation_id: String },
    NewConversation,
    RefreshConversations,
    Send { text: String },
    SetReaction { message_id: String, reaction: Option<Reaction> },
    SetComment { message_id: String, comment: String },
    Shutdown,
}

/// Results of spawned HTTP futures, posted back into the loop. Each one
/// names the conversation it was started for so stale results can be
/// discarded after a switch.
enum Completion {
    ConversationsListed(crate::atoms::error::ClientResult<Vec<Conversation>>),
    HistoryLoaded(HistoryLoad),
    FeedbackFetched {
        conversation_id: String,
        message_id: String,
        feedback: Option<Feedback>,
    },
    FeedbackSettled {
        conversation_id: String,
        message_id: String,
        ok: bool,
    },
}

enum Step {
    Command(Option<Command>),
    Completion(Completion),
    Frame(Option<ServerFrame>),
    ConnState(Option<ConnectionState>),
    FlushDue,
    StallDue,
}

enum AnnotationEdit {
    Reaction(Option<Reaction>),
    Comment(String),
}

/// Everything owned by the currently active conversation. Replaced, never
/// mutated across, on switch.
struct Session {
    conversation: Conversation,
    transcript: Transcript,
    feedback: FeedbackBook,
    connection: Option<Connection>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    frames_rx: Option<mpsc::Receiver<ServerFrame>>,
    /// Token-buffer idle flush deadline.
    flush_at: Option<Instant>,
    /// Safety timeout for a turn awaiting finalization.
    stall_at: Option<Instant>,
    history_pending: bool,
}

struct ClientLoop {
    cfg: ClientConfig,
    api: ApiClient,
    conversations: Vec<Conversation>,
    session: Option<Session>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    snapshot: Arc<Mutex<ClientSnapshot>>,
}

async fn recv_or_pending<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn state_or_pending(
    rx: Option<&mut watch::Receiver<ConnectionState>>,
) -> Option<ConnectionState> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ClientLoop {
    async fn run(mut self) {
        info!("[client] Loop started (api {})", self.cfg.rest_base());
        self.spawn_list_conversations();

        loop {
            let step = {
                let (frames_rx, state_rx, flush_at, stall_at) = match self.session.as_mut() {
                    Some(s) => (
                        s.frames_rx.as_mut(),
                        s.state_rx.as_mut(),
                        s.flush_at,
                        s.stall_at,
                    ),
                    None => (None, None, None, None),
                };
                tokio::select! {
                    cmd = self.commands_rx.recv() => Step::Command(cmd),
                    Some(done) = self.completions_rx.recv() => Step::Completion(done),
                    frame = recv_or_pending(frames_rx) => Step::Frame(frame),
                    state = state_or_pending(state_rx) => Step::ConnState(state),
                    _ = sleep_or_pending(flush_at) => Step::FlushDue,
                    _ = sleep_or_pending(stall_at) => Step::StallDue,
                }
            };

            match step {
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => {
                    self.shutdown().await;
                    break;
                }
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Completion(done) => self.handle_completion(done),
                Step::Frame(Some(frame)) => self.handle_frame(frame),
                Step::Frame(None) => {
                    // Socket task gone; the channel stays silent from here.
                    if let Some(s) = self.session.as_mut() {
                        s.frames_rx = None;
                    }
                    self.sync(false);
                }
                Step::ConnState(state) => {
                    if state.is_none() {
                        if let Some(s) = self.session.as_mut() {
                            s.state_rx = None;
                        }
                    }
                    self.sync(false);
                }
                Step::FlushDue => self.flush_due(),
                Step::StallDue => self.stall_due(),
            }
        }
        info!("[client] Loop stopped");
    }

    async fn shutdown(&mut self) {
        if let Some(old) = self.session.take() {
            if let Some(conn) = old.connection {
                conn.close(CloseReason::Shutdown).await;
            }
        }
    }

    // ── Commands ───────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        debug!("[client] Command {:?}", cmd);
        match cmd {
            Command::Activate { conversation_id } => {
                let conversation = self
                    .conversations
                    .iter()
                    .find(|c| c.id == conversation_id)
                    .cloned()
                    .unwrap_or_else(|| Conversation {
                        id: conversation_id.clone(),
                        title: String::new(),
                        created_at: chrono::Utc::now().to_rfc3339(),
                    });
                self.activate(conversation, false).await;
            }
            Command::NewConversation => {
                let conversation = Conversation::new_local("New chat");
                self.conversations.insert(0, conversation.clone());
                self.emit(ClientEvent::ConversationsChanged);
                self.activate(conversation, true).await;
            }
            Command::RefreshConversations => self.spawn_list_conversations(),
            Command::Send { text } => self.handle_send(&text),
            Command::SetReaction {
                message_id,
                reaction,
            } => self.annotate(message_id, AnnotationEdit::Reaction(reaction)),
            Command::SetComment {
                message_id,
                comment,
            } => self.annotate(message_id, AnnotationEdit::Comment(comment)),
            Command::Shutdown => {}
        }
    }

    /// Switch the active conversation. The old session's connection closes
    /// before the new one opens; everything else it owned dies with it.
    /// `fresh` marks a conversation minted locally a moment ago: it has no
    /// server-side history to fetch.
    async fn activate(&mut self, conversation: Conversation, fresh: bool) {
        if self
            .session
            .as_ref()
            .map(|s| s.conversation.id == conversation.id)
            .unwrap_or(false)
        {
            debug!("[client] {} is already active", conversation.id);
            return;
        }
        if let Some(old) = self.session.take() {
            info!("[client] Leaving conversation {}", old.conversation.id);
            if let Some(conn) = old.connection {
                conn.close(CloseReason::Switch).await;
            }
        }
        info!("[client] Activating conversation {}", conversation.id);

        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (connection, state_rx) = match Connection::open(&self.cfg, &conversation.id, frames_tx)
        {
            Ok(conn) => {
                let rx = conn.subscribe_state();
                (Some(conn), Some(rx))
            }
            Err(e) => {
                info!(
                    "[client] Socket for {} stays closed: {}",
                    conversation.id, e
                );
                (None, None)
            }
        };

        let mut session = Session {
            transcript: Transcript::new(conversation.id.clone()),
            conversation,
            feedback: FeedbackBook::new(),
            connection,
            state_rx,
            frames_rx: Some(frames_rx),
            flush_at: None,
            stall_at: None,
            history_pending: !fresh,
        };
        if fresh {
            if let Some(welcome) = self.cfg.welcome_message.as_deref().filter(|w| !w.is_empty()) {
                session.transcript.push_welcome(welcome);
            }
        }
        let conversation_id = session.conversation.id.clone();
        self.session = Some(session);
        if !fresh {
            self.spawn_history_load(conversation_id);
        }
        self.sync(true);
    }

    fn handle_send(&mut self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let open = self
            .session
            .as_ref()
            .and_then(|s| s.connection.as_ref())
            .map(|c| c.state() == ConnectionState::Open)
            .unwrap_or(false);
        if !open {
            let detail = if self.session.is_none() {
                "no active conversation"
            } else {
                "connection not open"
            };
            self.notice(NoticeKind::SendRefused, Some(detail.into()));
            return;
        }
        let Some(s) = self.session.as_mut() else {
            return;
        };

        s.transcript.push_user(trimmed);
        let frame = OutboundFrame {
            message: trimmed.to_string(),
            user_id: self.cfg.user_id.clone(),
        };
        if let Some(conn) = s.connection.as_ref() {
            if !conn.send(frame) {
                // Lost the race with a closure; the stall deadline cleans
                // the turn up.
                warn!("[client] Outbound frame dropped mid-send");
            }
        }
        s.stall_at = Some(Instant::now() + Duration::from_secs(STREAM_STALL_TIMEOUT_SECS));
        self.sync(true);
        self.propagate_title();
    }

    fn annotate(&mut self, message_id: String, edit: AnnotationEdit) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        // Feedback attaches to assistant replies only; a durable-id user
        // message from history is not annotatable.
        let Some(content) = s
            .transcript
            .messages()
            .iter()
            .find(|m| m.id == message_id && m.role == Role::Assistant)
            .map(|m| m.content.clone())
        else {
            debug!(
                "[client] No assistant message {} to annotate; ignoring",
                message_id
            );
            return;
        };
        let annotation = match edit {
            AnnotationEdit::Reaction(reaction) => s.feedback.set_reaction(&message_id, reaction),
            AnnotationEdit::Comment(comment) => s.feedback.set_comment(&message_id, &comment),
        };
        let Some(annotation) = annotation else {
            return;
        };
        let submission = FeedbackSubmission {
            interaction_id: message_id,
            session_id: s.conversation.id.clone(),
            bot_message: content,
            reaction: annotation.reaction,
            comment: annotation.comment,
        };
        let conversation_id = s.conversation.id.clone();
        self.spawn_feedback_submit(conversation_id, submission);
        self.sync(true);
    }

    // ── Socket frames ──────────────────────────────────────────────────

    fn handle_frame(&mut self, frame: ServerFrame) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        match frame {
            ServerFrame::StreamStart { agent } => {
                if s.transcript.begin_stream(agent.as_deref()) {
                    self.sync(true);
                }
            }
            ServerFrame::StreamToken { token, agent } => {
                match s.transcript.push_token(&token, agent.as_deref()) {
                    TokenPush::Buffered => {
                        s.flush_at =
                            Some(Instant::now() + Duration::from_millis(STREAM_FLUSH_IDLE_MS));
                    }
                    TokenPush::Flushed => {
                        s.flush_at = None;
                        self.sync(true);
                    }
                }
            }
            ServerFrame::StreamEnd {
                message,
                agent,
                metadata,
                id,
            } => {
                let conversation_id = s.conversation.id.clone();
                let out = s.transcript.finalize_stream(&message, agent, metadata, id);
                if out.completed {
                    s.flush_at = None;
                    s.stall_at = None;
                }
                self.sync(out.changed);
                self.propagate_title();
                if let Some(message_id) = out.feedback_lookup {
                    self.spawn_feedback_fetch(conversation_id, message_id);
                }
            }
            ServerFrame::Response {
                message,
                agent,
                metadata,
            } => {
                let changed = s.transcript.apply_response(&message, agent, metadata);
                s.stall_at = None;
                self.sync(changed);
                self.propagate_title();
            }
            ServerFrame::Error { message } => {
                s.transcript.apply_error(&message);
                s.stall_at = None;
                self.sync(true);
            }
        }
    }

    // ── Deadlines ──────────────────────────────────────────────────────

    fn flush_due(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        s.flush_at = None;
        if s.transcript.flush_tokens() {
            self.sync(true);
        }
    }

    fn stall_due(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        s.stall_at = None;
        if s.transcript.stall_timeout() {
            self.sync(false);
            self.notice(NoticeKind::StreamTimeout, None);
        }
    }

    // ── Completions of spawned work ────────────────────────────────────

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::ConversationsListed(Ok(mut list)) => {
                // A conversation minted locally and not yet materialized
                // stays visible at the top.
                if let Some(s) = &self.session {
                    if !list.iter().any(|c| c.id == s.conversation.id) {
                        list.insert(0, s.conversation.clone());
                    }
                }
                self.conversations = list;
                self.sync(false);
                self.emit(ClientEvent::ConversationsChanged);
            }
            Completion::ConversationsListed(Err(e)) => {
                warn!("[client] Conversation list fetch failed: {}", e);
            }
            Completion::HistoryLoaded(load) => self.commit_history(load),
            Completion::FeedbackFetched {
                conversation_id,
                message_id,
                feedback,
            } => {
                let Some(s) = self.session.as_mut() else {
                    return;
                };
                if s.conversation.id != conversation_id {
                    debug!("[client] Discarding stale feedback for {}", message_id);
                    return;
                }
                s.feedback.merge_one(&message_id, feedback);
                self.sync(true);
            }
            Completion::FeedbackSettled {
                conversation_id,
                message_id,
                ok,
            } => {
                let Some(s) = self.session.as_mut() else {
                    return;
                };
                if s.conversation.id != conversation_id {
                    return;
                }
                s.feedback.settle(&message_id, ok);
                if !ok {
                    self.notice(
                        NoticeKind::FeedbackFailed,
                        Some(format!("submission for {} failed", message_id)),
                    );
                }
            }
        }
    }

    /// Install a resolved history load, unless the active conversation has
    /// moved on since the fetch started.
    fn commit_history(&mut self, load: HistoryLoad) {
        let Some(s) = self.session.as_mut() else {
            debug!("[client] Discarding history; no active conversation");
            return;
        };
        if s.conversation.id != load.conversation_id {
            debug!(
                "[client] Discarding stale history for {} (active is {})",
                load.conversation_id, s.conversation.id
            );
            return;
        }
        if !s.history_pending {
            debug!(
                "[client] Duplicate history load for {}; ignoring",
                load.conversation_id
            );
            return;
        }
        s.history_pending = false;
        s.transcript.commit_history(load.messages);
        s.feedback.merge(load.feedback);
        if !load.degraded && s.transcript.messages().is_empty() {
            if let Some(welcome) = self.cfg.welcome_message.as_deref().filter(|w| !w.is_empty()) {
                s.transcript.push_welcome(welcome);
            }
        }
        self.sync(true);
        self.propagate_title();
        if load.degraded {
            self.notice(NoticeKind::HistoryUnavailable, None);
        }
    }

    // ── Title upkeep ───────────────────────────────────────────────────

    /// Push a rederived title to the collaborator and the local directory.
    /// No-op while the derived title matches what was last propagated or
    /// what the server already has.
    fn propagate_title(&mut self) {
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let Some(title) = s.transcript.title_update() else {
            return;
        };
        if title == s.conversation.title {
            return;
        }
        s.conversation.title = title.clone();
        let conversation_id = s.conversation.id.clone();
        if let Some(entry) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            entry.title = title.clone();
        }

        let api = self.api.clone();
        let (cid, t) = (conversation_id.clone(), title.clone());
        tokio::spawn(async move {
            if let Err(e) = api.rename_conversation(&cid, &t).await {
                warn!("[client] Title save for {} failed: {}", cid, e);
            }
        });

        self.sync(false);
        self.emit(ClientEvent::TitleChanged {
            conversation_id,
            title,
        });
    }

    // ── Spawned HTTP work ──────────────────────────────────────────────

    fn spawn_list_conversations(&self) {
        let api = self.api.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.list_conversations().await;
            let _ = tx.send(Completion::ConversationsListed(result));
        });
    }

    fn spawn_history_load(&self, conversation_id: String) {
        let api = self.api.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let load = load_history(&api, &conversation_id).await;
            let _ = tx.send(Completion::HistoryLoaded(load));
        });
    }

    fn spawn_feedback_fetch(&self, conversation_id: String, message_id: String) {
        let api = self.api.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let feedback = match api.fetch_feedback(&message_id).await {
                Ok(fb) => fb,
                Err(e) => {
                    debug!("[client] Feedback lookup for {} failed: {}", message_id, e);
                    None
                }
            };
            let _ = tx.send(Completion::FeedbackFetched {
                conversation_id,
                message_id,
                feedback,
            });
        });
    }

    fn spawn_feedback_submit(&self, conversation_id: String, submission: FeedbackSubmission) {
        let api = self.api.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let ok = match api.submit_feedback(&submission).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "[client] Feedback submission for {} failed: {}",
                        submission.interaction_id, e
                    );
                    false
                }
            };
            let _ = tx.send(Completion::FeedbackSettled {
                conversation_id,
                message_id: submission.interaction_id,
                ok,
            });
        });
    }

    // ── Snapshot & events ──────────────────────────────────────────────

    /// Rebuild the shared snapshot and emit change events. Loading and
    /// connection transitions are detected here so handlers never have to
    /// track them.
    fn sync(&mut self, transcript_changed: bool) {
        let fresh = self.build_snapshot();
        let (was_loading, was_connection) = {
            let mut guard = self.snapshot.lock();
            let prev = (guard.loading, guard.connection);
            *guard = fresh.clone();
            prev
        };
        if transcript_changed {
            self.emit(ClientEvent::TranscriptChanged);
        }
        if fresh.loading != was_loading {
            self.emit(ClientEvent::LoadingChanged {
                loading: fresh.loading,
            });
        }
        if fresh.connection != was_connection {
            info!("[client] Connection is {:?}", fresh.connection);
            self.emit(ClientEvent::ConnectionChanged {
                state: fresh.connection,
            });
        }
    }

    fn build_snapshot(&self) -> ClientSnapshot {
        match &self.session {
            Some(s) => ClientSnapshot {
                conversations: self.conversations.clone(),
                active: Some(s.conversation.clone()),
                messages: s.transcript.messages().to_vec(),
                feedback: s.feedback.entries().clone(),
                connection: s
                    .connection
                    .as_ref()
                    .map(|c| c.state())
                    .unwrap_or(ConnectionState::Closed),
                loading: s.transcript.loading(),
            },
            None => ClientSnapshot {
                conversations: self.conversations.clone(),
                ..ClientSnapshot::default()
            },
        }
    }

    fn notice(&self, notice: NoticeKind, detail: Option<String>) {
        let suffix = detail
            .as_deref()
            .map(|d| format!(": {}", d))
            .unwrap_or_default();
        match notice.severity() {
            Severity::Error => error!("[client] Notice {:?}{}", notice, suffix),
            Severity::Warning => warn!("[client] Notice {:?}{}", notice, suffix),
        }
        self.emit(ClientEvent::Notice { notice, detail });
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DURABLE: &str = "a1b2c3d4-e5f6-4789-8abc-def012345678";
    const DURABLE_B: &str = "b1b2c3d4-e5f6-4789-8abc-def012345678";

    fn conv(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            title: "New chat".to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Loop with no credential: connections stay closed, no socket I/O.
    fn test_loop(cfg: ClientConfig) -> (ClientLoop, mpsc::UnboundedReceiver<ClientEvent>) {
        let api = ApiClient::new(&cfg);
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let lp = ClientLoop {
            cfg,
            api,
            conversations: Vec::new(),
            session: None,
            commands_rx,
            completions_tx,
            completions_rx,
            events_tx,
            snapshot: Arc::new(Mutex::new(ClientSnapshot::default())),
        };
        (lp, events_rx)
    }

    fn drained(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn late_history_for_previous_conversation_is_discarded() {
        let (mut lp, _events) = test_loop(ClientConfig::default());
        lp.activate(conv("conv-a"), true).await;
        lp.activate(conv("conv-b"), false).await;

        // The load for conv-a resolves only now; conv-b is active.
        lp.commit_history(HistoryLoad {
            conversation_id: "conv-a".into(),
            messages: vec![ChatMessage::local(Role::User, "old thread")],
            feedback: HashMap::new(),
            degraded: false,
        });
        let s = lp.session.as_ref().unwrap();
        assert_eq!(s.conversation.id, "conv-b");
        assert!(s.transcript.messages().is_empty());
        assert!(s.history_pending);

        lp.commit_history(HistoryLoad {
            conversation_id: "conv-b".into(),
            messages: vec![ChatMessage::local(Role::User, "current thread")],
            feedback: HashMap::new(),
            degraded: false,
        });
        let s = lp.session.as_ref().unwrap();
        assert_eq!(s.transcript.messages().len(), 1);
        assert_eq!(s.transcript.messages()[0].content, "current thread");
        assert!(!s.history_pending);
    }

    #[tokio::test]
    async fn history_commits_at_most_once() {
        let (mut lp, _events) = test_loop(ClientConfig::default());
        lp.activate(conv("conv-a"), false).await;
        lp.commit_history(HistoryLoad {
            conversation_id: "conv-a".into(),
            messages: vec![ChatMessage::local(Role::User, "first")],
            feedback: HashMap::new(),
            degraded: false,
        });
        // A duplicate resolution must not clobber live state.
        lp.commit_history(HistoryLoad {
            conversation_id: "conv-a".into(),
            messages: Vec::new(),
            feedback: HashMap::new(),
            degraded: false,
        });
        let s = lp.session.as_ref().unwrap();
        assert_eq!(s.transcript.messages().len(), 1);
    }

    #[tokio::test]
    async fn degraded_history_opens_empty_with_notice() {
        let (mut lp, mut events) = test_loop(ClientConfig {
            welcome_message: Some("Hi! How can we help?".into()),
            ..ClientConfig::default()
        });
        lp.activate(conv("conv-a"), false).await;
        lp.commit_history(HistoryLoad {
            conversation_id: "conv-a".into(),
            messages: Vec::new(),
            feedback: HashMap::new(),
            degraded: true,
        });
        let s = lp.session.as_ref().unwrap();
        // Degraded loads get no banner, only the notice.
        assert!(s.transcript.messages().is_empty());
        assert!(drained(&mut events).iter().any(|ev| matches!(
            ev,
            ClientEvent::Notice {
                notice: NoticeKind::HistoryUnavailable,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn empty_history_gets_welcome_banner() {
        let (mut lp, _events) = test_loop(ClientConfig {
            welcome_message: Some("Hi! How can we help?".into()),
            ..ClientConfig::default()
        });
        lp.activate(conv("conv-a"), false).await;
        lp.commit_history(HistoryLoad {
            conversation_id: "conv-a".into(),
            messages: Vec::new(),
            feedback: HashMap::new(),
            degraded: false,
        });
        let s = lp.session.as_ref().unwrap();
        assert_eq!(s.transcript.messages().len(), 1);
        assert_eq!(s.transcript.messages()[0].content, "Hi! How can we help?");
    }

    #[tokio::test]
    async fn fresh_conversation_banners_without_history_fetch() {
        let (mut lp, _events) = test_loop(ClientConfig {
            welcome_message: Some("Hello!".into()),
            ..ClientConfig::default()
        });
        lp.activate(conv("session-1-ab"), true).await;
        let s = lp.session.as_ref().unwrap();
        assert!(!s.history_pending);
        assert_eq!(s.transcript.messages().len(), 1);
        assert_eq!(s.transcript.messages()[0].content, "Hello!");
    }

    #[tokio::test]
    async fn send_without_open_connection_is_refused() {
        let (mut lp, mut events) = test_loop(ClientConfig::default());
        lp.activate(conv("conv-a"), true).await;
        lp.handle_send("hello?");

        let s = lp.session.as_ref().unwrap();
        assert!(s.transcript.messages().is_empty());
        assert!(!s.transcript.loading());
        assert!(s.stall_at.is_none());
        assert!(drained(&mut events).iter().any(|ev| matches!(
            ev,
            ClientEvent::Notice {
                notice: NoticeKind::SendRefused,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn user_messages_cannot_be_annotated() {
        let (mut lp, _events) = test_loop(ClientConfig::default());
        lp.activate(conv("conv-a"), false).await;
        let mut user = ChatMessage::local(Role::User, "how do I reset my password?");
        user.id = DURABLE.into();
        let mut bot = ChatMessage::local(Role::Assistant, "Use the account portal.");
        bot.id = DURABLE_B.into();
        lp.commit_history(HistoryLoad {
            conversation_id: "conv-a".into(),
            messages: vec![user, bot],
            feedback: HashMap::new(),
            degraded: false,
        });

        lp.annotate(DURABLE.into(), AnnotationEdit::Reaction(Some(Reaction::Like)));
        assert!(lp.session.as_ref().unwrap().feedback.get(DURABLE).is_none());

        lp.annotate(DURABLE_B.into(), AnnotationEdit::Reaction(Some(Reaction::Like)));
        assert_eq!(
            lp.session.as_ref().unwrap().feedback.get(DURABLE_B).unwrap().reaction,
            Some(Reaction::Like)
        );
    }

    #[tokio::test]
    async fn stale_feedback_fetch_is_ignored() {
        let (mut lp, _events) = test_loop(ClientConfig::default());
        lp.activate(conv("conv-b"), true).await;

        let liked = Feedback {
            reaction: Some(Reaction::Like),
            comment: None,
        };
        lp.handle_completion(Completion::FeedbackFetched {
            conversation_id: "conv-a".into(),
            message_id: DURABLE.into(),
            feedback: Some(liked.clone()),
        });
        assert!(lp.session.as_ref().unwrap().feedback.get(DURABLE).is_none());

        lp.handle_completion(Completion::FeedbackFetched {
            conversation_id: "conv-b".into(),
            message_id: DURABLE.into(),
            feedback: Some(liked),
        });
        assert!(lp.session.as_ref().unwrap().feedback.get(DURABLE).is_some());
    }

    #[tokio::test]
    async fn stream_frames_drive_deadlines_and_loading() {
        let (mut lp, _events) = test_loop(ClientConfig::default());
        lp.activate(conv("conv-a"), true).await;

        lp.handle_frame(ServerFrame::StreamStart {
            agent: Some("triage".into()),
        });
        let s = lp.session.as_ref().unwrap();
        assert!(s.transcript.loading());
        assert!(s.flush_at.is_none());

        lp.handle_frame(ServerFrame::StreamToken {
            token: "Try ".into(),
            agent: None,
        });
        assert!(lp.session.as_ref().unwrap().flush_at.is_some());

        lp.handle_frame(ServerFrame::StreamEnd {
            message: "Try restarting it.".into(),
            agent: Some("triage".into()),
            metadata: Default::default(),
            id: None,
        });
        let s = lp.session.as_ref().unwrap();
        assert!(s.flush_at.is_none());
        assert!(s.stall_at.is_none());
        assert!(!s.transcript.loading());
        assert_eq!(lp.snapshot.lock().messages.len(), 1);
        assert_eq!(lp.snapshot.lock().messages[0].content, "Try restarting it.");
    }

    #[tokio::test]
    async fn stall_fire_emits_timeout_notice() {
        let (mut lp, mut events) = test_loop(ClientConfig::default());
        lp.activate(conv("conv-a"), true).await;
        lp.handle_frame(ServerFrame::StreamStart { agent: None });
        lp.session.as_mut().unwrap().stall_at = Some(Instant::now());

        lp.stall_due();
        let s = lp.session.as_ref().unwrap();
        assert!(!s.transcript.loading());
        assert!(s.stall_at.is_none());
        assert!(drained(&mut events).iter().any(|ev| matches!(
            ev,
            ClientEvent::Notice {
                notice: NoticeKind::StreamTimeout,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn title_propagates_once_and_mirrors_directory() {
        let (mut lp, mut events) = test_loop(ClientConfig::default());
        lp.conversations.push(conv("conv-a"));
        lp.activate(conv("conv-a"), true).await;

        lp.session
            .as_mut()
            .unwrap()
            .transcript
            .push_user("printer broken");
        lp.propagate_title();
        lp.propagate_title();

        assert_eq!(lp.conversations[0].title, "printer broken");
        assert_eq!(
            lp.session.as_ref().unwrap().conversation.title,
            "printer broken"
        );
        let titles: Vec<_> = drained(&mut events)
            .into_iter()
            .filter(|ev| matches!(ev, ClientEvent::TitleChanged { .. }))
            .collect();
        assert_eq!(titles.len(), 1);
    }

    #[tokio::test]
    async fn handle_drives_loop_and_snapshot() {
        let client = ChatClient::start(ClientConfig::default()).unwrap();
        client.new_conversation();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if client.snapshot().active.is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "loop never activated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = client.snapshot();
        let active = snap.active.unwrap();
        assert!(active.id.starts_with("session-"));
        assert_eq!(active.title, "New chat");
        assert_eq!(snap.connection, ConnectionState::Closed);
        assert!(snap.conversations.iter().any(|c| c.id == active.id));

        client.shutdown().await;
    }
}
