// Deskline Chat Engine
//
// Headless client core for a support-desk chat: it owns the message
// transcript of the active conversation, reconciles the live socket
// stream into it (token batching, idempotent finalization, echo
// suppression, human-relay handling), and keeps history, feedback
// annotations, and conversation titles in sync with the collaborator
// over REST.
//
// Embedders start a `ChatClient`, drive it with fire-and-forget commands,
// and render from `snapshot()` plus the `ClientEvent` stream:
//
// ```no_run
// use deskline::{ChatClient, ClientConfig};
//
// # async fn demo() -> deskline::ClientResult<()> {
// let client = ChatClient::start(ClientConfig::from_env()?)?;
// client.new_conversation();
// client.send_message("my printer is broken");
// # Ok(())
// # }
// ```

pub mod atoms;
pub mod engine;

pub use atoms::error::{ClientError, ClientResult};
pub use atoms::types::{
    ChatMessage, ClientEvent, ConnectionState, Conversation, Feedback, NoticeKind, Reaction, Role,
    ServerFrame, Severity,
};
pub use engine::client::{ChatClient, ClientSnapshot};
pub use engine::config::ClientConfig;
