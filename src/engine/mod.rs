// Deskline Chat Engine — Support-desk chat client runtime
// Streaming transcript reconciliation over one WebSocket per conversation,
// with REST-backed history, feedback, and conversation directory.

pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod feedback;
pub mod history;
pub mod transcript;
