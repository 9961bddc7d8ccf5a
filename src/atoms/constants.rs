// ── Deskline Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here, grouped by the component
// that consumes them. Timing values carry their unit in the name.

// ── Socket connection manager ──────────────────────────────────────────────
// Used by `engine/connection.rs`.
//
// An abnormal closure schedules exactly one reconnect attempt after this
// delay; intentional closes and do-not-retry close codes skip it entirely.
pub(crate) const RECONNECT_DELAY_SECS: u64 = 3;
// Keepalive ping cadence while the socket is open. The collaborator never
// pings first, so the client keeps NAT mappings warm itself.
pub(crate) const SOCKET_KEEPALIVE_SECS: u64 = 60;

// ── Stream reconciliation engine ───────────────────────────────────────────
// Used by `engine/transcript.rs` and the client loop's deadline handling.
//
// Token frames accumulate in a per-turn buffer; the buffer is flushed into
// the in-flight message after this idle window, or immediately once it
// grows past the threshold, whichever comes first.
pub(crate) const STREAM_FLUSH_IDLE_MS: u64 = 150;
pub(crate) const STREAM_FLUSH_THRESHOLD_CHARS: usize = 50;

// A turn with no finalization frame within this window is abandoned: the
// streaming pointer and buffer are discarded and the loading flag cleared.
pub(crate) const STREAM_STALL_TIMEOUT_SECS: u64 = 60;

// Finalization dedup hashes only this many leading characters of the
// trimmed final text. Texts that diverge only after this prefix share a
// dedup key, and the engine logs every drop taken on that basis.
pub(crate) const DEDUP_PREFIX_CHARS: usize = 150;

// Minimum trimmed length before an earlier byte-identical message is
// treated as an echo duplicate during finalization. Short acknowledgements
// ("ok", "yes") legitimately repeat across turns.
pub(crate) const ECHO_DEDUP_MIN_CHARS: usize = 10;

// Agent label carried by an in-flight assistant message. Overwritten at
// finalization; must never survive into a finalized transcript entry.
pub(crate) const PROCESSING_AGENT: &str = "processing";

// Derived conversation titles truncate to this many characters (plus an
// ellipsis when truncated).
pub(crate) const TITLE_MAX_CHARS: usize = 30;

// ── Identifier prefixes ────────────────────────────────────────────────────
// Ephemeral ids are minted locally and replaced by collaborator UUIDs at
// finalization. The prefixes keep them trivially distinguishable in logs.
pub(crate) const LOCAL_ID_PREFIX: &str = "local";
pub(crate) const SESSION_ID_PREFIX: &str = "session";

// ── Metadata keys ──────────────────────────────────────────────────────────
// Recognized keys in the otherwise-opaque message metadata bag. Everything
// else passes through untouched.
//
// Marks an assistant entry forwarded verbatim from a live human operator.
pub(crate) const META_HUMAN_RELAYED: &str = "human_relayed";
// A relayed frame with empty text and this flag set is suppressed entirely;
// it exists only to clear the loading indicator.
pub(crate) const META_SILENT: &str = "silent";
