// Deskline Chat Engine — Feedback Annotator
//
// Per-conversation reaction/comment state for assistant messages. Local
// state is authoritative and updates synchronously; submission to the
// collaborator is best-effort and never rolled back. One submission per
// message may be in flight at a time; attempts while busy are ignored,
// not queued.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::atoms::types::{is_durable_id, Feedback, Reaction};

#[derive(Default)]
pub struct FeedbackBook {
    entries: HashMap<String, Feedback>,
    /// Message ids with a submission in flight.
    busy: HashSet<String>,
}

impl FeedbackBook {
    pub fn new() -> Self {
        FeedbackBook::default()
    }

    pub fn get(&self, message_id: &str) -> Option<&Feedback> {
        self.entries.get(message_id)
    }

    pub fn entries(&self) -> &HashMap<String, Feedback> {
        &self.entries
    }

    /// Install the batch fetched by the History Loader.
    pub fn merge(&mut self, fetched: HashMap<String, Feedback>) {
        for (id, fb) in fetched {
            if !fb.is_empty() {
                self.entries.insert(id, fb);
            }
        }
    }

    /// Merge one post-finalization lookup result. Empty annotations are
    /// dropped rather than stored.
    pub fn merge_one(&mut self, message_id: &str, feedback: Option<Feedback>) {
        match feedback {
            Some(fb) if !fb.is_empty() => {
                self.entries.insert(message_id.to_string(), fb);
            }
            _ => {}
        }
    }

    /// Apply a reaction input. `Some` toggles: picking the already-active
    /// reaction clears it, anything else replaces it. `None` clears the
    /// stored reaction unconditionally. Returns the annotation to submit,
    /// or None when the attempt was ignored.
    pub fn set_reaction(
        &mut self,
        message_id: &str,
        reaction: Option<Reaction>,
    ) -> Option<Feedback> {
        if !self.accepts(message_id) {
            return None;
        }
        match reaction {
            Some(reaction) => {
                let entry = self.entries.entry(message_id.to_string()).or_default();
                entry.reaction = if entry.reaction == Some(reaction) {
                    None
                } else {
                    Some(reaction)
                };
            }
            None => match self.entries.get_mut(message_id) {
                Some(entry) if entry.reaction.is_some() => entry.reaction = None,
                // Nothing stored means nothing to clear or submit.
                _ => return None,
            },
        }
        self.commit(message_id)
    }

    /// Replace the comment. Empty text clears it.
    pub fn set_comment(&mut self, message_id: &str, comment: &str) -> Option<Feedback> {
        if !self.accepts(message_id) {
            return None;
        }
        let entry = self.entries.entry(message_id.to_string()).or_default();
        entry.comment = if comment.is_empty() {
            None
        } else {
            Some(comment.to_string())
        };
        self.commit(message_id)
    }

    /// A submission for `message_id` finished (either way). Failures keep
    /// the local annotation; the user's input is never silently reverted.
    pub fn settle(&mut self, message_id: &str, ok: bool) {
        self.busy.remove(message_id);
        if !ok {
            warn!(
                "[feedback] Submission for {} failed; keeping local annotation",
                message_id
            );
        }
    }

    fn accepts(&self, message_id: &str) -> bool {
        if !is_durable_id(message_id) {
            debug!(
                "[feedback] Ignoring annotation for ephemeral id {}",
                message_id
            );
            return false;
        }
        if self.busy.contains(message_id) {
            debug!(
                "[feedback] Submission for {} still in flight; ignoring attempt",
                message_id
            );
            return false;
        }
        true
    }

    /// Snapshot the entry for submission and mark the message busy. A fully
    /// cleared annotation still submits (the collaborator must forget it
    /// too) but drops out of the local map.
    fn commit(&mut self, message_id: &str) -> Option<Feedback> {
        let snapshot = self.entries.get(message_id).cloned().unwrap_or_default();
        if snapshot.is_empty() {
            self.entries.remove(message_id);
        }
        self.busy.insert(message_id.to_string());
        Some(snapshot)
    }
}
