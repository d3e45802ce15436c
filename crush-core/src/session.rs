//! Per-client differential synchronization state.
//!
//! A [`Session`] owns the live document, its shadow copy (the last text known
//! to be shared with peers) and the language selection. It performs no I/O:
//! the owner calls [`Session::tick`] on a fixed period and feeds every inbound
//! message to [`Session::handle`], sending whatever they return.
//!
//! ```text
//!   local edits ──► text ──tick──► diff(shadow, text) ──► patch ──► peers
//!                                  shadow := text
//!   peers ──► patch ──► apply to text, apply to shadow
//!   peers ──► full  ──► text := shadow := snapshot
//! ```
//!
//! Inbound changes bump a text revision. A host report that was typed on an
//! older revision is rebased with [`Session::set_text_at`] instead of
//! replacing the text outright.

use std::collections::VecDeque;

use thiserror::Error;

use crate::identity::ClientId;
use crate::language::Language;
use crate::patch::{self, PatchError, PatchSet};
use crate::protocol::{Body, Message, ProtocolError, SnapshotStamp};

/// Ticks after the first adopted snapshot before a resync round closes.
pub const RESYNC_SETTLE_TICKS: u32 = 2;
/// Published revisions kept for rebasing stale host edits.
const REVISION_HISTORY: usize = 32;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Undecodable patch from client {from}: {source}")]
    Patch {
        from: ClientId,
        #[source]
        source: PatchError,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// What handling one inbound message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Our own broadcast came back; nothing changed.
    SelfEcho,
    /// A peer patch was applied to both text and shadow.
    Patched { applied: usize, skipped: usize },
    /// Must be sent back to peers.
    Reply(Message),
    /// Text and shadow were overwritten by a snapshot.
    Replaced,
    /// A snapshot older than one already adopted in this resync round.
    StaleSnapshot,
    /// Execution output for the host to display.
    Results(String),
    LanguageChanged {
        language: Language,
        document_empty: bool,
    },
    /// Relay-bound message with no effect on clients.
    Ignored,
}

/// Host-visible state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub text: String,
    pub language: Language,
    pub clock: u64,
    /// Revision of `text`; pass it back with edits based on it.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ResyncRound {
    best: Option<SnapshotStamp>,
    settle_ticks: u32,
}

#[derive(Debug)]
pub struct Session {
    id: ClientId,
    text: String,
    shadow: String,
    language: Language,
    /// Logical clock: bumped per emitted patch, raised to any clock seen.
    clock: u64,
    resync: Option<ResyncRound>,
    /// Bumped whenever inbound traffic changes the text under the host.
    revision: u64,
    /// The host's last reported buffer and the revision it was based on.
    host_revision: u64,
    host_text: String,
    /// Texts published after `host_revision`, oldest first.
    published: VecDeque<(u64, String)>,
}

impl Session {
    /// An empty Python document at clock 0 and revision 0.
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            text: String::new(),
            shadow: String::new(),
            language: Language::default(),
            clock: 0,
            resync: None,
            revision: 0,
            host_revision: 0,
            host_text: String::new(),
            published: VecDeque::new(),
        }
    }

    pub fn with_random_id() -> Self {
        Self::new(ClientId::random())
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn shadow(&self) -> &str {
        &self.shadow
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn resync_pending(&self) -> bool {
        self.resync.is_some()
    }

    /// Current text revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            text: self.text.clone(),
            language: self.language,
            clock: self.clock,
            revision: self.revision,
        }
    }

    /// Replace the live text with the host's current editor contents.
    ///
    /// The host must have seen every revision so far; use
    /// [`Session::set_text_at`] when that is not guaranteed.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.host_revision = self.revision;
        self.host_text.clone_from(&text);
        self.published.clear();
        self.text = text;
    }

    /// Take the host's buffer, which was edited on top of `based_on`.
    ///
    /// If inbound changes landed after `based_on`, the host's own edit is
    /// rebased onto the current text instead of overwriting it. Returns
    /// `true` when that produced a new revision the host has not seen.
    pub fn set_text_at(&mut self, based_on: u64, text: impl Into<String>) -> bool {
        let text = text.into();
        if based_on >= self.revision {
            self.set_text(text);
            return false;
        }

        let base = if based_on == self.host_revision {
            self.host_text.as_str()
        } else {
            self.published
                .iter()
                .find(|(revision, _)| *revision == based_on)
                .map_or(self.host_text.as_str(), |(_, text)| text.as_str())
        };
        let edit = patch::make_patch(base, &text);
        self.published.retain(|(revision, _)| *revision > based_on);
        self.host_revision = based_on;
        self.host_text = text;
        if edit.is_empty() {
            return false;
        }

        let rebased = edit.apply(&self.text);
        if rebased.skipped() > 0 {
            log::debug!(
                "client {}: {} hunk(s) of a stale host edit did not match",
                self.id,
                rebased.skipped()
            );
        }
        self.text = rebased.text;
        self.publish();
        true
    }

    /// Change the language locally; the returned message announces it.
    pub fn set_language(&mut self, language: Language) -> Message {
        self.language = language;
        Message::language(self.id, language)
    }

    /// Execution request for the current text.
    pub fn run_request(&self) -> Message {
        Message::run(self.id, self.text.clone(), self.language)
    }

    /// The inbound channel (re)connected: open a resync round and ask peers
    /// for a snapshot.
    pub fn on_connected(&mut self) -> Message {
        self.resync = Some(ResyncRound::default());
        Message::sync_request(self.id)
    }

    /// Repeat the sync request if a round is still waiting for answers.
    pub fn pending_resync_request(&self) -> Option<Message> {
        self.resync
            .filter(|round| round.best.is_none())
            .map(|_| Message::sync_request(self.id))
    }

    /// One sync period: emit a patch from shadow to text if they differ.
    pub fn tick(&mut self) -> Option<Message> {
        self.settle_resync();
        if self.text == self.shadow {
            return None;
        }

        let patch = patch::make_patch(&self.shadow, &self.text);
        if patch.is_empty() {
            return None;
        }
        self.shadow.clone_from(&self.text);
        self.clock += 1;
        // Local edits have moved past whatever the round was waiting for.
        self.resync = None;
        log::trace!(
            "client {} emits patch with {} hunk(s) at clock {}",
            self.id,
            patch.hunks().len(),
            self.clock
        );
        Some(Message::patch(self.id, patch.to_text(), self.clock))
    }

    /// Decode and handle one text frame.
    pub fn receive(&mut self, frame: &str) -> Result<Outcome, SessionError> {
        let message = Message::decode(frame)?;
        self.handle(message)
    }

    /// Dispatch one inbound message.
    ///
    /// Our own echoes are ignored. Patches and snapshots that change the
    /// text publish a new revision. An undecodable patch is an error for
    /// this message only; the session is left untouched.
    pub fn handle(&mut self, message: Message) -> Result<Outcome, SessionError> {
        if message.id == self.id {
            return Ok(Outcome::SelfEcho);
        }
        let stamp = message.snapshot_stamp();
        let from = message.id;

        let outcome = match message.body {
            Body::Patch { patch_text, clock } => {
                let patch = PatchSet::from_text(&patch_text)
                    .map_err(|source| SessionError::Patch { from, source })?;
                let applied = patch.apply(&self.text);
                let changed = applied.text != self.text;
                self.text = applied.text.clone();
                self.shadow = patch.apply(&self.shadow).text;
                self.clock = self.clock.max(clock);
                if changed {
                    self.publish();
                }
                if applied.skipped() > 0 {
                    log::debug!(
                        "patch from client {from}: {} hunk(s) did not match",
                        applied.skipped()
                    );
                }
                Outcome::Patched {
                    applied: applied.applied(),
                    skipped: applied.skipped(),
                }
            }
            Body::SyncRequest => Outcome::Reply(Message::full_text(
                self.id,
                self.text.clone(),
                Some(self.language),
                self.clock,
            )),
            Body::FullText {
                text,
                language,
                version,
            } => {
                if let (Some(round), Some(stamp)) = (self.resync.as_mut(), stamp) {
                    if round.best.is_some_and(|best| stamp < best) {
                        log::debug!("ignoring stale snapshot v{version} from client {from}");
                        return Ok(Outcome::StaleSnapshot);
                    }
                    round.best = Some(stamp);
                }
                self.shadow.clone_from(&text);
                self.text = text;
                self.publish();
                if let Some(language) = language {
                    self.language = language;
                }
                self.clock = self.clock.max(version);
                Outcome::Replaced
            }
            Body::Results(output) => Outcome::Results(output),
            Body::Language(language) => {
                self.language = language;
                Outcome::LanguageChanged {
                    language,
                    document_empty: self.text.is_empty(),
                }
            }
            Body::Run { .. } => Outcome::Ignored,
        };
        Ok(outcome)
    }

    /// Record the current text as a new revision.
    fn publish(&mut self) {
        self.revision += 1;
        if self.published.len() == REVISION_HISTORY {
            self.published.pop_front();
        }
        self.published.push_back((self.revision, self.text.clone()));
    }

    fn settle_resync(&mut self) {
        let Some(round) = self.resync.as_mut() else {
            return;
        };
        if round.best.is_some() {
            round.settle_ticks += 1;
            if round.settle_ticks >= RESYNC_SETTLE_TICKS {
                self.resync = None;
            }
        }
    }
}
