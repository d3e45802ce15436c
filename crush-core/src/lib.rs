//! # crush-core — differential synchronization for a shared code buffer
//!
//! Sans-IO building blocks used by every Code Crush client:
//!
//! ```text
//!  host editor ──set_text──► ┌─────────────┐ ──tick──► patch message
//!                            │   Session   │
//!  inbound message ─handle─► │ text/shadow │ ──► Outcome (reply, replaced, ...)
//!                            └──────┬──────┘
//!                                   │ diff / patch
//!                            ┌──────┴──────┐
//!                            │ diff, patch │
//!                            └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`diff`] — Myers diff with merge and semantic cleanup
//! - [`patch`] — context-anchored patches, text format, fuzzy apply
//! - [`protocol`] — JSON wire messages (tagged and legacy shapes)
//! - [`identity`] — per-session client ids
//! - [`language`] — replicated language selection
//! - [`session`] — shadow-copy sync state machine

pub mod diff;
pub mod identity;
pub mod language;
pub mod patch;
pub mod protocol;
pub mod session;

pub use diff::{Edit, EditScript, Op};
pub use identity::ClientId;
pub use language::{Language, UnknownLanguage};
pub use patch::{make_patch, Applied, Hunk, PatchError, PatchSet};
pub use protocol::{Body, Kind, Message, ProtocolError, SnapshotStamp};
pub use session::{Outcome, Session, SessionError, Snapshot};
