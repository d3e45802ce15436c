//! JSON wire protocol shared by clients and the relay.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! { "id": 7301, "kind": "patch", "patch_text": "@@ -0,0 +1,5 @@\n+hello\n", "clock": 3 }
//! { "id": 7301, "kind": "sync",  "sync_needed": true }
//! { "id": 7301, "kind": "full",  "full_text": "...", "language": "Python", "version": 3 }
//! { "id": 7301, "kind": "run",   "type": "run", "full_text": "...", "language": "Ruby" }
//! { "id": 0,    "kind": "result", "results": "line 1\nline 2" }
//! { "id": 7301, "kind": "lang",  "type": "lang", "language": "PHP" }
//! ```
//!
//! `kind` is always written. Frames without it (older peers) are classified
//! by which fields are present, checked in the order
//! patch, sync, run, full, results, lang.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::ClientId;
use crate::language::{Language, UnknownLanguage};

/// Explicit message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Patch,
    Sync,
    Full,
    Run,
    Result,
    Lang,
}

/// Logical version of a full-text snapshot. Ordered by version, then by
/// origin id, so competing snapshots resolve the same way everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotStamp {
    pub version: u64,
    pub origin: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Serialized [`PatchSet`](crate::patch::PatchSet) plus the sender's clock.
    Patch { patch_text: String, clock: u64 },
    /// Ask connected peers for a full snapshot.
    SyncRequest,
    /// Authoritative document snapshot.
    FullText {
        text: String,
        language: Option<Language>,
        version: u64,
    },
    /// Execution request; consumed by the relay.
    Run { code: String, language: Language },
    /// Execution output, newline-delimited.
    Results(String),
    /// Language selection changed.
    Language(Language),
}

/// A protocol message: sender identity plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: ClientId,
    pub body: Body,
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Message matches no known shape")]
    UnknownShape,
    #[error("Message of kind {kind:?} is missing `{field}`")]
    MissingField { kind: Kind, field: &'static str },
    #[error(transparent)]
    Language(#[from] UnknownLanguage),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_needed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    full_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    msg_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    results: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clock: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

impl WireMessage {
    fn tagged(id: ClientId, kind: Kind) -> Self {
        Self {
            id,
            kind: Some(kind),
            patch_text: None,
            sync_needed: None,
            full_text: None,
            language: None,
            msg_type: None,
            results: None,
            clock: None,
            version: None,
        }
    }

    fn legacy_kind(&self) -> Option<Kind> {
        if self.patch_text.is_some() {
            Some(Kind::Patch)
        } else if self.sync_needed == Some(true) {
            Some(Kind::Sync)
        } else if self.msg_type.as_deref() == Some("run") {
            // Legacy relays answer a run request by echoing it with `results`.
            Some(if self.results.is_some() {
                Kind::Result
            } else {
                Kind::Run
            })
        } else if self.full_text.is_some() {
            Some(Kind::Full)
        } else if self.results.is_some() {
            Some(Kind::Result)
        } else if self.msg_type.as_deref() == Some("lang") || self.language.is_some() {
            Some(Kind::Lang)
        } else {
            None
        }
    }
}

impl Message {
    pub fn patch(id: ClientId, patch_text: impl Into<String>, clock: u64) -> Self {
        Self {
            id,
            body: Body::Patch {
                patch_text: patch_text.into(),
                clock,
            },
        }
    }

    pub fn sync_request(id: ClientId) -> Self {
        Self {
            id,
            body: Body::SyncRequest,
        }
    }

    pub fn full_text(
        id: ClientId,
        text: impl Into<String>,
        language: Option<Language>,
        version: u64,
    ) -> Self {
        Self {
            id,
            body: Body::FullText {
                text: text.into(),
                language,
                version,
            },
        }
    }

    pub fn run(id: ClientId, code: impl Into<String>, language: Language) -> Self {
        Self {
            id,
            body: Body::Run {
                code: code.into(),
                language,
            },
        }
    }

    pub fn results(id: ClientId, output: impl Into<String>) -> Self {
        Self {
            id,
            body: Body::Results(output.into()),
        }
    }

    pub fn language(id: ClientId, language: Language) -> Self {
        Self {
            id,
            body: Body::Language(language),
        }
    }

    pub fn kind(&self) -> Kind {
        match self.body {
            Body::Patch { .. } => Kind::Patch,
            Body::SyncRequest => Kind::Sync,
            Body::FullText { .. } => Kind::Full,
            Body::Run { .. } => Kind::Run,
            Body::Results(_) => Kind::Result,
            Body::Language(_) => Kind::Lang,
        }
    }

    /// Stamp of a full-text snapshot, `None` for other kinds.
    pub fn snapshot_stamp(&self) -> Option<SnapshotStamp> {
        match self.body {
            Body::FullText { version, .. } => Some(SnapshotStamp {
                version,
                origin: self.id,
            }),
            _ => None,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut wire = WireMessage::tagged(self.id, self.kind());
        match &self.body {
            Body::Patch { patch_text, clock } => {
                wire.patch_text = Some(patch_text.clone());
                wire.clock = Some(*clock);
            }
            Body::SyncRequest => wire.sync_needed = Some(true),
            Body::FullText {
                text,
                language,
                version,
            } => {
                wire.full_text = Some(text.clone());
                wire.language = language.map(|lang| lang.name().to_string());
                wire.version = Some(*version);
            }
            Body::Run { code, language } => {
                wire.msg_type = Some("run".into());
                wire.full_text = Some(code.clone());
                wire.language = Some(language.name().to_string());
            }
            Body::Results(output) => wire.results = Some(output.clone()),
            Body::Language(language) => {
                wire.msg_type = Some("lang".into());
                wire.language = Some(language.name().to_string());
            }
        }
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame, accepting both tagged and legacy shapes.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        let kind = match wire.kind {
            Some(kind) => kind,
            None => wire.legacy_kind().ok_or(ProtocolError::UnknownShape)?,
        };
        let missing = |field| ProtocolError::MissingField { kind, field };

        let body = match kind {
            Kind::Patch => Body::Patch {
                patch_text: wire.patch_text.ok_or_else(|| missing("patch_text"))?,
                clock: wire.clock.unwrap_or(0),
            },
            Kind::Sync => Body::SyncRequest,
            Kind::Full => Body::FullText {
                text: wire.full_text.ok_or_else(|| missing("full_text"))?,
                // An unrecognized language on a snapshot leaves ours alone.
                language: wire.language.and_then(|name| name.parse().ok()),
                version: wire.version.unwrap_or(0),
            },
            Kind::Run => Body::Run {
                code: wire.full_text.ok_or_else(|| missing("full_text"))?,
                language: match wire.language {
                    Some(name) => name.parse()?,
                    None => Language::default(),
                },
            },
            Kind::Result => Body::Results(wire.results.ok_or_else(|| missing("results"))?),
            Kind::Lang => {
                let name = wire.language.ok_or_else(|| missing("language"))?;
                Body::Language(name.parse()?)
            }
        };

        Ok(Self { id: wire.id, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> ClientId {
        ClientId::from_raw(raw)
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let messages = [
            Message::patch(id(1), "@@ -0,0 +1,2 @@\n+hi\n", 4),
            Message::sync_request(id(2)),
            Message::full_text(id(3), "print(1)\n", Some(Language::Python), 9),
            Message::full_text(id(3), "", None, 0),
            Message::run(id(4), "puts 1", Language::Ruby),
            Message::results(ClientId::RELAY, "1\n2"),
            Message::language(id(5), Language::Php),
        ];
        for msg in messages {
            let encoded = msg.encode().unwrap();
            assert_eq!(Message::decode(&encoded).unwrap(), msg, "{encoded}");
        }
    }

    #[test]
    fn test_encode_writes_kind_and_legacy_fields() {
        let json: serde_json::Value =
            serde_json::from_str(&Message::sync_request(id(7)).encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "sync");
        assert_eq!(json["sync_needed"], true);
        assert_eq!(json["id"], 7);

        let json: serde_json::Value = serde_json::from_str(
            &Message::run(id(7), "x = 1", Language::Python).encode().unwrap(),
        )
        .unwrap();
        assert_eq!(json["type"], "run");
        assert_eq!(json["full_text"], "x = 1");
        assert_eq!(json["language"], "Python");
        assert!(json.get("patch_text").is_none());
    }

    #[test]
    fn test_decode_legacy_shapes() {
        let msg = Message::decode(r#"{"id": 3, "patch_text": "@@ -1 +1 @@\n-a\n+b\n"}"#).unwrap();
        assert_eq!(msg.kind(), Kind::Patch);

        let msg = Message::decode(r#"{"id": 3, "sync_needed": true}"#).unwrap();
        assert_eq!(msg, Message::sync_request(id(3)));

        let msg = Message::decode(r#"{"id": 3, "full_text": "abc"}"#).unwrap();
        assert_eq!(msg, Message::full_text(id(3), "abc", None, 0));

        let msg = Message::decode(r#"{"id": 3, "results": "ok", "room": "default"}"#).unwrap();
        assert_eq!(msg, Message::results(id(3), "ok"));

        // the legacy relay's answer to a run request
        let msg = Message::decode(
            r#"{"id": 3, "type": "run", "language": "Python", "results": "42", "room": "default"}"#,
        )
        .unwrap();
        assert_eq!(msg, Message::results(id(3), "42"));

        let msg = Message::decode(r#"{"id": 3, "type": "lang", "language": "Perl"}"#).unwrap();
        assert_eq!(msg, Message::language(id(3), Language::Perl));
    }

    #[test]
    fn test_legacy_precedence() {
        // patch wins over everything else present
        let msg =
            Message::decode(r#"{"id": 1, "patch_text": "", "sync_needed": true, "full_text": "x"}"#)
                .unwrap();
        assert_eq!(msg.kind(), Kind::Patch);

        // a run request carries full_text but is not a snapshot
        let msg =
            Message::decode(r#"{"id": 1, "full_text": "puts 1", "type": "run", "language": "Ruby"}"#)
                .unwrap();
        assert_eq!(msg, Message::run(id(1), "puts 1", Language::Ruby));

        let msg = Message::decode(r#"{"id": 1, "full_text": "a", "results": "b"}"#).unwrap();
        assert_eq!(msg.kind(), Kind::Full);
    }

    #[test]
    fn test_explicit_kind_beats_field_presence() {
        let msg = Message::decode(r#"{"id": 1, "kind": "full", "full_text": "t", "sync_needed": true}"#)
            .unwrap();
        assert_eq!(msg.kind(), Kind::Full);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            Message::decode("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(matches!(
            Message::decode(r#"{"full_text": "no id"}"#),
            Err(ProtocolError::Deserialization(_))
        ));
        assert_eq!(
            Message::decode(r#"{"id": 1}"#),
            Err(ProtocolError::UnknownShape)
        );
        assert_eq!(
            Message::decode(r#"{"id": 1, "kind": "patch"}"#),
            Err(ProtocolError::MissingField {
                kind: Kind::Patch,
                field: "patch_text"
            })
        );
        assert!(matches!(
            Message::decode(r#"{"id": 1, "type": "lang", "language": "Cobol"}"#),
            Err(ProtocolError::Language(_))
        ));
    }

    #[test]
    fn test_snapshot_unknown_language_is_dropped() {
        let msg = Message::decode(r#"{"id": 1, "full_text": "t", "language": "Cobol"}"#).unwrap();
        assert_eq!(msg, Message::full_text(id(1), "t", None, 0));
    }

    #[test]
    fn test_snapshot_stamp_order() {
        let older = Message::full_text(id(9), "a", None, 1).snapshot_stamp().unwrap();
        let newer = Message::full_text(id(2), "b", None, 2).snapshot_stamp().unwrap();
        let tie = Message::full_text(id(3), "c", None, 2).snapshot_stamp().unwrap();
        assert!(newer > older);
        assert!(tie > newer);
        assert_eq!(Message::sync_request(id(1)).snapshot_stamp(), None);
    }
}
