use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest integer a JavaScript peer can represent exactly (2^53 - 1).
const ID_MASK: u64 = (1 << 53) - 1;

/// Random per-session tag used to drop our own broadcasts on the way back.
///
/// Serialized as a bare JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Identity of messages the relay produces itself.
    pub const RELAY: ClientId = ClientId(0);

    /// Fresh random identity in `1..2^53`.
    pub fn random() -> Self {
        loop {
            let id = (Uuid::new_v4().as_u128() as u64) & ID_MASK;
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn is_relay(self) -> bool {
        self == Self::RELAY
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_in_range() {
        for _ in 0..1000 {
            let id = ClientId::random();
            assert!(id.get() > 0);
            assert!(id.get() <= ID_MASK);
            assert!(!id.is_relay());
        }
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(ClientId::random(), ClientId::random());
    }

    #[test]
    fn test_serializes_as_number() {
        let id = ClientId::from_raw(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: ClientId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }
}
