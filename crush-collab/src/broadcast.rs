//! Per-room fan-out of encoded frames.
//!
//! Every `/receive/<room>` connection holds one receiver on the room's tokio
//! broadcast channel. A frame is encoded once and shared as `Arc<str>`.
//! Receivers that fall more than `capacity` frames behind lose the oldest
//! ones; sync clients recover through their next diff or a resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crush_core::protocol::{Message, ProtocolError};

/// Snapshot of a room's counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Frames published to the room
    pub messages_sent: u64,
    /// Frames skipped by lagging receivers, summed over receivers
    pub messages_dropped: u64,
    pub subscribers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<str>>,
    /// Receive connections currently subscribed.
    subscribers: RwLock<HashMap<Uuid, String>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// A group whose receivers buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a receive connection; `label` is only used for logging.
    pub async fn add_subscriber(
        &self,
        conn_id: Uuid,
        label: impl Into<String>,
    ) -> broadcast::Receiver<Arc<str>> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(conn_id, label.into());
        self.sender.subscribe()
    }

    /// Returns `false` if the connection was not subscribed.
    pub async fn remove_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.write().await.remove(conn_id).is_some()
    }

    /// Encode and send to every subscriber, the sender's own receive
    /// connection included. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &Message) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = msg.encode()?.into();
        Ok(self.broadcast_raw(encoded))
    }

    /// Send an already-encoded frame as-is.
    pub fn broadcast_raw(&self, frame: Arc<str>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room names to broadcast groups.
///
/// Joining and leaving happen under the map's write lock, so a room is never
/// dropped while a connection is subscribing to it.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Look up a room without creating it.
    pub async fn get(&self, room: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Subscribe a receive connection to `room`, creating the room if needed.
    pub async fn join(
        &self,
        room: &str,
        conn_id: Uuid,
        label: impl Into<String>,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Arc<str>>) {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let rx = group.add_subscriber(conn_id, label).await;
        (group, rx)
    }

    /// Unsubscribe and drop the room once nobody listens. Returns `true`
    /// if the room was removed.
    ///
    /// Leaving a room that does not exist, or that the connection never
    /// joined, is a no-op apart from the emptiness check.
    pub async fn leave(&self, room: &str, conn_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(group) = rooms.get(room) else {
            return false;
        };
        group.remove_subscriber(conn_id).await;
        let stats = group.stats().await;
        if stats.subscribers == 0 {
            rooms.remove(room);
            log::info!(
                "Room {room} removed (empty after {} frames, {} dropped by lagging receivers)",
                stats.messages_sent,
                stats.messages_dropped
            );
            return true;
        }
        false
    }

    /// Rooms with at least one receive connection.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crush_core::identity::ClientId;

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_subscriber(conn, "127.0.0.1:5000").await;
        assert_eq!(group.subscriber_count().await, 1);

        assert!(group.remove_subscriber(&conn).await);
        assert!(!group.remove_subscriber(&conn).await);
        assert_eq!(group.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_includes_sender() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_subscriber(Uuid::new_v4(), "a").await;
        let mut rx2 = group.add_subscriber(Uuid::new_v4(), "b").await;

        let msg = Message::sync_request(ClientId::from_raw(3));
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let frame = rx1.recv().await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), msg);
        assert_eq!(rx2.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_broadcast_raw_is_verbatim() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_subscriber(Uuid::new_v4(), "a").await;

        let frame: Arc<str> = Arc::from(r#"{"id": 4, "full_text": "x"}"#);
        assert_eq!(group.broadcast_raw(frame.clone()), 1);
        assert!(Arc::ptr_eq(&rx.recv().await.unwrap(), &frame));
    }

    #[tokio::test]
    async fn test_stats_and_lag() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_subscriber(Uuid::new_v4(), "slow").await;
        for i in 0..5 {
            group.broadcast(&Message::results(ClientId::RELAY, i.to_string())).unwrap();
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_room_manager_join_leave() {
        let manager = RoomManager::new(16);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let (group, _rx1) = manager.join("py", first, "a").await;
        let (same, _rx2) = manager.join("py", second, "b").await;
        assert!(Arc::ptr_eq(&group, &same));
        assert_eq!(group.capacity(), 16);
        let _other = manager.join("rb", Uuid::new_v4(), "c").await;
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.get("go").await.is_none());

        assert!(!manager.leave("py", &first).await);
        assert!(manager.leave("py", &second).await);
        assert!(manager.get("py").await.is_none());
        assert!(!manager.leave("missing", &first).await);
        assert_eq!(manager.room_count().await, 1);
    }
}
