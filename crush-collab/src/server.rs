//! WebSocket relay with room-based routing.
//!
//! Routes:
//! ```text
//! ws://host/submit/<room>   client ──► relay   (frames validated, then fanned out)
//! ws://host/receive/<room>  relay  ──► client  (every frame published to the room)
//!
//! Client A ─submit─┐                    ┌─receive─► Client A
//!                  ├─► BroadcastGroup ──┼─receive─► Client B
//! Client B ─submit─┘     (room)         └─receive─► Client C
//! ```
//!
//! The relay holds no document state. `run` requests are handed to the
//! configured [`CodeRunner`]; its output is published as a `result` message
//! from [`ClientId::RELAY`]. Submitted frames claiming that id are dropped.
//!
//! [`RelayServer::shutdown`] stops the accept loop and closes every open
//! connection with a "going away" close frame.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crush_core::identity::ClientId;
use crush_core::language::Language;
use crush_core::protocol::{Body, Message};

use crate::broadcast::RoomManager;
use crate::runner::{CodeRunner, RunError};

/// Close code sent to connections on an unknown path.
pub const CLOSE_UNKNOWN_ROUTE: u16 = 4000;

/// Errors that end a listener or a single connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per receive connection before it starts lagging
    pub broadcast_capacity: usize,
    /// Larger submitted frames are dropped
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_message_bytes: 1 << 20,
        }
    }
}

/// Relay-wide counters, readable through [`RelayServer::stats`].
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// WebSocket handshakes completed since start
    pub total_connections: u64,
    /// Connections currently open, both routes and rejected paths
    pub active_connections: u64,
    /// Text frames received on submit connections
    pub total_messages: u64,
    /// Bytes of those frames
    pub total_bytes: u64,
    /// Malformed, oversized or relay-impersonating frames dropped at submit
    pub rejected_messages: u64,
    /// `run` requests received, with or without a runner
    pub runs_requested: u64,
}

/// Which side of a room a connection serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Submit(String),
    Receive(String),
}

impl Route {
    /// Parse `/submit/<room>` or `/receive/<room>`; the room is
    /// percent-decoded.
    pub fn parse(path: &str) -> Option<Route> {
        let (kind, room) = path.strip_prefix('/')?.split_once('/')?;
        if room.is_empty() || room.contains('/') {
            return None;
        }
        let room = urlencoding::decode(room).ok()?.into_owned();
        match kind {
            "submit" => Some(Route::Submit(room)),
            "receive" => Some(Route::Receive(room)),
            _ => None,
        }
    }
}

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    runner: Option<Arc<dyn CodeRunner>>,
    /// Flipped to `true` once by [`RelayServer::shutdown`].
    shutdown: Arc<watch::Sender<bool>>,
}

impl Shared {
    /// Resolves once the relay is shutting down.
    async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        // The sender lives in `self`, so this only returns on shutdown.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// The relay server.
pub struct RelayServer {
    shared: Shared,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            shared: Shared {
                config,
                rooms,
                stats: Arc::new(RwLock::new(ServerStats::default())),
                runner: None,
                shutdown: Arc::new(watch::channel(false).0),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Execute `run` requests with `runner`.
    pub fn with_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.shared.runner = Some(runner);
        self
    }

    /// Bind the configured address and serve until [`RelayServer::shutdown`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until
    /// [`RelayServer::shutdown`]. The listener is dropped on return.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "Relay listening on {} (code runner {})",
            listener.local_addr()?,
            if self.has_runner() { "enabled" } else { "disabled" }
        );
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shared.stopped() => break,
            };
            log::debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
        log::info!("Relay stopped accepting connections");
        Ok(())
    }

    /// Stop serving: the accept loop returns and open connections close.
    pub async fn shutdown(&self) {
        log::info!(
            "Relay shutting down with {} active room(s)",
            self.shared.rooms.room_count().await
        );
        self.shared.shutdown.send_replace(true);
    }

    /// A copy of the relay-wide counters.
    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }

    pub fn has_runner(&self) -> bool {
        self.shared.runner.is_some()
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Shared,
) -> Result<(), ServerError> {
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let result = match Route::parse(&path) {
        Some(Route::Submit(room)) => {
            log::info!("{addr} submitting to room {room}");
            serve_submit(ws, addr, &room, &shared).await
        }
        Some(Route::Receive(room)) => {
            log::info!("{addr} receiving from room {room}");
            serve_receive(ws, addr, &room, &shared).await
        }
        None => {
            log::warn!("Closing {addr}: unknown route {path:?}");
            let frame = CloseFrame {
                code: CloseCode::from(CLOSE_UNKNOWN_ROUTE),
                reason: "unknown route".to_string().into(),
            };
            ws.close(Some(frame)).await.map_err(ServerError::from)
        }
    };

    shared.stats.write().await.active_connections -= 1;
    result
}

async fn serve_submit(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    room: &str,
    shared: &Shared,
) -> Result<(), ServerError> {
    let (mut ws_sender, mut ws_receiver) = ws.split();
    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = shared.stopped() => {
                close_going_away(&mut ws_sender).await;
                break;
            }
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => route_frame(text.as_str(), addr, room, shared).await,
            Some(Ok(WsMessage::Ping(data))) => ws_sender.send(WsMessage::Pong(data)).await?,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => log::debug!("Ignoring non-text frame from {addr}"),
            Some(Err(e)) => {
                log::error!("WebSocket error from {addr}: {e}");
                break;
            }
        }
    }
    log::info!("Submit connection from {addr} closed");
    Ok(())
}

async fn close_going_away(ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, WsMessage>) {
    let frame = CloseFrame {
        code: CloseCode::Away,
        reason: "relay shutting down".to_string().into(),
    };
    let _ = ws_sender.send(WsMessage::Close(Some(frame))).await;
}

/// Validate one submitted frame and publish it (or its execution result).
async fn route_frame(frame: &str, addr: SocketAddr, room: &str, shared: &Shared) {
    {
        let mut s = shared.stats.write().await;
        s.total_messages += 1;
        s.total_bytes += frame.len() as u64;
    }

    if frame.len() > shared.config.max_message_bytes {
        log::warn!(
            "Dropping {}-byte frame from {addr} (limit {})",
            frame.len(),
            shared.config.max_message_bytes
        );
        shared.stats.write().await.rejected_messages += 1;
        return;
    }

    let message = match Message::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Dropping malformed frame from {addr}: {e}");
            shared.stats.write().await.rejected_messages += 1;
            return;
        }
    };

    if message.id.is_relay() {
        log::warn!("Dropping {:?} from {addr} claiming the relay id", message.kind());
        shared.stats.write().await.rejected_messages += 1;
        return;
    }

    match message.body {
        Body::Run { code, language } => {
            shared.stats.write().await.runs_requested += 1;
            spawn_run(message.id, code, language, room.to_string(), shared);
        }
        _ => {
            let Some(group) = shared.rooms.get(room).await else {
                log::debug!("No receivers in room {room}; dropping {:?}", message.kind());
                return;
            };
            let reached = group.broadcast_raw(Arc::from(frame));
            log::debug!("{:?} from client {} reached {reached} receiver(s)", message.kind(), message.id);
        }
    }
}

fn spawn_run(requester: ClientId, code: String, language: Language, room: String, shared: &Shared) {
    let Some(runner) = shared.runner.clone() else {
        log::warn!("No code runner configured; dropping run request from client {requester}");
        return;
    };
    let rooms = shared.rooms.clone();

    tokio::spawn(async move {
        let output = match runner.run(language, code).await {
            Ok(output) => output,
            Err(RunError::Unsupported(language)) => {
                log::debug!("Unsupported language {language} requested by client {requester}");
                return;
            }
            Err(e) => {
                log::warn!("Run for client {requester} failed: {e}");
                e.to_string()
            }
        };

        let Some(group) = rooms.get(&room).await else {
            log::debug!("Room {room} emptied before results were ready");
            return;
        };
        if let Err(e) = group.broadcast(&Message::results(ClientId::RELAY, output)) {
            log::error!("Failed to encode results for room {room}: {e}");
        }
    });
}

async fn serve_receive(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    room: &str,
    shared: &Shared,
) -> Result<(), ServerError> {
    let conn_id = Uuid::new_v4();
    let (group, mut broadcast_rx) = shared.rooms.join(room, conn_id, addr.to_string()).await;
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let result: Result<(), ServerError> = async {
        loop {
            tokio::select! {
                _ = shared.stopped() => {
                    close_going_away(&mut ws_sender).await;
                    break;
                }
                incoming = ws_receiver.next() => match incoming {
                    Some(Ok(WsMessage::Ping(data))) => ws_sender.send(WsMessage::Pong(data)).await?,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => log::debug!("Ignoring frame sent on receive channel by {addr}"),
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                },
                outgoing = broadcast_rx.recv() => match outgoing {
                    Ok(frame) => ws_sender.send(WsMessage::text(frame.to_string())).await?,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!(
                            "Receiver {addr} in room {room} lagged by {n} messages (capacity {})",
                            group.capacity()
                        );
                        group.record_lag(n);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    shared.rooms.leave(room, &conn_id).await;
    log::info!("Receive connection from {addr} closed");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_message_bytes, 1024 * 1024);
    }

    #[test]
    fn test_route_parse() {
        assert_eq!(
            Route::parse("/submit/default"),
            Some(Route::Submit("default".into()))
        );
        assert_eq!(
            Route::parse("/receive/team%20a"),
            Some(Route::Receive("team a".into()))
        );
        assert_eq!(Route::parse("/receive/"), None);
        assert_eq!(Route::parse("/submit/a/b"), None);
        assert_eq!(Route::parse("/publish/default"), None);
        assert_eq!(Route::parse("/"), None);
        assert_eq!(Route::parse("submit/x"), None);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(!server.has_runner());

        let runner = |_: Language, _: &str| -> Result<String, RunError> { Ok(String::new()) };
        let server = server.with_runner(Arc::new(runner));
        assert!(server.has_runner());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_messages, 0);
        assert_eq!(server.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_route_frame_validates_and_relays() {
        let server = RelayServer::new(ServerConfig {
            max_message_bytes: 64,
            ..ServerConfig::default()
        });
        let shared = server.shared.clone();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (_group, mut rx) = shared.rooms.join("r", Uuid::new_v4(), "test").await;

        route_frame("garbage", addr, "r", &shared).await;
        route_frame(&format!(r#"{{"id": 1, "full_text": "{}"}}"#, "x".repeat(80)), addr, "r", &shared).await;
        route_frame(r#"{"id": 1, "sync_needed": true}"#, addr, "r", &shared).await;
        // no runner: dropped
        route_frame(r#"{"id": 1, "type": "run", "full_text": "1"}"#, addr, "r", &shared).await;
        // only the relay speaks as id 0
        route_frame(r#"{"id": 0, "results": "forged"}"#, addr, "r", &shared).await;

        assert_eq!(&*rx.recv().await.unwrap(), r#"{"id": 1, "sync_needed": true}"#);
        assert!(rx.try_recv().is_err());

        let stats = server.stats().await;
        assert_eq!(stats.total_messages, 5);
        assert_eq!(stats.rejected_messages, 3);
        assert_eq!(stats.runs_requested, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = Arc::new(RelayServer::with_defaults());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        server.shutdown().await;
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), serving)
            .await
            .expect("serve returns after shutdown")
            .unwrap();
        assert!(result.is_ok());

        // A relay that was already told to stop does not serve at all.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(server.serve(listener).await.is_ok());
    }
}
