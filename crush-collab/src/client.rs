//! Sync client: one actor task per editor session.
//!
//! The actor exclusively owns a [`Session`] and multiplexes four inputs in a
//! single `tokio::select!` loop:
//! - the tick timer (diff text against shadow, send a patch),
//! - inbound channel events (open → resync request, frames → session),
//! - outbound channel events (open → repeat a pending resync request),
//! - host commands from the [`ClientHandle`].
//!
//! While the outbound channel is down no ticks run, so edits made during an
//! outage stay in the text/shadow difference and go out with the first tick
//! after reconnecting.
//!
//! Every [`SyncEvent::TextChanged`] carries a revision. The host hands the
//! revision its buffer was last synced to back with [`ClientHandle::set_text`],
//! so an edit typed before a peer change was displayed is rebased onto that
//! change rather than overwriting it.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crush_core::identity::ClientId;
use crush_core::language::Language;
use crush_core::protocol::Message;
use crush_core::session::{Outcome, Session, Snapshot};

use crate::transport::{BackoffConfig, Channel, ChannelEvent};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Errors returned by [`ClientHandle`] calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Sync client has stopped")]
    Stopped,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Room name; percent-encoded into the route path.
    pub room: String,
    /// Period between diffs of text against shadow.
    pub tick_interval: Duration,
    /// Reconnect schedule shared by both channels.
    pub reconnect: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            room: "default".to_string(),
            tick_interval: Duration::from_millis(500),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// URL of the outbound channel for this room.
    pub fn submit_url(&self) -> String {
        self.route_url("submit")
    }

    /// URL of the inbound channel for this room.
    pub fn receive_url(&self) -> String {
        self.route_url("receive")
    }

    fn route_url(&self, route: &str) -> String {
        format!(
            "{}/{route}/{}",
            self.server_url.trim_end_matches('/'),
            urlencoding::encode(&self.room)
        )
    }
}

/// Channel connection state. Ticks run only while the outbound channel is
/// `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Events for the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The receive channel connected; a resync request has been sent.
    InboundOpen,
    InboundClosed,
    /// The submit channel connected; ticks resume.
    OutboundOpen,
    OutboundClosed,
    /// The document changed under the host: a peer patch or snapshot landed,
    /// or a stale host edit was rebased onto one.
    TextChanged { revision: u64, text: String },
    /// Execution output.
    Results(String),
    /// A peer changed the language. `document_empty` lets the host decide
    /// whether to insert boilerplate.
    LanguageChanged {
        language: Language,
        document_empty: bool,
    },
}

enum Command {
    SetText { based_on: u64, text: String },
    SetLanguage(Language),
    Run,
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Host-side handle to a running [`SyncClient`].
///
/// Dropping the handle stops the client.
pub struct ClientHandle {
    id: ClientId,
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Identity stamped on every message this client sends.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Report the editor's current contents.
    ///
    /// `based_on` is the revision of the last [`SyncEvent::TextChanged`] the
    /// host applied to its buffer, or 0 before any.
    pub async fn set_text(
        &self,
        based_on: u64,
        text: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.command(Command::SetText {
            based_on,
            text: text.into(),
        })
        .await
    }

    /// Change the language and announce it to peers.
    pub async fn set_language(&self, language: Language) -> Result<(), ClientError> {
        self.command(Command::SetLanguage(language)).await
    }

    /// Ask the relay to execute the current text.
    pub async fn run(&self) -> Result<(), ClientError> {
        self.command(Command::Run).await
    }

    /// Current text, language, clock and revision.
    pub async fn snapshot(&self) -> Result<Snapshot, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(Command::Snapshot(reply_tx)).await?;
        reply_rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Stop the client and wait for its channels to close.
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.command(Command::Shutdown).await?;
        (&mut self.task).await.map_err(|_| ClientError::Stopped)
    }

    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Stopped)
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The sync actor. Only reachable through the [`ClientHandle`] that
/// [`SyncClient::spawn`] returns.
pub struct SyncClient {
    config: ClientConfig,
    session: Session,
    event_tx: mpsc::Sender<SyncEvent>,
    inbound: ConnectionState,
    outbound: ConnectionState,
}

impl SyncClient {
    /// Start a client with a fresh random identity.
    pub fn spawn(config: ClientConfig) -> ClientHandle {
        Self::spawn_with_session(config, Session::with_random_id())
    }

    /// Start a client around an existing session.
    pub fn spawn_with_session(config: ClientConfig, session: Session) -> ClientHandle {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let id = session.id();
        let client = Self {
            config,
            session,
            event_tx,
            inbound: ConnectionState::Disconnected,
            outbound: ConnectionState::Disconnected,
        };
        let task = tokio::spawn(client.run(command_rx));
        ClientHandle {
            id,
            commands,
            event_rx: Some(event_rx),
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (outbox, mut outbox_events) =
            Channel::spawn(self.config.submit_url(), self.config.reconnect.clone());
        let (_inbox, mut inbox_events) =
            Channel::spawn(self.config.receive_url(), self.config.reconnect.clone());

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "Client {} joining room {} at {}",
            self.session.id(),
            self.config.room,
            self.config.server_url
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.outbound == ConnectionState::Connected {
                        if let Some(patch) = self.session.tick() {
                            self.send(&outbox, &patch);
                        }
                    }
                }
                Some(event) = inbox_events.recv() => match event {
                    ChannelEvent::Open => {
                        self.inbound = ConnectionState::Connected;
                        self.emit(SyncEvent::InboundOpen);
                        let request = self.session.on_connected();
                        self.send(&outbox, &request);
                    }
                    ChannelEvent::Message(frame) => self.receive(&outbox, &frame),
                    ChannelEvent::Closed => {
                        self.inbound = ConnectionState::Disconnected;
                        self.emit(SyncEvent::InboundClosed);
                    }
                },
                Some(event) = outbox_events.recv() => match event {
                    ChannelEvent::Open => {
                        self.outbound = ConnectionState::Connected;
                        self.emit(SyncEvent::OutboundOpen);
                        if let Some(request) = self.session.pending_resync_request() {
                            self.send(&outbox, &request);
                        }
                    }
                    ChannelEvent::Message(_) => {}
                    ChannelEvent::Closed => {
                        self.outbound = ConnectionState::Disconnected;
                        self.emit(SyncEvent::OutboundClosed);
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::SetText { based_on, text }) => {
                        if self.session.set_text_at(based_on, text) {
                            self.emit_text();
                        }
                    }
                    Some(Command::SetLanguage(language)) => {
                        let announce = self.session.set_language(language);
                        self.send(&outbox, &announce);
                    }
                    Some(Command::Run) => {
                        let request = self.session.run_request();
                        self.send(&outbox, &request);
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.session.snapshot());
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        log::info!("Client {} stopped", self.session.id());
    }

    fn receive(&mut self, outbox: &Channel, frame: &str) {
        let revision = self.session.revision();
        match self.session.receive(frame) {
            Ok(Outcome::Reply(reply)) => self.send(outbox, &reply),
            Ok(Outcome::Patched { .. }) | Ok(Outcome::Replaced) => {
                if self.session.revision() != revision {
                    self.emit_text();
                }
            }
            Ok(Outcome::Results(output)) => self.emit(SyncEvent::Results(output)),
            Ok(Outcome::LanguageChanged {
                language,
                document_empty,
            }) => self.emit(SyncEvent::LanguageChanged {
                language,
                document_empty,
            }),
            Ok(Outcome::SelfEcho) | Ok(Outcome::StaleSnapshot) | Ok(Outcome::Ignored) => {}
            Err(e) => log::warn!("Client {} dropped inbound message: {e}", self.session.id()),
        }
    }

    fn send(&self, outbox: &Channel, message: &Message) {
        if self.outbound != ConnectionState::Connected {
            log::debug!("{} is down; dropping {:?}", outbox.url(), message.kind());
            return;
        }
        match message.encode() {
            Ok(frame) => {
                outbox.send(frame);
            }
            Err(e) => log::error!("Failed to encode {:?}: {e}", message.kind()),
        }
    }

    fn emit_text(&self) {
        self.emit(SyncEvent::TextChanged {
            revision: self.session.revision(),
            text: self.session.text().to_string(),
        });
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            log::warn!("Event queue full; dropping {event:?}");
        }
    }
}
