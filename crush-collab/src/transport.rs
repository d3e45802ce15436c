//! Auto-reconnecting WebSocket channel.
//!
//! Each channel runs as its own task and reports [`ChannelEvent`]s:
//!
//! ```text
//!   connect ──ok──► Open ──► Message* ──► Closed ──┐
//!      ▲                                           │
//!      └────────────── backoff sleep ◄─────────────┘
//! ```
//!
//! Frames handed to [`Channel::send`] while the socket is down are dropped.
//! Nothing is queued across a reconnect.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const OUTBOUND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry after a failure or disconnect.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth per failed attempt; values below 1.0 count as 1.0.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let secs = (self.initial.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Lifecycle and traffic of one [`Channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A connection was established. Sent again after every reconnect.
    Open,
    /// A text frame from the peer.
    Message(String),
    /// The connection was lost; a reconnect is scheduled.
    Closed,
}

/// Handle to a reconnecting channel task. Dropping it stops the task.
pub struct Channel {
    url: String,
    outbound: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl Channel {
    /// Start connecting to `url`; events arrive on the returned receiver.
    ///
    /// The task retries forever with `backoff` delays, reset after every
    /// successful connect. It stops when the handle or the receiver is
    /// dropped.
    pub fn spawn(
        url: impl Into<String>,
        backoff: BackoffConfig,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let url = url.into();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run(url.clone(), backoff, outbound_rx, event_tx));
        (
            Self {
                url,
                outbound,
                task,
            },
            event_rx,
        )
    }

    /// Queue a text frame. Returns `false` if it was dropped immediately.
    pub fn send(&self, frame: String) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping frame for {}: {e}", self.url);
                false
            }
        }
    }

    /// Endpoint this channel connects to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    url: String,
    backoff: BackoffConfig,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let mut attempt = 0u32;
    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                attempt = 0;
                // Frames queued while connecting belong to the previous outage.
                let mut stale = 0;
                while outbound.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    log::debug!("Discarded {stale} frame(s) queued while {url} was down");
                }
                log::info!("Connected to {url}");
                if events.send(ChannelEvent::Open).await.is_err() {
                    return;
                }

                let (mut ws_sender, mut ws_receiver) = ws_stream.split();
                loop {
                    tokio::select! {
                        frame = outbound.recv() => match frame {
                            Some(text) => {
                                if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                                    log::warn!("Send to {url} failed: {e}");
                                    break;
                                }
                            }
                            None => {
                                let _ = ws_sender.close().await;
                                return;
                            }
                        },
                        incoming = ws_receiver.next() => match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                if events.send(ChannelEvent::Message(text.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            Some(Ok(WsMessage::Close(frame))) => {
                                log::debug!("{url} closed by peer: {frame:?}");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::warn!("WebSocket error on {url}: {e}");
                                break;
                            }
                            None => break,
                        },
                    }
                }

                log::info!("Disconnected from {url}");
                if events.send(ChannelEvent::Closed).await.is_err() {
                    return;
                }
            }
            Err(e) => log::debug!("Connect to {url} failed: {e}"),
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                frame = outbound.recv() => match frame {
                    Some(_) => log::debug!("Dropping frame: {url} is down"),
                    None => return,
                },
                _ = events.closed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_secs(5));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_flat_multiplier() {
        let backoff = BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 1.0,
        };
        assert_eq!(backoff.delay(7), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_drops_frames_quietly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let backoff = BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(20),
            multiplier: 2.0,
        };
        let (channel, mut events) = Channel::spawn(format!("ws://127.0.0.1:{port}/x"), backoff);
        assert!(channel.send("lost".into()));
        let event = timeout(Duration::from_millis(200), events.recv()).await;
        assert!(event.is_err(), "no event without a server, got {event:?}");
    }
}
