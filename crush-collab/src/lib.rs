//! # crush-collab — WebSocket relay and sync client for Code Crush
//!
//! Peers never talk to each other directly. Each client holds two
//! connections to a stateless relay, one per direction:
//!
//! ```text
//! ┌─────────────┐  /submit/<room>   ┌──────────────┐
//! │ SyncClient  │ ────────────────► │ RelayServer  │
//! │ (Session)   │                   │ (no document)│
//! │             │ ◄──────────────── │              │
//! └─────────────┘  /receive/<room>  └──────┬───────┘
//!                                          │
//!                                  ┌───────┴───────┐
//!                                  │ BroadcastGroup│
//!                                  │ (per room)    │
//!                                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`broadcast`] — room registry and per-room fan-out
//! - [`server`] — relay routes, validation, run dispatch
//! - [`runner`] — pluggable code execution for `run` requests
//! - [`transport`] — auto-reconnecting WebSocket channel
//! - [`client`] — sync actor driving a [`crush_core::Session`]

pub mod broadcast;
pub mod client;
pub mod runner;
pub mod server;
pub mod transport;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use client::{ClientConfig, ClientError, ClientHandle, ConnectionState, SyncClient, SyncEvent};
pub use runner::{CodeRunner, InterpreterCommand, LocalRunner, RunError, DEFAULT_RUN_TIMEOUT};
pub use server::{RelayServer, Route, ServerConfig, ServerError, ServerStats, CLOSE_UNKNOWN_ROUTE};
pub use transport::{BackoffConfig, Channel, ChannelEvent};
