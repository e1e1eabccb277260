//! # relaydrop-core
//!
//! The browser-independent core of a peer-to-peer file and text
//! transfer engine: a rendezvous signaling client, per-peer WebRTC/relay
//! sessions, and a chunked transfer protocol, all driven by a single
//! local [`events::EventBus`] instead of a thread-safe message bus —
//! this engine runs entirely on the browser's one JS thread.
//!
//! ## Module map
//!
//! - [`config`] — injected configuration (`EngineConfig`, `HostContext`)
//! - [`error`] — the engine-wide `Error`/`Result` types
//! - [`events`] — the synchronous, typed event bus the rest of the
//!   crate fires into and the `wasm` glue drains out of
//! - [`protocol`] — wire types for both the server and session-peer
//!   protocols
//! - [`server`] — the rendezvous `WebSocket` connection
//! - [`session`] — per-peer transport (RTC or relay) and transfer state
//! - [`manager`] — the peer-id → session registry
//! - [`transfer`] — chunking and reassembly
//! - [`wasm`] — the `wasm-bindgen` surface; compiled only as
//!   `target_arch = "wasm32"` with the `wasm` feature enabled
//!
//! Everything outside [`wasm`] is plain, testable Rust: the browser
//! seams ([`server::SocketFactory`], [`server::Timer`],
//! [`session::Transport`], [`transfer::ChunkSource`],
//! [`manager::SessionFactory`]) are traits so the whole engine can be
//! driven from `cargo test` without a DOM anywhere in sight.

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transfer;

#[cfg(all(target_arch = "wasm32", feature = "wasm"))]
pub mod wasm;

pub use config::{EngineConfig, HostContext, IceServer};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use manager::PeersManager;
pub use session::PeerSession;
