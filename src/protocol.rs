//! # Wire protocols
//!
//! Two independent tagged-enum protocols, both JSON-over-text, in the same
//! `#[serde(tag = "type", rename_all = "...")]` style the rendezvous/relay
//! client code this engine is grounded on uses for its own envelopes:
//!
//! - [`ServerMessage`] / server-bound frames: the control channel between a
//!   peer and the rendezvous server (spec §4.4): peer discovery and
//!   signaling relay.
//! - [`SessionMessage`]: the data-channel protocol spoken directly between
//!   two peers once a session (RTC or relay) is open (spec §4.5-§4.7):
//!   transfer headers, binary partitions, flow-control acks, and text.
//!
//! Binary partitions themselves never go through `serde_json` — they are
//! sent as raw bytes over the data channel (spec §4.5) or base64-wrapped
//! only when the underlying transport is itself JSON-only (spec §4.7,
//! relay fallback). [`SessionMessage`] therefore only models the
//! *control* frames of the session protocol; partition bytes are handled
//! alongside it by the transport layer.

use serde::{Deserialize, Serialize};

/// One entry in a `peers` roster frame (spec §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Stable id the rendezvous server assigned this peer for the room.
    pub id: String,
    /// Human-displayable name, if the server attaches one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether this peer's runtime can establish direct RTC sessions.
    pub rtc_supported: bool,
}

/// An opaque SDP/ICE signaling payload, forwarded by the server between
/// two peers without being interpreted there. The session layer is the
/// only thing that looks inside `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    /// Offer, answer, or ICE-candidate body, as produced by
    /// [`crate::session::rtc`].
    pub payload: serde_json::Value,
}

/// Frames the rendezvous server sends to a connected peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The full current roster of the room, sent on join and whenever it
    /// changes in a way the server chooses to snapshot rather than delta.
    Peers { peers: Vec<PeerDescriptor> },
    /// A peer joined after we did.
    PeerJoined { peer: PeerDescriptor },
    /// A peer left the room (disconnect or timeout).
    PeerLeft { id: String },
    /// A signaling payload addressed to us, originating from `sender`.
    Signal {
        sender: String,
        #[serde(flatten)]
        signal: SignalPayload,
    },
    /// Keepalive request; answer with a `pong` (spec §4.4).
    Ping,
}

/// Frames a peer sends to the rendezvous server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerRequest {
    /// Forward a signaling payload to `target`.
    Signal {
        target: String,
        #[serde(flatten)]
        signal: SignalPayload,
    },
    /// Answer a server `ping`.
    Pong,
    /// Courtesy notice sent just before the page unloads, so the server
    /// reaps this peer immediately instead of waiting out a dead-socket
    /// timeout (spec §4.4).
    Disconnect,
}

/// One file's transfer header, sent once before its partitions (spec
/// §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferHeader {
    /// Transfer id, unique within the session, so header/partition/ack
    /// frames for concurrently queued files don't get confused.
    pub id: String,
    pub name: String,
    pub mime: String,
    pub size: u64,
}

/// Control frames spoken over an open peer session, once SDP/ICE
/// negotiation (handled by [`crate::session::rtc`]) has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionMessage {
    /// Announce an upcoming file transfer; partitions follow as raw
    /// binary frames out-of-band of this enum.
    Header(TransferHeader),
    /// Flow-control acknowledgement: the number of bytes of `id` the
    /// receiver has reassembled so far, so the sender can throttle
    /// (spec §4.5, partition_received carries the receiver's real
    /// running offset rather than echoing the whole frame back).
    PartitionReceived { id: String, bytes_received: u64 },
    /// Progress notice the *sender* pushes proactively, gated by
    /// `progress_report_threshold` (spec §6), so a receiver that
    /// isn't separately instrumented can still drive a progress bar.
    Progress { id: String, progress: f64 },
    /// All partitions for `id` have been sent.
    TransferComplete { id: String },
    /// A standalone text message, unrelated to any file transfer.
    Text { text: String },
    /// Binary partition data carried over a transport that cannot send
    /// raw binary frames of its own (spec §4.7, relay fallback). Not
    /// used over a direct RTC data channel, which sends partitions as
    /// plain binary frames instead.
    RelayBinary { id: String, data: String },
}
