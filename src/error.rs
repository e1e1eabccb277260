//! # Error Handling
//!
//! A single error type for the engine, categorized by the domain it
//! originates in. Mirrors the error hierarchy/`code()` convention used
//! throughout the Umbra Core library this engine is adapted from, but
//! scoped to the domains a signaling + transfer engine actually has:
//! signaling, session transport, and the transfer protocol itself.
//!
//! ## Crossing the wasm boundary
//!
//! Interior code always returns `Result<T, Error>` and propagates with
//! `?`. Per §7 of the specification, no error should surface to the host
//! page as a thrown exception — the `wasm` glue module is the only place
//! that converts an `Err` into a `notify-user` event or a dropped log
//! line; it never lets a `Result::Err` escape as a JS exception.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    // ------------------------------------------------------------------
    // Signaling / Server Connection (100-199)
    // ------------------------------------------------------------------
    /// The server connection is not open; the send was dropped.
    #[error("server connection is not open")]
    NotConnected,

    /// The server sent a frame that didn't parse as a known envelope.
    #[error("malformed server frame: {0}")]
    MalformedServerFrame(String),

    /// An unrecognized `type` discriminator was received and dropped.
    #[error("unknown server message type: {0}")]
    UnknownServerMessageType(String),

    // ------------------------------------------------------------------
    // Session / transport (200-299)
    // ------------------------------------------------------------------
    /// No session exists for the given peer id.
    #[error("no session for peer {0}")]
    UnknownPeer(String),

    /// A session already exists for a peer id that was about to be created.
    #[error("session already exists for peer {0}")]
    DuplicateSession(String),

    /// The underlying transport (data channel or relay) is closed.
    #[error("transport closed for peer {0}")]
    TransportClosed(String),

    /// SDP or ICE negotiation failed.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    // ------------------------------------------------------------------
    // Transfer protocol (300-399)
    // ------------------------------------------------------------------
    /// A frame was received that violates the transfer state machine
    /// (e.g. a chunk with no transfer in progress).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The Digester received more bytes than the declared transfer size.
    #[error("digester overrun: received {received} bytes, expected {expected}")]
    DigesterOverrun {
        /// Bytes actually received.
        received: u64,
        /// Bytes declared in the transfer header.
        expected: u64,
    },

    /// The chunk source could not be read (e.g. the browser `File` read failed).
    #[error("failed to read chunk: {0}")]
    ChunkReadFailed(String),

    // ------------------------------------------------------------------
    // Internal (900-999)
    // ------------------------------------------------------------------
    /// Serialization/deserialization of a protocol frame failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Catch-all for host-runtime failures (DOM/JS exceptions surfaced
    /// through `wasm` glue).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// A stable numeric code for the error's domain, for logging and for
    /// any host-side error taxonomy the UI collaborator wants to branch on.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotConnected => 100,
            Error::MalformedServerFrame(_) => 101,
            Error::UnknownServerMessageType(_) => 102,

            Error::UnknownPeer(_) => 200,
            Error::DuplicateSession(_) => 201,
            Error::TransportClosed(_) => 202,
            Error::NegotiationFailed(_) => 203,

            Error::ProtocolViolation(_) => 300,
            Error::DigesterOverrun { .. } => 301,
            Error::ChunkReadFailed(_) => 302,

            Error::Serialization(_) => 900,
            Error::Internal(_) => 901,
        }
    }

    /// Whether this error is recoverable by a later retry (reconnect,
    /// refresh, or re-handshake) rather than being a hard programming error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::TransportClosed(_)
                | Error::NegotiationFailed(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::NotConnected.code(), 100);
        assert_eq!(Error::UnknownPeer("x".into()).code(), 200);
        assert_eq!(Error::ProtocolViolation("x".into()).code(), 300);
        assert_eq!(Error::Internal("x".into()).code(), 901);
    }

    #[test]
    fn recoverable_classification() {
        assert!(Error::NotConnected.is_recoverable());
        assert!(Error::TransportClosed("p1".into()).is_recoverable());
        assert!(!Error::ProtocolViolation("bad".into()).is_recoverable());
    }

    #[test]
    fn digester_overrun_reports_both_values() {
        let err = Error::DigesterOverrun { received: 10, expected: 5 };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains('5'));
    }
}
