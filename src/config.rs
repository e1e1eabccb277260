//! # Engine configuration
//!
//! The injected configuration structure called for in spec §9 ("Global
//! state... Model as an injected configuration structure"). Everything
//! the core needs to know about its host page and the rendezvous
//! deployment lives here, constructed once by the `wasm` glue layer and
//! threaded down to the `ServerConnection`, the `PeersManager`, and every
//! `PeerSession`.

use serde::{Deserialize, Serialize};

/// One STUN or TURN endpoint, opaque to the core beyond what's needed to
/// hand it to `RTCConfiguration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    /// One or more `stun:`/`turn:` URLs for this server.
    pub urls: Vec<String>,
    /// TURN username, if this is a TURN server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential, if this is a TURN server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Facts about the hosting page needed to derive the rendezvous endpoint
/// (spec §4.4). Supplied by the `wasm` glue layer, which is the only code
/// that can actually inspect `window.location`.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Whether the hosting page was loaded over `https:`.
    pub secure: bool,
    /// The page's hostname (e.g. `"snap.example.com"` or `"localhost"`).
    pub hostname: String,
    /// Whether the runtime can create `RTCPeerConnection`s at all.
    pub rtc_supported: bool,
}

impl HostContext {
    /// Resolve the rendezvous endpoint per spec §4.4:
    /// - scheme: `wss` if secure, else `ws`
    /// - host: `localhost:<dev_port>` when hosted at localhost, else `<hostname>/server`
    /// - path: `/webrtc` if RTC is supported, else `/fallback`
    pub fn server_url(&self, dev_port: u16) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let host = if self.hostname == "localhost" || self.hostname == "127.0.0.1" {
            format!("localhost:{}", dev_port)
        } else {
            format!("{}/server", self.hostname)
        };
        let path = if self.rtc_supported { "webrtc" } else { "fallback" };
        format!("{scheme}://{host}/{path}")
    }
}

/// Tunable protocol constants (spec §6), all with the distilled spec's
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// ICE servers handed opaquely to `RTCConfiguration`.
    pub ice_servers: Vec<IceServer>,
    /// Maximum size of one binary chunk, in bytes.
    pub chunk_size: usize,
    /// Maximum total size of one partition, in bytes.
    pub max_partition_size: usize,
    /// Server reconnect delay, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Minimum progress delta (0..1) before a `progress` frame is sent.
    pub progress_report_threshold: f64,
    /// Dev-server port used when the hosting page is `localhost`.
    pub dev_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            chunk_size: 64_000,
            max_partition_size: 1_000_000,
            reconnect_delay_ms: 5_000,
            progress_report_threshold: 0.01,
            dev_port: 3000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_size, 64_000);
        assert_eq!(cfg.max_partition_size, 1_000_000);
        assert_eq!(cfg.reconnect_delay_ms, 5_000);
        assert_eq!(cfg.progress_report_threshold, 0.01);
    }

    #[test]
    fn server_url_selects_localhost_dev_port() {
        let host = HostContext { secure: false, hostname: "localhost".into(), rtc_supported: true };
        assert_eq!(host.server_url(3000), "ws://localhost:3000/webrtc");
    }

    #[test]
    fn server_url_selects_secure_fallback_path() {
        let host = HostContext { secure: true, hostname: "snap.example.com".into(), rtc_supported: false };
        assert_eq!(host.server_url(3000), "wss://snap.example.com/server/fallback");
    }
}
