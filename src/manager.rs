//! # Peers Manager
//!
//! The registry correlating server-visible peer identities with live
//! [`PeerSession`]s (spec §4.8): creates a session the first time a peer
//! is seen (either in a `peers`/`peer-joined` roster or as the sender of
//! an unsolicited `signal`), refreshes it when the peer reappears, tears
//! it down on `peer-left`, and routes the two user-initiated actions
//! (`files-selected`, `send-text`) to the right session.
//!
//! Building an actual session means either kicking off an RTC handshake
//! or wrapping the shared [`crate::server::ServerConnection`] in a
//! [`crate::session::relay::RelayTransport`] — both of which need a real
//! browser to run for real. [`SessionFactory`] is the seam that keeps
//! this module's routing logic (the part spec §8's invariant 6, "at most
//! one session per peer id", is actually about) unit-testable without
//! one, the same role [`crate::server::SocketFactory`] and
//! [`crate::server::Timer`] play for [`crate::server::ServerConnection`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::protocol::PeerDescriptor;
use crate::session::PeerSession;
use crate::transfer::ChunkSource;

/// Builds and drives the concrete session for a peer id, so
/// [`PeersManager`] never has to know whether that session ended up RTC
/// or relay. `wasm`'s live implementation (paired with
/// [`crate::session::rtc::wasm_impl`]) kicks off the real handshake;
/// tests substitute one that hands back sessions over an in-memory
/// transport.
pub trait SessionFactory {
    /// Begin a caller-role RTC handshake toward `peer_id` (spec §4.6)
    /// and return the session immediately — its transport starts closed
    /// and becomes usable once the data channel opens in the
    /// background.
    fn create_rtc_caller(&self, peer_id: &str) -> Result<Rc<PeerSession>>;
    /// Construct a callee-role RTC session awaiting an inbound offer.
    fn create_rtc_callee(&self, peer_id: &str) -> Result<Rc<PeerSession>>;
    /// Construct a relay session; no handshake (spec §4.7).
    fn create_relay(&self, peer_id: &str) -> Result<Rc<PeerSession>>;
    /// Hand a signaling payload (offer, answer, or ICE candidate) to
    /// whatever is running `peer_id`'s RTC handshake. A no-op for a
    /// relay session, which never calls this.
    fn forward_signal(&self, peer_id: &str, payload: serde_json::Value) -> Result<()>;
    /// Restart the handshake for a peer whose transport isn't open, in
    /// whatever role it was last assigned; a no-op if it already is
    /// (spec §4.6 `refresh()`).
    fn refresh(&self, peer_id: &str, session: &Rc<PeerSession>) -> Result<()>;
}

/// `peer id -> session` registry (spec §4.8).
pub struct PeersManager {
    /// Whether this runtime itself can do RTC — decides, together with
    /// the remote peer's advertised `rtc_supported`, whether a newly
    /// seen peer gets an RTC or a relay session.
    self_rtc_supported: bool,
    factory: Rc<dyn SessionFactory>,
    sessions: RefCell<HashMap<String, Rc<PeerSession>>>,
}

impl PeersManager {
    pub fn new(self_rtc_supported: bool, factory: Rc<dyn SessionFactory>) -> Self {
        Self { self_rtc_supported, factory, sessions: RefCell::new(HashMap::new()) }
    }

    /// The session currently registered for `peer_id`, if any.
    pub fn session(&self, peer_id: &str) -> Option<Rc<PeerSession>> {
        self.sessions.borrow().get(peer_id).cloned()
    }

    /// Number of live sessions. Exercises invariant 6 (spec §8): this
    /// can never exceed the number of distinct peer ids ever passed to
    /// [`Self::handle_peer_joined`] or [`Self::handle_signal`] minus
    /// those removed by [`Self::handle_peer_left`].
    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.borrow().is_empty()
    }

    /// spec §4.8: on `signal` from server — ensure a (callee-role)
    /// session exists for an unfamiliar sender, then forward the
    /// payload to it regardless.
    pub fn handle_signal(&self, sender: &str, payload: serde_json::Value) -> Result<()> {
        let exists = self.sessions.borrow().contains_key(sender);
        if !exists {
            let session = self.factory.create_rtc_callee(sender)?;
            self.sessions.borrow_mut().insert(sender.to_string(), session);
        }
        self.factory.forward_signal(sender, payload)
    }

    /// spec §4.8: on `peers` from server — the full roster snapshot,
    /// one [`Self::handle_peer_joined`] per entry.
    pub fn handle_peers(&self, peers: Vec<PeerDescriptor>) -> Result<()> {
        for peer in peers {
            self.handle_peer_joined(peer)?;
        }
        Ok(())
    }

    /// spec §4.8: on `peer-joined` from server (also the per-entry body
    /// of a `peers` roster). A peer already known is refreshed in place
    /// rather than replaced, so a mid-transfer session survives a
    /// server-side roster re-announce.
    pub fn handle_peer_joined(&self, peer: PeerDescriptor) -> Result<()> {
        if let Some(session) = self.session(&peer.id) {
            return self.factory.refresh(&peer.id, &session);
        }
        let session = if self.self_rtc_supported && peer.rtc_supported {
            self.factory.create_rtc_caller(&peer.id)?
        } else {
            self.factory.create_relay(&peer.id)?
        };
        self.sessions.borrow_mut().insert(peer.id, session);
        Ok(())
    }

    /// spec §4.8: on `peer-left` — drop the session (and with it, its
    /// transport: `Rc`'s last reference going away lets the underlying
    /// `RtcPeerConnection`/relay handle's `Drop` close things out).
    pub fn handle_peer_left(&self, id: &str) {
        self.sessions.borrow_mut().remove(id);
    }

    /// spec §4.8: on `files-selected {to, files}`.
    pub async fn send_files(&self, to: &str, files: Vec<Box<dyn ChunkSource>>) -> Result<()> {
        let session = self.session(to).ok_or_else(|| Error::UnknownPeer(to.to_string()))?;
        session.send_files(files).await
    }

    /// spec §4.8: on `send-text {to, text}`.
    pub async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        let session = self.session(to).ok_or_else(|| Error::UnknownPeer(to.to_string()))?;
        session.send_text(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::protocol::SessionMessage;
    use crate::session::Transport;
    use async_trait::async_trait;
    use std::cell::Cell;

    struct RecordingTransport {
        open: Cell<bool>,
        sent: Rc<RefCell<Vec<SessionMessage>>>,
    }

    #[async_trait(?Send)]
    impl Transport for RecordingTransport {
        async fn send_control(&self, msg: &SessionMessage) -> Result<()> {
            self.sent.borrow_mut().push(msg.clone());
            Ok(())
        }
        async fn send_partition(&self, _id: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open.get()
        }
    }

    /// A [`SessionFactory`] that builds every session over an in-memory
    /// [`RecordingTransport`] and records every call made to it, so
    /// tests can assert on the *routing decisions* `PeersManager` made
    /// without a browser anywhere in sight.
    #[derive(Default)]
    struct MockFactory {
        calls: RefCell<Vec<String>>,
        forwarded: RefCell<Vec<(String, serde_json::Value)>>,
    }

    impl MockFactory {
        fn session(&self, peer_id: &str, open: bool) -> Rc<PeerSession> {
            let transport = Rc::new(RecordingTransport { open: Cell::new(open), sent: Rc::new(RefCell::new(Vec::new())) });
            Rc::new(PeerSession::new(peer_id.to_string(), transport, EventBus::new(), EngineConfig::default()))
        }
    }

    impl SessionFactory for MockFactory {
        fn create_rtc_caller(&self, peer_id: &str) -> Result<Rc<PeerSession>> {
            self.calls.borrow_mut().push(format!("caller:{peer_id}"));
            Ok(self.session(peer_id, true))
        }
        fn create_rtc_callee(&self, peer_id: &str) -> Result<Rc<PeerSession>> {
            self.calls.borrow_mut().push(format!("callee:{peer_id}"));
            Ok(self.session(peer_id, true))
        }
        fn create_relay(&self, peer_id: &str) -> Result<Rc<PeerSession>> {
            self.calls.borrow_mut().push(format!("relay:{peer_id}"));
            Ok(self.session(peer_id, true))
        }
        fn forward_signal(&self, peer_id: &str, payload: serde_json::Value) -> Result<()> {
            self.forwarded.borrow_mut().push((peer_id.to_string(), payload));
            Ok(())
        }
        fn refresh(&self, peer_id: &str, _session: &Rc<PeerSession>) -> Result<()> {
            self.calls.borrow_mut().push(format!("refresh:{peer_id}"));
            Ok(())
        }
    }

    fn peer(id: &str, rtc_supported: bool) -> PeerDescriptor {
        PeerDescriptor { id: id.to_string(), name: None, rtc_supported }
    }

    #[test]
    fn peers_with_rtc_support_get_an_rtc_caller_session() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory.clone());

        manager.handle_peers(vec![peer("b", true)]).unwrap();

        assert_eq!(manager.len(), 1);
        assert!(manager.session("b").is_some());
        assert_eq!(*factory.calls.borrow(), vec!["caller:b".to_string()]);
    }

    #[test]
    fn peer_lacking_rtc_support_falls_back_to_relay() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory.clone());

        manager.handle_peers(vec![peer("b", false)]).unwrap();

        assert_eq!(*factory.calls.borrow(), vec!["relay:b".to_string()]);
    }

    #[test]
    fn self_without_rtc_support_always_relays() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(false, factory.clone());

        manager.handle_peers(vec![peer("b", true)]).unwrap();

        assert_eq!(*factory.calls.borrow(), vec!["relay:b".to_string()]);
    }

    #[test]
    fn reappearing_peer_is_refreshed_not_recreated() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory.clone());

        manager.handle_peers(vec![peer("b", true)]).unwrap();
        manager.handle_peers(vec![peer("b", true)]).unwrap();

        assert_eq!(manager.len(), 1, "spec invariant 6: at most one session per peer id");
        assert_eq!(*factory.calls.borrow(), vec!["caller:b".to_string(), "refresh:b".to_string()]);
    }

    #[test]
    fn signal_from_unknown_sender_creates_callee_session() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory.clone());

        manager.handle_signal("c", serde_json::json!({"kind": "offer", "sdp": "v=0"})).unwrap();

        assert!(manager.session("c").is_some());
        assert_eq!(*factory.calls.borrow(), vec!["callee:c".to_string()]);
        assert_eq!(factory.forwarded.borrow().len(), 1);
    }

    #[test]
    fn signal_from_known_sender_only_forwards() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory.clone());
        manager.handle_peers(vec![peer("b", true)]).unwrap();

        manager.handle_signal("b", serde_json::json!({"kind": "ice", "candidate": "..."})).unwrap();

        assert_eq!(*factory.calls.borrow(), vec!["caller:b".to_string()], "no extra session created");
        assert_eq!(factory.forwarded.borrow().len(), 1);
    }

    #[test]
    fn peer_left_removes_the_session() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory.clone());
        manager.handle_peers(vec![peer("b", true)]).unwrap();

        manager.handle_peer_left("b");

        assert!(manager.session("b").is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn send_text_to_unknown_peer_is_an_error() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory);

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let local = tokio::task::LocalSet::new();
        let result = local.block_on(&rt, manager.send_text("ghost", "hi"));
        assert!(matches!(result.unwrap_err(), Error::UnknownPeer(id) if id == "ghost"));
    }

    #[test]
    fn send_text_routes_to_the_right_session() {
        let factory = Rc::new(MockFactory::default());
        let manager = PeersManager::new(true, factory);
        manager.handle_peers(vec![peer("b", true)]).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, manager.send_text("b", "hello")).unwrap();
    }
}
