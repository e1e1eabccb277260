//! # Server Connection
//!
//! The WebSocket link to the rendezvous server (spec §4.4): resolves an
//! endpoint from [`HostContext`], answers `ping` with `pong`, forwards
//! `signal` frames to the [`crate::session`] layer, and reconnects once
//! after an unexpected close. Structured the same way the teacher's
//! `network::mod` documents its connection lifecycle (disconnected →
//! connecting → connected → disconnected), even though the teacher
//! itself never implements a `WebSocket` client directly — this module
//! is written fresh in that lifecycle's idiom.

pub mod socket;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config::{EngineConfig, HostContext};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::protocol::{ServerMessage, ServerRequest, SignalPayload};
use crate::session::relay::SignalSender;
use socket::Socket;

/// Schedules a one-shot callback after a delay. Implemented with
/// `window.set_timeout` on `wasm32` and a spawned `tokio::time::sleep`
/// natively, so the reconnect-after-close logic can be driven
/// deterministically in tests via a fake implementation.
pub trait Timer {
    fn schedule(&self, delay_ms: u64, callback: Box<dyn FnOnce()>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Builds a fresh [`Socket`] for a connection attempt. A trait rather
/// than a bare closure so it can be named in `ServerConnection`'s type
/// without boxing headaches, and so the `wasm` glue can hand over a
/// factory that captures the page's resolved URL once.
pub trait SocketFactory {
    fn connect(&self, url: &str) -> Result<Rc<dyn Socket>>;
}

pub struct ServerConnection {
    config: EngineConfig,
    host: HostContext,
    bus: EventBus,
    factory: Rc<dyn SocketFactory>,
    timer: Rc<dyn Timer>,

    socket: RefCell<Option<Rc<dyn Socket>>>,
    state: Cell<ConnectionState>,
    reconnect_pending: Cell<bool>,
    on_signal: RefCell<Option<Box<dyn Fn(String, serde_json::Value)>>>,
}

impl ServerConnection {
    pub fn new(config: EngineConfig, host: HostContext, bus: EventBus, factory: Rc<dyn SocketFactory>, timer: Rc<dyn Timer>) -> Rc<Self> {
        Rc::new(Self {
            config,
            host,
            bus,
            factory,
            timer,
            socket: RefCell::new(None),
            state: Cell::new(ConnectionState::Disconnected),
            reconnect_pending: Cell::new(false),
            on_signal: RefCell::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Register the handler that receives a `signal` frame's sender and
    /// opaque payload, so the session layer (owned by
    /// [`crate::manager::PeersManager`]) can drive SDP/ICE negotiation
    /// or relayed session traffic without this module knowing anything
    /// about WebRTC. Mirrors the single-callback registration pattern
    /// the `wasm` glue uses for UI events.
    pub fn on_signal<F>(&self, handler: F)
    where
        F: Fn(String, serde_json::Value) + 'static,
    {
        *self.on_signal.borrow_mut() = Some(Box::new(handler));
    }

    fn endpoint(&self) -> String {
        self.host.server_url(self.config.dev_port)
    }

    /// Open a connection attempt. Idempotent: calling it while already
    /// connecting or connected is a no-op.
    pub fn connect(self: &Rc<Self>) -> Result<()> {
        if self.state.get() != ConnectionState::Disconnected {
            return Ok(());
        }
        self.state.set(ConnectionState::Connecting);
        let socket = self.factory.connect(&self.endpoint())?;
        *self.socket.borrow_mut() = Some(socket);
        Ok(())
    }

    /// Called by the glue layer once the socket's `open` event fires.
    pub fn handle_open(&self) {
        self.state.set(ConnectionState::Connected);
        self.reconnect_pending.set(false);
    }

    /// Called by the glue layer for every inbound text frame.
    pub fn handle_message(&self, raw: &str) -> Result<()> {
        let msg: ServerMessage = serde_json::from_str(raw).map_err(|e| Error::MalformedServerFrame(e.to_string()))?;
        match msg {
            ServerMessage::Peers { peers } => self.bus.fire(Event::Peers { peers }),
            ServerMessage::PeerJoined { peer } => self.bus.fire(Event::PeerJoined { peer }),
            ServerMessage::PeerLeft { id } => self.bus.fire(Event::PeerLeft { id }),
            ServerMessage::Signal { sender, signal } => {
                self.bus.fire(Event::Signal { sender: sender.clone() });
                if let Some(handler) = self.on_signal.borrow().as_ref() {
                    handler(sender, signal.payload);
                }
            }
            ServerMessage::Ping => self.send_request(&ServerRequest::Pong)?,
        }
        Ok(())
    }

    /// Called by the glue layer when the socket closes or errors.
    /// Per spec §4.4, the connection retries exactly once, after
    /// `reconnect_delay_ms`, rather than backing off indefinitely.
    pub fn handle_close(self: &Rc<Self>) {
        let was_connected = self.state.get() != ConnectionState::Disconnected;
        self.state.set(ConnectionState::Disconnected);
        *self.socket.borrow_mut() = None;

        if was_connected && !self.reconnect_pending.get() {
            self.reconnect_pending.set(true);
            self.bus.fire(Event::NotifyUser { message: "connection lost, reconnecting...".to_string() });
            let this = self.clone();
            self.timer.schedule(
                self.config.reconnect_delay_ms,
                Box::new(move || {
                    this.reconnect_pending.set(false);
                    let _ = this.connect();
                }),
            );
        }
    }

    /// The page became hidden/visible (spec §4.4 lifecycle). A hidden
    /// page keeps its connection open — browsers throttle but do not
    /// kill WebSocket timers the way they do animation frames — so there's
    /// nothing to do there beyond logging. Returning to visible attempts a
    /// connect, which is a no-op per [`Self::connect`] if already
    /// connected or connecting.
    pub fn handle_visibility_change(self: &Rc<Self>, visible: bool) {
        if visible {
            let _ = self.connect();
        } else {
            tracing::debug!("page hidden while server connection is {:?}", self.state.get());
        }
    }

    /// The page is unloading; send the courtesy `disconnect` frame so the
    /// server reaps this peer immediately instead of waiting for a
    /// dead-socket timeout, then close.
    pub fn handle_before_unload(&self) {
        let _ = self.send_request(&ServerRequest::Disconnect);
        if let Some(socket) = self.socket.borrow().as_ref() {
            socket.close();
        }
        self.state.set(ConnectionState::Disconnected);
    }

    fn send_request(&self, request: &ServerRequest) -> Result<()> {
        let socket = self.socket.borrow();
        let socket = socket.as_ref().ok_or(Error::NotConnected)?;
        let json = serde_json::to_string(request)?;
        socket.send_text(&json)
    }
}

impl SignalSender for ServerConnection {
    fn send_signal(&self, target_peer: &str, payload: serde_json::Value) -> Result<()> {
        self.send_request(&ServerRequest::Signal {
            target: target_peer.to_string(),
            signal: SignalPayload { payload },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerDescriptor;
    use socket::mock::MockSocket;
    use std::rc::Rc;

    struct FixedSocketFactory {
        socket: Rc<MockSocket>,
    }

    impl SocketFactory for FixedSocketFactory {
        fn connect(&self, _url: &str) -> Result<Rc<dyn Socket>> {
            Ok(self.socket.clone() as Rc<dyn Socket>)
        }
    }

    struct ImmediateTimer {
        fired: RefCell<Vec<(u64, Box<dyn FnOnce()>)>>,
    }

    impl ImmediateTimer {
        fn new() -> Rc<Self> {
            Rc::new(Self { fired: RefCell::new(Vec::new()) })
        }

        fn run_all(&self) {
            let pending = self.fired.borrow_mut().drain(..).collect::<Vec<_>>();
            for (_, cb) in pending {
                cb();
            }
        }
    }

    impl Timer for ImmediateTimer {
        fn schedule(&self, delay_ms: u64, callback: Box<dyn FnOnce()>) {
            self.fired.borrow_mut().push((delay_ms, callback));
        }
    }

    fn host() -> HostContext {
        HostContext { secure: false, hostname: "localhost".into(), rtc_supported: true }
    }

    #[test]
    fn connect_transitions_to_connecting_then_connected() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock });
        let timer = ImmediateTimer::new();
        let conn = ServerConnection::new(EngineConfig::default(), host(), EventBus::new(), factory, timer);

        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.handle_open();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock.clone() });
        let timer = ImmediateTimer::new();
        let conn = ServerConnection::new(EngineConfig::default(), host(), EventBus::new(), factory, timer);
        conn.connect().unwrap();
        conn.handle_open();

        conn.handle_message(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(mock.sent.borrow().last().unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn peers_frame_fires_bus_event() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock });
        let timer = ImmediateTimer::new();
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        bus.on("peers", move |event| {
            if let Event::Peers { peers } = event {
                s.borrow_mut().extend(peers.iter().map(|p| p.id.clone()));
            }
        });
        let conn = ServerConnection::new(EngineConfig::default(), host(), bus, factory, timer);
        conn.connect().unwrap();
        conn.handle_open();

        let peer = PeerDescriptor { id: "p1".into(), name: None, rtc_supported: true };
        let frame = serde_json::to_string(&ServerMessage::Peers { peers: vec![peer] }).unwrap();
        conn.handle_message(&frame).unwrap();

        assert_eq!(*seen.borrow(), vec!["p1".to_string()]);
    }

    #[test]
    fn unexpected_close_schedules_exactly_one_reconnect() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock });
        let timer = ImmediateTimer::new();
        let conn = ServerConnection::new(EngineConfig::default(), host(), EventBus::new(), factory, timer.clone());
        conn.connect().unwrap();
        conn.handle_open();

        conn.handle_close();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(timer.fired.borrow().len(), 1);

        timer.run_all();
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn visibility_returning_reconnects_when_disconnected() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock });
        let timer = ImmediateTimer::new();
        let conn = ServerConnection::new(EngineConfig::default(), host(), EventBus::new(), factory, timer);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.handle_visibility_change(true);
        assert_eq!(conn.state(), ConnectionState::Connecting, "visible page should attempt to connect");
    }

    #[test]
    fn visibility_returning_is_a_no_op_when_already_connected() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock });
        let timer = ImmediateTimer::new();
        let conn = ServerConnection::new(EngineConfig::default(), host(), EventBus::new(), factory, timer);
        conn.connect().unwrap();
        conn.handle_open();

        conn.handle_visibility_change(true);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn before_unload_sends_disconnect_courtesy_frame_then_closes() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock.clone() });
        let timer = ImmediateTimer::new();
        let conn = ServerConnection::new(EngineConfig::default(), host(), EventBus::new(), factory, timer);
        conn.connect().unwrap();
        conn.handle_open();

        conn.handle_before_unload();

        assert_eq!(mock.sent.borrow().last().unwrap(), r#"{"type":"disconnect"}"#);
        assert!(!mock.is_open());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn send_signal_wraps_target_and_payload() {
        let mock = MockSocket::new_open();
        let factory = Rc::new(FixedSocketFactory { socket: mock.clone() });
        let timer = ImmediateTimer::new();
        let conn = ServerConnection::new(EngineConfig::default(), host(), EventBus::new(), factory, timer);
        conn.connect().unwrap();
        conn.handle_open();

        conn.send_signal("peer-9", serde_json::json!({"kind": "offer", "sdp": "v=0"})).unwrap();
        let sent = mock.sent.borrow();
        let value: serde_json::Value = serde_json::from_str(sent.last().unwrap()).unwrap();
        assert_eq!(value["type"], "signal");
        assert_eq!(value["target"], "peer-9");
        assert_eq!(value["payload"]["kind"], "offer");
    }
}
