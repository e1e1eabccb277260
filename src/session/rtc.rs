//! # RTC Peer Session
//!
//! Establishes a direct `RTCPeerConnection` + `RTCDataChannel` to another
//! peer (spec §4.6), using the rendezvous server purely to carry SDP
//! offer/answer and ICE candidates (spec §4.4's `signal` frames).
//! Grounded on the teacher's `network::webrtc_transport` module: the
//! caller/callee role split, the `Closure`-per-event wiring, and storing
//! the connection behind `Rc<RefCell<_>>` so JS callbacks can reach back
//! into it are all carried over; what's new is driving a
//! [`super::PeerSession`] instead of a libp2p `StreamMuxer`.
//!
//! [`RtcHandshakeState`] is kept free of `web-sys` so the negotiation
//! state machine itself — who offers, what a candidate or answer does to
//! the state, what counts as a terminal failure — can be unit-tested
//! without a browser.

use crate::error::{Error, Result};

/// Which side of the handshake this peer plays. Decided structurally by
/// which [`crate::manager::SessionFactory`] method constructed the
/// session (spec §4.6): a peer seen in the peers-list path gets
/// `create_rtc_caller` and so is the `Caller`; a peer first seen as the
/// sender of an unsolicited `signal` gets `create_rtc_callee` and so is
/// the `Callee`. There is no separate tie-breaking rule to apply once
/// that choice is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Negotiation state, independent of any particular transport library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcHandshakeState {
    /// No connection attempt has started.
    Idle,
    /// We are the caller and have created an offer, awaiting an answer.
    AwaitingAnswer,
    /// We are the callee and have received an offer, awaiting local
    /// answer creation to complete.
    AwaitingLocalAnswer,
    /// SDP is exchanged; ICE is still connecting.
    Negotiating,
    /// The data channel is open and ready to carry session traffic.
    Open,
    /// Negotiation failed or the channel closed after being open.
    Closed,
}

impl RtcHandshakeState {
    /// Apply the event of creating/receiving an SDP offer as the caller.
    pub fn on_local_offer_created(self) -> Result<Self> {
        match self {
            RtcHandshakeState::Idle => Ok(RtcHandshakeState::AwaitingAnswer),
            other => Err(Error::NegotiationFailed(format!("unexpected local offer from state {other:?}"))),
        }
    }

    /// Apply the event of receiving a remote offer as the callee.
    pub fn on_remote_offer_received(self) -> Result<Self> {
        match self {
            RtcHandshakeState::Idle => Ok(RtcHandshakeState::AwaitingLocalAnswer),
            other => Err(Error::NegotiationFailed(format!("unexpected remote offer in state {other:?}"))),
        }
    }

    /// Apply the event of receiving the remote answer as the caller.
    pub fn on_remote_answer_received(self) -> Result<Self> {
        match self {
            RtcHandshakeState::AwaitingAnswer => Ok(RtcHandshakeState::Negotiating),
            other => Err(Error::NegotiationFailed(format!("unexpected answer in state {other:?}"))),
        }
    }

    /// Apply the event of the callee's local answer being set, moving
    /// both sides into ICE negotiation.
    pub fn on_local_answer_set(self) -> Result<Self> {
        match self {
            RtcHandshakeState::AwaitingLocalAnswer => Ok(RtcHandshakeState::Negotiating),
            other => Err(Error::NegotiationFailed(format!("unexpected local answer in state {other:?}"))),
        }
    }

    /// Apply the event of the data channel opening.
    pub fn on_channel_open(self) -> Self {
        RtcHandshakeState::Open
    }

    /// Apply the event of an ICE/connection failure or the channel
    /// closing, from any state.
    pub fn on_failed_or_closed(self) -> Self {
        RtcHandshakeState::Closed
    }

    pub fn is_open(self) -> bool {
        matches!(self, RtcHandshakeState::Open)
    }
}

#[cfg(target_arch = "wasm32")]
pub mod wasm_impl {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::{Rc, Weak};

    use async_trait::async_trait;
    use js_sys::{Array, Reflect};
    use send_wrapper::SendWrapper;
    use serde::{Deserialize, Serialize};
    use wasm_bindgen::closure::Closure;
    use wasm_bindgen::{JsCast, JsValue};
    use wasm_bindgen_futures::JsFuture;
    use web_sys::{
        RtcConfiguration, RtcDataChannel, RtcDataChannelType, RtcIceCandidate, RtcIceCandidateInit,
        RtcIceServer, RtcPeerConnection, RtcSdpType, RtcSessionDescriptionInit,
    };

    use std::collections::HashMap;

    use crate::config::EngineConfig;
    use crate::events::EventBus;
    use crate::manager::SessionFactory;
    use crate::protocol::SessionMessage;
    use crate::server::ServerConnection;
    use crate::session::relay::RelayTransport;
    use crate::session::{PeerSession, Transport};

    /// One SDP body or ICE candidate, carried inside a `signal` server
    /// frame (spec §4.4/§4.6). Distinguished by `kind` rather than by
    /// nesting in `serde(untagged)`, so a malformed payload fails to
    /// parse loudly instead of silently matching the wrong arm.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "kebab-case")]
    pub enum SignalBody {
        Offer { sdp: String },
        Answer { sdp: String },
        IceCandidate { candidate: String, sdp_mid: Option<String>, sdp_m_line_index: Option<u16> },
    }

    fn build_peer_connection(config: &EngineConfig) -> Result<RtcPeerConnection> {
        let rtc_config = RtcConfiguration::new();
        let ice_servers = Array::new();
        for server in &config.ice_servers {
            let ice_server = RtcIceServer::new();
            let urls = Array::new();
            for url in &server.urls {
                urls.push(&JsValue::from_str(url));
            }
            ice_server.set_urls(&urls);
            if let Some(username) = &server.username {
                ice_server.set_username(username);
            }
            if let Some(credential) = &server.credential {
                ice_server.set_credential(credential);
            }
            ice_servers.push(&ice_server);
        }
        rtc_config.set_ice_servers(&ice_servers);
        RtcPeerConnection::new_with_configuration(&rtc_config)
            .map_err(|e| Error::NegotiationFailed(format!("RTCPeerConnection construction failed: {e:?}")))
    }

    /// Live RTC transport: the connection that must outlive its channel,
    /// plus the channel itself. The caller path has a concrete channel
    /// from the moment the offer is created; the callee path only learns
    /// its channel once the browser's `ondatachannel` event fires after
    /// the offer is accepted, so the slot starts empty and
    /// [`Self::set_channel`] fills it in later (spec §4.6: "it waits for
    /// the remote-created channel to appear").
    pub struct RtcLiveTransport {
        #[allow(dead_code)]
        connection: SendWrapper<RtcPeerConnection>,
        channel: SendWrapper<RefCell<Option<RtcDataChannel>>>,
    }

    impl RtcLiveTransport {
        pub fn new(connection: RtcPeerConnection, channel: RtcDataChannel) -> Self {
            channel.set_binary_type(RtcDataChannelType::Arraybuffer);
            Self { connection: SendWrapper::new(connection), channel: SendWrapper::new(RefCell::new(Some(channel))) }
        }

        /// A transport with a connection but no channel yet (callee path
        /// before `ondatachannel` fires).
        pub fn pending(connection: RtcPeerConnection) -> Self {
            Self { connection: SendWrapper::new(connection), channel: SendWrapper::new(RefCell::new(None)) }
        }

        /// Fill in the channel once it's known.
        pub fn set_channel(&self, channel: RtcDataChannel) {
            channel.set_binary_type(RtcDataChannelType::Arraybuffer);
            *self.channel.borrow_mut() = Some(channel);
        }

        /// The channel's current ready state, if it exists yet.
        pub fn ready_state(&self) -> Option<web_sys::RtcDataChannelState> {
            self.channel.borrow().as_ref().map(|c| c.ready_state())
        }
    }

    #[async_trait(?Send)]
    impl Transport for RtcLiveTransport {
        async fn send_control(&self, msg: &SessionMessage) -> Result<()> {
            let json = serde_json::to_string(msg)?;
            let channel = self.channel.borrow();
            let channel = channel.as_ref().ok_or_else(|| Error::TransportClosed("data channel not open yet".into()))?;
            channel
                .send_with_str(&json)
                .map_err(|e| Error::TransportClosed(format!("data channel send failed: {e:?}")))
        }

        async fn send_partition(&self, _id: &str, data: &[u8]) -> Result<()> {
            let channel = self.channel.borrow();
            let channel = channel.as_ref().ok_or_else(|| Error::TransportClosed("data channel not open yet".into()))?;
            channel
                .send_with_u8_array(data)
                .map_err(|e| Error::TransportClosed(format!("data channel send failed: {e:?}")))
        }

        fn is_open(&self) -> bool {
            self.ready_state() == Some(web_sys::RtcDataChannelState::Open)
        }
    }

    /// Create and publish a local offer on an already-built connection.
    /// ICE candidates are not awaited here: they trickle separately via
    /// `onicecandidate` (spec §4.6), which keeps a slow STUN/TURN round
    /// trip from blocking the first signal frame.
    async fn negotiate_local_offer(pc: &RtcPeerConnection) -> Result<String> {
        let offer = JsFuture::from(pc.create_offer())
            .await
            .map_err(|e| Error::NegotiationFailed(format!("create_offer failed: {e:?}")))?;
        let sdp = Reflect::get(&offer, &JsValue::from_str("sdp"))
            .ok()
            .and_then(|v| v.as_string())
            .ok_or_else(|| Error::NegotiationFailed("offer had no sdp field".into()))?;

        let mut desc = RtcSessionDescriptionInit::new(RtcSdpType::Offer);
        desc.set_sdp(&sdp);
        JsFuture::from(pc.set_local_description(&desc))
            .await
            .map_err(|e| Error::NegotiationFailed(format!("set_local_description failed: {e:?}")))?;
        Ok(sdp)
    }

    /// Apply a remote offer and produce the local answer SDP.
    async fn negotiate_remote_offer(pc: &RtcPeerConnection, remote_sdp: &str) -> Result<String> {
        let mut remote_desc = RtcSessionDescriptionInit::new(RtcSdpType::Offer);
        remote_desc.set_sdp(remote_sdp);
        JsFuture::from(pc.set_remote_description(&remote_desc))
            .await
            .map_err(|e| Error::NegotiationFailed(format!("set_remote_description failed: {e:?}")))?;

        let answer = JsFuture::from(pc.create_answer())
            .await
            .map_err(|e| Error::NegotiationFailed(format!("create_answer failed: {e:?}")))?;
        let sdp = Reflect::get(&answer, &JsValue::from_str("sdp"))
            .ok()
            .and_then(|v| v.as_string())
            .ok_or_else(|| Error::NegotiationFailed("answer had no sdp field".into()))?;

        let mut local_desc = RtcSessionDescriptionInit::new(RtcSdpType::Answer);
        local_desc.set_sdp(&sdp);
        JsFuture::from(pc.set_local_description(&local_desc))
            .await
            .map_err(|e| Error::NegotiationFailed(format!("set_local_description failed: {e:?}")))?;
        Ok(sdp)
    }

    /// Build a connection and data channel, create a local offer, and
    /// return it ready to forward as a `signal` frame. Used directly by
    /// tests and tools that want a one-shot handshake without going
    /// through [`LiveSessionFactory`].
    pub async fn create_offer(config: &EngineConfig) -> Result<(RtcPeerConnection, RtcDataChannel, String)> {
        let pc = build_peer_connection(config)?;
        let mut dc_init = web_sys::RtcDataChannelInit::new();
        dc_init.set_ordered(true);
        let channel = pc.create_data_channel_with_data_channel_dict("session", &dc_init);
        channel.set_binary_type(RtcDataChannelType::Arraybuffer);
        let sdp = negotiate_local_offer(&pc).await?;
        Ok((pc, channel, sdp))
    }

    /// Accept a remote offer as the callee and produce an answer SDP.
    /// `on_channel` fires once the browser hands us the remote-created
    /// data channel (spec §4.6: "it waits for the remote-created channel
    /// to appear") — normally shortly after the remote description is
    /// set, but always asynchronously, so it's a callback rather than a
    /// return value.
    pub async fn accept_offer(
        config: &EngineConfig,
        remote_sdp: &str,
        on_channel: impl Fn(RtcDataChannel) + 'static,
    ) -> Result<(RtcPeerConnection, String)> {
        let pc = build_peer_connection(config)?;

        let on_data_channel = Closure::<dyn FnMut(web_sys::RtcDataChannelEvent)>::new(move |evt: web_sys::RtcDataChannelEvent| {
            on_channel(evt.channel());
        });
        pc.set_ondatachannel(Some(on_data_channel.as_ref().unchecked_ref()));
        on_data_channel.forget();

        let sdp = negotiate_remote_offer(&pc, remote_sdp).await?;
        Ok((pc, sdp))
    }

    /// Apply the caller's received answer to finish negotiation.
    pub async fn complete_handshake(pc: &RtcPeerConnection, remote_sdp: &str) -> Result<()> {
        let mut desc = RtcSessionDescriptionInit::new(RtcSdpType::Answer);
        desc.set_sdp(remote_sdp);
        JsFuture::from(pc.set_remote_description(&desc))
            .await
            .map_err(|e| Error::NegotiationFailed(format!("set_remote_description failed: {e:?}")))?;
        Ok(())
    }

    /// Add a trickled remote ICE candidate, if the deployment enables
    /// trickle ICE instead of the default wait-for-gathering approach.
    pub async fn add_ice_candidate(pc: &RtcPeerConnection, candidate: &str, sdp_mid: Option<&str>, sdp_m_line_index: Option<u16>) -> Result<()> {
        let mut init = RtcIceCandidateInit::new(candidate);
        if let Some(mid) = sdp_mid {
            init.set_sdp_mid(Some(mid));
        }
        if let Some(idx) = sdp_m_line_index {
            init.set_sdp_m_line_index(Some(idx));
        }
        let ice_candidate = RtcIceCandidate::new(&init)
            .map_err(|e| Error::NegotiationFailed(format!("invalid ICE candidate: {e:?}")))?;
        JsFuture::from(pc.add_ice_candidate_with_opt_rtc_ice_candidate(Some(&ice_candidate)))
            .await
            .map_err(|e| Error::NegotiationFailed(format!("add_ice_candidate failed: {e:?}")))?;
        Ok(())
    }

    /// One peer's live handshake: its role, the `RtcPeerConnection` it is
    /// currently negotiating or has negotiated, and the [`PeerSession`]
    /// whose transport that connection's data channel backs.
    ///
    /// `connection` is behind a `RefCell` because a caller-role handshake
    /// rebuilds it from scratch on reconnect (spec §4.6 `refresh`);
    /// `session` never changes identity, only the transport installed on
    /// it via [`PeerSession::replace_transport`].
    struct Handshake {
        role: Role,
        state: Cell<RtcHandshakeState>,
        connection: RefCell<SendWrapper<RtcPeerConnection>>,
        session: Rc<PeerSession>,
    }

    /// The browser-backed [`SessionFactory`]: owns every in-progress or
    /// live RTC handshake and every relay session, and is the thing that
    /// actually drives `RTCPeerConnection`/`RTCDataChannel` the way
    /// [`crate::manager::PeersManager`] expects a factory to.
    ///
    /// Closures registered on a connection or channel (`onicecandidate`,
    /// `onconnectionstatechange`, `onmessage`, ...) need to call back
    /// into this factory, but the factory also owns those connections —
    /// capturing `Rc<Self>` directly would be a reference cycle the
    /// `RtcPeerConnection`'s own `Drop` would never break. `weak_self`
    /// (built via `Rc::new_cyclic` in [`Self::new`]) is how closures get
    /// a handle on the factory without holding it alive themselves.
    pub struct LiveSessionFactory {
        config: EngineConfig,
        bus: EventBus,
        server: Rc<ServerConnection>,
        handshakes: RefCell<HashMap<String, Rc<Handshake>>>,
        relay_sessions: RefCell<HashMap<String, Rc<PeerSession>>>,
        weak_self: Weak<LiveSessionFactory>,
    }

    impl LiveSessionFactory {
        pub fn new(config: EngineConfig, bus: EventBus, server: Rc<ServerConnection>) -> Rc<Self> {
            Rc::new_cyclic(|weak| Self {
                config,
                bus,
                server,
                handshakes: RefCell::new(HashMap::new()),
                relay_sessions: RefCell::new(HashMap::new()),
                weak_self: weak.clone(),
            })
        }

        fn build_caller_channel(&self) -> Result<(RtcPeerConnection, RtcDataChannel)> {
            let pc = build_peer_connection(&self.config)?;
            let mut dc_init = web_sys::RtcDataChannelInit::new();
            dc_init.set_ordered(true);
            let channel = pc.create_data_channel_with_data_channel_dict("session", &dc_init);
            channel.set_binary_type(RtcDataChannelType::Arraybuffer);
            Ok((pc, channel))
        }

        /// Wire `onicecandidate` (trickle ICE straight back out through
        /// the rendezvous server) and `onconnectionstatechange` (detects
        /// a dropped connection so a caller can re-offer).
        fn wire_peer_connection_events(&self, peer_id: String, pc: &RtcPeerConnection) {
            let server = self.server.clone();
            let ice_peer_id = peer_id.clone();
            let onicecandidate = Closure::<dyn FnMut(web_sys::RtcPeerConnectionIceEvent)>::new(move |evt: web_sys::RtcPeerConnectionIceEvent| {
                if let Some(candidate) = evt.candidate() {
                    let body = SignalBody::IceCandidate {
                        candidate: candidate.candidate(),
                        sdp_mid: candidate.sdp_mid(),
                        sdp_m_line_index: candidate.sdp_m_line_index(),
                    };
                    if let Ok(payload) = serde_json::to_value(&body) {
                        let _ = server.send_signal(&ice_peer_id, payload);
                    }
                }
            });
            pc.set_onicecandidate(Some(onicecandidate.as_ref().unchecked_ref()));
            onicecandidate.forget();

            // `connectionstatechange` fires on every transition, including
            // the ordinary `new -> connecting -> connected` path; only
            // `disconnected`/`failed` mean anything to the handshake (spec
            // §4.6), so the state itself has to be read rather than
            // reacting to the event unconditionally.
            let weak_self = self.weak_self.clone();
            let state_pc = pc.clone();
            let onconnectionstatechange = Closure::<dyn FnMut()>::new(move || {
                if let Some(factory) = weak_self.upgrade() {
                    factory.handle_connection_state_change(&peer_id, state_pc.connection_state());
                }
            });
            pc.set_onconnectionstatechange(Some(onconnectionstatechange.as_ref().unchecked_ref()));
            onconnectionstatechange.forget();
        }

        /// React to a `connectionstatechange` event. Per spec §4.6,
        /// `disconnected` is treated as channel-closed directly;
        /// `failed` additionally drops the connection object (closes it,
        /// releasing its ICE/DTLS resources) before the same
        /// channel-closed handling runs, since a failed connection is
        /// never coming back on its own. Every other state (`new`,
        /// `connecting`, `connected`) is a normal part of negotiation and
        /// is ignored here.
        fn handle_connection_state_change(&self, peer_id: &str, state: web_sys::RtcPeerConnectionState) {
            match state {
                web_sys::RtcPeerConnectionState::Failed => {
                    if let Some(handshake) = self.handshakes.borrow().get(peer_id).cloned() {
                        handshake.connection.borrow().close();
                    }
                    self.handle_connection_dropped(peer_id);
                }
                web_sys::RtcPeerConnectionState::Disconnected => {
                    self.handle_connection_dropped(peer_id);
                }
                _ => {}
            }
        }

        /// Wire the data channel's traffic (`onmessage` routed straight
        /// into [`PeerSession::handle_control`]/`handle_partition`) and
        /// lifecycle (`onopen`/`onclose`).
        fn wire_channel(&self, peer_id: String, handshake: Rc<Handshake>, channel: &RtcDataChannel) {
            let session = handshake.session.clone();
            let onmessage = Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |evt: web_sys::MessageEvent| {
                let data = evt.data();
                if let Some(text) = data.as_string() {
                    match serde_json::from_str::<SessionMessage>(&text) {
                        Ok(msg) => {
                            let _ = session.handle_control(msg);
                        }
                        Err(e) => tracing::warn!("malformed session frame on data channel: {e}"),
                    }
                } else if let Ok(buf) = data.dyn_into::<js_sys::ArrayBuffer>() {
                    let bytes = js_sys::Uint8Array::new(&buf).to_vec();
                    let _ = session.handle_partition(&bytes);
                }
            });
            channel.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
            onmessage.forget();

            let open_handshake = handshake.clone();
            let onopen = Closure::<dyn FnMut()>::new(move || {
                open_handshake.state.set(open_handshake.state.get().on_channel_open());
            });
            channel.set_onopen(Some(onopen.as_ref().unchecked_ref()));
            onopen.forget();

            let weak_self = self.weak_self.clone();
            let onclose = Closure::<dyn FnMut()>::new(move || {
                if let Some(factory) = weak_self.upgrade() {
                    factory.handle_connection_dropped(&peer_id);
                }
            });
            channel.set_onclose(Some(onclose.as_ref().unchecked_ref()));
            onclose.forget();
        }

        /// A connection or channel reported disconnection. Idempotent:
        /// both `onconnectionstatechange` and the channel's `onclose`
        /// can fire for the same drop, and only the first should act on
        /// it. Only a caller re-initiates (spec §4.6: the callee waits
        /// for a fresh offer rather than guessing when to retry).
        fn handle_connection_dropped(&self, peer_id: &str) {
            let handshake = match self.handshakes.borrow().get(peer_id).cloned() {
                Some(h) => h,
                None => return,
            };
            if handshake.state.get() == RtcHandshakeState::Closed {
                return;
            }
            handshake.state.set(handshake.state.get().on_failed_or_closed());
            if handshake.role == Role::Caller {
                self.restart_caller(peer_id.to_string());
            }
        }

        fn spawn_caller_offer(&self, peer_id: String) {
            let weak_self = self.weak_self.clone();
            wasm_spawn(async move {
                if let Some(factory) = weak_self.upgrade() {
                    if let Err(e) = factory.send_caller_offer(&peer_id).await {
                        tracing::warn!("offer negotiation with {peer_id} failed: {e:?}");
                    }
                }
            });
        }

        async fn send_caller_offer(&self, peer_id: &str) -> Result<()> {
            let handshake = self.handshakes.borrow().get(peer_id).cloned().ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
            let pc = (**handshake.connection.borrow()).clone();
            let sdp = negotiate_local_offer(&pc).await?;
            handshake.state.set(handshake.state.get().on_local_offer_created()?);
            let body = SignalBody::Offer { sdp };
            let payload = serde_json::to_value(&body)?;
            self.server.send_signal(peer_id, payload)
        }

        /// Rebuild a caller's connection, channel and transport from
        /// scratch and re-offer, while leaving the [`PeerSession`] (and
        /// its queued/in-flight transfer state) exactly where it is —
        /// see [`PeerSession::replace_transport`].
        fn restart_caller(&self, peer_id: String) {
            let handshake = match self.handshakes.borrow().get(&peer_id).cloned() {
                Some(h) => h,
                None => return,
            };
            match self.build_caller_channel() {
                Ok((pc, channel)) => {
                    let transport = Rc::new(RtcLiveTransport::new(pc.clone(), channel.clone()));
                    handshake.session.replace_transport(transport as Rc<dyn Transport>);
                    *handshake.connection.borrow_mut() = SendWrapper::new(pc.clone());
                    handshake.state.set(RtcHandshakeState::Idle);
                    self.wire_peer_connection_events(peer_id.clone(), &pc);
                    self.wire_channel(peer_id.clone(), handshake, &channel);
                    self.spawn_caller_offer(peer_id);
                }
                Err(e) => tracing::warn!("failed to rebuild caller transport for {peer_id}: {e:?}"),
            }
        }

        fn handle_remote_offer(&self, peer_id: String, handshake: Rc<Handshake>, sdp: String) {
            let next = match handshake.state.get().on_remote_offer_received() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("{e}");
                    return;
                }
            };
            handshake.state.set(next);
            let server = self.server.clone();
            wasm_spawn(async move {
                let pc = (**handshake.connection.borrow()).clone();
                let answer_sdp = match negotiate_remote_offer(&pc, &sdp).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("answer negotiation with {peer_id} failed: {e:?}");
                        return;
                    }
                };
                match handshake.state.get().on_local_answer_set() {
                    Ok(s) => handshake.state.set(s),
                    Err(e) => {
                        tracing::warn!("{e}");
                        return;
                    }
                }
                let body = SignalBody::Answer { sdp: answer_sdp };
                if let Ok(payload) = serde_json::to_value(&body) {
                    let _ = server.send_signal(&peer_id, payload);
                }
            });
        }

        fn handle_remote_answer(&self, handshake: Rc<Handshake>, sdp: String) {
            let next = match handshake.state.get().on_remote_answer_received() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("{e}");
                    return;
                }
            };
            handshake.state.set(next);
            wasm_spawn(async move {
                let pc = (**handshake.connection.borrow()).clone();
                if let Err(e) = complete_handshake(&pc, &sdp).await {
                    tracing::warn!("completing handshake failed: {e:?}");
                }
            });
        }

        fn handle_remote_candidate(&self, handshake: Rc<Handshake>, candidate: String, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) {
            wasm_spawn(async move {
                let pc = (**handshake.connection.borrow()).clone();
                if let Err(e) = add_ice_candidate(&pc, &candidate, sdp_mid.as_deref(), sdp_m_line_index).await {
                    tracing::warn!("add_ice_candidate failed: {e:?}");
                }
            });
        }
    }

    impl SessionFactory for LiveSessionFactory {
        fn create_rtc_caller(&self, peer_id: &str) -> Result<Rc<PeerSession>> {
            let (pc, channel) = self.build_caller_channel()?;
            let transport = Rc::new(RtcLiveTransport::new(pc.clone(), channel.clone()));
            let session = Rc::new(PeerSession::new(peer_id.to_string(), transport as Rc<dyn Transport>, self.bus.clone(), self.config.clone()));
            let handshake = Rc::new(Handshake {
                role: Role::Caller,
                state: Cell::new(RtcHandshakeState::Idle),
                connection: RefCell::new(SendWrapper::new(pc.clone())),
                session: session.clone(),
            });
            self.wire_peer_connection_events(peer_id.to_string(), &pc);
            self.wire_channel(peer_id.to_string(), handshake.clone(), &channel);
            self.handshakes.borrow_mut().insert(peer_id.to_string(), handshake);
            self.spawn_caller_offer(peer_id.to_string());
            Ok(session)
        }

        fn create_rtc_callee(&self, peer_id: &str) -> Result<Rc<PeerSession>> {
            let pc = build_peer_connection(&self.config)?;
            let transport = Rc::new(RtcLiveTransport::pending(pc.clone()));
            let session = Rc::new(PeerSession::new(peer_id.to_string(), transport.clone() as Rc<dyn Transport>, self.bus.clone(), self.config.clone()));
            let handshake = Rc::new(Handshake {
                role: Role::Callee,
                state: Cell::new(RtcHandshakeState::Idle),
                connection: RefCell::new(SendWrapper::new(pc.clone())),
                session: session.clone(),
            });
            self.wire_peer_connection_events(peer_id.to_string(), &pc);

            let weak_self = self.weak_self.clone();
            let data_peer_id = peer_id.to_string();
            let data_transport = transport;
            let data_handshake = handshake.clone();
            let on_data_channel = Closure::<dyn FnMut(web_sys::RtcDataChannelEvent)>::new(move |evt: web_sys::RtcDataChannelEvent| {
                let channel = evt.channel();
                data_transport.set_channel(channel.clone());
                if let Some(factory) = weak_self.upgrade() {
                    factory.wire_channel(data_peer_id.clone(), data_handshake.clone(), &channel);
                }
            });
            pc.set_ondatachannel(Some(on_data_channel.as_ref().unchecked_ref()));
            on_data_channel.forget();

            self.handshakes.borrow_mut().insert(peer_id.to_string(), handshake);
            Ok(session)
        }

        fn create_relay(&self, peer_id: &str) -> Result<Rc<PeerSession>> {
            let transport = Rc::new(RelayTransport::new(peer_id.to_string(), self.server.clone() as Rc<dyn crate::session::relay::SignalSender>));
            let session = Rc::new(PeerSession::new(peer_id.to_string(), transport as Rc<dyn Transport>, self.bus.clone(), self.config.clone()));
            self.relay_sessions.borrow_mut().insert(peer_id.to_string(), session.clone());
            Ok(session)
        }

        /// Dispatch an inbound `signal` payload. A peer with a handshake
        /// in progress gets it decoded as offer/answer/candidate; a peer
        /// already on a relay session gets it decoded as the raw
        /// [`SessionMessage`] the relay transport wraps its traffic in
        /// (spec §4.7) — the same envelope, routed differently depending
        /// on which transport this peer ended up with.
        fn forward_signal(&self, peer_id: &str, payload: serde_json::Value) -> Result<()> {
            if let Some(handshake) = self.handshakes.borrow().get(peer_id).cloned() {
                let body: SignalBody = serde_json::from_value(payload).map_err(|e| Error::MalformedServerFrame(e.to_string()))?;
                match body {
                    SignalBody::Offer { sdp } => self.handle_remote_offer(peer_id.to_string(), handshake, sdp),
                    SignalBody::Answer { sdp } => self.handle_remote_answer(handshake, sdp),
                    SignalBody::IceCandidate { candidate, sdp_mid, sdp_m_line_index } => {
                        self.handle_remote_candidate(handshake, candidate, sdp_mid, sdp_m_line_index)
                    }
                }
                return Ok(());
            }
            if let Some(session) = self.relay_sessions.borrow().get(peer_id).cloned() {
                let msg: SessionMessage = serde_json::from_value(payload)?;
                return session.handle_control(msg);
            }
            Err(Error::UnknownPeer(peer_id.to_string()))
        }

        fn refresh(&self, peer_id: &str, session: &Rc<PeerSession>) -> Result<()> {
            if session.is_open() {
                return Ok(());
            }
            if let Some(handshake) = self.handshakes.borrow().get(peer_id).cloned() {
                if handshake.role == Role::Caller {
                    self.restart_caller(peer_id.to_string());
                }
            }
            Ok(())
        }
    }

    fn wasm_spawn(fut: impl std::future::Future<Output = ()> + 'static) {
        wasm_bindgen_futures::spawn_local(fut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_happy_path() {
        let state = RtcHandshakeState::Idle;
        let state = state.on_local_offer_created().unwrap();
        assert_eq!(state, RtcHandshakeState::AwaitingAnswer);
        let state = state.on_remote_answer_received().unwrap();
        assert_eq!(state, RtcHandshakeState::Negotiating);
        let state = state.on_channel_open();
        assert!(state.is_open());
    }

    #[test]
    fn callee_happy_path() {
        let state = RtcHandshakeState::Idle;
        let state = state.on_remote_offer_received().unwrap();
        assert_eq!(state, RtcHandshakeState::AwaitingLocalAnswer);
        let state = state.on_local_answer_set().unwrap();
        assert_eq!(state, RtcHandshakeState::Negotiating);
        let state = state.on_channel_open();
        assert!(state.is_open());
    }

    #[test]
    fn out_of_order_answer_is_rejected() {
        let err = RtcHandshakeState::Idle.on_remote_answer_received().unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed(_)));
    }

    #[test]
    fn failure_is_terminal_from_any_state() {
        assert_eq!(RtcHandshakeState::Negotiating.on_failed_or_closed(), RtcHandshakeState::Closed);
        assert_eq!(RtcHandshakeState::Open.on_failed_or_closed(), RtcHandshakeState::Closed);
    }
}
