//! # Event Bus
//!
//! A process-wide synchronous publish/subscribe facility (spec §4.1).
//! `fire()` dispatches to every listener registered for that event's
//! discriminant, in registration order, before returning; `on()`
//! registers a listener. Delivery is synchronous — a handler that
//! enqueues more work is expected to run to completion before the next
//! event is processed (spec §5, "local event-bus dispatches run to
//! completion before the next event is processed").
//!
//! Rust gives us a typed enum instead of a stringly-typed `type` field;
//! the `wasm` glue layer is what turns a fired `Event` back into the
//! `(event_type: &str, detail_json: &str)` shape the host page expects,
//! the same boundary convention as `ffi::events::emit_event` in the
//! library this engine is grounded on.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::protocol::PeerDescriptor;

/// Every event the core can emit to the UI collaborator (spec §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    /// The full current peer list, as last reported by the server.
    Peers { peers: Vec<PeerDescriptor> },
    /// A single peer joined the room.
    PeerJoined { peer: PeerDescriptor },
    /// A peer left the room.
    PeerLeft { id: String },
    /// A signaling frame addressed to us arrived (surfaced for
    /// diagnostics; the `PeersManager` also consumes it directly).
    Signal { sender: String },
    /// Progress update for an in-flight transfer in either direction.
    FileProgress { peer: String, progress: f64 },
    /// An inbound file finished reassembling.
    FileReceived { peer: String, name: String, mime: String, size: u64, handle: String },
    /// An inbound text message arrived.
    TextReceived { peer: String, text: String },
    /// A user-visible notification (e.g. "reconnecting...").
    NotifyUser { message: String },
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Peers { .. } => "peers",
            Event::PeerJoined { .. } => "peer-joined",
            Event::PeerLeft { .. } => "peer-left",
            Event::Signal { .. } => "signal",
            Event::FileProgress { .. } => "file-progress",
            Event::FileReceived { .. } => "file-received",
            Event::TextReceived { .. } => "text-received",
            Event::NotifyUser { .. } => "notify-user",
        }
    }
}

type Listener = Box<dyn FnMut(&Event)>;

#[derive(Default)]
struct Subscribers {
    // Keyed by event kind string rather than a hashable discriminant so a
    // listener can be registered before any variant with that shape
    // exists — mirrors `on(type, callback)` taking a string in the
    // distilled spec.
    by_kind: std::collections::HashMap<&'static str, Vec<Listener>>,
}

/// The process-wide event bus. Cheap to clone (an `Rc` handle); every
/// module that needs to fire or subscribe holds one of these.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<Subscribers>>,
}

impl EventBus {
    /// Create a fresh, empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for events of the same shape as `kind`. The
    /// listener fires for every subsequent `fire()` call whose event has
    /// the same discriminant.
    pub fn on<F>(&self, kind: &'static str, callback: F)
    where
        F: FnMut(&Event) + 'static,
    {
        self.inner
            .borrow_mut()
            .by_kind
            .entry(kind)
            .or_default()
            .push(Box::new(callback));
    }

    /// Dispatch `event` to all listeners of its kind, in registration
    /// order, synchronously.
    pub fn fire(&self, event: Event) {
        let kind = event.kind();
        // Listeners are allowed to fire further events (e.g. a `signal`
        // listener driving a session that later fires `file-progress`);
        // taking the list out of the `RefCell` for the duration of
        // dispatch avoids a panic from such re-entrant fires.
        let taken = self
            .inner
            .borrow_mut()
            .by_kind
            .get_mut(kind)
            .map(std::mem::take);
        let Some(mut handlers) = taken else { return };

        for handler in handlers.iter_mut() {
            handler(&event);
        }

        self.inner
            .borrow_mut()
            .by_kind
            .entry(kind)
            .or_default()
            .splice(0..0, handlers);
    }
}
