//! # Socket abstraction
//!
//! [`Socket`] is the one thing [`super::ServerConnection`] needs from a
//! transport: send a text frame, report whether it's open, and close it.
//! Actual message delivery runs the other way — the host attaches
//! `onmessage`/`onopen`/`onclose` handlers when it builds the socket and
//! calls back into [`super::ServerConnection`] directly, the same
//! registration style the teacher's `webrtc_transport` module uses for
//! `RtcDataChannel` events, just aimed at a `WebSocket` instead.

use crate::error::Result;

/// A live connection to the rendezvous server.
pub trait Socket {
    fn send_text(&self, text: &str) -> Result<()>;
    fn is_open(&self) -> bool;
    fn close(&self);
}

/// An in-memory [`Socket`] for tests: records every send, and can be
/// toggled open/closed without a real network stack.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Default)]
    pub struct MockSocket {
        pub sent: Rc<RefCell<Vec<String>>>,
        pub open: Cell<bool>,
    }

    impl MockSocket {
        pub fn new_open() -> Rc<Self> {
            Rc::new(Self { sent: Rc::new(RefCell::new(Vec::new())), open: Cell::new(true) })
        }
    }

    impl Socket for MockSocket {
        fn send_text(&self, text: &str) -> Result<()> {
            self.sent.borrow_mut().push(text.to_string());
            Ok(())
        }
        fn is_open(&self) -> bool {
            self.open.get()
        }
        fn close(&self) {
            self.open.set(false);
        }
    }
}

/// A `WebSocket`-backed [`Socket`], constructed by the `wasm` glue layer
/// against the endpoint [`crate::config::HostContext::server_url`]
/// resolves.
#[cfg(target_arch = "wasm32")]
pub mod js_socket {
    use super::*;
    use send_wrapper::SendWrapper;
    use web_sys::WebSocket;

    pub struct JsWebSocket {
        socket: SendWrapper<WebSocket>,
    }

    impl JsWebSocket {
        pub fn new(socket: WebSocket) -> Self {
            socket.set_binary_type(web_sys::BinaryType::Arraybuffer);
            Self { socket: SendWrapper::new(socket) }
        }
    }

    impl Socket for JsWebSocket {
        fn send_text(&self, text: &str) -> Result<()> {
            self.socket
                .send_with_str(text)
                .map_err(|e| crate::error::Error::TransportClosed(format!("websocket send failed: {e:?}")))
        }

        fn is_open(&self) -> bool {
            self.socket.ready_state() == WebSocket::OPEN
        }

        fn close(&self) {
            let _ = self.socket.close();
        }
    }
}
