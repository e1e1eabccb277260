//! # Browser glue
//!
//! The one module allowed to touch `window`, `WebSocket`, and the rest
//! of the DOM: resolves [`HostContext`] from `window.location`, builds
//! the live [`ServerConnection`]/[`PeersManager`]/[`LiveSessionFactory`]
//! trio, and turns fired [`Event`]s into JSON pushed to a single JS
//! callback. Grounded on the teacher's `ffi::wasm` module — the panic
//! hook + `tracing_wasm` init on the `_init` entry point, a global
//! engine instance, and one stored callback function for every event —
//! adapted from the teacher's `OnceCell<Arc<RwLock<_>>>` (its state is
//! `Send`) to a `thread_local!` `RefCell`, since this engine's `Rc`-based
//! session state is not.
//!
//! Per spec §7, nothing here lets a `Result::Err` escape as a thrown JS
//! exception except the handful of calls the host needs synchronous
//! failure from (`engine_init`, `engine_connect`); everything else
//! reports failure as a `notify-user` event and logs via `tracing`.

#![cfg(all(target_arch = "wasm32", feature = "wasm"))]

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use wasm_bindgen::closure::Closure;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::WebSocket;

use crate::config::{EngineConfig, HostContext};
use crate::events::{Event, EventBus};
use crate::manager::PeersManager;
use crate::server::socket::js_socket::JsWebSocket;
use crate::server::socket::Socket;
use crate::server::{ServerConnection, SocketFactory, Timer};
use crate::session::rtc::wasm_impl::LiveSessionFactory;
use crate::transfer::{ChunkSource, JsFileSource};

thread_local! {
    static ENGINE: RefCell<Option<Rc<Engine>>> = RefCell::new(None);
    static EVENT_CALLBACK: RefCell<Option<js_sys::Function>> = RefCell::new(None);
}

/// Everything the glue functions need a handle on, bundled so
/// `thread_local!` only has to hold one `Option`.
struct Engine {
    server: Rc<ServerConnection>,
    manager: Rc<PeersManager>,
}

fn with_engine<T>(f: impl FnOnce(&Engine) -> Result<T, JsValue>) -> Result<T, JsValue> {
    ENGINE.with(|cell| {
        let engine = cell.borrow();
        let engine = engine.as_ref().ok_or_else(|| JsValue::from_str("engine not initialized"))?;
        f(engine)
    })
}

/// Clone the manager's `Rc` out of thread-local state so it can be moved
/// into a `future_to_promise` future without borrowing across an
/// `.await` (the `RefCell` guard inside [`with_engine`] doesn't outlive
/// that call).
fn manager_handle() -> Result<Rc<PeersManager>, JsValue> {
    with_engine(|engine| Ok(engine.manager.clone()))
}

/// Builds a live [`WebSocket`] against the resolved endpoint and wires
/// its `onopen`/`onmessage`/`onclose` straight into the
/// [`ServerConnection`] that asked for it. The connection is set after
/// construction (see [`Self::bind`]) rather than passed in, since
/// [`ServerConnection::new`] needs the factory before it can hand back
/// the `Rc<Self>` the factory's closures capture.
struct JsSocketFactory {
    server: RefCell<Weak<ServerConnection>>,
}

impl JsSocketFactory {
    fn new() -> Rc<Self> {
        Rc::new(Self { server: RefCell::new(Weak::new()) })
    }

    fn bind(&self, server: &Rc<ServerConnection>) {
        *self.server.borrow_mut() = Rc::downgrade(server);
    }
}

impl SocketFactory for JsSocketFactory {
    fn connect(&self, url: &str) -> crate::error::Result<Rc<dyn Socket>> {
        let ws = WebSocket::new(url).map_err(|e| crate::error::Error::TransportClosed(format!("WebSocket::new failed: {e:?}")))?;

        let onopen_server = self.server.borrow().clone();
        let onopen = Closure::<dyn FnMut()>::new(move || {
            if let Some(server) = onopen_server.upgrade() {
                server.handle_open();
            }
        });
        ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));
        onopen.forget();

        let onmessage_server = self.server.borrow().clone();
        let onmessage = Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |evt: web_sys::MessageEvent| {
            if let Some(server) = onmessage_server.upgrade() {
                if let Some(text) = evt.data().as_string() {
                    if let Err(e) = server.handle_message(&text) {
                        tracing::warn!("dropped malformed server frame: {e}");
                    }
                }
            }
        });
        ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
        onmessage.forget();

        let onclose_server = self.server.borrow().clone();
        let onclose = Closure::<dyn FnMut()>::new(move || {
            if let Some(server) = onclose_server.upgrade() {
                server.handle_close();
            }
        });
        ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));
        ws.set_onerror(Some(onclose.as_ref().unchecked_ref()));
        onclose.forget();

        Ok(Rc::new(JsWebSocket::new(ws)) as Rc<dyn Socket>)
    }
}

/// [`Timer`] backed by `window.set_timeout`.
struct JsTimer;

impl Timer for JsTimer {
    fn schedule(&self, delay_ms: u64, callback: Box<dyn FnOnce()>) {
        let window = match web_sys::window() {
            Some(w) => w,
            None => return,
        };
        let closure = Closure::once(move || callback());
        let _ = window.set_timeout_with_callback_and_timeout_and_arguments_0(closure.as_ref().unchecked_ref(), delay_ms as i32);
        closure.forget();
    }
}

/// Subscribe to every event kind the core can fire and forward each one
/// to whichever JS function [`engine_on_event`] last registered, as a
/// JSON string. One bus subscription per kind rather than a generic
/// "any event" hook, since [`Event::kind`] is private to [`crate::events`].
fn wire_event_forwarding(bus: &EventBus) {
    const KINDS: &[&str] = &[
        "peers",
        "peer-joined",
        "peer-left",
        "signal",
        "file-progress",
        "file-received",
        "text-received",
        "notify-user",
    ];
    for kind in KINDS {
        bus.on(kind, move |event: &Event| {
            forward_event(event);
        });
    }
}

fn forward_event(event: &Event) {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            tracing::warn!("failed to serialize event for the host page: {e}");
            return;
        }
    };
    EVENT_CALLBACK.with(|cell| {
        if let Some(callback) = cell.borrow().as_ref() {
            let this = JsValue::NULL;
            if let Err(e) = callback.call1(&this, &JsValue::from_str(&json)) {
                tracing::warn!("event callback threw: {e:?}");
            }
        }
    });
}

/// Initialize the engine: panic hook, `tracing_wasm`, and the
/// server/session/manager trio, ready to [`engine_connect`]. Must be
/// called exactly once before any other `engine_*` function.
///
/// `config_json` is a serialized [`EngineConfig`]; pass `"null"` (or any
/// JSON that fails to parse as one) to fall back to
/// [`EngineConfig::default`].
#[wasm_bindgen]
pub fn engine_init(config_json: &str, secure: bool, hostname: &str, rtc_supported: bool) -> Result<(), JsValue> {
    console_error_panic_hook::set_once();
    tracing_wasm::set_as_global_default();

    let already_initialized = ENGINE.with(|cell| cell.borrow().is_some());
    if already_initialized {
        return Err(JsValue::from_str("engine already initialized"));
    }

    let config: EngineConfig = serde_json::from_str(config_json).unwrap_or_default();
    let host = HostContext { secure, hostname: hostname.to_string(), rtc_supported };
    let bus = EventBus::new();
    wire_event_forwarding(&bus);

    let socket_factory = JsSocketFactory::new();
    let server = ServerConnection::new(config.clone(), host, bus.clone(), socket_factory.clone() as Rc<dyn SocketFactory>, Rc::new(JsTimer) as Rc<dyn Timer>);
    socket_factory.bind(&server);

    let session_factory = LiveSessionFactory::new(config, bus, server.clone());
    let manager = Rc::new(PeersManager::new(rtc_supported, session_factory as Rc<dyn crate::manager::SessionFactory>));

    // Every inbound `signal` frame is routed through the manager (spec
    // §4.8): an unfamiliar sender gets a fresh callee session, a known
    // one is just forwarded to its in-progress handshake.
    let weak_manager = Rc::downgrade(&manager);
    server.on_signal(move |sender, payload| {
        if let Some(manager) = weak_manager.upgrade() {
            if let Err(e) = manager.handle_signal(&sender, payload) {
                tracing::warn!("failed to route signal from {sender}: {e}");
            }
        }
    });

    let engine = Rc::new(Engine { server, manager });
    ENGINE.with(|cell| *cell.borrow_mut() = Some(engine));
    Ok(())
}

/// Open the WebSocket connection to the rendezvous server. Idempotent.
#[wasm_bindgen]
pub fn engine_connect() -> Result<(), JsValue> {
    with_engine(|engine| engine.server.connect().map_err(|e| JsValue::from_str(&e.to_string())))
}

/// Register the single JS function that receives every event, as
/// `(json: string) => void`. Replaces any previously registered
/// callback.
#[wasm_bindgen]
pub fn engine_on_event(callback: js_sys::Function) {
    EVENT_CALLBACK.with(|cell| *cell.borrow_mut() = Some(callback));
}

/// Send one or more browser `File`s to `to` (spec §4.8
/// `files-selected`). Resolves once every file has finished sending;
/// rejects with the first error encountered, matching
/// [`crate::session::PeerSession::send_files`]'s ordering.
#[wasm_bindgen]
pub fn engine_send_files(to: String, files: js_sys::Array) -> js_sys::Promise {
    let sources: Vec<Box<dyn ChunkSource>> = files
        .iter()
        .filter_map(|value| value.dyn_into::<web_sys::File>().ok())
        .map(|file| Box::new(JsFileSource::new(file)) as Box<dyn ChunkSource>)
        .collect();

    wasm_bindgen_futures::future_to_promise(async move {
        let manager = manager_handle()?;
        manager
            .send_files(&to, sources)
            .await
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(JsValue::UNDEFINED)
    })
}

/// Send a standalone text message to `to` (spec §4.8 `send-text`).
#[wasm_bindgen]
pub fn engine_send_text(to: String, text: String) -> js_sys::Promise {
    wasm_bindgen_futures::future_to_promise(async move {
        let manager = manager_handle()?;
        manager
            .send_text(&to, &text)
            .await
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(JsValue::UNDEFINED)
    })
}

/// The page's visibility changed (`document.visibilitychange`).
#[wasm_bindgen]
pub fn engine_handle_visibility_change(visible: bool) -> Result<(), JsValue> {
    with_engine(|engine| {
        engine.server.handle_visibility_change(visible);
        Ok(())
    })
}

/// The page is unloading (`window.beforeunload`).
#[wasm_bindgen]
pub fn engine_handle_before_unload() -> Result<(), JsValue> {
    with_engine(|engine| {
        engine.server.handle_before_unload();
        Ok(())
    })
}
