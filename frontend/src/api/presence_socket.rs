//! One realtime presence connection per browser tab.
//!
//! Components never own the socket. They register listeners here and the
//! connection lives until the tab closes or [`reconnect`] replaces it.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::{cell::RefCell, rc::Rc, time::Duration};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAccepted { connection_id: String },
    ActiveCountChanged { count: i64 },
    Pong,
    Error { message: String },
}

/// Frames the browser sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AboutToUnload,
    Heartbeat,
}

/// What listeners observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connecting,
    Connected { connection_id: String },
    CountChanged(i64),
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceSocketError {
    #[error("invalid presence frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
    #[error("failed to open presence socket: {0}")]
    Open(String),
    #[error("failed to send on presence socket: {0}")]
    Send(String),
}

/// Bounded retries with a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (attempt >= 1 && attempt <= self.max_retries).then_some(self.delay)
    }
}

/// Teardown state across `pagehide` and `pageshow`.
///
/// A page restored from the back/forward cache comes back hidden-then-shown
/// and must reconnect instead of staying torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
pub(crate) struct PageLifecycle {
    hidden: bool,
}

#[cfg_attr(not(target_arch = "wasm32"), allow(dead_code))]
impl PageLifecycle {
    /// Marks the page hidden; true the first time, when teardown is due.
    pub(crate) fn hide(&mut self) -> bool {
        !std::mem::replace(&mut self.hidden, true)
    }

    /// Marks the page visible; true when it had been torn down.
    pub(crate) fn show(&mut self) -> bool {
        std::mem::replace(&mut self.hidden, false)
    }

    pub(crate) fn is_hidden(&self) -> bool {
        self.hidden
    }
}

pub fn parse_server_message(text: &str) -> Result<ServerMessage, PresenceSocketError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_client_message(message: ClientMessage) -> String {
    match message {
        ClientMessage::AboutToUnload => r#"{"type":"about_to_unload"}"#.to_string(),
        ClientMessage::Heartbeat => r#"{"type":"heartbeat"}"#.to_string(),
    }
}

/// Appends the handshake query (`token`, `resume`) to the socket URL.
pub fn handshake_url(base: &str, token: Option<&str>, resume: Option<&str>) -> String {
    let params: Vec<String> = [("token", token), ("resume", resume)]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}={}", key, utf8_percent_encode(v, NON_ALPHANUMERIC)))
        })
        .collect();
    if params.is_empty() {
        return base.to_string();
    }
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, separator, params.join("&"))
}

pub type ListenerId = u64;
type Listener = Rc<dyn Fn(&SocketEvent)>;

#[derive(Default)]
struct Registry {
    next_id: ListenerId,
    listeners: Vec<(ListenerId, Listener)>,
    last_status: Option<SocketEvent>,
    last_count: Option<i64>,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

/// Registers `listener` and replays the latest status and count to it.
pub fn subscribe(listener: impl Fn(&SocketEvent) + 'static) -> ListenerId {
    let listener: Listener = Rc::new(listener);
    let (id, replay) = REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, listener.clone()));
        let mut replay = Vec::new();
        replay.extend(registry.last_status.clone());
        replay.extend(registry.last_count.map(SocketEvent::CountChanged));
        (id, replay)
    });
    for event in &replay {
        listener(event);
    }
    id
}

pub fn unsubscribe(id: ListenerId) {
    REGISTRY.with(|registry| {
        registry
            .borrow_mut()
            .listeners
            .retain(|(listener_id, _)| *listener_id != id)
    });
}

pub fn listener_count() -> usize {
    REGISTRY.with(|registry| registry.borrow().listeners.len())
}

pub(crate) fn dispatch(event: SocketEvent) {
    // Listeners run outside the borrow so they may subscribe or unsubscribe.
    let listeners: Vec<Listener> = REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        match &event {
            SocketEvent::CountChanged(count) => registry.last_count = Some(*count),
            status => registry.last_status = Some(status.clone()),
        }
        registry
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    });
    for listener in listeners {
        listener(&event);
    }
}

#[cfg(target_arch = "wasm32")]
pub use transport::{ensure_open, reconnect};

/// Socket transport is browser-only; native builds observe the registry alone.
#[cfg(not(target_arch = "wasm32"))]
pub fn ensure_open() {}

#[cfg(not(target_arch = "wasm32"))]
pub fn reconnect() {}

#[cfg(target_arch = "wasm32")]
mod transport {
    use super::*;
    use gloo_timers::callback::{Interval, Timeout};
    use wasm_bindgen::{closure::Closure, JsCast};
    use web_sys::{CloseEvent, Event, MessageEvent, WebSocket};

    struct Handlers {
        _on_message: Closure<dyn FnMut(MessageEvent)>,
        _on_close: Closure<dyn FnMut(CloseEvent)>,
    }

    #[derive(Default)]
    struct Transport {
        socket: Option<WebSocket>,
        handlers: Option<Handlers>,
        // Handlers of a released socket; a closure must not be dropped while it runs.
        stale_handlers: Option<Handlers>,
        heartbeat: Option<Interval>,
        retry: Option<Timeout>,
        opening: bool,
        attempts: u32,
        connection_id: Option<String>,
        unload_hooked: bool,
        page: PageLifecycle,
        policy: ReconnectPolicy,
    }

    impl Transport {
        fn busy(&self) -> bool {
            self.opening || self.socket.is_some() || self.retry.is_some()
        }

        /// Detaches handlers from the current socket and returns it.
        fn release(&mut self) -> Option<WebSocket> {
            self.heartbeat = None;
            let socket = self.socket.take();
            if let Some(socket) = &socket {
                socket.set_onmessage(None);
                socket.set_onclose(None);
            }
            self.stale_handlers = self.handlers.take();
            socket
        }
    }

    thread_local! {
        static TRANSPORT: RefCell<Transport> = RefCell::new(Transport::default());
    }

    /// Opens the tab's connection unless one is open, opening or scheduled.
    pub fn ensure_open() {
        let start = TRANSPORT.with(|t| {
            let mut t = t.borrow_mut();
            if t.busy() || t.page.is_hidden() {
                return false;
            }
            t.opening = true;
            true
        });
        if start {
            hook_unload();
            spawn_open();
        }
    }

    /// Replaces the connection, e.g. after the signed-in user changed.
    ///
    /// The old row is retired by the server when its socket closes, and the new
    /// handshake does not resume it.
    pub fn reconnect() {
        let old = TRANSPORT.with(|t| {
            let mut t = t.borrow_mut();
            t.retry = None;
            t.attempts = 0;
            t.connection_id = None;
            t.release()
        });
        if let Some(socket) = old {
            let _ = socket.close();
            dispatch(SocketEvent::Disconnected);
        }
        ensure_open();
    }

    fn spawn_open() {
        dispatch(SocketEvent::Connecting);
        wasm_bindgen_futures::spawn_local(async {
            TRANSPORT.with(|t| {
                let mut t = t.borrow_mut();
                t.retry = None;
                t.stale_handlers = None;
            });
            let base = crate::config::await_presence_socket_url().await;
            if let Err(err) = open(&base) {
                log::warn!("{}", err);
                TRANSPORT.with(|t| t.borrow_mut().opening = false);
                on_closed();
            }
        });
    }

    fn open(base: &str) -> Result<(), PresenceSocketError> {
        let resume = TRANSPORT.with(|t| t.borrow().connection_id.clone());
        let token = stored_access_token();
        let url = handshake_url(base, token.as_deref(), resume.as_deref());
        let socket =
            WebSocket::new(&url).map_err(|e| PresenceSocketError::Open(format!("{:?}", e)))?;

        let on_message = Closure::<dyn FnMut(MessageEvent)>::new(|event: MessageEvent| {
            if let Some(text) = event.data().as_string() {
                handle_frame(&text);
            }
        });
        let on_close = Closure::<dyn FnMut(CloseEvent)>::new(|event: CloseEvent| {
            log::debug!("Presence socket closed (code={})", event.code());
            TRANSPORT.with(|t| {
                t.borrow_mut().release();
            });
            on_closed();
        });
        socket.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        socket.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        TRANSPORT.with(|t| {
            let mut t = t.borrow_mut();
            t.opening = false;
            t.socket = Some(socket);
            t.handlers = Some(Handlers {
                _on_message: on_message,
                _on_close: on_close,
            });
        });
        Ok(())
    }

    fn handle_frame(text: &str) {
        match parse_server_message(text) {
            Ok(ServerMessage::ConnectionAccepted { connection_id }) => {
                TRANSPORT.with(|t| {
                    let mut t = t.borrow_mut();
                    t.attempts = 0;
                    t.connection_id = Some(connection_id.clone());
                    t.heartbeat = Some(Interval::new(
                        HEARTBEAT_INTERVAL.as_millis() as u32,
                        || send(ClientMessage::Heartbeat),
                    ));
                });
                dispatch(SocketEvent::Connected { connection_id });
            }
            Ok(ServerMessage::ActiveCountChanged { count }) => {
                dispatch(SocketEvent::CountChanged(count))
            }
            Ok(ServerMessage::Pong) => {}
            Ok(ServerMessage::Error { message }) => {
                log::warn!("Presence server rejected a frame: {}", message)
            }
            Err(err) => log::warn!("{}", err),
        }
    }

    fn on_closed() {
        dispatch(SocketEvent::Disconnected);
        let delay = TRANSPORT.with(|t| {
            let mut t = t.borrow_mut();
            if t.page.is_hidden() {
                return None;
            }
            t.attempts += 1;
            t.policy.delay_for(t.attempts)
        });
        match delay {
            Some(delay) => {
                let retry = Timeout::new(delay.as_millis() as u32, || {
                    TRANSPORT.with(|t| t.borrow_mut().opening = true);
                    spawn_open();
                });
                TRANSPORT.with(|t| t.borrow_mut().retry = Some(retry));
            }
            None => log::info!("Presence socket gave up reconnecting"),
        }
    }

    fn send(message: ClientMessage) {
        let socket = TRANSPORT.with(|t| t.borrow().socket.clone());
        let Some(socket) = socket else {
            return;
        };
        if socket.ready_state() != WebSocket::OPEN {
            return;
        }
        if let Err(err) = socket
            .send_with_str(&encode_client_message(message))
            .map_err(|e| PresenceSocketError::Send(format!("{:?}", e)))
        {
            log::debug!("{}", err);
        }
    }

    /// Tears the session down on `pagehide` and reconnects on `pageshow`.
    ///
    /// `beforeunload` is cancellable and never triggers teardown.
    fn hook_unload() {
        let already = TRANSPORT.with(|t| std::mem::replace(&mut t.borrow_mut().unload_hooked, true));
        if already {
            return;
        }
        let Some(window) = web_sys::window() else {
            return;
        };
        let on_hide = Closure::<dyn FnMut(Event)>::new(|_event: Event| {
            let teardown = TRANSPORT.with(|t| {
                let mut t = t.borrow_mut();
                t.retry = None;
                t.page.hide()
            });
            if teardown {
                send(ClientMessage::AboutToUnload);
            }
        });
        let on_show = Closure::<dyn FnMut(Event)>::new(|_event: Event| {
            if TRANSPORT.with(|t| t.borrow_mut().page.show()) {
                log::debug!("Page restored; reopening presence socket");
                reconnect();
            }
        });
        for (event, handler) in [("pagehide", on_hide), ("pageshow", on_show)] {
            if window
                .add_event_listener_with_callback(event, handler.as_ref().unchecked_ref())
                .is_ok()
            {
                // Lives for the rest of the page.
                handler.forget();
            }
        }
    }

    fn stored_access_token() -> Option<String> {
        web_sys::window()?
            .local_storage()
            .ok()??
            .get_item("access_token")
            .ok()?
    }
}
