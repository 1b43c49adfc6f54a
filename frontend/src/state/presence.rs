use crate::api::presence_socket::{self, SocketEvent};
use leptos::*;
use std::fmt;

pub(crate) type PresenceContext = (ReadSignal<PresenceState>, WriteSignal<PresenceState>);

/// Client view of the tab's realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceState {
    pub connection: ConnectionState,
    pub connection_id: Option<String>,
    /// Last count broadcast by the server, unchanged.
    pub active_count: Option<i64>,
}

impl PresenceState {
    pub fn apply(&mut self, event: &SocketEvent) {
        match event {
            SocketEvent::Connecting => self.connection = ConnectionState::Connecting,
            SocketEvent::Connected { connection_id } => {
                self.connection = ConnectionState::Connected;
                self.connection_id = Some(connection_id.clone());
            }
            SocketEvent::CountChanged(count) => self.active_count = Some(*count),
            SocketEvent::Disconnected => self.connection = ConnectionState::Disconnected,
        }
    }
}

#[component]
pub fn PresenceProvider(children: Children) -> impl IntoView {
    provide_context::<PresenceContext>(create_signal(PresenceState::default()));
    view! { <>{children()}</> }
}

/// Binds the shared presence connection to the component's lifetime.
///
/// Unmounting drops this component's listener only. The socket stays open for
/// the tab.
pub fn use_presence() -> ReadSignal<PresenceState> {
    let (state, set_state) = use_context::<PresenceContext>()
        .unwrap_or_else(|| create_signal(PresenceState::default()));

    let listener = presence_socket::subscribe(move |event| {
        set_state.update(|state| state.apply(event));
    });
    on_cleanup(move || presence_socket::unsubscribe(listener));

    presence_socket::ensure_open();
    state
}
