use crate::state::presence::{use_presence, ConnectionState, PresenceState};
use leptos::*;

pub fn badge_label(state: &PresenceState) -> String {
    match state.active_count {
        Some(1) => "1 active session".to_string(),
        Some(count) => format!("{} active sessions", count),
        None => "Active sessions: -".to_string(),
    }
}

#[component]
pub fn ActiveSessionsBadge() -> impl IntoView {
    let presence = use_presence();
    let label = move || badge_label(&presence.get());
    let connection = move || presence.get().connection.to_string();
    let stale = move || presence.get().connection != ConnectionState::Connected;

    view! {
        <span
            class="inline-flex items-center gap-1 rounded-full px-3 py-1 text-sm"
            class=("opacity-60", stale)
            data-connection=connection
            title="Open dashboard tabs"
        >
            {label}
        </span>
    }
}
