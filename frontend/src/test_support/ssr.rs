use crate::state::presence::{PresenceContext, PresenceState};
use leptos::*;

pub fn with_runtime<T>(f: impl FnOnce() -> T) -> T {
    let runtime = leptos::create_runtime();
    let result = f();
    runtime.dispose();
    result
}

/// Provides the shared presence signal the way `PresenceProvider` does.
pub fn provide_presence(initial: PresenceState) -> PresenceContext {
    let context = create_signal(initial);
    provide_context::<PresenceContext>(context);
    context
}

pub fn render_to_string<F, N>(view: F) -> String
where
    F: FnOnce() -> N + 'static,
    N: IntoView + 'static,
{
    leptos_reactive::suppress_resource_load(true);
    let html = with_runtime(|| view().into_view().render_to_string().to_string());
    leptos_reactive::suppress_resource_load(false);
    html
}
