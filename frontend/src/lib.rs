pub mod api;
pub mod components;
pub mod config;
pub mod state;
mod test_support;

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen::prelude::wasm_bindgen(start)]
pub fn start() {
    use components::presence_badge::ActiveSessionsBadge;
    use leptos::*;
    use state::presence::PresenceProvider;

    console_error_panic_hook::set_once();
    let _ = console_log::init_with_level(log::Level::Debug);
    log::info!("Starting inventory dashboard presence client (wasm)");

    // Kick off runtime config load from ./config.json (non-blocking).
    // If window.__INVENTORY_ENV is present (env.js), it takes precedence.
    spawn_local(async move {
        config::init().await;
    });

    mount_to_body(|| {
        view! {
            <PresenceProvider>
                <ActiveSessionsBadge/>
            </PresenceProvider>
        }
    });
}
