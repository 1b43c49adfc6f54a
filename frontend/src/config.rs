use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub api_base_url: Option<String>,
    pub presence_socket_url: Option<String>,
}

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

fn read_global(object_name: &str, keys: &[&str]) -> Option<String> {
    let w = web_sys::window()?;
    let any = js_sys::Reflect::get(&w, &object_name.into()).ok()?;
    if any.is_undefined() || any.is_null() {
        return None;
    }
    let obj = js_sys::Object::from(any);
    keys.iter().find_map(|key| {
        js_sys::Reflect::get(&obj, &(*key).into())
            .ok()
            .and_then(|v| v.as_string())
            .filter(|v| !v.is_empty())
    })
}

fn snapshot_from_globals() -> RuntimeConfig {
    // window.__INVENTORY_ENV (env.js) wins over window.__INVENTORY_CONFIG.
    let lookup = |upper: &str, lower: &str| {
        read_global("__INVENTORY_ENV", &[upper, lower])
            .or_else(|| read_global("__INVENTORY_CONFIG", &[lower, upper]))
    };
    RuntimeConfig {
        api_base_url: lookup("API_BASE_URL", "api_base_url"),
        presence_socket_url: lookup("PRESENCE_SOCKET_URL", "presence_socket_url"),
    }
}

async fn fetch_runtime_config() -> Option<RuntimeConfig> {
    let resp = reqwest::get("./config.json").await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<RuntimeConfig>().await.ok()
}

async fn runtime_config() -> RuntimeConfig {
    if let Some(cached) = RUNTIME_CONFIG.get() {
        return cached.clone();
    }
    let mut cfg = snapshot_from_globals();
    if cfg.api_base_url.is_none() || cfg.presence_socket_url.is_none() {
        if let Some(fetched) = fetch_runtime_config().await {
            cfg.api_base_url = cfg.api_base_url.or(fetched.api_base_url);
            cfg.presence_socket_url = cfg.presence_socket_url.or(fetched.presence_socket_url);
        }
    }
    let _ = RUNTIME_CONFIG.set(cfg.clone());
    cfg
}

pub async fn await_presence_socket_url() -> String {
    let cfg = runtime_config().await;
    match cfg.presence_socket_url {
        Some(url) => url,
        None => presence_socket_url(
            cfg.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL),
        ),
    }
}

/// Maps `http(s)://host/api` to `ws(s)://host/api/presence/ws`.
pub fn presence_socket_url(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/presence/ws", base)
}

pub async fn init() {
    let cfg = runtime_config().await;
    log::debug!(
        "Runtime config resolved (api_base_url={:?}, presence_socket_url={:?})",
        cfg.api_base_url,
        cfg.presence_socket_url
    );
}
