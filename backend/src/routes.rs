use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{handlers, state::AppState};

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allow_origins);

    Router::new()
        .route("/api/health", get(handlers::presence::health))
        .route("/api/presence", get(handlers::presence::get_active_count))
        .route("/api/presence/ws", get(handlers::presence_ws::presence_socket))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn cors_layer(allow_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(24 * 60 * 60))
}
