use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::ws::h264_ws_handler;
use crate::state::AppState;

/// Build the application router. Every endpoint here answers directly
/// at the root — this proxy has no `/api` prefix and no auth layer,
/// unlike the sibling web UI this codebase also serves.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::mjpeg_stream))
        .route("/stream", get(handlers::mjpeg_stream))
        .route("/mjpeg", get(handlers::mjpeg_stream))
        .route("/snapshot", get(handlers::snapshot))
        .route("/snap", get(handlers::snapshot))
        .route("/image", get(handlers::snapshot))
        .route("/h264", any(h264_route))
        .route("/flv", get(handlers::flv_stream))
        .route("/status", get(handlers::status))
        .route("/led", get(handlers::led_unavailable).post(handlers::led_unavailable))
        .route("/led/on", get(handlers::led_unavailable).post(handlers::led_unavailable))
        .route("/led/off", get(handlers::led_unavailable).post(handlers::led_unavailable))
        .route("/hls/playlist.m3u8", get(handlers::hls_playlist))
        .route("/hls/legacy.m3u8", get(handlers::hls_legacy_playlist))
        .route("/hls/{file}", get(handlers::hls_file))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `/h264` dispatches to the WebSocket upgrade when the client asks
/// for one, and to a JSON status body otherwise.
async fn h264_route(
    ws: Option<axum::extract::ws::WebSocketUpgrade>,
    state: axum::extract::State<Arc<AppState>>,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    match ws {
        Some(ws) => h264_ws_handler(ws, state).await,
        None => handlers::h264_info(state).await.into_response(),
    }
}
