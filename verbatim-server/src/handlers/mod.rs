//! HTTP surface: transcription endpoints, document store endpoints,
//! config, and static assets.

pub mod storage;
pub mod whisper;

use std::path::Path;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState, static_dir: &Path, cors: bool, payload_limit: usize) -> Router {
    let mut app = Router::new()
        .route("/api/config", get(decode_limits))
        .route("/api/whisper", post(whisper::submit))
        .route("/api/whisper/:id/status", get(whisper::status))
        .route("/api/whisper/:id/abort", get(whisper::abort))
        .route("/api/whisper/:id/wait", get(whisper::wait))
        .route(
            "/api/storage/:id",
            put(storage::put_document)
                .get(storage::get_document)
                .delete(storage::delete_document),
        )
        .route("/api/storage/:id/verify", get(storage::verify))
        .route(
            "/api/storage/:id/audio",
            put(storage::put_audio)
                .get(storage::get_audio)
                .delete(storage::delete_audio),
        )
        .layer(DefaultBodyLimit::max(payload_limit))
        .with_state(state)
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http());

    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Advertised decode limits for the web client.
async fn decode_limits(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "whisper": {
            "limit": state.limits.limit_input_s,
            "vad_trim_range": state.limits.vad_trim_range_s,
        }
    }))
}
