// libs/teleconsult-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::*;
use crate::ws::room_ws;
use crate::TeleconsultState;

/// Creates the teleconsultation routes. The room WebSocket endpoint sits
/// outside the JWT middleware: its admission check is the relay token.
pub fn teleconsult_routes(state: Arc<TeleconsultState>) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/rooms/{room_id}/ws", get(room_ws));

    let protected_routes = Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}/join", post(join_session))
        .route("/sessions/{session_id}/leave", post(leave_session))
        .route("/sessions/{session_id}/status", put(change_session_status))
        .route(
            "/sessions/{session_id}/technical-issues",
            post(report_technical_issue),
        )
        .route("/sessions/{session_id}/rating", post(submit_rating))
        .route("/sessions/{session_id}/messages", get(list_messages))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
