// libs/teleconsult-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::User;

use crate::error::TeleconsultError;
use crate::models::{
    CreateSessionOutcome, CreateSessionRequest, JoinSessionRequest, MessagesQuery, RatingRequest,
    StatusChangeRequest, TechnicalIssueRequest,
};
use crate::TeleconsultState;

// ==============================================================================
// SESSION MANAGEMENT HANDLERS
// ==============================================================================

/// Create the teleconsult session for an appointment (doctor-side).
/// Idempotent: a retry for an appointment that already has a session gets
/// `409` with the existing session id.
#[axum::debug_handler]
pub async fn create_session(
    State(state): State<Arc<TeleconsultState>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response, TeleconsultError> {
    let outcome = state.lifecycle.create_session(&request, &user).await?;

    let response = match outcome {
        CreateSessionOutcome::Created(session) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "session": session,
            })),
        )
            .into_response(),
        CreateSessionOutcome::Existing(existing_session_id) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "existing_session_id": existing_session_id,
            })),
        )
            .into_response(),
    };
    Ok(response)
}

/// Get the session snapshot (bound parties or admin only).
#[axum::debug_handler]
pub async fn get_session(
    State(state): State<Arc<TeleconsultState>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TeleconsultError> {
    let session = state.lifecycle.get_session(session_id, &user).await?;
    Ok(Json(json!({ "session": session })))
}

/// Join the session. On success the caller receives the session snapshot
/// plus a single-use relay token admitting it to the room.
#[axum::debug_handler]
pub async fn join_session(
    State(state): State<Arc<TeleconsultState>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<JoinSessionRequest>,
) -> Result<Json<Value>, TeleconsultError> {
    let (session, role) = state
        .lifecycle
        .join(session_id, &user, request.device_info)
        .await?;

    let relay_token = state.relay.issue_token(&session, role, &user.id).await;

    Ok(Json(json!({
        "session": session,
        "room_id": session.room_id,
        "relay_token": relay_token,
    })))
}

/// Leave the session. Idempotent; repeated calls after termination are
/// no-ops.
#[axum::debug_handler]
pub async fn leave_session(
    State(state): State<Arc<TeleconsultState>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TeleconsultError> {
    let session = state.lifecycle.leave(session_id, &user).await?;
    Ok(Json(json!({ "session": session })))
}

/// Doctor-only explicit status change (cancel, no-show, technical-issue
/// flagging and recovery).
#[axum::debug_handler]
pub async fn change_session_status(
    State(state): State<Arc<TeleconsultState>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<StatusChangeRequest>,
) -> Result<Json<Value>, TeleconsultError> {
    let session = state
        .lifecycle
        .change_status(session_id, &user, request.new_state, request.reason)
        .await?;
    Ok(Json(json!({ "session": session })))
}

// ==============================================================================
// TELEMETRY HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn report_technical_issue(
    State(state): State<Arc<TeleconsultState>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<TechnicalIssueRequest>,
) -> Result<Response, TeleconsultError> {
    let report = state
        .telemetry
        .report_issue(session_id, &user, request.kind, request.description)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "report": report })),
    )
        .into_response())
}

/// Submit a post-session rating for the caller's role. A second submission
/// overwrites the first.
#[axum::debug_handler]
pub async fn submit_rating(
    State(state): State<Arc<TeleconsultState>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<RatingRequest>,
) -> Result<Json<Value>, TeleconsultError> {
    let session = state
        .telemetry
        .submit_rating(session_id, &user, request.score, request.feedback)
        .await?;
    Ok(Json(json!({
        "success": true,
        "quality_metrics": session.quality_metrics,
    })))
}

// ==============================================================================
// CHAT HISTORY
// ==============================================================================

/// Paginated chat history in append order, retrievable by either party
/// even after both have disconnected.
#[axum::debug_handler]
pub async fn list_messages(
    State(state): State<Arc<TeleconsultState>>,
    Path(session_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Value>, TeleconsultError> {
    let (messages, total) = state
        .lifecycle
        .list_messages(session_id, &user, query.limit, query.offset)
        .await?;

    Ok(Json(json!({
        "messages": messages,
        "total": total,
        "offset": query.offset.unwrap_or(0),
    })))
}

// ==============================================================================
// SYSTEM
// ==============================================================================

/// Health check for the session-coordination subsystem.
#[axum::debug_handler]
pub async fn health_check(State(state): State<Arc<TeleconsultState>>) -> Json<Value> {
    let configured = state.config.is_store_configured();
    Json(json!({
        "status": if configured { "healthy" } else { "not_configured" },
        "store_configured": configured,
    }))
}
