use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use crate::models::SessionState;

/// Typed errors for the session-coordination core. All lifecycle errors are
/// returned synchronously to the caller; only best-effort relay delivery
/// failures are swallowed (logged at the relay, never surfaced).
#[derive(Error, Debug)]
pub enum TeleconsultError {
    #[error("Teleconsult session not found")]
    SessionNotFound,

    #[error("Appointment not found or not in a bookable state")]
    AppointmentNotFound,

    #[error("User is not a party to this session")]
    Forbidden,

    #[error("Join window opens at {can_join_at}")]
    JoinWindowClosed { can_join_at: DateTime<Utc> },

    #[error("Session has already concluded ({state})")]
    SessionTerminal { state: SessionState },

    #[error("Illegal state transition from {from} to {to}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Relay delivery failed: {0}")]
    Relay(String),
}

impl TeleconsultError {
    /// Stable machine-readable code included in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            TeleconsultError::SessionNotFound => "session_not_found",
            TeleconsultError::AppointmentNotFound => "appointment_not_found",
            TeleconsultError::Forbidden => "forbidden",
            TeleconsultError::JoinWindowClosed { .. } => "join_window_closed",
            TeleconsultError::SessionTerminal { .. } => "session_terminal",
            TeleconsultError::IllegalTransition { .. } => "illegal_transition",
            TeleconsultError::Validation(_) => "validation_error",
            TeleconsultError::Store(_) => "store_error",
            TeleconsultError::Relay(_) => "relay_error",
        }
    }
}

impl IntoResponse for TeleconsultError {
    fn into_response(self) -> Response {
        let status = match &self {
            TeleconsultError::SessionNotFound | TeleconsultError::AppointmentNotFound => {
                StatusCode::NOT_FOUND
            }
            TeleconsultError::Forbidden => StatusCode::FORBIDDEN,
            TeleconsultError::JoinWindowClosed { .. }
            | TeleconsultError::IllegalTransition { .. }
            | TeleconsultError::Validation(_) => StatusCode::BAD_REQUEST,
            TeleconsultError::SessionTerminal { .. } => StatusCode::CONFLICT,
            TeleconsultError::Store(_) | TeleconsultError::Relay(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!("Error: {}: {}", status, self);
        }

        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        match &self {
            TeleconsultError::JoinWindowClosed { can_join_at } => {
                body["can_join_at"] = json!(can_join_at);
            }
            TeleconsultError::SessionTerminal { state } => {
                body["state"] = json!(state);
            }
            TeleconsultError::IllegalTransition { from, to } => {
                body["from"] = json!(from);
                body["to"] = json!(to);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
