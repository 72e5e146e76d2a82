// libs/teleconsult-cell/src/lib.rs
//! # Teleconsult Cell
//!
//! Session coordination for live teleconsultations: turns a booked
//! appointment into a time-boxed two-party real-time session with a
//! well-defined lifecycle, presence tracking, signaling relay, in-session
//! chat and quality telemetry.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                 Teleconsult Cell                    |
//! +-----------------------------------------------------+
//! |  handlers.rs    |  HTTP endpoint handlers           |
//! |  router.rs      |  Route definitions                |
//! |  ws.rs          |  Room WebSocket endpoint          |
//! |  models.rs      |  Session record & DTOs            |
//! |  services/      |  Business logic layer             |
//! |    store.rs     |  Durable session store + locks    |
//! |    lifecycle.rs |  Session state machine            |
//! |    presence.rs  |  Connection registry              |
//! |    relay.rs     |  Room-scoped signaling fan-out    |
//! |    telemetry.rs |  Issues, ratings, latency         |
//! |    appointments.rs | Appointment lookup collaborator|
//! +-----------------------------------------------------+
//! ```
//!
//! Mutations against a session are serialized through a per-session lock
//! held by the lifecycle engine; the presence registry and relay are
//! indexes over live connections and never the source of truth for session
//! state.

pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use shared_config::AppConfig;

use services::appointments::{AppointmentDirectory, SupabaseAppointmentDirectory};
use services::lifecycle::SessionLifecycleService;
use services::presence::PresenceRegistry;
use services::relay::SignalingRelay;
use services::store::{SessionLocks, SessionStore, SupabaseSessionStore};
use services::telemetry::TelemetryRecorder;

// Re-export commonly used types
pub use error::TeleconsultError;
pub use models::{
    ChatMessage, CreateSessionOutcome, Role, SessionState, TeleconsultSession,
};
pub use router::teleconsult_routes;

/// Shared state for the teleconsult cell: one lifecycle engine, presence
/// registry and relay per process, wired over a trait-abstracted store.
pub struct TeleconsultState {
    pub config: Arc<AppConfig>,
    pub lifecycle: Arc<SessionLifecycleService>,
    pub presence: Arc<PresenceRegistry>,
    pub relay: Arc<SignalingRelay>,
    pub telemetry: Arc<TelemetryRecorder>,
}

impl TeleconsultState {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let store: Arc<dyn SessionStore> = Arc::new(SupabaseSessionStore::new(&config));
        let appointments: Arc<dyn AppointmentDirectory> =
            Arc::new(SupabaseAppointmentDirectory::new(&config));
        Self::with_parts(config, store, appointments)
    }

    /// Assemble the cell over explicit store and appointment collaborators;
    /// tests inject in-memory implementations here.
    pub fn with_parts(
        config: Arc<AppConfig>,
        store: Arc<dyn SessionStore>,
        appointments: Arc<dyn AppointmentDirectory>,
    ) -> Self {
        let locks = Arc::new(SessionLocks::new());
        let lifecycle = Arc::new(SessionLifecycleService::new(
            store.clone(),
            appointments,
            locks.clone(),
        ));
        let presence = Arc::new(PresenceRegistry::new(
            lifecycle.clone(),
            Duration::from_secs(config.disconnect_grace_seconds),
        ));
        let relay = Arc::new(SignalingRelay::new(presence.clone()));
        let telemetry = Arc::new(TelemetryRecorder::new(store, locks));

        Self {
            config,
            lifecycle,
            presence,
            relay,
            telemetry,
        }
    }
}
