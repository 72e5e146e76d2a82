// libs/teleconsult-cell/src/services/lifecycle.rs
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::OwnedMutexGuard;
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{error, info, warn};
use uuid::Uuid;

use shared_models::auth::User;

use crate::error::TeleconsultError;
use crate::models::{
    ChatMessage, CreateSessionOutcome, CreateSessionRequest, MessageKind, Role, SessionState,
    StatusActor, TeleconsultSession,
};
use crate::services::appointments::AppointmentDirectory;
use crate::services::store::{SessionLocks, SessionStore};

/// How long before the scheduled start the join window opens.
pub const JOIN_WINDOW_LEAD_MINUTES: i64 = 10;

const MESSAGE_BODY_MAX_CHARS: usize = 4000;
const MESSAGES_DEFAULT_LIMIT: usize = 50;
const MESSAGES_MAX_LIMIT: usize = 200;

const DISCONNECT_RETRY_ATTEMPTS: u32 = 5;
const DISCONNECT_RETRY_BASE_MS: u64 = 200;

/// The state machine governing a session's lifecycle. Every mutating
/// operation acquires the per-session lock and performs its read-modify-write
/// against the store while holding it, so state transitions for a single
/// session are totally ordered. Operations on different sessions proceed in
/// parallel.
pub struct SessionLifecycleService {
    store: Arc<dyn SessionStore>,
    appointments: Arc<dyn AppointmentDirectory>,
    locks: Arc<SessionLocks>,
}

impl SessionLifecycleService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        appointments: Arc<dyn AppointmentDirectory>,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self {
            store,
            appointments,
            locks,
        }
    }

    /// Create the session for an appointment. Doctor-side action; idempotent
    /// with respect to client retries (a second create returns the existing
    /// session id instead of erroring).
    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
        user: &User,
    ) -> Result<CreateSessionOutcome, TeleconsultError> {
        if !(user.is_doctor() || user.is_admin()) {
            return Err(TeleconsultError::Forbidden);
        }
        if request.scheduled_end <= request.scheduled_start {
            return Err(TeleconsultError::Validation(
                "scheduled_end must be after scheduled_start".to_string(),
            ));
        }

        let appointment = self
            .appointments
            .fetch(request.appointment_id)
            .await?
            .ok_or(TeleconsultError::AppointmentNotFound)?;

        if !appointment.is_bookable() {
            return Err(TeleconsultError::AppointmentNotFound);
        }
        if user.is_doctor() && user.id != appointment.doctor_id.to_string() {
            return Err(TeleconsultError::Forbidden);
        }

        // Serialize creates for the same appointment; at most one session
        // per appointment may ever exist.
        let guard = self.locks.acquire(request.appointment_id).await;

        if let Some(existing) = self
            .store
            .fetch_by_appointment(request.appointment_id)
            .await?
        {
            info!(
                "Session {} already exists for appointment {}",
                existing.id, request.appointment_id
            );
            drop(guard);
            self.locks.evict(request.appointment_id).await;
            return Ok(CreateSessionOutcome::Existing(existing.id));
        }

        let session = TeleconsultSession::new(
            appointment.id,
            appointment.patient_id,
            appointment.doctor_id,
            request.scheduled_start,
            request.scheduled_end,
        );
        self.store.insert(&session).await?;

        info!(
            "Created teleconsult session {} for appointment {}",
            session.id, session.appointment_id
        );
        drop(guard);
        self.locks.evict(request.appointment_id).await;
        Ok(CreateSessionOutcome::Created(session))
    }

    /// Join a session as one of its bound parties. Permitted only while the
    /// session is active and the join window is open. If both parties are
    /// connected after this update and the session is still `Scheduled`, it
    /// is promoted to `InProgress` inside the same locked read-modify-write,
    /// so two near-simultaneous joins promote exactly once.
    pub async fn join(
        &self,
        session_id: Uuid,
        user: &User,
        device_info: Option<serde_json::Value>,
    ) -> Result<(TeleconsultSession, Role), TeleconsultError> {
        let _guard = self.locks.acquire(session_id).await;

        let mut session = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)?;
        let role = session.role_of(&user.id).ok_or(TeleconsultError::Forbidden)?;

        if !session.state.is_active() {
            return Err(TeleconsultError::SessionTerminal {
                state: session.state,
            });
        }

        let now = Utc::now();
        let can_join_at =
            session.scheduled_start - ChronoDuration::minutes(JOIN_WINDOW_LEAD_MINUTES);
        if now < can_join_at {
            return Err(TeleconsultError::JoinWindowClosed { can_join_at });
        }

        let participant = session.participant_mut(role);
        participant.connected = true;
        participant.joined_at = Some(now);
        if device_info.is_some() {
            participant.device_info = device_info;
        }

        if session.both_connected() && session.state == SessionState::Scheduled {
            session.transition_to(
                SessionState::InProgress,
                StatusActor::System,
                Some("both parties connected".to_string()),
                now,
            )?;
        }

        session.updated_at = now;
        self.store.persist(&session).await?;

        info!("{} joined session {} ({})", role, session_id, session.state);
        Ok((session, role))
    }

    /// Leave a session. Idempotent: leaving an already-concluded session (or
    /// leaving twice) is a no-op, not an error.
    pub async fn leave(
        &self,
        session_id: Uuid,
        user: &User,
    ) -> Result<TeleconsultSession, TeleconsultError> {
        let guard = self.locks.acquire(session_id).await;
        let mut session = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)?;
        let role = session.role_of(&user.id).ok_or(TeleconsultError::Forbidden)?;

        self.apply_leave(&mut session, role, false).await?;
        self.release_lock(guard, &session).await;
        Ok(session)
    }

    /// Leave by role, used by the real-time channel where the role was
    /// already resolved at relay admission.
    pub async fn leave_as(
        &self,
        session_id: Uuid,
        role: Role,
    ) -> Result<TeleconsultSession, TeleconsultError> {
        let guard = self.locks.acquire(session_id).await;
        let mut session = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)?;

        self.apply_leave(&mut session, role, false).await?;
        self.release_lock(guard, &session).await;
        Ok(session)
    }

    /// Implicit leave synthesized by the presence registry after the
    /// disconnect grace period expires. Counted against the session's
    /// quality metrics. Store failures are retried with backoff: dropping
    /// the event could leave an `InProgress` session with nobody connected.
    pub async fn handle_disconnect(
        &self,
        session_id: Uuid,
        role: Role,
    ) -> Result<(), TeleconsultError> {
        let mut attempt = 0;
        loop {
            match self.apply_disconnect_once(session_id, role).await {
                Ok(()) => return Ok(()),
                Err(TeleconsultError::Store(msg)) if attempt < DISCONNECT_RETRY_ATTEMPTS => {
                    let backoff = DISCONNECT_RETRY_BASE_MS << attempt;
                    warn!(
                        "Implicit leave for session {} ({}) failed, retrying in {}ms: {}",
                        session_id, role, backoff, msg
                    );
                    sleep(TokioDuration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Implicit leave for session {} ({}) abandoned: {}",
                        session_id, role, e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn apply_disconnect_once(
        &self,
        session_id: Uuid,
        role: Role,
    ) -> Result<(), TeleconsultError> {
        let guard = self.locks.acquire(session_id).await;
        let mut session = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)?;

        self.apply_leave(&mut session, role, true).await?;
        self.release_lock(guard, &session).await;
        Ok(())
    }

    /// Release the per-session guard and, once a session has concluded,
    /// evict its lock entry so the map stays bounded by live sessions.
    async fn release_lock(&self, guard: OwnedMutexGuard<()>, session: &TeleconsultSession) {
        let concluded = !session.state.is_active();
        drop(guard);
        if concluded {
            self.locks.evict(session.id).await;
        }
    }

    /// Shared leave path. Must be called with the session lock held.
    async fn apply_leave(
        &self,
        session: &mut TeleconsultSession,
        role: Role,
        implicit: bool,
    ) -> Result<(), TeleconsultError> {
        let now = Utc::now();
        let participant = session.participant_mut(role);
        let was_connected = participant.connected;

        if !session.state.is_active() {
            // Already concluded: record the departure, never transition.
            if was_connected {
                let participant = session.participant_mut(role);
                participant.connected = false;
                participant.left_at = Some(now);
                session.updated_at = now;
                self.store.persist(session).await?;
            }
            return Ok(());
        }

        if !was_connected {
            return Ok(());
        }

        let participant = session.participant_mut(role);
        participant.connected = false;
        participant.left_at = Some(now);

        if implicit {
            session.quality_metrics.disconnection_count += 1;
        }

        // The doctor leaving ends the consultation; so does the second
        // party dropping out of a running one.
        let should_complete = role == Role::Doctor
            || (session.state == SessionState::InProgress && session.both_disconnected());

        if should_complete {
            let reason = if implicit {
                format!("{} disconnected", role)
            } else {
                format!("{} left", role)
            };
            session.transition_to(
                SessionState::Completed,
                if implicit {
                    StatusActor::System
                } else {
                    StatusActor::from(role)
                },
                Some(reason),
                now,
            )?;
        }

        session.updated_at = now;
        self.store.persist(session).await?;

        info!(
            "{} left session {} (implicit: {}, state: {})",
            role, session.id, implicit, session.state
        );
        Ok(())
    }

    /// Doctor-only explicit status change: cancellation, no-show marking,
    /// technical-issue flagging and recovery. Illegal edges are rejected
    /// with the state unchanged.
    pub async fn change_status(
        &self,
        session_id: Uuid,
        user: &User,
        new_state: SessionState,
        reason: Option<String>,
    ) -> Result<TeleconsultSession, TeleconsultError> {
        let guard = self.locks.acquire(session_id).await;
        let mut session = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)?;

        match session.role_of(&user.id) {
            Some(Role::Doctor) => {}
            _ => return Err(TeleconsultError::Forbidden),
        }

        if !session.state.allows_explicit_change_to(new_state) {
            return Err(TeleconsultError::IllegalTransition {
                from: session.state,
                to: new_state,
            });
        }

        let recovering = session.state == SessionState::TechnicalIssue;
        session.transition_to(new_state, StatusActor::Doctor, reason, Utc::now())?;

        if recovering && new_state == SessionState::Completed {
            for issue in &mut session.technical_issues {
                issue.resolved = true;
            }
        }

        self.store.persist(&session).await?;
        info!(
            "Session {} status changed to {} by doctor",
            session_id, new_state
        );
        self.release_lock(guard, &session).await;
        Ok(session)
    }

    /// Append a chat message to the session log. The append order here,
    /// committed under the session lock, is the authoritative message order.
    pub async fn append_chat(
        &self,
        session_id: Uuid,
        role: Role,
        body: String,
    ) -> Result<ChatMessage, TeleconsultError> {
        if body.trim().is_empty() {
            return Err(TeleconsultError::Validation(
                "message body must not be empty".to_string(),
            ));
        }
        if body.chars().count() > MESSAGE_BODY_MAX_CHARS {
            return Err(TeleconsultError::Validation(format!(
                "message body exceeds {} characters",
                MESSAGE_BODY_MAX_CHARS
            )));
        }

        let _guard = self.locks.acquire(session_id).await;
        let mut session = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)?;

        if !session.state.is_active() {
            return Err(TeleconsultError::SessionTerminal {
                state: session.state,
            });
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender_role: role,
            body,
            kind: MessageKind::Text,
            timestamp: Utc::now(),
        };
        session.messages.push(message.clone());
        session.updated_at = message.timestamp;
        self.store.persist(&session).await?;

        Ok(message)
    }

    /// Paginated read of the append-only chat log, in append order.
    pub async fn list_messages(
        &self,
        session_id: Uuid,
        user: &User,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<(Vec<ChatMessage>, usize), TeleconsultError> {
        let session = self.authorized_session(session_id, user).await?;

        let total = session.messages.len();
        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(MESSAGES_DEFAULT_LIMIT).min(MESSAGES_MAX_LIMIT);

        let page = session
            .messages
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();
        Ok((page, total))
    }

    /// Fetch the session snapshot for one of its bound parties or an admin.
    pub async fn get_session(
        &self,
        session_id: Uuid,
        user: &User,
    ) -> Result<TeleconsultSession, TeleconsultError> {
        self.authorized_session(session_id, user).await
    }

    async fn authorized_session(
        &self,
        session_id: Uuid,
        user: &User,
    ) -> Result<TeleconsultSession, TeleconsultError> {
        let session = self
            .store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)?;

        if session.role_of(&user.id).is_none() && !user.is_admin() {
            return Err(TeleconsultError::Forbidden);
        }
        Ok(session)
    }
}
