// libs/teleconsult-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::TeleconsultError;

// ==============================================================================
// TELECONSULTATION DOMAIN MODELS
// ==============================================================================

/// The two parties bound to a teleconsultation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    #[serde(rename = "patient")]
    Patient,
    #[serde(rename = "doctor")]
    Doctor,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Patient => Role::Doctor,
            Role::Doctor => Role::Patient,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Patient => write!(f, "patient"),
            Role::Doctor => write!(f, "doctor"),
        }
    }
}

/// Session lifecycle states. The session record is mutated exclusively
/// through the lifecycle engine, which checks legality via the predicates
/// below before committing any transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "no_show")]
    NoShow,
    #[serde(rename = "technical_issue")]
    TechnicalIssue,
}

impl SessionState {
    /// States in which parties may still join the room.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Scheduled | SessionState::InProgress)
    }

    /// States with no outgoing edges at all.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::NoShow
        )
    }

    /// The full transition graph. `TechnicalIssue` is terminal-ish: its only
    /// outgoing edge is the explicit recovery to `Completed`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Scheduled, InProgress)
                | (Scheduled, Cancelled)
                | (Scheduled, NoShow)
                | (Scheduled, Completed)
                | (InProgress, Completed)
                | (InProgress, TechnicalIssue)
                | (TechnicalIssue, Completed)
        )
    }

    /// Edges reachable through the doctor-only explicit status change.
    /// Promotion to `InProgress` happens only via join, and the
    /// `Scheduled -> Completed` edge only via leave.
    pub fn allows_explicit_change_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Scheduled, Cancelled)
                | (Scheduled, NoShow)
                | (InProgress, Completed)
                | (InProgress, TechnicalIssue)
                | (TechnicalIssue, Completed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Scheduled => "scheduled",
            SessionState::InProgress => "in_progress",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::NoShow => "no_show",
            SessionState::TechnicalIssue => "technical_issue",
        };
        write!(f, "{}", s)
    }
}

/// Per-role connectivity snapshot. Informational only: session state is a
/// function of the transition history, never of current connectivity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantState {
    pub connected: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageKind {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "system")]
    System,
}

/// One entry of the append-only in-session chat log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_role: Role,
    pub body: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IssueKind {
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "connectivity")]
    Connectivity,
    #[serde(rename = "other")]
    Other,
}

/// Append-only technical-issue report. Duplicate reports of the same
/// problem are expected and retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalIssueReport {
    pub reported_by: Role,
    pub kind: IssueKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_rating: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor_rating: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor_feedback: Option<String>,
    pub disconnection_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
    pub latency_samples: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusActor {
    #[serde(rename = "patient")]
    Patient,
    #[serde(rename = "doctor")]
    Doctor,
    #[serde(rename = "system")]
    System,
}

impl From<Role> for StatusActor {
    fn from(role: Role) -> Self {
        match role {
            Role::Patient => StatusActor::Patient,
            Role::Doctor => StatusActor::Doctor,
        }
    }
}

/// Audit trail entry for a single state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: SessionState,
    pub to: SessionState,
    pub actor: StatusActor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One teleconsultation session, bound 1:1 to an appointment. Never
/// physically deleted; retained for audit and billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeleconsultSession {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub state: SessionState,
    pub room_id: String,
    pub participants: HashMap<Role, ParticipantState>,
    pub messages: Vec<ChatMessage>,
    pub technical_issues: Vec<TechnicalIssueReport>,
    pub quality_metrics: QualityMetrics,
    pub status_history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TeleconsultSession {
    pub fn new(
        appointment_id: Uuid,
        patient_id: Uuid,
        doctor_id: Uuid,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        let mut participants = HashMap::new();
        participants.insert(Role::Patient, ParticipantState::default());
        participants.insert(Role::Doctor, ParticipantState::default());

        Self {
            id: Uuid::new_v4(),
            appointment_id,
            patient_id,
            doctor_id,
            scheduled_start,
            scheduled_end,
            actual_start: None,
            actual_end: None,
            state: SessionState::Scheduled,
            room_id: format!("room_{}", Uuid::new_v4().simple()),
            participants,
            messages: Vec::new(),
            technical_issues: Vec::new(),
            quality_metrics: QualityMetrics::default(),
            status_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolves the role a user plays in this session, if any.
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        let uid = Uuid::parse_str(user_id).ok()?;
        if uid == self.patient_id {
            Some(Role::Patient)
        } else if uid == self.doctor_id {
            Some(Role::Doctor)
        } else {
            None
        }
    }

    pub fn participant(&self, role: Role) -> &ParticipantState {
        // both roles are seeded at construction
        self.participants.get(&role).expect("participant map seeded")
    }

    pub fn participant_mut(&mut self, role: Role) -> &mut ParticipantState {
        self.participants.entry(role).or_default()
    }

    pub fn both_connected(&self) -> bool {
        self.participant(Role::Patient).connected && self.participant(Role::Doctor).connected
    }

    pub fn both_disconnected(&self) -> bool {
        !self.participant(Role::Patient).connected && !self.participant(Role::Doctor).connected
    }

    /// Commits a state transition, rejecting illegal edges. Stamps
    /// `actual_start` on entry into `InProgress` and `actual_end` on entry
    /// into any concluding state, each exactly once.
    pub fn transition_to(
        &mut self,
        next: SessionState,
        actor: StatusActor,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TeleconsultError> {
        if !self.state.can_transition_to(next) {
            return Err(TeleconsultError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }

        if next == SessionState::InProgress && self.actual_start.is_none() {
            self.actual_start = Some(now);
        }
        if !next.is_active() && self.actual_end.is_none() {
            self.actual_end = Some(now);
        }

        self.status_history.push(StatusChange {
            from: self.state,
            to: next,
            actor,
            reason,
            timestamp: now,
        });
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

// ==============================================================================
// API REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub appointment_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinSessionRequest {
    #[serde(default)]
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusChangeRequest {
    pub new_state: SessionState,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TechnicalIssueRequest {
    pub kind: IssueKind,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RatingRequest {
    pub score: u8,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Outcome of the idempotent create operation: client retries for an
/// appointment that already has a session get the existing id back.
#[derive(Debug, Clone)]
pub enum CreateSessionOutcome {
    Created(TeleconsultSession),
    Existing(Uuid),
}
