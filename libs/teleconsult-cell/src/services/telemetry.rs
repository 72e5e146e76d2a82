// libs/teleconsult-cell/src/services/telemetry.rs
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::info;
use uuid::Uuid;

use shared_models::auth::User;

use crate::error::TeleconsultError;
use crate::models::{IssueKind, Role, TechnicalIssueReport, TeleconsultSession};
use crate::services::store::{SessionLocks, SessionStore};

/// Records quality and technical telemetry onto the session record. Shares
/// the lifecycle engine's per-session locks so appends never race with
/// state transitions.
pub struct TelemetryRecorder {
    store: Arc<dyn SessionStore>,
    locks: Arc<SessionLocks>,
}

impl TelemetryRecorder {
    pub fn new(store: Arc<dyn SessionStore>, locks: Arc<SessionLocks>) -> Self {
        Self { store, locks }
    }

    /// Append a technical-issue report. No deduplication: repeated reports
    /// of the same problem are expected and all retained.
    pub async fn report_issue(
        &self,
        session_id: Uuid,
        user: &User,
        kind: IssueKind,
        description: String,
    ) -> Result<TechnicalIssueReport, TeleconsultError> {
        if description.trim().is_empty() {
            return Err(TeleconsultError::Validation(
                "issue description must not be empty".to_string(),
            ));
        }

        let guard = self.locks.acquire(session_id).await;
        let mut session = self.fetch(session_id).await?;
        let role = session.role_of(&user.id).ok_or(TeleconsultError::Forbidden)?;

        let report = TechnicalIssueReport {
            reported_by: role,
            kind,
            description,
            timestamp: Utc::now(),
            resolved: false,
        };
        session.technical_issues.push(report.clone());
        session.updated_at = report.timestamp;
        self.store.persist(&session).await?;
        self.release_lock(guard, &session).await;

        info!("Technical issue reported on session {} by {}", session_id, role);
        Ok(report)
    }

    /// Submit a quality rating for the caller's role. A re-submission
    /// overwrites the previous one rather than duplicating it.
    pub async fn submit_rating(
        &self,
        session_id: Uuid,
        user: &User,
        score: u8,
        feedback: Option<String>,
    ) -> Result<TeleconsultSession, TeleconsultError> {
        if !(1..=5).contains(&score) {
            return Err(TeleconsultError::Validation(
                "rating score must be between 1 and 5".to_string(),
            ));
        }

        let guard = self.locks.acquire(session_id).await;
        let mut session = self.fetch(session_id).await?;
        let role = session.role_of(&user.id).ok_or(TeleconsultError::Forbidden)?;

        match role {
            Role::Patient => {
                session.quality_metrics.patient_rating = Some(score);
                session.quality_metrics.patient_feedback = feedback;
            }
            Role::Doctor => {
                session.quality_metrics.doctor_rating = Some(score);
                session.quality_metrics.doctor_feedback = feedback;
            }
        }
        session.updated_at = Utc::now();
        self.store.persist(&session).await?;
        self.release_lock(guard, &session).await;
        Ok(session)
    }

    /// Fold a latency sample reported over the real-time channel into the
    /// session's running average.
    pub async fn record_latency_sample(
        &self,
        session_id: Uuid,
        sample_ms: f64,
    ) -> Result<(), TeleconsultError> {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return Err(TeleconsultError::Validation(
                "latency sample must be a non-negative number".to_string(),
            ));
        }

        let guard = self.locks.acquire(session_id).await;
        let mut session = self.fetch(session_id).await?;

        let metrics = &mut session.quality_metrics;
        let count = metrics.latency_samples as f64;
        let average = metrics.average_latency_ms.unwrap_or(0.0);
        metrics.average_latency_ms = Some((average * count + sample_ms) / (count + 1.0));
        metrics.latency_samples += 1;

        session.updated_at = Utc::now();
        self.store.persist(&session).await?;
        self.release_lock(guard, &session).await;
        Ok(())
    }

    async fn fetch(&self, session_id: Uuid) -> Result<TeleconsultSession, TeleconsultError> {
        self.store
            .fetch(session_id)
            .await?
            .ok_or(TeleconsultError::SessionNotFound)
    }

    /// Drop the guard and evict the lock entry once the session has
    /// concluded, mirroring the lifecycle engine's lock hygiene.
    async fn release_lock(&self, guard: OwnedMutexGuard<()>, session: &TeleconsultSession) {
        let concluded = !session.state.is_active();
        drop(guard);
        if concluded {
            self.locks.evict(session.id).await;
        }
    }
}
