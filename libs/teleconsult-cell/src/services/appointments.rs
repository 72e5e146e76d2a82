// libs/teleconsult-cell/src/services/appointments.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::TeleconsultError;

/// Appointment data the session core needs: the two bound identities, the
/// booked time window and the booking status. Everything else about
/// appointments belongs to the appointment system.
#[derive(Debug, Clone, Deserialize)]
pub struct AppointmentRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub status: String,
}

impl AppointmentRecord {
    /// Statuses under which a teleconsult session may be created.
    pub fn is_bookable(&self) -> bool {
        matches!(self.status.as_str(), "scheduled" | "confirmed")
    }
}

/// External collaborator supplying appointment lookups.
#[async_trait]
pub trait AppointmentDirectory: Send + Sync {
    async fn fetch(&self, id: Uuid) -> Result<Option<AppointmentRecord>, TeleconsultError>;
}

pub struct SupabaseAppointmentDirectory {
    supabase: SupabaseClient,
}

impl SupabaseAppointmentDirectory {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::service(config),
        }
    }
}

#[async_trait]
impl AppointmentDirectory for SupabaseAppointmentDirectory {
    async fn fetch(&self, id: Uuid) -> Result<Option<AppointmentRecord>, TeleconsultError> {
        let path = format!("/rest/v1/appointments?id=eq.{}", id);
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| TeleconsultError::Store(e.to_string()))?;

        rows.into_iter()
            .next()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| {
                    TeleconsultError::Store(format!("Failed to parse appointment: {}", e))
                })
            })
            .transpose()
    }
}

/// In-memory directory for tests.
pub struct InMemoryAppointmentDirectory {
    appointments: RwLock<HashMap<Uuid, AppointmentRecord>>,
}

impl InMemoryAppointmentDirectory {
    pub fn new() -> Self {
        Self {
            appointments: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, appointment: AppointmentRecord) {
        self.appointments
            .write()
            .await
            .insert(appointment.id, appointment);
    }
}

impl Default for InMemoryAppointmentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AppointmentDirectory for InMemoryAppointmentDirectory {
    async fn fetch(&self, id: Uuid) -> Result<Option<AppointmentRecord>, TeleconsultError> {
        Ok(self.appointments.read().await.get(&id).cloned())
    }
}
