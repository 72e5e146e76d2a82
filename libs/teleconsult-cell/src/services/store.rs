// libs/teleconsult-cell/src/services/store.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::TeleconsultError;
use crate::models::TeleconsultSession;

/// Durable record holder for teleconsult sessions. Deliberately dumb: no
/// business rules fire here, all invariants live in the lifecycle engine.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &TeleconsultSession) -> Result<(), TeleconsultError>;
    async fn fetch(&self, id: Uuid) -> Result<Option<TeleconsultSession>, TeleconsultError>;
    async fn fetch_by_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<TeleconsultSession>, TeleconsultError>;
    async fn persist(&self, session: &TeleconsultSession) -> Result<(), TeleconsultError>;
}

/// Per-session mutex map. Holding the guard for a session id serializes all
/// mutating operations against that session, so a read-modify-write under
/// the guard is atomic with respect to other engine operations. Sessions
/// with different ids proceed fully in parallel.
pub struct SessionLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the entry for an id nothing is holding or waiting on. Terminal
    /// sessions would otherwise leak one mutex each for the life of the
    /// process. An entry with outstanding guards or waiters (strong count
    /// above the map's own reference) is left in place.
    pub async fn evict(&self, id: Uuid) {
        let mut map = self.inner.lock().await;
        if let Some(lock) = map.get(&id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&id);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::new()
    }
}

// ==============================================================================
// SUPABASE-BACKED STORE
// ==============================================================================

/// Session store backed by Supabase PostgREST. Writes use the service-role
/// client because engine-driven mutations (grace-period disconnects, status
/// promotion) run outside any user request.
pub struct SupabaseSessionStore {
    supabase: SupabaseClient,
}

impl SupabaseSessionStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::service(config),
        }
    }

    fn serialize(session: &TeleconsultSession) -> Result<Value, TeleconsultError> {
        serde_json::to_value(session)
            .map_err(|e| TeleconsultError::Store(format!("Failed to serialize session: {}", e)))
    }

    fn parse_row(row: Value) -> Result<TeleconsultSession, TeleconsultError> {
        serde_json::from_value(row)
            .map_err(|e| TeleconsultError::Store(format!("Failed to parse session: {}", e)))
    }

    async fn fetch_one(&self, path: &str) -> Result<Option<TeleconsultSession>, TeleconsultError> {
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, path, None, None)
            .await
            .map_err(|e| TeleconsultError::Store(e.to_string()))?;

        rows.into_iter().next().map(Self::parse_row).transpose()
    }
}

#[async_trait]
impl SessionStore for SupabaseSessionStore {
    async fn insert(&self, session: &TeleconsultSession) -> Result<(), TeleconsultError> {
        let body = Self::serialize(session)?;
        let _: Vec<Value> = self
            .supabase
            .request(Method::POST, "/rest/v1/teleconsult_sessions", None, Some(body))
            .await
            .map_err(|e| TeleconsultError::Store(format!("Failed to store session: {}", e)))?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<TeleconsultSession>, TeleconsultError> {
        let path = format!("/rest/v1/teleconsult_sessions?id=eq.{}", id);
        self.fetch_one(&path).await
    }

    async fn fetch_by_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<TeleconsultSession>, TeleconsultError> {
        let path = format!(
            "/rest/v1/teleconsult_sessions?appointment_id=eq.{}",
            appointment_id
        );
        self.fetch_one(&path).await
    }

    async fn persist(&self, session: &TeleconsultSession) -> Result<(), TeleconsultError> {
        let path = format!("/rest/v1/teleconsult_sessions?id=eq.{}", session.id);
        let body = Self::serialize(session)?;
        let _: Vec<Value> = self
            .supabase
            .request(Method::PATCH, &path, None, Some(body))
            .await
            .map_err(|e| TeleconsultError::Store(format!("Failed to update session: {}", e)))?;
        Ok(())
    }
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

/// In-memory store used by tests and single-process deployments.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, TeleconsultSession>>,
    by_appointment: RwLock<HashMap<Uuid, Uuid>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_appointment: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: &TeleconsultSession) -> Result<(), TeleconsultError> {
        let mut sessions = self.sessions.write().await;
        let mut index = self.by_appointment.write().await;
        sessions.insert(session.id, session.clone());
        index.insert(session.appointment_id, session.id);
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<TeleconsultSession>, TeleconsultError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn fetch_by_appointment(
        &self,
        appointment_id: Uuid,
    ) -> Result<Option<TeleconsultSession>, TeleconsultError> {
        let index = self.by_appointment.read().await;
        let Some(id) = index.get(&appointment_id) else {
            return Ok(None);
        };
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn persist(&self, session: &TeleconsultSession) -> Result<(), TeleconsultError> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&session.id) {
            return Err(TeleconsultError::Store(format!(
                "Unknown session {}",
                session.id
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }
}
