// libs/teleconsult-cell/src/services/presence.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc::UnboundedSender, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Role;
use crate::services::lifecycle::SessionLifecycleService;
use crate::services::relay::RoomEvent;

/// One registered real-time connection for a (session, role) slot.
struct RegisteredConnection {
    connection_id: Uuid,
    user_id: String,
    sender: UnboundedSender<RoomEvent>,
}

/// Process-local registry of who is connected where. An index over live
/// connections only, never the source of truth for session state: the
/// lifecycle engine derives state exclusively from join/leave events.
///
/// At most one connection per role per session is authoritative; a second
/// device registering for the same role supersedes the first. A transport
/// drop without an explicit leave starts a cancellable grace timer; only if
/// the role has not reconnected when it fires does the registry synthesize
/// an implicit leave through the lifecycle engine.
pub struct PresenceRegistry {
    connections: RwLock<HashMap<(Uuid, Role), RegisteredConnection>>,
    by_connection: RwLock<HashMap<Uuid, (Uuid, Role)>>,
    generations: RwLock<HashMap<(Uuid, Role), u64>>,
    lifecycle: Arc<SessionLifecycleService>,
    grace: Duration,
}

impl PresenceRegistry {
    pub fn new(lifecycle: Arc<SessionLifecycleService>, grace: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            by_connection: RwLock::new(HashMap::new()),
            generations: RwLock::new(HashMap::new()),
            lifecycle,
            grace,
        }
    }

    /// Register a connection for a (session, role) slot, evicting any prior
    /// connection for the same slot. The superseded socket is notified and
    /// closed. Registering also bumps the slot generation, which cancels
    /// any pending grace-period disconnect for the role.
    pub async fn register(
        &self,
        session_id: Uuid,
        role: Role,
        user_id: String,
        sender: UnboundedSender<RoomEvent>,
    ) -> Uuid {
        let key = (session_id, role);
        let connection_id = Uuid::new_v4();

        // Generation bump and connection swap happen under one lock so a
        // grace-timer snapshot can never interleave with a reconnect.
        let evicted = {
            let mut connections = self.connections.write().await;
            let mut generations = self.generations.write().await;
            *generations.entry(key).or_insert(0) += 1;
            connections.insert(
                key,
                RegisteredConnection {
                    connection_id,
                    user_id,
                    sender,
                },
            )
        };

        let mut by_connection = self.by_connection.write().await;
        if let Some(old) = evicted {
            info!(
                "Superseding connection {} for session {} ({})",
                old.connection_id, session_id, role
            );
            by_connection.remove(&old.connection_id);
            if old.sender.send(RoomEvent::Superseded).is_err() {
                debug!("Superseded connection already gone");
            }
        }
        by_connection.insert(connection_id, key);

        debug!(
            "Registered connection {} for session {} ({})",
            connection_id, session_id, role
        );
        connection_id
    }

    /// Remove a connection after an explicit leave. No grace timer: the
    /// lifecycle engine has already processed the departure. Returns
    /// whether the connection was still the authoritative one for its slot.
    pub async fn unregister(&self, connection_id: Uuid) -> bool {
        match self.remove_if_current(connection_id).await {
            Some((session_id, role, _)) => {
                self.generations.write().await.remove(&(session_id, role));
                true
            }
            None => false,
        }
    }

    /// Handle a transport-level drop without an explicit leave. If the
    /// connection was still authoritative its mapping is removed and the
    /// grace timer starts; a reconnect before the timer fires bumps the
    /// slot generation and suppresses the pending implicit leave. Returns
    /// whether the connection was authoritative.
    pub async fn connection_dropped(self: &Arc<Self>, connection_id: Uuid) -> bool {
        let Some((session_id, role, generation_at_drop)) =
            self.remove_if_current(connection_id).await
        else {
            return false;
        };

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(registry.grace).await;

            let expired = {
                let mut generations = registry.generations.write().await;
                match generations.get(&(session_id, role)) {
                    Some(&g) if g == generation_at_drop => {
                        generations.remove(&(session_id, role));
                        true
                    }
                    _ => false,
                }
            };
            if !expired {
                debug!(
                    "{} reconnected to session {} within grace period",
                    role, session_id
                );
                return;
            }

            info!(
                "Grace period expired for {} on session {}, synthesizing leave",
                role, session_id
            );
            if let Err(e) = registry.lifecycle.handle_disconnect(session_id, role).await {
                warn!(
                    "Implicit leave failed for session {} ({}): {}",
                    session_id, role, e
                );
            }
        });
        true
    }

    /// Sender for the other party in the session's room, if connected.
    pub async fn peer_sender(
        &self,
        session_id: Uuid,
        role: Role,
    ) -> Option<UnboundedSender<RoomEvent>> {
        let connections = self.connections.read().await;
        connections
            .get(&(session_id, role.other()))
            .map(|c| c.sender.clone())
    }

    /// Senders for all current members of the session's room.
    pub async fn room_senders(&self, session_id: Uuid) -> Vec<(Role, UnboundedSender<RoomEvent>)> {
        let connections = self.connections.read().await;
        [Role::Patient, Role::Doctor]
            .into_iter()
            .filter_map(|role| {
                connections
                    .get(&(session_id, role))
                    .map(|c| (role, c.sender.clone()))
            })
            .collect()
    }

    /// Whether the given role is currently connected.
    pub async fn is_connected(&self, session_id: Uuid, role: Role) -> bool {
        self.connections
            .read()
            .await
            .contains_key(&(session_id, role))
    }

    pub async fn connected_user(&self, session_id: Uuid, role: Role) -> Option<String> {
        let connections = self.connections.read().await;
        connections
            .get(&(session_id, role))
            .map(|c| c.user_id.clone())
    }

    /// Number of (session, role) slots still holding presence bookkeeping,
    /// connected or in their grace window.
    pub async fn slot_count(&self) -> usize {
        self.generations.read().await.len()
    }

    /// Remove the mapping only if this connection is still the
    /// authoritative one for its slot (it may have been superseded). The
    /// slot generation is read under the same lock that removes the
    /// mapping, so a reconnect is guaranteed to bump past the returned
    /// value.
    async fn remove_if_current(&self, connection_id: Uuid) -> Option<(Uuid, Role, u64)> {
        let key = {
            let mut by_connection = self.by_connection.write().await;
            by_connection.remove(&connection_id)?
        };

        let mut connections = self.connections.write().await;
        match connections.get(&key) {
            Some(current) if current.connection_id == connection_id => {
                connections.remove(&key);
                let generation = self
                    .generations
                    .read()
                    .await
                    .get(&key)
                    .copied()
                    .unwrap_or(0);
                Some((key.0, key.1, generation))
            }
            _ => None,
        }
    }
}
