// libs/teleconsult-cell/src/services/relay.rs
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::models::{ChatMessage, Role, TeleconsultSession};
use crate::services::presence::PresenceRegistry;

/// Relay tokens expire if the client never opens the room connection.
const TOKEN_TTL_MINUTES: i64 = 10;

/// Events fanned out to room members over the real-time channel. Presence
/// events are informational; clients reconcile against the REST snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    Signal { from: Role, payload: Value },
    Chat { message: ChatMessage },
    PresenceJoined { role: Role },
    PresenceLeft { role: Role },
    Superseded,
}

/// Admission ticket for a room, minted at REST join and redeemed exactly
/// once when the room connection is opened.
#[derive(Debug, Clone)]
pub struct RelayGrant {
    pub session_id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
}

/// Room-scoped fan-out of signaling and chat. Signaling payloads are opaque
/// and delivery is best-effort: failures are logged and repaired by the
/// clients' own negotiation protocol, never retried here.
pub struct SignalingRelay {
    presence: Arc<PresenceRegistry>,
    tokens: RwLock<HashMap<String, RelayGrant>>,
}

impl SignalingRelay {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self {
            presence,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a single-use token admitting one bound party to the session's
    /// room. Stale unredeemed tokens are pruned opportunistically.
    pub async fn issue_token(&self, session: &TeleconsultSession, role: Role, user_id: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let grant = RelayGrant {
            session_id: session.id,
            room_id: session.room_id.clone(),
            user_id: user_id.to_string(),
            role,
            issued_at: Utc::now(),
        };

        let mut tokens = self.tokens.write().await;
        let cutoff = Utc::now() - Duration::minutes(TOKEN_TTL_MINUTES);
        tokens.retain(|_, g| g.issued_at > cutoff);
        tokens.insert(token.clone(), grant);
        token
    }

    /// Redeem a token for the given room. Consumes the token; a mismatched
    /// room or an unknown/expired token yields nothing and the connection
    /// is rejected as forbidden.
    pub async fn redeem_token(&self, token: &str, room_id: &str) -> Option<RelayGrant> {
        let mut tokens = self.tokens.write().await;
        let grant = tokens.remove(token)?;
        if grant.room_id != room_id {
            debug!("Relay token redeemed against the wrong room");
            return None;
        }
        if grant.issued_at < Utc::now() - Duration::minutes(TOKEN_TTL_MINUTES) {
            debug!("Relay token expired before redemption");
            return None;
        }
        Some(grant)
    }

    /// Relay an opaque signaling payload to the other connected party.
    /// Never persisted, never retried.
    pub async fn send_signal(&self, session_id: Uuid, from: Role, payload: Value) {
        match self.presence.peer_sender(session_id, from).await {
            Some(sender) => {
                if sender.send(RoomEvent::Signal { from, payload }).is_err() {
                    debug!(
                        "Dropping signal for session {}: peer channel closed",
                        session_id
                    );
                }
            }
            None => debug!(
                "Dropping signal for session {}: peer not connected",
                session_id
            ),
        }
    }

    /// Broadcast an event to every current member of the session's room.
    pub async fn broadcast(&self, session_id: Uuid, event: RoomEvent) {
        for (role, sender) in self.presence.room_senders(session_id).await {
            if sender.send(event.clone()).is_err() {
                debug!(
                    "Failed to deliver room event to {} on session {}",
                    role, session_id
                );
            }
        }
    }
}
