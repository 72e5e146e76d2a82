use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

use shared_models::auth::User;
use shared_utils::test_utils::{TestConfig, TestUser};
use teleconsult_cell::models::{CreateSessionOutcome, CreateSessionRequest, Role, SessionState};
use teleconsult_cell::services::appointments::{
    AppointmentDirectory, AppointmentRecord, InMemoryAppointmentDirectory,
};
use teleconsult_cell::services::relay::RoomEvent;
use teleconsult_cell::services::store::{InMemorySessionStore, SessionStore};
use teleconsult_cell::{TeleconsultSession, TeleconsultState};

struct TestHarness {
    state: Arc<TeleconsultState>,
    appointments: Arc<InMemoryAppointmentDirectory>,
    patient: User,
    doctor: User,
}

async fn setup() -> TestHarness {
    // TestConfig uses a 1-second disconnect grace so timer tests stay fast
    let config = TestConfig::default().to_arc();
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let appointments = Arc::new(InMemoryAppointmentDirectory::new());
    let directory: Arc<dyn AppointmentDirectory> = appointments.clone();
    let state = Arc::new(TeleconsultState::with_parts(config, store, directory));

    TestHarness {
        state,
        appointments,
        patient: TestUser::with_id(Uuid::new_v4(), "patient@example.com", "patient").to_user(),
        doctor: TestUser::with_id(Uuid::new_v4(), "doctor@example.com", "doctor").to_user(),
    }
}

impl TestHarness {
    /// Creates a session whose join window is open and connects both parties
    /// through the lifecycle engine.
    async fn running_session(&self) -> TeleconsultSession {
        let start = Utc::now() + Duration::minutes(5);
        let appointment = AppointmentRecord {
            id: Uuid::new_v4(),
            patient_id: Uuid::parse_str(&self.patient.id).unwrap(),
            doctor_id: Uuid::parse_str(&self.doctor.id).unwrap(),
            scheduled_start: start,
            scheduled_end: start + Duration::minutes(30),
            status: "confirmed".to_string(),
        };
        self.appointments.add(appointment.clone()).await;

        let request = CreateSessionRequest {
            appointment_id: appointment.id,
            scheduled_start: appointment.scheduled_start,
            scheduled_end: appointment.scheduled_end,
        };
        let session = match self
            .state
            .lifecycle
            .create_session(&request, &self.doctor)
            .await
            .unwrap()
        {
            CreateSessionOutcome::Created(s) => s,
            CreateSessionOutcome::Existing(_) => unreachable!(),
        };

        self.state
            .lifecycle
            .join(session.id, &self.patient, None)
            .await
            .unwrap();
        let (session, _) = self
            .state
            .lifecycle
            .join(session.id, &self.doctor, None)
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::InProgress);
        session
    }

    async fn register(
        &self,
        session_id: Uuid,
        role: Role,
        user_id: &str,
    ) -> (Uuid, UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self
            .state
            .presence
            .register(session_id, role, user_id.to_string(), tx)
            .await;
        (connection_id, rx)
    }
}

// ==============================================================================
// SIGNALING RELAY
// ==============================================================================

#[tokio::test]
async fn signal_reaches_peer_only() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (_, mut patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    let (_, mut doctor_rx) = harness
        .register(session.id, Role::Doctor, &harness.doctor.id)
        .await;

    let payload = json!({ "sdp": "offer" });
    harness
        .state
        .relay
        .send_signal(session.id, Role::Patient, payload.clone())
        .await;

    match doctor_rx.try_recv().unwrap() {
        RoomEvent::Signal { from, payload: p } => {
            assert_eq!(from, Role::Patient);
            assert_eq!(p, payload);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // sender must not receive its own signal
    assert!(patient_rx.try_recv().is_err());
}

#[tokio::test]
async fn signal_dropped_when_peer_absent() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (_, mut patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;

    // no doctor connection; the signal is silently dropped
    harness
        .state
        .relay
        .send_signal(session.id, Role::Patient, json!({ "sdp": "offer" }))
        .await;

    assert!(patient_rx.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_reaches_all_room_members() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (_, mut patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    let (_, mut doctor_rx) = harness
        .register(session.id, Role::Doctor, &harness.doctor.id)
        .await;

    harness
        .state
        .relay
        .broadcast(session.id, RoomEvent::PresenceJoined { role: Role::Patient })
        .await;

    assert!(matches!(
        patient_rx.try_recv().unwrap(),
        RoomEvent::PresenceJoined { role: Role::Patient }
    ));
    assert!(matches!(
        doctor_rx.try_recv().unwrap(),
        RoomEvent::PresenceJoined { role: Role::Patient }
    ));
}

// ==============================================================================
// SUPERSEDE
// ==============================================================================

#[tokio::test]
async fn second_device_supersedes_first() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (_, mut first_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    let (_, mut second_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    let (_, _doctor_rx) = harness
        .register(session.id, Role::Doctor, &harness.doctor.id)
        .await;

    // the first device is told it was replaced
    assert!(matches!(
        first_rx.try_recv().unwrap(),
        RoomEvent::Superseded
    ));

    // signaling now flows to the second device
    harness
        .state
        .relay
        .send_signal(session.id, Role::Doctor, json!({ "ice": "candidate" }))
        .await;
    assert!(matches!(
        second_rx.try_recv().unwrap(),
        RoomEvent::Signal { .. }
    ));
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn superseded_connection_drop_does_not_evict_replacement() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (first_id, _first_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    let (_, _second_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;

    // the stale socket closing must not tear down the new one
    assert!(!harness.state.presence.connection_dropped(first_id).await);
    tokio::time::sleep(StdDuration::from_millis(1500)).await;

    assert!(
        harness
            .state
            .presence
            .is_connected(session.id, Role::Patient)
            .await
    );
    let session = harness
        .state
        .lifecycle
        .get_session(session.id, &harness.patient)
        .await
        .unwrap();
    assert_eq!(session.quality_metrics.disconnection_count, 0);
}

// ==============================================================================
// DISCONNECT GRACE PERIOD
// ==============================================================================

#[tokio::test]
async fn grace_expiry_synthesizes_implicit_leave() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (patient_conn, _patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    let (_, _doctor_rx) = harness
        .register(session.id, Role::Doctor, &harness.doctor.id)
        .await;

    assert!(harness.state.presence.connection_dropped(patient_conn).await);
    tokio::time::sleep(StdDuration::from_millis(1500)).await;

    let session = harness
        .state
        .lifecycle
        .get_session(session.id, &harness.patient)
        .await
        .unwrap();
    assert!(!session.participant(Role::Patient).connected);
    assert_eq!(session.quality_metrics.disconnection_count, 1);
    // doctor is still connected, the consultation keeps running
    assert_eq!(session.state, SessionState::InProgress);
}

#[tokio::test]
async fn reconnect_within_grace_cancels_pending_leave() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (patient_conn, _patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;

    harness.state.presence.connection_dropped(patient_conn).await;
    // same role reconnects well inside the grace window
    let (_, _new_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    tokio::time::sleep(StdDuration::from_millis(1500)).await;

    let session = harness
        .state
        .lifecycle
        .get_session(session.id, &harness.patient)
        .await
        .unwrap();
    assert!(session.participant(Role::Patient).connected);
    assert_eq!(session.quality_metrics.disconnection_count, 0);
}

#[tokio::test]
async fn rapid_drop_reconnect_cycles_never_synthesize_leave() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (_, _doctor_rx) = harness
        .register(session.id, Role::Doctor, &harness.doctor.id)
        .await;

    // A flaky transport: the patient drops and reconnects back-to-back,
    // several times. Each reconnect must land after the drop's generation
    // snapshot, so none of the pending timers may fire a leave.
    let (mut patient_conn, first_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    let mut receivers = vec![first_rx];
    for _ in 0..5 {
        harness.state.presence.connection_dropped(patient_conn).await;
        let (conn, rx) = harness
            .register(session.id, Role::Patient, &harness.patient.id)
            .await;
        patient_conn = conn;
        receivers.push(rx);
    }
    tokio::time::sleep(StdDuration::from_millis(1500)).await;

    assert!(
        harness
            .state
            .presence
            .is_connected(session.id, Role::Patient)
            .await
    );
    let record = harness
        .state
        .lifecycle
        .get_session(session.id, &harness.patient)
        .await
        .unwrap();
    assert!(record.participant(Role::Patient).connected);
    assert_eq!(record.quality_metrics.disconnection_count, 0);
    assert_eq!(record.state, SessionState::InProgress);

    // the last reconnect is still the authoritative connection for the slot
    assert!(harness.state.presence.unregister(patient_conn).await);
    drop(receivers);
}

#[tokio::test]
async fn presence_bookkeeping_is_released_after_departure() {
    let harness = setup().await;
    let session = harness.running_session().await;

    // explicit leave drops the slot immediately
    let (patient_conn, _patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    assert_eq!(harness.state.presence.slot_count().await, 1);
    assert!(harness.state.presence.unregister(patient_conn).await);
    assert_eq!(harness.state.presence.slot_count().await, 0);

    // a transport drop keeps the slot through the grace window only
    let (patient_conn, _patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;
    harness.state.presence.connection_dropped(patient_conn).await;
    assert_eq!(harness.state.presence.slot_count().await, 1);
    tokio::time::sleep(StdDuration::from_millis(1500)).await;
    assert_eq!(harness.state.presence.slot_count().await, 0);
}

#[tokio::test]
async fn explicit_unregister_starts_no_grace_timer() {
    let harness = setup().await;
    let session = harness.running_session().await;
    let (patient_conn, _patient_rx) = harness
        .register(session.id, Role::Patient, &harness.patient.id)
        .await;

    // explicit leave path: the lifecycle engine has already been told
    harness
        .state
        .lifecycle
        .leave(session.id, &harness.patient)
        .await
        .unwrap();
    harness.state.presence.unregister(patient_conn).await;
    tokio::time::sleep(StdDuration::from_millis(1500)).await;

    let session = harness
        .state
        .lifecycle
        .get_session(session.id, &harness.patient)
        .await
        .unwrap();
    // no implicit leave was synthesized on top of the explicit one
    assert_eq!(session.quality_metrics.disconnection_count, 0);
}

// ==============================================================================
// RELAY TOKENS
// ==============================================================================

#[tokio::test]
async fn relay_token_is_single_use() {
    let harness = setup().await;
    let session = harness.running_session().await;

    let token = harness
        .state
        .relay
        .issue_token(&session, Role::Patient, &harness.patient.id)
        .await;

    let grant = harness
        .state
        .relay
        .redeem_token(&token, &session.room_id)
        .await
        .expect("first redemption succeeds");
    assert_eq!(grant.session_id, session.id);
    assert_eq!(grant.role, Role::Patient);
    assert_eq!(grant.user_id, harness.patient.id);

    assert!(harness
        .state
        .relay
        .redeem_token(&token, &session.room_id)
        .await
        .is_none());
}

#[tokio::test]
async fn relay_token_bound_to_room() {
    let harness = setup().await;
    let session = harness.running_session().await;

    let token = harness
        .state
        .relay
        .issue_token(&session, Role::Doctor, &harness.doctor.id)
        .await;

    assert!(harness
        .state
        .relay
        .redeem_token(&token, "room_somewhere_else")
        .await
        .is_none());
    // the failed redemption consumed the token
    assert!(harness
        .state
        .relay
        .redeem_token(&token, &session.room_id)
        .await
        .is_none());
}
