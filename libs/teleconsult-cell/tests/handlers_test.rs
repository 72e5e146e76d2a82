use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};
use teleconsult_cell::router::teleconsult_routes;
use teleconsult_cell::services::appointments::{
    AppointmentDirectory, AppointmentRecord, InMemoryAppointmentDirectory,
};
use teleconsult_cell::services::store::{InMemorySessionStore, SessionStore};
use teleconsult_cell::TeleconsultState;

struct ApiHarness {
    app: Router,
    jwt_secret: String,
    appointments: Arc<InMemoryAppointmentDirectory>,
    patient: TestUser,
    doctor: TestUser,
}

fn api_harness() -> ApiHarness {
    let test_config = TestConfig::default();
    let jwt_secret = test_config.jwt_secret.clone();
    let config = test_config.to_arc();

    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let appointments = Arc::new(InMemoryAppointmentDirectory::new());
    let directory: Arc<dyn AppointmentDirectory> = appointments.clone();
    let state = Arc::new(TeleconsultState::with_parts(config, store, directory));

    ApiHarness {
        app: teleconsult_routes(state),
        jwt_secret,
        appointments,
        patient: TestUser::with_id(Uuid::new_v4(), "patient@example.com", "patient"),
        doctor: TestUser::with_id(Uuid::new_v4(), "doctor@example.com", "doctor"),
    }
}

impl ApiHarness {
    fn token_for(&self, user: &TestUser) -> String {
        JwtTestUtils::create_test_token(user, &self.jwt_secret, Some(1))
    }

    async fn add_appointment(&self, start_offset_minutes: i64) -> AppointmentRecord {
        let start = Utc::now() + Duration::minutes(start_offset_minutes);
        let appointment = AppointmentRecord {
            id: Uuid::new_v4(),
            patient_id: Uuid::parse_str(&self.patient.id).unwrap(),
            doctor_id: Uuid::parse_str(&self.doctor.id).unwrap(),
            scheduled_start: start,
            scheduled_end: start + Duration::minutes(30),
            status: "confirmed".to_string(),
        };
        self.appointments.add(appointment.clone()).await;
        appointment
    }

    async fn request(
        &self,
        method: &str,
        uri: &str,
        user: Option<&TestUser>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("authorization", format!("Bearer {}", self.token_for(user)));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            json!(null)
        } else {
            serde_json::from_slice(&bytes).unwrap_or(json!(null))
        };
        (status, json)
    }

    async fn create_session(&self, appointment: &AppointmentRecord) -> Uuid {
        let (status, body) = self
            .request(
                "POST",
                "/sessions",
                Some(&self.doctor),
                Some(json!({
                    "appointment_id": appointment.id,
                    "scheduled_start": appointment.scheduled_start,
                    "scheduled_end": appointment.scheduled_end,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        Uuid::parse_str(body["session"]["id"].as_str().unwrap()).unwrap()
    }
}

#[tokio::test]
async fn health_check_reports_store_configuration() {
    let harness = api_harness();
    let (status, body) = harness.request("GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store_configured"], true);
}

#[tokio::test]
async fn protected_routes_require_token() {
    let harness = api_harness();

    let (status, _) = harness.request("POST", "/sessions", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = harness
        .request(
            "GET",
            &format!("/sessions/{}", Uuid::new_v4()),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rejects_tampered_token() {
    let harness = api_harness();
    let forged = JwtTestUtils::create_invalid_signature_token(&harness.doctor);

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{}", Uuid::new_v4()))
                .header("authorization", format!("Bearer {}", forged))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn doctor_creates_session_and_retry_conflicts() {
    let harness = api_harness();
    let appointment = harness.add_appointment(30).await;
    let session_id = harness.create_session(&appointment).await;

    let (status, body) = harness
        .request(
            "POST",
            "/sessions",
            Some(&harness.doctor),
            Some(json!({
                "appointment_id": appointment.id,
                "scheduled_start": appointment.scheduled_start,
                "scheduled_end": appointment.scheduled_end,
            })),
        )
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        body["existing_session_id"].as_str().unwrap(),
        session_id.to_string()
    );
}

#[tokio::test]
async fn patient_cannot_create_session() {
    let harness = api_harness();
    let appointment = harness.add_appointment(30).await;

    let (status, body) = harness
        .request(
            "POST",
            "/sessions",
            Some(&harness.patient),
            Some(json!({
                "appointment_id": appointment.id,
                "scheduled_start": appointment.scheduled_start,
                "scheduled_end": appointment.scheduled_end,
            })),
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn stranger_cannot_read_session() {
    let harness = api_harness();
    let appointment = harness.add_appointment(30).await;
    let session_id = harness.create_session(&appointment).await;
    let stranger = TestUser::patient("stranger@example.com");

    let (status, body) = harness
        .request(
            "GET",
            &format!("/sessions/{}", session_id),
            Some(&stranger),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn admin_can_read_any_session() {
    let harness = api_harness();
    let appointment = harness.add_appointment(30).await;
    let session_id = harness.create_session(&appointment).await;
    let admin = TestUser::admin("admin@example.com");

    let (status, body) = harness
        .request(
            "GET",
            &format!("/sessions/{}", session_id),
            Some(&admin),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["state"], "scheduled");
}

#[tokio::test]
async fn early_join_returns_window_opening_time() {
    let harness = api_harness();
    let appointment = harness.add_appointment(60).await;
    let session_id = harness.create_session(&appointment).await;

    let (status, body) = harness
        .request(
            "POST",
            &format!("/sessions/{}/join", session_id),
            Some(&harness.patient),
            Some(json!({})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "join_window_closed");
    assert!(body["can_join_at"].is_string());
}

#[tokio::test]
async fn join_within_window_returns_relay_token() {
    let harness = api_harness();
    let appointment = harness.add_appointment(5).await;
    let session_id = harness.create_session(&appointment).await;

    let (status, body) = harness
        .request(
            "POST",
            &format!("/sessions/{}/join", session_id),
            Some(&harness.patient),
            Some(json!({ "device_info": { "browser": "firefox" } })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["relay_token"].is_string());
    assert!(body["room_id"].as_str().unwrap().starts_with("room_"));
    assert_eq!(body["session"]["state"], "scheduled");
}

#[tokio::test]
async fn both_joins_promote_session_over_http() {
    let harness = api_harness();
    let appointment = harness.add_appointment(5).await;
    let session_id = harness.create_session(&appointment).await;

    harness
        .request(
            "POST",
            &format!("/sessions/{}/join", session_id),
            Some(&harness.doctor),
            Some(json!({})),
        )
        .await;
    let (status, body) = harness
        .request(
            "POST",
            &format!("/sessions/{}/join", session_id),
            Some(&harness.patient),
            Some(json!({})),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["state"], "in_progress");
}

#[tokio::test]
async fn doctor_leave_completes_session_over_http() {
    let harness = api_harness();
    let appointment = harness.add_appointment(5).await;
    let session_id = harness.create_session(&appointment).await;

    harness
        .request(
            "POST",
            &format!("/sessions/{}/join", session_id),
            Some(&harness.doctor),
            Some(json!({})),
        )
        .await;
    let (status, body) = harness
        .request(
            "POST",
            &format!("/sessions/{}/leave", session_id),
            Some(&harness.doctor),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["state"], "completed");
}

#[tokio::test]
async fn illegal_status_change_rejected() {
    let harness = api_harness();
    let appointment = harness.add_appointment(30).await;
    let session_id = harness.create_session(&appointment).await;

    let (status, body) = harness
        .request(
            "PUT",
            &format!("/sessions/{}/status", session_id),
            Some(&harness.doctor),
            Some(json!({ "new_state": "completed" })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "illegal_transition");
    assert_eq!(body["from"], "scheduled");
    assert_eq!(body["to"], "completed");
}

#[tokio::test]
async fn technical_issue_report_created() {
    let harness = api_harness();
    let appointment = harness.add_appointment(30).await;
    let session_id = harness.create_session(&appointment).await;

    let (status, body) = harness
        .request(
            "POST",
            &format!("/sessions/{}/technical-issues", session_id),
            Some(&harness.patient),
            Some(json!({ "kind": "audio", "description": "echo on the line" })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["report"]["kind"], "audio");
    assert_eq!(body["report"]["reported_by"], "patient");
    assert_eq!(body["report"]["resolved"], false);
}

#[tokio::test]
async fn rating_submission_returns_quality_metrics() {
    let harness = api_harness();
    let appointment = harness.add_appointment(30).await;
    let session_id = harness.create_session(&appointment).await;

    let (status, body) = harness
        .request(
            "POST",
            &format!("/sessions/{}/rating", session_id),
            Some(&harness.patient),
            Some(json!({ "score": 5, "feedback": "clear advice" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quality_metrics"]["patient_rating"], 5);

    let (status, body) = harness
        .request(
            "POST",
            &format!("/sessions/{}/rating", session_id),
            Some(&harness.patient),
            Some(json!({ "score": 9 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn message_listing_paginates() {
    let harness = api_harness();
    let appointment = harness.add_appointment(5).await;
    let session_id = harness.create_session(&appointment).await;

    let (status, body) = harness
        .request(
            "GET",
            &format!("/sessions/{}/messages?limit=10&offset=0", session_id),
            Some(&harness.doctor),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
    assert_eq!(body["offset"], 0);
    assert!(body["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let harness = api_harness();

    let (status, body) = harness
        .request(
            "GET",
            &format!("/sessions/{}", Uuid::new_v4()),
            Some(&harness.doctor),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "session_not_found");
}
