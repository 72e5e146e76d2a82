use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use shared_config::AppConfig;
use teleconsult_cell::router::teleconsult_routes;
use teleconsult_cell::TeleconsultState;

pub fn create_router(config: Arc<AppConfig>) -> Router {
    let teleconsult_state = Arc::new(TeleconsultState::new(config));

    Router::new()
        .route("/", get(|| async { "Teleconsult API is running!" }))
        .merge(teleconsult_routes(teleconsult_state))
}
