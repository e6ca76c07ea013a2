use axum::{
    extract::State,
    response::IntoResponse,
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::common::success_response;
use crate::{
    errors::ServiceError,
    services::sdn::{NewSdnRecord, SdnQuery},
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sdn/check", post(check))
        .route("/sdn/fallback-records", put(replace_fallback_records))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SdnCheckRequest {
    #[serde(flatten)]
    #[validate]
    pub query: SdnQuery,
    pub basket_id: Option<i32>,
    pub username: Option<String>,
}

async fn check(
    State(state): State<AppState>,
    Json(request): Json<SdnCheckRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request.validate()?;
    let outcome = state
        .services
        .sdn
        .check(request.basket_id, request.username.as_deref(), &request.query)
        .await?;
    Ok(success_response(outcome))
}

#[derive(Debug, Serialize)]
struct ReplacedRecords {
    count: usize,
}

async fn replace_fallback_records(
    State(state): State<AppState>,
    Json(records): Json<Vec<NewSdnRecord>>,
) -> Result<impl IntoResponse, ServiceError> {
    let count = state.services.sdn.replace_fallback_records(records).await?;
    Ok(success_response(ReplacedRecords { count }))
}
