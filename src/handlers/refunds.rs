use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::common::{created_response, success_response};
use crate::{errors::ServiceError, services::refunds::CreateRefundInput, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/refunds", post(create_refund))
        .route("/refunds/:id", get(get_refund))
        .route("/refunds/:id/process", put(process_refund))
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RefundAction {
    Approve,
    Deny,
}

#[derive(Debug, Deserialize)]
pub struct ProcessRefundRequest {
    pub action: RefundAction,
}

async fn create_refund(
    State(state): State<AppState>,
    Json(input): Json<CreateRefundInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let refund = state.services.refunds.create_refund(input).await?;
    Ok(created_response(refund))
}

async fn get_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let refund = state.services.refunds.get_refund(id).await?;
    Ok(success_response(refund))
}

async fn process_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ProcessRefundRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let refund = match request.action {
        RefundAction::Approve => state.services.refunds.approve(id).await?,
        RefundAction::Deny => state.services.refunds.deny(id).await?,
    };
    Ok(success_response(refund))
}
