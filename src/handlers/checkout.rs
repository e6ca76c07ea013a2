use axum::{
    extract::State,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use super::common::{created_response, success_response};
use crate::{
    errors::ServiceError,
    services::checkout::{PaymentOutcome, StartCheckoutInput},
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(start_checkout))
        .route("/checkout/free", post(place_free_order))
        .route("/checkout/invoice", post(place_invoiced_order))
}

#[derive(Debug, Deserialize)]
pub struct BasketRef {
    pub basket_id: i32,
}

/// Freezes the basket and returns what the client needs to collect payment.
async fn start_checkout(
    State(state): State<AppState>,
    Json(input): Json<StartCheckoutInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let started = state.services.checkout.start_checkout(input).await?;
    Ok(success_response(started))
}

async fn place_free_order(
    State(state): State<AppState>,
    Json(body): Json<BasketRef>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.checkout.place_free_order(body.basket_id).await?;
    Ok(created_response(order))
}

async fn place_invoiced_order(
    State(state): State<AppState>,
    Json(body): Json<BasketRef>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .checkout
        .place_invoiced_order(body.basket_id)
        .await?;
    Ok(match outcome {
        PaymentOutcome::Placed(_) => created_response(outcome),
        PaymentOutcome::AlreadyPlaced(_) => success_response(outcome),
    })
}
