//! Processor callbacks. Each handler hands the raw payload to the checkout
//! service, which records it before anything else happens.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::common::success_response;
use crate::{errors::ServiceError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/payment/processors", get(list_processors))
        .route("/payment/cybersource/notify", post(cybersource_notify))
        .route("/payment/stripe/webhook", post(stripe_webhook))
        .route("/payment/paypal/execute", get(paypal_execute))
}

#[derive(Debug, Serialize)]
struct ProcessorList {
    processors: Vec<String>,
}

async fn list_processors(State(state): State<AppState>) -> impl IntoResponse {
    success_response(ProcessorList {
        processors: state
            .services
            .registry
            .available()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

#[derive(Debug, Serialize)]
struct RejectedNotification {
    status: &'static str,
    reason: String,
}

async fn cybersource_notify(
    State(state): State<AppState>,
    Form(fields): Form<BTreeMap<String, String>>,
) -> Result<Response, ServiceError> {
    match state
        .services
        .checkout
        .handle_cybersource_notification(fields)
        .await
    {
        Ok(outcome) => Ok(success_response(outcome)),
        Err(ServiceError::Payment(e)) if e.is_processor_decision() => {
            info!(reason = %e, "CyberSource notification acknowledged as rejected");
            Ok((
                StatusCode::OK,
                Json(RejectedNotification {
                    status: "rejected",
                    reason: e.to_string(),
                }),
            )
                .into_response())
        }
        Err(e) => Err(e),
    }
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::BadRequest("Missing Stripe-Signature header".into()))?;
    let outcome = state
        .services
        .checkout
        .handle_stripe_webhook(&body, signature)
        .await?;
    Ok(success_response(outcome))
}

#[derive(Debug, Deserialize)]
pub struct PaypalReturnQuery {
    #[serde(rename = "paymentId")]
    pub payment_id: String,
    #[serde(rename = "PayerID")]
    pub payer_id: String,
}

/// Buyer lands here after approving on PayPal.
async fn paypal_execute(
    State(state): State<AppState>,
    Query(query): Query<PaypalReturnQuery>,
) -> Result<Response, ServiceError> {
    let outcome = state
        .services
        .checkout
        .execute_paypal_payment(&query.payment_id, &query.payer_id)
        .await?;

    match state.config.receipt_page_url.as_deref() {
        Some(receipt) => {
            let url = format!("{}?order_number={}", receipt, outcome.order().number);
            Ok(Redirect::to(&url).into_response())
        }
        None => Ok(success_response(outcome)),
    }
}
