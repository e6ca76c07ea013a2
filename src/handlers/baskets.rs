use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

use super::common::{created_response, success_response};
use crate::{
    entities::{basket_line, BasketStatus},
    errors::ServiceError,
    services::baskets::{AddLineInput, BasketWithLines, CreateBasketInput},
    AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/baskets", post(create_basket))
        .route("/baskets/:id", get(get_basket))
        .route("/baskets/:id/lines", post(add_line).delete(flush_lines))
        .route("/baskets/:id/lines/:line_id", delete(remove_line))
        .route(
            "/baskets/:id/processor-responses",
            get(list_processor_responses),
        )
}

#[derive(Debug, Serialize)]
pub struct BasketResponse {
    pub id: i32,
    pub owner: Option<String>,
    pub currency: String,
    pub status: BasketStatus,
    pub total: Decimal,
    /// Number the order for this basket will carry
    pub order_number: String,
    pub lines: Vec<basket_line::Model>,
}

fn basket_response(state: &AppState, basket: BasketWithLines) -> BasketResponse {
    let total = basket.total();
    let order_number = state.services.orders.numbers().order_number(basket.id());
    BasketResponse {
        id: basket.basket.id,
        owner: basket.basket.owner,
        currency: basket.basket.currency,
        status: basket.basket.status,
        total,
        order_number,
        lines: basket.lines,
    }
}

/// Creates a basket. When an owner is named, that owner's open basket is
/// returned instead, with any duplicates merged into it.
async fn create_basket(
    State(state): State<AppState>,
    Json(input): Json<CreateBasketInput>,
) -> Result<impl IntoResponse, ServiceError> {
    input.validate()?;
    let basket = match input.owner.as_deref() {
        Some(owner) => {
            state
                .services
                .baskets
                .get_or_create_open_basket(owner, input.currency.clone())
                .await?
        }
        None => BasketWithLines {
            basket: state.services.baskets.create_basket(input).await?,
            lines: Vec::new(),
        },
    };
    Ok(created_response(basket_response(&state, basket)))
}

async fn get_basket(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let basket = state.services.baskets.get_basket(id).await?;
    Ok(success_response(basket_response(&state, basket)))
}

async fn add_line(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(input): Json<AddLineInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let basket = state.services.baskets.add_line(id, input).await?;
    Ok(success_response(basket_response(&state, basket)))
}

async fn flush_lines(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    let basket = state.services.baskets.flush(id).await?;
    Ok(success_response(basket_response(&state, basket)))
}

async fn remove_line(
    State(state): State<AppState>,
    Path((id, line_id)): Path<(i32, Uuid)>,
) -> Result<impl IntoResponse, ServiceError> {
    let basket = state.services.baskets.remove_line(id, line_id).await?;
    Ok(success_response(basket_response(&state, basket)))
}

async fn list_processor_responses(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ServiceError> {
    // 404 for unknown baskets rather than an empty list
    state.services.baskets.get_basket(id).await?;
    let entries = state.services.audit.list_for_basket(id).await?;
    Ok(success_response(entries))
}
