use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};

use super::common::success_response;
use crate::{errors::ServiceError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new().route("/orders/:number", get(get_order))
}

/// Order with its lines, payment sources and payment events.
async fn get_order(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state.services.orders.get_with_details(&number).await?;
    Ok(success_response(details))
}
