pub mod baskets;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payments;
pub mod refunds;
pub mod sdn;

use axum::Router;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Every `/api/v2` route.
pub fn api_v2_routes() -> Router<AppState> {
    Router::new()
        .merge(baskets::routes())
        .merge(checkout::routes())
        .merge(payments::routes())
        .merge(orders::routes())
        .merge(refunds::routes())
        .merge(sdn::routes())
}
