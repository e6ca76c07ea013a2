//! Payment processors and the normalized results they produce.
//!
//! Every processor turns its own wire format into a [`HandledProcessorResponse`]
//! or a [`PaymentError`]. Order placement, reconciliation and idempotency live in
//! the checkout service, never in a processor.

use async_trait::async_trait;
use axum::http::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::services::baskets::BasketWithLines;

pub mod audit;
pub mod cybersource;
pub mod invoice;
pub mod paypal;
pub mod registry;
pub mod signing;
pub mod stripe;

pub use audit::PaymentAuditLog;
pub use registry::PaymentProcessorRegistry;

/// Processor names accepted in `payment_processors`
pub const KNOWN_PROCESSORS: &[&str] = &[
    cybersource::NAME,
    paypal::NAME,
    stripe::NAME,
    invoice::NAME,
];

/// A payment the processor has accepted, in the basket's terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandledProcessorResponse {
    pub transaction_id: Option<String>,
    pub total: Decimal,
    pub currency: String,
    /// Masked card number or account label shown on the order
    pub card_number: Option<String>,
    pub card_type: Option<String>,
}

/// What the client needs to send the buyer to (or render) the processor's payment page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionParameters {
    pub processor: String,
    /// Set when the processor issues an id before payment (PayPal, Stripe)
    pub transaction_id: Option<String>,
    pub payment_page_url: Option<String>,
    pub fields: BTreeMap<String, String>,
}

/// Per-checkout inputs that do not come from the basket itself.
#[derive(Debug, Clone, Default)]
pub struct CheckoutContext {
    pub order_number: String,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub buyer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    pub order_number: String,
    /// Processor transaction id of the original payment
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("processor response signature is invalid")]
    InvalidSignature,

    #[error("buyer cancelled the payment")]
    UserCancelled,

    #[error("transaction declined: {0}")]
    TransactionDeclined(String),

    #[error("transaction {0} is pending review")]
    PendingReview(String),

    #[error("duplicate reference number {0}")]
    DuplicateReferenceNumber(String),

    #[error("partial authorization: authorized {authorized}, requested {requested}")]
    PartialAuthorization {
        authorized: Decimal,
        requested: Decimal,
    },

    #[error("gateway error: {0}")]
    GatewayError(String),

    #[error("invalid processor response: {0}")]
    InvalidResponse(String),

    #[error("payment processor {0} does not exist")]
    ProcessorNotFound(String),

    #[error("payment processor {0} is disabled")]
    ProcessorDisabled(String),

    #[error("payment processor {0} does not support refunds")]
    RefundNotSupported(String),

    #[error("transaction {0} was already applied to another basket")]
    RedundantPaymentNotification(String),

    #[error("basket already paid by order {order_number}")]
    ExcessivePaymentForOrder { order_number: String },

    #[error("paid amount {paid} does not match basket total {expected}")]
    AmountMismatch { paid: Decimal, expected: Decimal },

    #[error("paid currency {paid} does not match basket currency {expected}")]
    CurrencyMismatch { paid: String, expected: String },
}

impl PaymentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSignature | Self::InvalidResponse(_) => StatusCode::BAD_REQUEST,
            Self::UserCancelled
            | Self::TransactionDeclined(_)
            | Self::PendingReview(_)
            | Self::PartialAuthorization { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::DuplicateReferenceNumber(_)
            | Self::RedundantPaymentNotification(_)
            | Self::ExcessivePaymentForOrder { .. }
            | Self::AmountMismatch { .. }
            | Self::CurrencyMismatch { .. } => StatusCode::CONFLICT,
            Self::GatewayError(_) => StatusCode::BAD_GATEWAY,
            Self::ProcessorNotFound(_) => StatusCode::NOT_FOUND,
            Self::ProcessorDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RefundNotSupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// The processor reported a buyer-facing outcome. Notifications carrying
    /// one are acknowledged so the processor stops redelivering them.
    pub fn is_processor_decision(&self) -> bool {
        matches!(
            self,
            Self::UserCancelled
                | Self::TransactionDeclined(_)
                | Self::PendingReview(_)
                | Self::DuplicateReferenceNumber(_)
                | Self::PartialAuthorization { .. }
        )
    }

    /// The buyer may try again with the same basket.
    pub fn releases_basket(&self) -> bool {
        matches!(self, Self::UserCancelled | Self::TransactionDeclined(_))
    }

    /// Short label used as a metrics dimension
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::UserCancelled => "user_cancelled",
            Self::TransactionDeclined(_) => "declined",
            Self::PendingReview(_) => "pending_review",
            Self::DuplicateReferenceNumber(_) => "duplicate_reference",
            Self::PartialAuthorization { .. } => "partial_authorization",
            Self::GatewayError(_) => "gateway_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::ProcessorNotFound(_) => "processor_not_found",
            Self::ProcessorDisabled(_) => "processor_disabled",
            Self::RefundNotSupported(_) => "refund_not_supported",
            Self::RedundantPaymentNotification(_) => "redundant_notification",
            Self::ExcessivePaymentForOrder { .. } => "excessive_payment",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
        }
    }
}

/// An adapter to an external payment gateway.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parameters for sending the buyer to the processor for `basket`.
    async fn transaction_parameters(
        &self,
        basket: &BasketWithLines,
        ctx: &CheckoutContext,
    ) -> Result<TransactionParameters, PaymentError>;

    /// Normalizes a processor response into an accepted payment, or the reason it was not.
    async fn handle_processor_response(
        &self,
        response: &serde_json::Value,
        basket: &BasketWithLines,
    ) -> Result<HandledProcessorResponse, PaymentError>;

    /// Returns the credit at the processor and the processor's refund reference.
    async fn issue_credit(&self, credit: &CreditRequest) -> Result<Option<String>, PaymentError>;
}

/// Reads a string field from a JSON object response.
pub(crate) fn str_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

/// Parses a decimal amount the way processors send them ("10.00").
pub(crate) fn parse_amount(raw: &str, field: &str) -> Result<Decimal, PaymentError> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|_| PaymentError::InvalidResponse(format!("{field} is not a decimal amount: {raw}")))
}

pub(crate) fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn declines_release_the_basket_but_reviews_do_not() {
        assert!(PaymentError::UserCancelled.releases_basket());
        assert!(PaymentError::TransactionDeclined("card expired".into()).releases_basket());
        assert!(!PaymentError::PendingReview("tx".into()).releases_basket());
        assert!(!PaymentError::InvalidSignature.releases_basket());
    }

    #[test]
    fn signature_failures_are_not_processor_decisions() {
        assert!(!PaymentError::InvalidSignature.is_processor_decision());
        assert!(PaymentError::PartialAuthorization {
            authorized: dec!(5),
            requested: dec!(10)
        }
        .is_processor_decision());
    }

    #[test]
    fn amounts_are_formatted_with_two_decimals() {
        assert_eq!(format_amount(dec!(10)), "10.00");
        assert_eq!(format_amount(dec!(99.5)), "99.50");
        assert_eq!(format_amount(dec!(1.005)), "1.00");
        assert_eq!(parse_amount(" 12.30 ", "amount").unwrap(), dec!(12.30));
        assert!(parse_amount("abc", "amount").is_err());
    }
}
