//! Stripe payment intents and signed webhooks.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{info, instrument};

use super::signing;
use super::{
    str_field, CheckoutContext, CreditRequest, HandledProcessorResponse, PaymentError,
    PaymentProcessor, TransactionParameters,
};
use crate::config::AppConfig;
use crate::services::baskets::BasketWithLines;

pub const NAME: &str = "stripe";

/// Currencies Stripe charges in whole units
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

pub fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES.contains(&currency.to_uppercase().as_str())
}

/// Converts an amount to the integer minor units Stripe expects.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, PaymentError> {
    use rust_decimal::prelude::ToPrimitive;
    let scaled = if is_zero_decimal(currency) {
        amount.round()
    } else {
        (amount * Decimal::ONE_HUNDRED).round()
    };
    scaled
        .to_i64()
        .ok_or_else(|| PaymentError::InvalidResponse(format!("amount {amount} out of range")))
}

pub fn from_minor_units(units: i64, currency: &str) -> Decimal {
    if is_zero_decimal(currency) {
        Decimal::from(units)
    } else {
        Decimal::new(units, 2)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StripeConfig {
    pub api_url: String,
    pub secret_key: Option<String>,
    pub publishable_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: u64,
}

impl From<&AppConfig> for StripeConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            api_url: cfg.stripe_api_url.trim_end_matches('/').to_string(),
            secret_key: cfg.stripe_secret_key.clone(),
            publishable_key: cfg.stripe_publishable_key.clone(),
            webhook_secret: cfg.stripe_webhook_secret.clone(),
            webhook_tolerance_secs: cfg.stripe_webhook_tolerance_secs,
        }
    }
}

pub struct Stripe {
    config: StripeConfig,
    http: reqwest::Client,
}

impl Stripe {
    pub fn new(config: StripeConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    pub fn from_app_config(cfg: &AppConfig, http: reqwest::Client) -> Self {
        Self::new(StripeConfig::from(cfg), http)
    }

    /// Verifies a webhook delivery and returns the parsed event.
    pub fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: i64,
    ) -> Result<serde_json::Value, PaymentError> {
        let secret = self
            .config
            .webhook_secret
            .as_deref()
            .ok_or_else(|| PaymentError::GatewayError("Stripe webhook secret is not configured".into()))?;
        signing::verify_stripe_signature(
            secret,
            payload,
            signature_header,
            now,
            self.config.webhook_tolerance_secs,
        )?;
        serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidResponse(format!("webhook body is not JSON: {e}")))
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<serde_json::Value, PaymentError> {
        let secret = self
            .config
            .secret_key
            .as_deref()
            .ok_or_else(|| PaymentError::GatewayError("Stripe secret key is not configured".into()))?;
        let response = self
            .http
            .post(format!("{}{}", self.config.api_url, path))
            .bearer_auth(secret)
            .form(form)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayError(format!("Stripe request failed: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PaymentError::InvalidResponse(format!("unreadable Stripe response: {e}")))?;
        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(PaymentError::GatewayError(format!(
                "Stripe {path} returned {status}: {message}"
            )));
        }
        Ok(body)
    }

    fn card_details(intent: &serde_json::Value) -> (Option<String>, Option<String>) {
        let card = intent
            .pointer("/charges/data/0/payment_method_details/card")
            .or_else(|| intent.pointer("/latest_charge/payment_method_details/card"));
        match card {
            Some(card) => (
                str_field(card, "last4").map(|l| format!("xxxxxxxxxxxx{l}")),
                str_field(card, "brand").map(str::to_string),
            ),
            None => (None, None),
        }
    }
}

#[async_trait]
impl PaymentProcessor for Stripe {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip(self, basket, ctx), fields(basket_id = basket.basket.id))]
    async fn transaction_parameters(
        &self,
        basket: &BasketWithLines,
        ctx: &CheckoutContext,
    ) -> Result<TransactionParameters, PaymentError> {
        let currency = basket.basket.currency.clone();
        let amount = to_minor_units(basket.total(), &currency)?;
        let mut form = vec![
            ("amount".to_string(), amount.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            ("description".to_string(), ctx.order_number.clone()),
            ("metadata[order_number]".to_string(), ctx.order_number.clone()),
            ("metadata[basket_id]".to_string(), basket.basket.id.to_string()),
        ];
        if let Some(email) = &ctx.buyer_email {
            form.push(("receipt_email".to_string(), email.clone()));
        }

        let intent = self.post_form("/v1/payment_intents", &form).await?;
        let intent_id = str_field(&intent, "id")
            .ok_or_else(|| PaymentError::InvalidResponse("payment intent has no id".into()))?
            .to_string();
        info!(payment_intent = %intent_id, "Stripe payment intent created");

        let mut fields = BTreeMap::new();
        if let Some(secret) = str_field(&intent, "client_secret") {
            fields.insert("client_secret".to_string(), secret.to_string());
        }
        if let Some(key) = &self.config.publishable_key {
            fields.insert("publishable_key".to_string(), key.clone());
        }

        Ok(TransactionParameters {
            processor: NAME.to_string(),
            transaction_id: Some(intent_id),
            payment_page_url: None,
            fields,
        })
    }

    async fn handle_processor_response(
        &self,
        intent: &serde_json::Value,
        basket: &BasketWithLines,
    ) -> Result<HandledProcessorResponse, PaymentError> {
        let intent_id = str_field(intent, "id")
            .ok_or_else(|| PaymentError::InvalidResponse("payment intent has no id".into()))?;

        if let Some(basket_id) = intent.pointer("/metadata/basket_id").and_then(|v| v.as_str()) {
            if basket_id != basket.basket.id.to_string() {
                return Err(PaymentError::InvalidResponse(format!(
                    "payment intent {intent_id} belongs to basket {basket_id}"
                )));
            }
        }

        match str_field(intent, "status").unwrap_or("") {
            "succeeded" => {}
            "canceled" => return Err(PaymentError::UserCancelled),
            "requires_payment_method" => {
                let message = intent
                    .pointer("/last_payment_error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("payment method was declined");
                return Err(PaymentError::TransactionDeclined(message.to_string()));
            }
            _ => return Err(PaymentError::PendingReview(intent_id.to_string())),
        }

        let currency = str_field(intent, "currency")
            .ok_or_else(|| PaymentError::InvalidResponse("payment intent has no currency".into()))?
            .to_uppercase();
        let units = intent
            .get("amount_received")
            .and_then(|v| v.as_i64())
            .or_else(|| intent.get("amount").and_then(|v| v.as_i64()))
            .ok_or_else(|| PaymentError::InvalidResponse("payment intent has no amount".into()))?;
        let (card_number, card_type) = Self::card_details(intent);

        Ok(HandledProcessorResponse {
            transaction_id: Some(intent_id.to_string()),
            total: from_minor_units(units, &currency),
            currency,
            card_number,
            card_type,
        })
    }

    #[instrument(skip(self, credit), fields(order_number = %credit.order_number))]
    async fn issue_credit(&self, credit: &CreditRequest) -> Result<Option<String>, PaymentError> {
        let form = vec![
            ("payment_intent".to_string(), credit.reference.clone()),
            (
                "amount".to_string(),
                to_minor_units(credit.amount, &credit.currency)?.to_string(),
            ),
            ("metadata[order_number]".to_string(), credit.order_number.clone()),
        ];
        let refund = self.post_form("/v1/refunds", &form).await?;
        if str_field(&refund, "status") == Some("failed") {
            return Err(PaymentError::GatewayError(format!(
                "Stripe refund for {} failed",
                credit.reference
            )));
        }
        Ok(str_field(&refund, "id").map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_respect_zero_decimal_currencies() {
        assert_eq!(to_minor_units(dec!(10.50), "USD").unwrap(), 1050);
        assert_eq!(to_minor_units(dec!(1200), "jpy").unwrap(), 1200);
        assert_eq!(from_minor_units(1050, "USD"), dec!(10.50));
        assert_eq!(from_minor_units(1200, "JPY"), dec!(1200));
    }

    #[test]
    fn webhook_requires_configured_secret() {
        let stripe = Stripe::new(StripeConfig::default(), reqwest::Client::new());
        assert!(matches!(
            stripe.verify_webhook(b"{}", "t=1,v1=00", 1),
            Err(PaymentError::GatewayError(_))
        ));
    }

    #[test]
    fn card_details_come_from_the_first_charge() {
        let intent = serde_json::json!({
            "charges": { "data": [{ "payment_method_details": { "card": { "last4": "4242", "brand": "visa" } } }] }
        });
        let (number, brand) = Stripe::card_details(&intent);
        assert_eq!(number.as_deref(), Some("xxxxxxxxxxxx4242"));
        assert_eq!(brand.as_deref(), Some("visa"));
    }
}
