//! CyberSource Secure Acceptance (hosted payment page) and REST refunds.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::signing::{self, HttpSignatureRequest};
use super::{
    format_amount, parse_amount, CheckoutContext, CreditRequest, HandledProcessorResponse,
    PaymentError, PaymentProcessor, TransactionParameters,
};
use crate::config::AppConfig;
use crate::services::baskets::BasketWithLines;

pub const NAME: &str = "cybersource";

/// Reason code CyberSource returns when a reference number was already used
const DUPLICATE_REFERENCE_REASON_CODE: &str = "104";

#[derive(Debug, Clone, Default)]
pub struct CybersourceConfig {
    pub profile_id: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub payment_page_url: String,
    pub rest_api_url: String,
    pub merchant_id: Option<String>,
    pub api_key_id: Option<String>,
    pub api_secret: Option<String>,
}

impl From<&AppConfig> for CybersourceConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            profile_id: cfg.cybersource_profile_id.clone(),
            access_key: cfg.cybersource_access_key.clone(),
            secret_key: cfg.cybersource_secret_key.clone(),
            payment_page_url: cfg.cybersource_payment_page_url.clone(),
            rest_api_url: cfg.cybersource_rest_api_url.clone(),
            merchant_id: cfg.cybersource_merchant_id.clone(),
            api_key_id: cfg.cybersource_api_key_id.clone(),
            api_secret: cfg.cybersource_api_secret.clone(),
        }
    }
}

pub struct Cybersource {
    config: CybersourceConfig,
    http: reqwest::Client,
}

/// Maps CyberSource card type codes to card brand names.
pub fn card_type_name(code: &str) -> Option<&'static str> {
    match code {
        "001" => Some("visa"),
        "002" => Some("mastercard"),
        "003" => Some("american_express"),
        "004" => Some("discover"),
        _ => None,
    }
}

/// Flattens a JSON object into the string fields Secure Acceptance posts.
pub fn response_fields(response: &serde_json::Value) -> Result<BTreeMap<String, String>, PaymentError> {
    let object = response
        .as_object()
        .ok_or_else(|| PaymentError::InvalidResponse("expected form fields".to_string()))?;
    Ok(object
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect())
}

impl Cybersource {
    pub fn new(config: CybersourceConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    pub fn from_app_config(cfg: &AppConfig, http: reqwest::Client) -> Self {
        Self::new(CybersourceConfig::from(cfg), http)
    }

    fn secret_key(&self) -> Result<&str, PaymentError> {
        self.config
            .secret_key
            .as_deref()
            .ok_or_else(|| PaymentError::GatewayError("CyberSource secret key is not configured".into()))
    }

    /// Checks the Secure Acceptance signature on a response.
    pub fn verify_signature(&self, fields: &BTreeMap<String, String>) -> Result<(), PaymentError> {
        signing::verify_secure_acceptance(self.secret_key()?, fields)
    }

    /// Signs a set of request fields, listing every field as signed.
    pub fn sign_fields(&self, fields: &mut BTreeMap<String, String>) -> Result<(), PaymentError> {
        fields.remove("signature");
        let mut names: Vec<String> = fields.keys().cloned().collect();
        if !names.iter().any(|n| n == "signed_field_names") {
            names.push("signed_field_names".to_string());
            names.sort();
        }
        fields.insert("signed_field_names".to_string(), names.join(","));
        let signature = signing::sign_secure_acceptance(self.secret_key()?, fields)?;
        fields.insert("signature".to_string(), signature);
        Ok(())
    }

    /// Maps a verified notification to an accepted payment or the processor's decision.
    pub fn normalize(&self, fields: &BTreeMap<String, String>) -> Result<HandledProcessorResponse, PaymentError> {
        let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or("");
        let transaction_id = field("transaction_id").to_string();
        let decision = field("decision").to_uppercase();

        match decision.as_str() {
            "ACCEPT" => {}
            "CANCEL" => return Err(PaymentError::UserCancelled),
            "DECLINE" => {
                return Err(PaymentError::TransactionDeclined(field("message").to_string()))
            }
            "REVIEW" => return Err(PaymentError::PendingReview(transaction_id)),
            "ERROR" if field("reason_code") == DUPLICATE_REFERENCE_REASON_CODE => {
                return Err(PaymentError::DuplicateReferenceNumber(
                    field("req_reference_number").to_string(),
                ))
            }
            "ERROR" => {
                return Err(PaymentError::GatewayError(format!(
                    "reason code {}: {}",
                    field("reason_code"),
                    field("message")
                )))
            }
            other => {
                return Err(PaymentError::InvalidResponse(format!(
                    "unknown decision {other:?}"
                )))
            }
        }

        let requested = parse_amount(field("req_amount"), "req_amount")?;
        let auth_amount = field("auth_amount");
        if !auth_amount.trim().is_empty() {
            let authorized = parse_amount(auth_amount, "auth_amount")?;
            if authorized != requested {
                return Err(PaymentError::PartialAuthorization {
                    authorized,
                    requested,
                });
            }
        }

        Ok(HandledProcessorResponse {
            transaction_id: Some(transaction_id).filter(|t| !t.is_empty()),
            total: requested,
            currency: field("req_currency").to_uppercase(),
            card_number: fields.get("req_card_number").cloned(),
            card_type: card_type_name(field("req_card_type")).map(str::to_string),
        })
    }

    fn refund_headers(&self, path: &str, body: &[u8]) -> Result<(String, signing::HttpSignatureHeaders), PaymentError> {
        let not_configured =
            || PaymentError::GatewayError("CyberSource REST credentials are not configured".into());
        let merchant_id = self.config.merchant_id.as_deref().ok_or_else(not_configured)?;
        let key_id = self.config.api_key_id.as_deref().ok_or_else(not_configured)?;
        let secret = self.config.api_secret.as_deref().ok_or_else(not_configured)?;

        let url = reqwest::Url::parse(&self.config.rest_api_url)
            .map_err(|e| PaymentError::GatewayError(format!("invalid REST url: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(PaymentError::GatewayError("REST url has no host".into())),
        };
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let headers = signing::http_signature(&HttpSignatureRequest {
            key_id,
            shared_secret: secret,
            merchant_id,
            host: &host,
            method: "post",
            path,
            date: &date,
            body,
        })?;
        Ok((host, headers))
    }
}

#[async_trait]
impl PaymentProcessor for Cybersource {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip(self, basket, ctx), fields(basket_id = basket.basket.id))]
    async fn transaction_parameters(
        &self,
        basket: &BasketWithLines,
        ctx: &CheckoutContext,
    ) -> Result<TransactionParameters, PaymentError> {
        let mut fields = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            fields.insert(k.to_string(), v);
        };
        put("access_key", self.config.access_key.clone().unwrap_or_default());
        put("profile_id", self.config.profile_id.clone().unwrap_or_default());
        put("transaction_uuid", Uuid::new_v4().simple().to_string());
        put("unsigned_field_names", String::new());
        put(
            "signed_date_time",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        put("locale", "en-us".to_string());
        put("transaction_type", "sale".to_string());
        put("reference_number", ctx.order_number.clone());
        put("amount", format_amount(basket.total()));
        put("currency", basket.basket.currency.clone());
        put("merchant_defined_data1", basket.basket.id.to_string());
        if let Some(owner) = &basket.basket.owner {
            put("consumer_id", owner.clone());
        }
        if let Some(email) = &ctx.buyer_email {
            put("bill_to_email", email.clone());
        }
        if let Some(url) = &ctx.return_url {
            put("override_custom_receipt_page", url.clone());
        }
        if let Some(url) = &ctx.cancel_url {
            put("override_custom_cancel_page", url.clone());
        }
        self.sign_fields(&mut fields)?;

        Ok(TransactionParameters {
            processor: NAME.to_string(),
            transaction_id: None,
            payment_page_url: Some(self.config.payment_page_url.clone()),
            fields,
        })
    }

    async fn handle_processor_response(
        &self,
        response: &serde_json::Value,
        _basket: &BasketWithLines,
    ) -> Result<HandledProcessorResponse, PaymentError> {
        let fields = response_fields(response)?;
        self.verify_signature(&fields)?;
        self.normalize(&fields)
    }

    #[instrument(skip(self, credit), fields(order_number = %credit.order_number))]
    async fn issue_credit(&self, credit: &CreditRequest) -> Result<Option<String>, PaymentError> {
        let path = format!("/pts/v2/payments/{}/refunds", credit.reference);
        let body = serde_json::to_vec(&serde_json::json!({
            "clientReferenceInformation": { "code": credit.order_number },
            "orderInformation": {
                "amountDetails": {
                    "totalAmount": format_amount(credit.amount),
                    "currency": credit.currency,
                }
            }
        }))
        .map_err(|e| PaymentError::GatewayError(e.to_string()))?;

        let (host, headers) = self.refund_headers(&path, &body)?;
        let merchant_id = self.config.merchant_id.clone().unwrap_or_default();
        let url = format!("{}{}", self.config.rest_api_url.trim_end_matches('/'), path);

        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(30))
            .header("host", host)
            .header("date", headers.date)
            .header("digest", headers.digest)
            .header("v-c-merchant-id", merchant_id)
            .header("signature", headers.signature)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayError(format!("refund request failed: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PaymentError::GatewayError(format!("unreadable refund response: {e}")))?;

        if !status.is_success() {
            warn!(%status, reference = %credit.reference, "CyberSource refund rejected");
            return Err(PaymentError::GatewayError(format!(
                "refund rejected with status {status}: {}",
                payload.get("message").and_then(|m| m.as_str()).unwrap_or("no message")
            )));
        }

        let refund_id = payload.get("id").and_then(|v| v.as_str()).map(str::to_string);
        info!(reference = %credit.reference, refund_id = ?refund_id, "CyberSource refund issued");
        Ok(refund_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn processor() -> Cybersource {
        Cybersource::new(
            CybersourceConfig {
                secret_key: Some("secret".into()),
                ..Default::default()
            },
            reqwest::Client::new(),
        )
    }

    fn signed(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        let mut fields: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        processor().sign_fields(&mut fields).unwrap();
        fields
    }

    #[test]
    fn accepted_response_is_normalized() {
        let p = processor();
        let fields = signed(&[
            ("decision", "ACCEPT"),
            ("transaction_id", "tx-1"),
            ("req_amount", "99.00"),
            ("auth_amount", "99.00"),
            ("req_currency", "usd"),
            ("req_card_number", "xxxxxxxxxxxx1111"),
            ("req_card_type", "001"),
        ]);
        let handled = p.normalize(&fields).unwrap();
        assert_eq!(handled.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(handled.total, dec!(99.00));
        assert_eq!(handled.currency, "USD");
        assert_eq!(handled.card_type.as_deref(), Some("visa"));
    }

    #[test]
    fn partial_authorization_is_rejected() {
        let fields = signed(&[
            ("decision", "ACCEPT"),
            ("req_amount", "99.00"),
            ("auth_amount", "50.00"),
            ("req_currency", "USD"),
        ]);
        assert_matches!(
            processor().normalize(&fields),
            Err(PaymentError::PartialAuthorization { authorized, requested })
                if authorized == dec!(50) && requested == dec!(99)
        );
    }

    #[test]
    fn duplicate_reference_is_distinguished_from_other_errors() {
        let duplicate = signed(&[
            ("decision", "ERROR"),
            ("reason_code", "104"),
            ("req_reference_number", "EDX-100001"),
        ]);
        assert_matches!(
            processor().normalize(&duplicate),
            Err(PaymentError::DuplicateReferenceNumber(r)) if r == "EDX-100001"
        );

        let other = signed(&[("decision", "ERROR"), ("reason_code", "150")]);
        assert_matches!(processor().normalize(&other), Err(PaymentError::GatewayError(_)));
    }

    #[test]
    fn card_type_codes() {
        assert_eq!(card_type_name("002"), Some("mastercard"));
        assert_eq!(card_type_name("003"), Some("american_express"));
        assert_eq!(card_type_name("004"), Some("discover"));
        assert_eq!(card_type_name("042"), None);
    }

    #[test]
    fn non_string_form_values_are_stringified() {
        let fields = response_fields(&serde_json::json!({"a": "x", "b": 3})).unwrap();
        assert_eq!(fields.get("b").map(String::as_str), Some("3"));
        assert!(response_fields(&serde_json::json!([1, 2])).is_err());
    }
}
