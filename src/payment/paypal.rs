//! PayPal redirect flow against the v1 payments REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::{
    format_amount, parse_amount, str_field, CheckoutContext, CreditRequest,
    HandledProcessorResponse, PaymentError, PaymentProcessor, TransactionParameters,
};
use crate::config::AppConfig;
use crate::services::baskets::BasketWithLines;

pub const NAME: &str = "paypal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaypalAmount {
    pub total: String,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaypalSale {
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaypalRelatedResource {
    #[serde(default)]
    pub sale: Option<PaypalSale>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaypalTransaction {
    pub amount: PaypalAmount,
    #[serde(default)]
    pub related_resources: Vec<PaypalRelatedResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaypalPayerInfo {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaypalPayer {
    #[serde(default)]
    pub payer_info: Option<PaypalPayerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaypalLink {
    pub href: String,
    pub rel: String,
}

/// A payment resource as returned by create, execute and lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaypalPayment {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub payer: Option<PaypalPayer>,
    #[serde(default)]
    pub transactions: Vec<PaypalTransaction>,
    #[serde(default)]
    pub links: Vec<PaypalLink>,
}

impl PaypalPayment {
    pub fn approval_url(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == "approval_url")
            .map(|l| l.href.as_str())
    }

    pub fn sale_id(&self) -> Option<&str> {
        self.transactions
            .iter()
            .flat_map(|t| t.related_resources.iter())
            .find_map(|r| r.sale.as_ref())
            .map(|s| s.id.as_str())
    }

    pub fn payer_email(&self) -> Option<&str> {
        self.payer
            .as_ref()
            .and_then(|p| p.payer_info.as_ref())
            .and_then(|i| i.email.as_deref())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaypalItem {
    pub name: String,
    pub sku: String,
    pub price: String,
    pub currency: String,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct PaypalPaymentRequest {
    pub invoice_number: String,
    pub amount: PaypalAmount,
    pub items: Vec<PaypalItem>,
    pub return_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaypalRefund {
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
}

/// The PayPal REST operations the processor needs.
#[async_trait]
pub trait PaypalClient: Send + Sync {
    async fn create_payment(&self, request: &PaypalPaymentRequest) -> Result<PaypalPayment, PaymentError>;
    async fn execute_payment(&self, payment_id: &str, payer_id: &str) -> Result<PaypalPayment, PaymentError>;
    async fn get_payment(&self, payment_id: &str) -> Result<PaypalPayment, PaymentError>;
    async fn refund_sale(&self, sale_id: &str, amount: &PaypalAmount) -> Result<PaypalRefund, PaymentError>;
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    300
}

/// [`PaypalClient`] over HTTPS with cached client-credentials tokens.
pub struct PaypalRestClient {
    http: reqwest::Client,
    api_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl PaypalRestClient {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, PaymentError> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.api_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| PaymentError::GatewayError(format!("PayPal token request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PaymentError::GatewayError(format!(
                "PayPal token request rejected with status {}",
                response.status()
            )));
        }
        let token: AccessToken = response
            .json()
            .await
            .map_err(|e| PaymentError::GatewayError(format!("unreadable PayPal token: {e}")))?;

        // Refresh a little early so a token never expires mid-request
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(30));
        *cached = Some((token.access_token.clone(), Instant::now() + lifetime));
        Ok(token.access_token)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, PaymentError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.api_url, path);
        let request = match body {
            Some(body) => self.http.post(url).json(&body),
            None => self.http.get(url),
        };
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| PaymentError::GatewayError(format!("PayPal request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PaymentError::GatewayError(format!(
                "PayPal {path} returned {status}: {detail}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| PaymentError::InvalidResponse(format!("unreadable PayPal response: {e}")))
    }
}

#[async_trait]
impl PaypalClient for PaypalRestClient {
    async fn create_payment(&self, request: &PaypalPaymentRequest) -> Result<PaypalPayment, PaymentError> {
        let body = serde_json::json!({
            "intent": "sale",
            "payer": { "payment_method": "paypal" },
            "redirect_urls": {
                "return_url": request.return_url,
                "cancel_url": request.cancel_url,
            },
            "transactions": [{
                "amount": request.amount,
                "invoice_number": request.invoice_number,
                "item_list": { "items": request.items },
            }],
        });
        self.call("/v1/payments/payment", Some(body)).await
    }

    async fn execute_payment(&self, payment_id: &str, payer_id: &str) -> Result<PaypalPayment, PaymentError> {
        let body = serde_json::json!({ "payer_id": payer_id });
        self.call(&format!("/v1/payments/payment/{payment_id}/execute"), Some(body))
            .await
    }

    async fn get_payment(&self, payment_id: &str) -> Result<PaypalPayment, PaymentError> {
        self.call(&format!("/v1/payments/payment/{payment_id}"), None)
            .await
    }

    async fn refund_sale(&self, sale_id: &str, amount: &PaypalAmount) -> Result<PaypalRefund, PaymentError> {
        let body = serde_json::json!({ "amount": amount });
        self.call(&format!("/v1/payments/sale/{sale_id}/refund"), Some(body))
            .await
    }
}

pub struct Paypal {
    client: Arc<dyn PaypalClient>,
    retry_attempts: u32,
}

impl Paypal {
    pub fn new(client: Arc<dyn PaypalClient>, retry_attempts: u32) -> Self {
        Self {
            client,
            retry_attempts: retry_attempts.max(1),
        }
    }

    pub fn from_app_config(cfg: &AppConfig, http: reqwest::Client) -> Self {
        let client = PaypalRestClient::new(
            http,
            cfg.paypal_api_url.clone(),
            cfg.paypal_client_id.clone().unwrap_or_default(),
            cfg.paypal_client_secret.clone().unwrap_or_default(),
        );
        Self::new(Arc::new(client), cfg.paypal_retry_attempts)
    }

    /// Executes an approved payment, retrying failed or unapproved executions.
    async fn execute_with_retries(&self, payment_id: &str, payer_id: &str) -> Result<PaypalPayment, PaymentError> {
        let mut last_problem = String::new();
        for attempt in 1..=self.retry_attempts {
            match self.client.execute_payment(payment_id, payer_id).await {
                Ok(payment) if payment.state == "approved" => return Ok(payment),
                Ok(payment) => {
                    last_problem = format!("payment state is {}", payment.state);
                }
                Err(e) => {
                    last_problem = e.to_string();
                }
            }
            warn!(
                payment_id,
                attempt,
                max_attempts = self.retry_attempts,
                problem = %last_problem,
                "PayPal execution did not complete"
            );
        }
        Err(PaymentError::GatewayError(format!(
            "PayPal payment {payment_id} was not executed after {} attempt(s): {last_problem}",
            self.retry_attempts
        )))
    }
}

#[async_trait]
impl PaymentProcessor for Paypal {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip(self, basket, ctx), fields(basket_id = basket.basket.id))]
    async fn transaction_parameters(
        &self,
        basket: &BasketWithLines,
        ctx: &CheckoutContext,
    ) -> Result<TransactionParameters, PaymentError> {
        let (Some(return_url), Some(cancel_url)) = (&ctx.return_url, &ctx.cancel_url) else {
            return Err(PaymentError::GatewayError(
                "PayPal checkout requires receipt and cancel page urls".to_string(),
            ));
        };
        let currency = basket.basket.currency.clone();
        let request = PaypalPaymentRequest {
            invoice_number: ctx.order_number.clone(),
            amount: PaypalAmount {
                total: format_amount(basket.total()),
                currency: currency.clone(),
            },
            items: basket
                .lines
                .iter()
                .map(|line| PaypalItem {
                    name: line.title.clone(),
                    sku: line.sku.clone(),
                    price: format_amount(line.unit_price),
                    currency: currency.clone(),
                    quantity: line.quantity,
                })
                .collect(),
            return_url: return_url.clone(),
            cancel_url: cancel_url.clone(),
        };

        let payment = self.client.create_payment(&request).await?;
        let approval_url = payment
            .approval_url()
            .ok_or_else(|| PaymentError::InvalidResponse("PayPal payment has no approval url".into()))?
            .to_string();
        info!(payment_id = %payment.id, "PayPal payment created");

        Ok(TransactionParameters {
            processor: NAME.to_string(),
            transaction_id: Some(payment.id.clone()),
            payment_page_url: Some(approval_url),
            fields: Default::default(),
        })
    }

    async fn handle_processor_response(
        &self,
        response: &serde_json::Value,
        _basket: &BasketWithLines,
    ) -> Result<HandledProcessorResponse, PaymentError> {
        let payment_id = str_field(response, "paymentId")
            .ok_or_else(|| PaymentError::InvalidResponse("missing paymentId".into()))?;
        let payer_id = str_field(response, "PayerID")
            .ok_or_else(|| PaymentError::InvalidResponse("missing PayerID".into()))?;

        let payment = self.execute_with_retries(payment_id, payer_id).await?;
        let transaction = payment
            .transactions
            .first()
            .ok_or_else(|| PaymentError::InvalidResponse("executed payment has no transactions".into()))?;

        Ok(HandledProcessorResponse {
            transaction_id: Some(payment.id.clone()),
            total: parse_amount(&transaction.amount.total, "amount.total")?,
            currency: transaction.amount.currency.to_uppercase(),
            card_number: Some(format!(
                "PayPal Account ({})",
                payment.payer_email().unwrap_or("unknown")
            )),
            card_type: None,
        })
    }

    #[instrument(skip(self, credit), fields(order_number = %credit.order_number))]
    async fn issue_credit(&self, credit: &CreditRequest) -> Result<Option<String>, PaymentError> {
        let payment = self.client.get_payment(&credit.reference).await?;
        let sale_id = payment.sale_id().ok_or_else(|| {
            PaymentError::GatewayError(format!("PayPal payment {} has no sale", credit.reference))
        })?;
        let refund = self
            .client
            .refund_sale(
                sale_id,
                &PaypalAmount {
                    total: format_amount(credit.amount),
                    currency: credit.currency.clone(),
                },
            )
            .await?;
        info!(sale_id, refund_id = %refund.id, "PayPal sale refunded");
        Ok(Some(refund.id))
    }
}
