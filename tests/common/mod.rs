#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use coursecart_api::{
    config::AppConfig,
    db::{self, DbConfig},
    events,
    payment::{signing, PaymentProcessorRegistry},
    services::{
        baskets::{AddLineInput, CreateBasketInput},
        AppServices,
    },
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tower::ServiceExt;

pub const CYBERSOURCE_SECRET: &str = "cybersource-test-secret";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const RECEIPT_PAGE: &str = "https://learn.example.com/checkout/receipt/";
pub const CANCEL_PAGE: &str = "https://learn.example.com/checkout/cancel/";

/// Configuration every test starts from. Gateway URLs point at `gateway_url`,
/// normally a wiremock server.
pub fn test_config(gateway_url: &str) -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.payment_processors = "cybersource,paypal,stripe,invoice".to_string();
    cfg.receipt_page_url = Some(RECEIPT_PAGE.to_string());
    cfg.cancel_page_url = Some(CANCEL_PAGE.to_string());

    cfg.cybersource_profile_id = Some("profile-1".to_string());
    cfg.cybersource_access_key = Some("access-1".to_string());
    cfg.cybersource_secret_key = Some(CYBERSOURCE_SECRET.to_string());
    cfg.cybersource_rest_api_url = gateway_url.to_string();
    cfg.cybersource_merchant_id = Some("merchant-1".to_string());
    cfg.cybersource_api_key_id = Some("key-1".to_string());
    // base64("rest-secret")
    cfg.cybersource_api_secret = Some("cmVzdC1zZWNyZXQ=".to_string());

    cfg.paypal_api_url = gateway_url.to_string();
    cfg.paypal_client_id = Some("paypal-client".to_string());
    cfg.paypal_client_secret = Some("paypal-secret".to_string());
    cfg.paypal_retry_attempts = 2;

    cfg.stripe_api_url = gateway_url.to_string();
    cfg.stripe_secret_key = Some("sk_test_123".to_string());
    cfg.stripe_publishable_key = Some("pk_test_123".to_string());
    cfg.stripe_webhook_secret = Some(STRIPE_WEBHOOK_SECRET.to_string());

    cfg.sdn_api_url = format!("{gateway_url}/consolidated_screening_list/search");
    cfg
}

/// Helper harness for spinning up an application backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config("http://127.0.0.1:9")).await
    }

    /// Application whose processor and screening APIs live at `gateway_url`.
    pub async fn with_gateway(gateway_url: &str) -> Self {
        Self::with_config(test_config(gateway_url)).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::in_memory())
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let cfg = Arc::new(cfg);
        let (sender, rx) = events::channel(cfg.event_channel_capacity);
        let event_sender = Arc::new(sender);
        let event_task = tokio::spawn(events::process_events(rx));

        let registry = Arc::new(
            PaymentProcessorRegistry::from_config(&cfg).expect("processors configure"),
        );
        let services = AppServices::new(db.clone(), event_sender.clone(), cfg.clone(), registry);
        let state = AppState {
            db,
            config: cfg,
            event_sender,
            services,
        };

        Self {
            router: coursecart_api::api_router(state.clone()),
            state,
            _event_task: event_task,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Creates an open basket holding `lines` of `(sku, unit price, quantity)`.
    pub async fn seed_basket(&self, owner: &str, lines: &[(&str, Decimal, i32)]) -> i32 {
        let basket = self
            .services()
            .baskets
            .create_basket(CreateBasketInput {
                owner: Some(owner.to_string()),
                currency: Some("USD".to_string()),
            })
            .await
            .expect("basket created");
        for (sku, price, quantity) in lines {
            self.services()
                .baskets
                .add_line(
                    basket.id,
                    AddLineInput {
                        sku: sku.to_string(),
                        title: format!("Course {sku}"),
                        unit_price: *price,
                        quantity: *quantity,
                    },
                )
                .await
                .expect("line added");
        }
        basket.id
    }

    pub fn order_number(&self, basket_id: i32) -> String {
        self.services().orders.numbers().order_number(basket_id)
    }

    /// A signed Secure Acceptance notification for `basket_id`.
    pub fn cybersource_notification(
        &self,
        basket_id: i32,
        decision: &str,
        amount: &str,
        transaction_id: &str,
    ) -> BTreeMap<String, String> {
        let mut fields: BTreeMap<String, String> = [
            ("decision", decision),
            ("reason_code", if decision == "ACCEPT" { "100" } else { "481" }),
            ("message", "Request was processed"),
            ("transaction_id", transaction_id),
            ("req_amount", amount),
            ("auth_amount", amount),
            ("req_currency", "USD"),
            ("req_card_number", "xxxxxxxxxxxx1111"),
            ("req_card_type", "001"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        fields.insert("req_reference_number".to_string(), self.order_number(basket_id));
        self.services()
            .registry
            .cybersource()
            .expect("cybersource enabled")
            .sign_fields(&mut fields)
            .expect("fields signed");
        fields
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request builds");
        self.send(request).await
    }

    pub async fn post_form(&self, uri: &str, fields: &BTreeMap<String, String>) -> Response {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", form_encode(k), form_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .expect("request builds");
        self.send(request).await
    }

    /// Posts a Stripe webhook signed with the configured secret.
    pub async fn post_stripe_event(&self, event: &Value) -> Response {
        let payload = event.to_string();
        let signature = signing::stripe_signature_header(
            STRIPE_WEBHOOK_SECRET,
            payload.as_bytes(),
            chrono::Utc::now().timestamp(),
        )
        .expect("signature");
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v2/payment/stripe/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header("stripe-signature", signature)
            .body(Body::from(payload))
            .expect("request builds");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router responds")
    }
}

fn form_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => {
                (b as char).to_string()
            }
            b' ' => "+".to_string(),
            other => format!("%{other:02X}"),
        })
        .collect()
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub async fn expect_status(response: Response, status: StatusCode) -> Value {
    let actual = response.status();
    let body = response_json(response).await;
    assert_eq!(actual, status, "unexpected status, body: {body}");
    body
}

/// Reads a decimal serialized as a JSON string or number.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}
