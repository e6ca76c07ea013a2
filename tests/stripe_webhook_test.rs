mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::{expect_status, TestApp};
use coursecart_api::{
    entities::{BasketStatus, RefundStatus},
    services::refunds::CreateRefundInput,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn intent_event(event_type: &str, intent: Value) -> Value {
    json!({
        "id": "evt_1",
        "type": event_type,
        "data": { "object": intent }
    })
}

async fn start_stripe_checkout(app: &TestApp, server: &MockServer, basket_id: i32) -> String {
    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(body_string_contains("amount=4900"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_123",
            "client_secret": "pi_123_secret_abc",
            "status": "requires_payment_method"
        })))
        .expect(1)
        .mount(server)
        .await;

    let body = expect_status(
        app.request(
            Method::POST,
            "/api/v2/checkout",
            Some(json!({ "basket_id": basket_id, "processor": "stripe" })),
        )
        .await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(body["data"]["parameters"]["fields"]["client_secret"], "pi_123_secret_abc");
    assert_eq!(body["data"]["parameters"]["fields"]["publishable_key"], "pk_test_123");
    body["data"]["parameters"]["transaction_id"]
        .as_str()
        .expect("intent id")
        .to_string()
}

#[tokio::test]
async fn succeeded_intent_places_order() {
    let server = MockServer::start().await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let basket_id = app.seed_basket("alice", &[("COURSE-1", dec!(49), 1)]).await;
    let intent_id = start_stripe_checkout(&app, &server, basket_id).await;

    // metadata is absent: the basket is found through the recorded checkout response
    let event = intent_event(
        "payment_intent.succeeded",
        json!({
            "id": intent_id,
            "status": "succeeded",
            "amount_received": 4900,
            "currency": "usd",
            "charges": { "data": [{ "payment_method_details": { "card": { "last4": "4242", "brand": "visa" } } }] }
        }),
    );
    let body = expect_status(app.post_stripe_event(&event).await, StatusCode::OK).await;
    assert_eq!(body["data"]["status"], "processed");
    assert_eq!(body["data"]["outcome"]["result"], "placed");

    // Stripe retries deliveries; a second one is acknowledged without a new order
    let body = expect_status(app.post_stripe_event(&event).await, StatusCode::OK).await;
    assert_eq!(body["data"]["outcome"]["result"], "already_placed");

    let details = app
        .services()
        .orders
        .get_with_details(&app.order_number(basket_id))
        .await
        .unwrap();
    assert_eq!(details.payment_events.len(), 1);
    assert_eq!(details.sources[0].reference.as_deref(), Some("pi_123"));
    assert_eq!(details.sources[0].label.as_deref(), Some("xxxxxxxxxxxx4242"));
}

#[tokio::test]
async fn refund_of_stripe_order_goes_through_the_refunds_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/refunds"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(body_string_contains("payment_intent=pi_123"))
        .and(body_string_contains("amount=4900"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "re_1",
            "object": "refund",
            "status": "succeeded"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let basket_id = app.seed_basket("alice", &[("COURSE-1", dec!(49), 1)]).await;
    let intent_id = start_stripe_checkout(&app, &server, basket_id).await;
    let event = intent_event(
        "payment_intent.succeeded",
        json!({
            "id": intent_id,
            "status": "succeeded",
            "amount_received": 4900,
            "currency": "usd",
            "metadata": { "basket_id": basket_id.to_string() }
        }),
    );
    expect_status(app.post_stripe_event(&event).await, StatusCode::OK).await;

    let number = app.order_number(basket_id);
    let refund = app
        .services()
        .refunds
        .create_refund(CreateRefundInput {
            order_number: number.clone(),
            line_ids: None,
        })
        .await
        .unwrap();
    let approved = app.services().refunds.approve(refund.refund.id).await.unwrap();
    assert_eq!(approved.refund.status, RefundStatus::Complete);

    let details = app.services().orders.get_with_details(&number).await.unwrap();
    assert_eq!(details.sources[0].amount_refunded, dec!(49));
    assert!(details
        .payment_events
        .iter()
        .any(|e| e.reference.as_deref() == Some("re_1")));
}

#[tokio::test]
async fn failed_intent_releases_basket() {
    let server = MockServer::start().await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let basket_id = app.seed_basket("alice", &[("COURSE-1", dec!(49), 1)]).await;
    start_stripe_checkout(&app, &server, basket_id).await;

    let event = intent_event(
        "payment_intent.payment_failed",
        json!({
            "id": "pi_123",
            "status": "requires_payment_method",
            "amount": 4900,
            "currency": "usd",
            "metadata": { "basket_id": basket_id.to_string() },
            "last_payment_error": { "message": "Your card was declined." }
        }),
    );
    let body = expect_status(app.post_stripe_event(&event).await, StatusCode::OK).await;
    assert_eq!(body["data"]["status"], "acknowledged");

    let basket = app.services().baskets.get_basket(basket_id).await.unwrap();
    assert_eq!(basket.basket.status, BasketStatus::Open);
}

#[tokio::test]
async fn unrelated_events_are_acknowledged() {
    let app = TestApp::new().await;
    let event = json!({ "id": "evt_2", "type": "customer.created", "data": { "object": { "id": "cus_1" } } });
    let body = expect_status(app.post_stripe_event(&event).await, StatusCode::OK).await;
    assert_eq!(body["data"]["event_type"], "customer.created");
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v2/payment/stripe/webhook")
        .header("stripe-signature", format!("t={},v1=deadbeef", chrono::Utc::now().timestamp()))
        .body(Body::from(r#"{"type":"payment_intent.succeeded"}"#))
        .unwrap();
    assert_eq!(app.send(request).await.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v2/payment/stripe/webhook")
        .body(Body::from("{}"))
        .unwrap();
    assert_eq!(app.send(request).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn gateway_failure_releases_basket() {
    let server = MockServer::start().await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let basket_id = app.seed_basket("alice", &[("COURSE-1", dec!(49), 1)]).await;

    Mock::given(method("POST"))
        .and(path("/v1/payment_intents"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({ "error": { "message": "boom" } })),
        )
        .mount(&server)
        .await;

    let response = app
        .request(
            Method::POST,
            "/api/v2/checkout",
            Some(json!({ "basket_id": basket_id, "processor": "stripe" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let basket = app.services().baskets.get_basket(basket_id).await.unwrap();
    assert_eq!(basket.basket.status, BasketStatus::Open);
}
