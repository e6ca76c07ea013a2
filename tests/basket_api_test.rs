//! HTTP-level tests for basket management.

mod common;

use axum::http::{Method, StatusCode};
use common::{decimal, expect_status, TestApp};
use coursecart_api::entities::BasketStatus;
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn create_basket_and_add_lines() {
    let app = TestApp::new().await;

    let created = expect_status(
        app.request(
            Method::POST,
            "/api/v2/baskets",
            Some(json!({ "currency": "usd" })),
        )
        .await,
        StatusCode::CREATED,
    )
    .await;
    let basket_id = created["data"]["id"].as_i64().expect("basket id");
    assert_eq!(created["data"]["status"], "open");
    assert_eq!(created["data"]["currency"], "USD");
    assert_eq!(created["data"]["order_number"], format!("EDX-{}", 100_000 + basket_id));

    let uri = format!("/api/v2/baskets/{basket_id}/lines");
    let line = json!({ "sku": "COURSE-1", "title": "Intro to Rust", "unit_price": "49.00", "quantity": 1 });
    expect_status(app.request(Method::POST, &uri, Some(line.clone())).await, StatusCode::OK).await;
    let body = expect_status(app.request(Method::POST, &uri, Some(line)).await, StatusCode::OK).await;

    let lines = body["data"]["lines"].as_array().expect("lines");
    assert_eq!(lines.len(), 1, "same SKU is merged into one line");
    assert_eq!(lines[0]["quantity"], 2);
    assert_eq!(decimal(&body["data"]["total"]), dec!(98));
}

#[tokio::test]
async fn remove_line_updates_total() {
    let app = TestApp::new().await;
    let basket_id = app
        .seed_basket("alice", &[("A", dec!(10), 1), ("B", dec!(15.50), 2)])
        .await;
    let basket = app.services().baskets.get_basket(basket_id).await.unwrap();
    let line_b = basket.lines.iter().find(|l| l.sku == "B").unwrap().id;

    let body = expect_status(
        app.request(
            Method::DELETE,
            &format!("/api/v2/baskets/{basket_id}/lines/{line_b}"),
            None,
        )
        .await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(decimal(&body["data"]["total"]), dec!(10));

    // Removing it again is a 404
    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v2/baskets/{basket_id}/lines/{line_b}"),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_lines_are_rejected() {
    let app = TestApp::new().await;
    let basket_id = app.seed_basket("bob", &[]).await;
    let uri = format!("/api/v2/baskets/{basket_id}/lines");

    for payload in [
        json!({ "sku": "", "title": "x", "unit_price": "1.00", "quantity": 1 }),
        json!({ "sku": "A", "title": "x", "unit_price": "-1.00", "quantity": 1 }),
        json!({ "sku": "A", "title": "x", "unit_price": "1.00", "quantity": 0 }),
        json!({ "sku": "A", "title": "x", "unit_price": "10.005", "quantity": 1 }),
    ] {
        let response = app.request(Method::POST, &uri, Some(payload.clone())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "payload {payload}");
    }
}

#[tokio::test]
async fn prices_follow_the_basket_currency_precision() {
    let app = TestApp::new().await;
    let created = expect_status(
        app.request(
            Method::POST,
            "/api/v2/baskets",
            Some(json!({ "currency": "JPY" })),
        )
        .await,
        StatusCode::CREATED,
    )
    .await;
    let uri = format!("/api/v2/baskets/{}/lines", created["data"]["id"]);

    let response = app
        .request(
            Method::POST,
            &uri,
            Some(json!({ "sku": "A", "title": "x", "unit_price": "1000.50", "quantity": 1 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Trailing zeros do not count as precision
    let body = expect_status(
        app.request(
            Method::POST,
            &uri,
            Some(json!({ "sku": "A", "title": "x", "unit_price": "1000.00", "quantity": 1 })),
        )
        .await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(decimal(&body["data"]["total"]), dec!(1000));
}

#[tokio::test]
async fn open_baskets_of_one_owner_are_merged_into_the_oldest() {
    let app = TestApp::new().await;
    let oldest = app
        .seed_basket("erin", &[("A", dec!(10), 1), ("B", dec!(5), 1)])
        .await;
    let second = app.seed_basket("erin", &[("A", dec!(10), 2)]).await;
    let third = app.seed_basket("erin", &[("C", dec!(7), 1)]).await;

    let body = expect_status(
        app.request(
            Method::POST,
            "/api/v2/baskets",
            Some(json!({ "owner": "erin" })),
        )
        .await,
        StatusCode::CREATED,
    )
    .await;
    assert_eq!(body["data"]["id"].as_i64(), Some(i64::from(oldest)));
    let lines = body["data"]["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 3);
    let quantity_of = |sku: &str| {
        lines
            .iter()
            .find(|l| l["sku"] == sku)
            .map(|l| l["quantity"].as_i64().unwrap())
    };
    assert_eq!(quantity_of("A"), Some(3));
    assert_eq!(quantity_of("B"), Some(1));
    assert_eq!(quantity_of("C"), Some(1));
    assert_eq!(decimal(&body["data"]["total"]), dec!(42));

    for merged in [second, third] {
        let basket = app.services().baskets.get_basket(merged).await.unwrap();
        assert_eq!(basket.basket.status, BasketStatus::Merged);
        assert!(basket.lines.is_empty());
    }
}

#[tokio::test]
async fn flushing_empties_an_open_basket() {
    let app = TestApp::new().await;
    let basket_id = app
        .seed_basket("frank", &[("A", dec!(10), 1), ("B", dec!(5), 3)])
        .await;
    let uri = format!("/api/v2/baskets/{basket_id}/lines");

    let body = expect_status(app.request(Method::DELETE, &uri, None).await, StatusCode::OK).await;
    assert!(body["data"]["lines"].as_array().unwrap().is_empty());
    assert_eq!(decimal(&body["data"]["total"]), dec!(0));
    assert_eq!(body["data"]["status"], "open");

    app.services().baskets.freeze(basket_id).await.unwrap();
    let response = app.request(Method::DELETE, &uri, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn owner_gets_their_open_basket_back() {
    let app = TestApp::new().await;
    let existing = app.seed_basket("carol", &[("A", dec!(5), 1)]).await;

    let body = expect_status(
        app.request(
            Method::POST,
            "/api/v2/baskets",
            Some(json!({ "owner": "carol" })),
        )
        .await,
        StatusCode::CREATED,
    )
    .await;
    assert_eq!(body["data"]["id"].as_i64(), Some(i64::from(existing)));
    assert_eq!(body["data"]["lines"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn frozen_basket_cannot_be_edited() {
    let app = TestApp::new().await;
    let basket_id = app.seed_basket("dave", &[("A", dec!(5), 1)]).await;
    app.services().baskets.freeze(basket_id).await.unwrap();

    let response = app
        .request(
            Method::POST,
            &format!("/api/v2/baskets/{basket_id}/lines"),
            Some(json!({ "sku": "B", "title": "x", "unit_price": "1.00", "quantity": 1 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.services().baskets.thaw(basket_id).await.unwrap();
    let response = app
        .request(
            Method::POST,
            &format!("/api/v2/baskets/{basket_id}/lines"),
            Some(json!({ "sku": "B", "title": "x", "unit_price": "1.00", "quantity": 1 })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_basket_is_not_found_and_carries_request_id() {
    let app = TestApp::new().await;
    let response = app.request(Method::GET, "/api/v2/baskets/4242", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let header = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .expect("request id header");

    let body = common::response_json(response).await;
    assert_eq!(body["request_id"].as_str(), Some(header.as_str()));
}

#[tokio::test]
async fn health_reports_database_and_processors() {
    let app = TestApp::new().await;
    let body = expect_status(app.request(Method::GET, "/health", None).await, StatusCode::OK).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"]["status"], "up");
    assert_eq!(
        body["payment_processors"],
        json!(["cybersource", "paypal", "stripe", "invoice"])
    );
}
