//! Refund pipeline: creation, approval against the processor, denial and retries.

mod common;

use axum::http::{Method, StatusCode};
use common::{decimal, expect_status, test_config, TestApp};
use coursecart_api::{
    db::is_unique_violation,
    entities::{
        refund_line::{self, RefundLineStatus},
        OrderLineStatus, OrderStatus, RefundStatus,
    },
    payment::HandledProcessorResponse,
    services::refunds::CreateRefundInput,
};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Places a CyberSource-paid order for two courses and returns its number.
async fn paid_order(app: &TestApp) -> String {
    let basket_id = app
        .seed_basket("alice", &[("COURSE-1", dec!(30), 1), ("COURSE-2", dec!(20), 1)])
        .await;
    let fields = app.cybersource_notification(basket_id, "ACCEPT", "50.00", "txn-1");
    app.services()
        .checkout
        .handle_cybersource_notification(fields)
        .await
        .expect("order placed");
    app.order_number(basket_id)
}

async fn mount_refund(server: &MockServer, status: u16, times: Option<u64>) {
    let mock = Mock::given(method("POST"))
        .and(path("/pts/v2/payments/txn-1/refunds"))
        .and(header("v-c-merchant-id", "merchant-1"))
        .and(header_exists("signature"))
        .and(header_exists("digest"));
    let response = if status < 300 {
        ResponseTemplate::new(status).set_body_json(json!({ "id": "refund-1", "status": "PENDING" }))
    } else {
        ResponseTemplate::new(status).set_body_json(json!({ "message": "processor unavailable" }))
    };
    let mock = mock.respond_with(response);
    match times {
        Some(n) => mock.up_to_n_times(n).with_priority(1).mount(server).await,
        None => mock.mount(server).await,
    }
}

#[tokio::test]
async fn approved_refund_credits_processor_and_completes() {
    let server = MockServer::start().await;
    mount_refund(&server, 201, None).await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let number = paid_order(&app).await;

    let created = expect_status(
        app.request(
            Method::POST,
            "/api/v2/refunds",
            Some(json!({ "order_number": number })),
        )
        .await,
        StatusCode::CREATED,
    )
    .await;
    assert_eq!(created["data"]["refund"]["status"], "open");
    assert_eq!(decimal(&created["data"]["refund"]["total_credit"]), dec!(50));
    let refund_id = created["data"]["refund"]["id"].as_str().unwrap().to_string();

    let body = expect_status(
        app.request(
            Method::PUT,
            &format!("/api/v2/refunds/{refund_id}/process"),
            Some(json!({ "action": "approve" })),
        )
        .await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(body["data"]["refund"]["status"], "complete");
    assert!(body["data"]["lines"]
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["status"] == "complete"));

    let details = app.services().orders.get_with_details(&number).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Refunded);
    assert!(details.lines.iter().all(|l| l.status == OrderLineStatus::Refunded));
    assert_eq!(details.sources[0].amount_refunded, dec!(50));
    let refunded: Vec<_> = details
        .payment_events
        .iter()
        .filter(|e| e.reference.as_deref() == Some("refund-1"))
        .collect();
    assert_eq!(refunded.len(), 1);

    // Approving again is a no-op
    let again = app
        .services()
        .refunds
        .approve(refund_id.parse().unwrap())
        .await
        .unwrap();
    assert_eq!(again.refund.status, RefundStatus::Complete);
    let details = app.services().orders.get_with_details(&number).await.unwrap();
    assert_eq!(details.payment_events.len(), 2);
}

#[tokio::test]
async fn partial_refund_leaves_order_complete() {
    let server = MockServer::start().await;
    mount_refund(&server, 201, None).await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let number = paid_order(&app).await;

    let details = app.services().orders.get_with_details(&number).await.unwrap();
    let course_two = details.lines.iter().find(|l| l.sku == "COURSE-2").unwrap().id;

    let refund = app
        .services()
        .refunds
        .create_refund(coursecart_api::services::refunds::CreateRefundInput {
            order_number: number.clone(),
            line_ids: Some(vec![course_two]),
        })
        .await
        .unwrap();
    assert_eq!(refund.refund.total_credit, dec!(20));
    app.services().refunds.approve(refund.refund.id).await.unwrap();

    let details = app.services().orders.get_with_details(&number).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Complete);
    assert_eq!(details.sources[0].amount_refunded, dec!(20));

    // Only the remaining line can still be refunded
    let rest = app
        .services()
        .refunds
        .create_refund(coursecart_api::services::refunds::CreateRefundInput {
            order_number: number,
            line_ids: None,
        })
        .await
        .unwrap();
    assert_eq!(rest.refund.total_credit, dec!(30));
    assert_eq!(rest.lines.len(), 1);
}

#[tokio::test]
async fn processor_failure_is_retryable() {
    let server = MockServer::start().await;
    mount_refund(&server, 502, Some(1)).await;
    mount_refund(&server, 201, None).await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let number = paid_order(&app).await;

    let refund = expect_status(
        app.request(
            Method::POST,
            "/api/v2/refunds",
            Some(json!({ "order_number": number })),
        )
        .await,
        StatusCode::CREATED,
    )
    .await;
    let refund_id = refund["data"]["refund"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/v2/refunds/{refund_id}/process");

    let response = app
        .request(Method::PUT, &uri, Some(json!({ "action": "approve" })))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = expect_status(
        app.request(Method::GET, &format!("/api/v2/refunds/{refund_id}"), None).await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(body["data"]["refund"]["status"], "payment_refund_error");

    // A refund that already reached the processor can no longer be denied
    let response = app
        .request(Method::PUT, &uri, Some(json!({ "action": "deny" })))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = expect_status(
        app.request(Method::PUT, &uri, Some(json!({ "action": "approve" })))
            .await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(body["data"]["refund"]["status"], "complete");
}

#[tokio::test]
async fn denied_refund_frees_lines_for_a_new_refund() {
    let app = TestApp::new().await;
    let number = paid_order(&app).await;

    let refund = app
        .services()
        .refunds
        .create_refund(coursecart_api::services::refunds::CreateRefundInput {
            order_number: number.clone(),
            line_ids: None,
        })
        .await
        .unwrap();

    // Lines under an open refund are not refundable twice
    let err = app
        .services()
        .refunds
        .create_refund(coursecart_api::services::refunds::CreateRefundInput {
            order_number: number.clone(),
            line_ids: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    let denied = app.services().refunds.deny(refund.refund.id).await.unwrap();
    assert_eq!(denied.refund.status, RefundStatus::Denied);
    let denied_again = app.services().refunds.deny(refund.refund.id).await.unwrap();
    assert_eq!(denied_again.refund.status, RefundStatus::Denied);

    let approve_denied = app.services().refunds.approve(refund.refund.id).await;
    assert!(approve_denied.is_err());

    let fresh = app
        .services()
        .refunds
        .create_refund(coursecart_api::services::refunds::CreateRefundInput {
            order_number: number,
            line_ids: None,
        })
        .await
        .unwrap();
    assert_eq!(fresh.lines.len(), 2);
}

#[tokio::test]
async fn invoiced_orders_cannot_be_credited() {
    let app = TestApp::new().await;
    let basket_id = app.seed_basket("bob", &[("A", dec!(5), 1)]).await;
    app.services()
        .checkout
        .place_invoiced_order(basket_id)
        .await
        .unwrap();

    let refund = app
        .services()
        .refunds
        .create_refund(coursecart_api::services::refunds::CreateRefundInput {
            order_number: app.order_number(basket_id),
            line_ids: None,
        })
        .await
        .unwrap();
    let err = app.services().refunds.approve(refund.refund.id).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    let refund = app.services().refunds.get_refund(refund.refund.id).await.unwrap();
    assert_eq!(refund.refund.status, RefundStatus::PaymentRefundError);
}

#[tokio::test]
async fn unknown_order_or_line_is_rejected() {
    let app = TestApp::new().await;
    let number = paid_order(&app).await;

    let response = app
        .request(
            Method::POST,
            "/api/v2/refunds",
            Some(json!({ "order_number": "EDX-999999" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .request(
            Method::POST,
            "/api/v2/refunds",
            Some(json!({ "order_number": number, "line_ids": [uuid::Uuid::new_v4()] })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_approvals_credit_the_processor_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pts/v2/payments/txn-1/refunds"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({ "id": "refund-1", "status": "PENDING" }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let app = TestApp::with_gateway(&server.uri()).await;
    let number = paid_order(&app).await;
    let refund = app
        .services()
        .refunds
        .create_refund(CreateRefundInput {
            order_number: number.clone(),
            line_ids: None,
        })
        .await
        .unwrap();

    let refunds = &app.services().refunds;
    let (first, second) = tokio::join!(
        refunds.approve(refund.refund.id),
        refunds.approve(refund.refund.id),
    );
    let mut completed = 0;
    for result in [first, second] {
        match result {
            Ok(done) => {
                assert_eq!(done.refund.status, RefundStatus::Complete);
                completed += 1;
            }
            Err(e) => assert_eq!(e.status_code(), StatusCode::CONFLICT),
        }
    }
    assert!(completed >= 1);

    let details = app.services().orders.get_with_details(&number).await.unwrap();
    assert_eq!(details.sources[0].amount_refunded, dec!(50));
    assert_eq!(details.payment_events.len(), 2);
}

#[tokio::test]
async fn refund_in_flight_cannot_be_approved_again() {
    let app = TestApp::new().await;
    let number = paid_order(&app).await;
    let refund = app
        .services()
        .refunds
        .create_refund(CreateRefundInput {
            order_number: number,
            line_ids: None,
        })
        .await
        .unwrap();

    // Simulate an approval that is still waiting on the processor
    let mut pending: coursecart_api::entities::refund::ActiveModel = refund.refund.clone().into();
    pending.status = Set(RefundStatus::PaymentRefundPending);
    pending.update(&*app.state.db).await.unwrap();

    let err = app.services().refunds.approve(refund.refund.id).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
    let err = app.services().refunds.deny(refund.refund.id).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_refund_requests_claim_a_line_once() {
    let app = TestApp::new().await;
    let number = paid_order(&app).await;
    let details = app.services().orders.get_with_details(&number).await.unwrap();
    let course_one = details.lines.iter().find(|l| l.sku == "COURSE-1").unwrap().id;
    let input = CreateRefundInput {
        order_number: number.clone(),
        line_ids: Some(vec![course_one]),
    };

    let refunds = &app.services().refunds;
    let (first, second) = tokio::join!(
        refunds.create_refund(input.clone()),
        refunds.create_refund(input.clone()),
    );
    let (created, refused): (Vec<_>, Vec<_>) = [first, second].into_iter().partition(Result::is_ok);
    assert_eq!(created.len(), 1);
    let refused = refused.into_iter().next().unwrap().unwrap_err();
    assert_eq!(refused.status_code(), StatusCode::BAD_REQUEST);

    // The database refuses a second live claim on the same order line
    let created = created.into_iter().next().unwrap().unwrap();
    let duplicate = refund_line::ActiveModel {
        id: Set(uuid::Uuid::new_v4()),
        refund_id: Set(created.refund.id),
        order_line_id: Set(course_one),
        quantity: Set(1),
        line_credit: Set(dec!(30)),
        status: Set(RefundLineStatus::Open),
    }
    .insert(&*app.state.db)
    .await
    .unwrap_err();
    assert!(is_unique_violation(&duplicate));
}

#[tokio::test]
async fn disabled_processor_still_refunds_its_orders() {
    let server = MockServer::start().await;
    mount_refund(&server, 201, None).await;
    let mut cfg = test_config(&server.uri());
    cfg.disabled_payment_processors = Some("cybersource".to_string());
    let app = TestApp::with_config(cfg).await;

    // Orders taken before the processor was switched off
    let basket_id = app.seed_basket("alice", &[("COURSE-1", dec!(50), 1)]).await;
    let basket = app.services().baskets.get_basket(basket_id).await.unwrap();
    let payment = HandledProcessorResponse {
        transaction_id: Some("txn-1".to_string()),
        total: dec!(50),
        currency: "USD".to_string(),
        card_number: None,
        card_type: None,
    };
    let order = app
        .services()
        .orders
        .place_order(&basket, Some(&payment), Some("cybersource"))
        .await
        .unwrap();

    let refund = app
        .services()
        .refunds
        .create_refund(CreateRefundInput {
            order_number: order.number.clone(),
            line_ids: None,
        })
        .await
        .unwrap();
    let approved = app.services().refunds.approve(refund.refund.id).await.unwrap();
    assert_eq!(approved.refund.status, RefundStatus::Complete);

    let details = app.services().orders.get_with_details(&order.number).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Refunded);
}
