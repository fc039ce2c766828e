mod common;

use common::{
    razorpay_config, razorpay_order, TestApp, TestContext, RAZORPAY_KEY_ID, RAZORPAY_KEY_SECRET,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use service_core::utils::signature::hmac_sha256_hex;
use subscription_service::error::PaymentError;
use subscription_service::gateway::CallbackPayload;
use subscription_service::models::{OrderStatus, TransactionStatus};
use subscription_service::services::ReconcileOutcome;
use subscription_service::store::SubscriptionStore;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, ResponseTemplate};

const THIRTY_DAYS_MS: i64 = 30 * 86_400_000;

#[tokio::test]
async fn verified_payment_activates_a_thirty_day_order() {
    let ctx = TestContext::razorpay().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;

    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({
            "amount": 22400,
            "currency": "INR",
            "notes": { "internal_order_id": created.order.id.to_string() }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(razorpay_order(
                "order_g1",
                "created",
                created.order.id,
            )),
        )
        .expect(1)
        .mount(&ctx.gateway)
        .await;

    let handle = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("Checkout failed");
    assert_eq!(handle.gateway, "razorpay");
    assert_eq!(handle.gateway_order_id, "order_g1");
    assert_eq!(handle.session_token.as_deref(), Some("order_g1"));
    assert_eq!(handle.key_id, RAZORPAY_KEY_ID);
    assert_eq!(handle.amount, Decimal::from(224));

    ctx.mock_status("order_g1", "paid", created.order.id).await;
    let outcome = ctx
        .state
        .reconciler
        .handle_callback(CallbackPayload {
            gateway_order_id: "order_g1".to_string(),
            asserted_status: Some("paid".to_string()),
            payment_id: Some("pay_1".to_string()),
        })
        .await
        .expect("Callback failed");
    assert!(matches!(outcome, ReconcileOutcome::Activated(_)));

    let transaction = outcome.transaction();
    assert_eq!(transaction.status, TransactionStatus::Paid);
    assert_eq!(transaction.amount_paid, Decimal::from(224));
    assert_eq!(transaction.payment_id.as_deref(), Some("pay_1"));
    assert_eq!(transaction.attempts, 1);
    assert!(!transaction.needs_reverification);

    let order = ctx.store.get_order(created.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
    let start = order.start_date.unwrap().timestamp_millis();
    let expiry = order.expiration_date.unwrap().timestamp_millis();
    assert_eq!(expiry - start, THIRTY_DAYS_MS);
}

#[tokio::test]
async fn order_creation_failure_leaves_no_transaction() {
    let ctx = TestContext::razorpay().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    ctx.mock_create_error(500).await;

    let result = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await;

    assert!(matches!(result, Err(PaymentError::Gateway(_))));
    assert_eq!(ctx.store.transaction_count().await, 0);
    let order = ctx.store.get_order(created.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Pending);

    // A later attempt is not blocked by the failed one
    ctx.reset_gateway().await;
    ctx.mock_create("order_g2", created.order.id).await;
    ctx.state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("Retry after gateway recovery failed");
    assert_eq!(ctx.store.transaction_count().await, 1);
}

#[tokio::test]
async fn unreachable_status_lookup_keeps_the_payment_open() {
    let ctx = TestContext::razorpay().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    ctx.mock_create("order_g1", created.order.id).await;
    ctx.state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("Checkout failed");
    ctx.mock_status_error("order_g1", 500).await;

    let outcome = ctx
        .state
        .reconciler
        .handle_callback(CallbackPayload {
            gateway_order_id: "order_g1".to_string(),
            asserted_status: None,
            payment_id: None,
        })
        .await
        .expect("Callback failed");

    assert!(matches!(outcome, ReconcileOutcome::Pending(_)));
    let order = ctx.store.get_order(created.order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
}

async fn create_and_checkout(app: &TestApp, user_id: Uuid) -> Uuid {
    let response = app
        .client
        .post(app.url("/orders"))
        .header("X-User-ID", user_id.to_string())
        .json(&json!({ "amount": 224, "period_days": 30 }))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 201);
    let order: Value = response.json().await.unwrap();
    let order_id: Uuid = order["id"].as_str().unwrap().parse().unwrap();
    let reference = order["reference"].as_str().unwrap();

    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(razorpay_order("order_g1", "created", order_id)),
        )
        .mount(&app.gateway)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders/order_g1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(razorpay_order("order_g1", "paid", order_id)),
        )
        .mount(&app.gateway)
        .await;

    let response = app
        .client
        .get(app.url(&format!("/payment/checkout/{}", reference)))
        .header("X-User-ID", user_id.to_string())
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);
    let handle: Value = response.json().await.unwrap();
    assert_eq!(handle["gateway"], "razorpay");
    assert_eq!(handle["amount"], 224.0);

    order_id
}

#[tokio::test]
async fn signed_redirect_activates_the_subscription() {
    let app = TestApp::spawn_with(razorpay_config).await;
    let user_id = Uuid::new_v4();
    let order_id = create_and_checkout(&app, user_id).await;

    let signature = hmac_sha256_hex(RAZORPAY_KEY_SECRET, b"order_g1|pay_1").unwrap();
    let response = app
        .client
        .post(app.url("/payment/response"))
        .form(&[
            ("razorpay_order_id", "order_g1"),
            ("razorpay_payment_id", "pay_1"),
            ("razorpay_signature", signature.as_str()),
        ])
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["outcome"], "activated");
    let order = app.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
}

#[tokio::test]
async fn tampered_redirect_signature_is_rejected() {
    let app = TestApp::spawn_with(razorpay_config).await;
    let user_id = Uuid::new_v4();
    let order_id = create_and_checkout(&app, user_id).await;

    let signature = hmac_sha256_hex(RAZORPAY_KEY_SECRET, b"order_g1|pay_other").unwrap();
    let response = app
        .client
        .post(app.url("/payment/response"))
        .form(&[
            ("razorpay_order_id", "order_g1"),
            ("razorpay_payment_id", "pay_1"),
            ("razorpay_signature", signature.as_str()),
        ])
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 401);
    let order = app.store.get_order(order_id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
}
