mod common;

use common::{cashfree_order, TestContext};
use mongodb::bson::DateTime;
use std::time::Duration;
use subscription_service::error::PaymentError;
use subscription_service::models::TransactionStatus;
use subscription_service::store::SubscriptionStore;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn checkout_creates_one_transaction() {
    let ctx = TestContext::new().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    ctx.mock_create("g1", created.order.id).await;

    let handle = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("Checkout failed");

    assert_eq!(handle.gateway, "cashfree");
    assert_eq!(handle.gateway_order_id, "g1");
    assert_eq!(handle.session_token.as_deref(), Some("session_g1"));
    assert_eq!(handle.order_id, created.order.id);
    assert_eq!(handle.currency, "INR");
    assert!(handle.receipt.starts_with("receipt"));

    let transaction = ctx
        .store
        .find_transaction_by_gateway_order_id("g1")
        .await
        .unwrap()
        .expect("Transaction was not stored");
    assert_eq!(transaction.status, TransactionStatus::Created);
    assert_eq!(transaction.order_id, Some(created.order.id));
    assert_eq!(transaction.user_id, Some(user_id));
    assert_eq!(transaction.amount, created.order.subscription_amount);
    assert_eq!(transaction.receipt, handle.receipt);
}

#[tokio::test]
async fn second_checkout_inside_window_is_rejected() {
    let ctx = TestContext::new().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    ctx.mock_create("g1", created.order.id).await;
    ctx.mock_status("g1", "ACTIVE", created.order.id).await;

    ctx.state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("First checkout failed");

    let second = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await;

    match second {
        Err(PaymentError::DuplicateCheckout { retry_after_secs }) => {
            assert!(retry_after_secs > 0 && retry_after_secs <= 600);
        }
        other => panic!("Expected DuplicateCheckout, got {:?}", other),
    }
    assert_eq!(ctx.store.transaction_count().await, 1);
}

#[tokio::test]
async fn failed_attempt_does_not_block_a_new_checkout() {
    let ctx = TestContext::new().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    ctx.mock_create("g1", created.order.id).await;
    ctx.mock_status("g1", "EXPIRED", created.order.id).await;

    ctx.state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("First checkout failed");

    ctx.reset_gateway().await;
    ctx.mock_create("g2", created.order.id).await;
    ctx.mock_status("g1", "EXPIRED", created.order.id).await;

    let handle = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("Retry after a failed attempt should be allowed");

    assert_eq!(handle.gateway_order_id, "g2");
    let first = ctx
        .store
        .find_transaction_by_gateway_order_id("g1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, TransactionStatus::Failed);
    assert_eq!(ctx.store.transaction_count().await, 2);
}

#[tokio::test]
async fn gateway_failure_leaves_no_transaction() {
    let ctx = TestContext::new().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;

    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream unavailable"))
        .mount(&ctx.gateway)
        .await;

    let result = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await;

    assert!(matches!(result, Err(PaymentError::Gateway(_))));
    assert_eq!(ctx.store.transaction_count().await, 0);

    // The lease is released, so the customer can try again.
    ctx.reset_gateway().await;
    ctx.mock_create("g1", created.order.id).await;
    let handle = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .expect("Retry after gateway failure failed");
    assert_eq!(handle.gateway_order_id, "g1");
}

#[tokio::test]
async fn checkout_is_limited_to_the_order_owner() {
    let ctx = TestContext::new().await;
    let owner = Uuid::new_v4();
    let created = ctx.create_order(owner).await;

    let result = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(Uuid::new_v4()))
        .await;

    assert!(matches!(result, Err(PaymentError::OrderNotOwned)));
    assert_eq!(ctx.store.transaction_count().await, 0);
}

#[tokio::test]
async fn malformed_reference_is_rejected() {
    let ctx = TestContext::new().await;

    let result = ctx
        .state
        .checkout
        .initiate_checkout("not-a-reference", None)
        .await;

    assert!(matches!(result, Err(PaymentError::InvalidOrder(_))));
}

#[tokio::test]
async fn completed_order_cannot_be_checked_out_again() {
    let ctx = TestContext::new().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    ctx.mock_create("g1", created.order.id).await;
    ctx.mock_status("g1", "PAID", created.order.id).await;

    ctx.state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await
        .unwrap();
    ctx.state
        .reconciler
        .handle_callback(subscription_service::gateway::CallbackPayload {
            gateway_order_id: "g1".to_string(),
            asserted_status: Some("PAID".to_string()),
            payment_id: None,
        })
        .await
        .unwrap();

    let result = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await;
    assert!(matches!(result, Err(PaymentError::OrderAlreadyCompleted)));
}

#[tokio::test]
async fn orphaned_gateway_order_is_logged_and_reported() {
    let ctx = TestContext::new().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    ctx.mock_create("g1", created.order.id).await;
    ctx.store.fail_transaction_inserts(true);

    let result = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id))
        .await;

    assert!(matches!(result, Err(PaymentError::Store(_))));
    assert_eq!(ctx.store.transaction_count().await, 0);
}

#[tokio::test]
async fn order_completed_during_checkout_is_not_handed_out() {
    let ctx = TestContext::new().await;
    let user_id = Uuid::new_v4();
    let created = ctx.create_order(user_id).await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(cashfree_order("g2", "ACTIVE", created.order.id))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&ctx.gateway)
        .await;

    let checkout = ctx
        .state
        .checkout
        .initiate_checkout(&created.reference, Some(user_id));
    let complete = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = DateTime::now();
        let expiry = created.order.subscription_period.expiry_from(start);
        ctx.store
            .activate_order(created.order.id, start, expiry)
            .await
            .unwrap()
    };
    let (result, activated) = tokio::join!(checkout, complete);

    assert!(activated);
    assert!(matches!(result, Err(PaymentError::OrderAlreadyCompleted)));
    assert_eq!(ctx.store.transaction_count().await, 0);
}
