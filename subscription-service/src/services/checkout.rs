//! Checkout: from an encoded order reference to a gateway order the
//! customer can pay.

use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::error::PaymentError;
use crate::gateway::{CreateGatewayOrder, GatewayEnvironment, PaymentGateway};
use crate::models::{
    compose_receipt, Customer, CustomerDetails, Order, OrderReference, Transaction,
    TransactionStatus,
};
use crate::services::metrics;
use crate::services::reconciliation::{ReconcileOutcome, ReconciliationHandler, Trigger};
use crate::store::SubscriptionStore;

/// Upper bound on how long one checkout may hold an order.
const CHECKOUT_LEASE: Duration = Duration::from_secs(60);

/// Everything a client needs to open the gateway's payment page.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutHandle {
    pub transaction_id: Uuid,
    pub order_id: Uuid,
    pub gateway: &'static str,
    pub gateway_order_id: String,
    pub receipt: String,
    pub key_id: String,
    pub environment: GatewayEnvironment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub customer: CustomerDetails,
    pub return_url: String,
}

fn millis_after(at: DateTime, duration: Duration) -> DateTime {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    DateTime::from_millis(at.timestamp_millis().saturating_add(millis))
}

fn millis_before(at: DateTime, duration: Duration) -> DateTime {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    DateTime::from_millis(at.timestamp_millis().saturating_sub(millis))
}

pub struct CheckoutOrchestrator {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<ReconciliationHandler>,
    config: CheckoutConfig,
    references: OrderReference,
}

impl CheckoutOrchestrator {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<ReconciliationHandler>,
        config: CheckoutConfig,
    ) -> Self {
        let references = OrderReference::new(config.reference_prefix.clone());
        Self {
            store,
            gateway,
            reconciler,
            config,
            references,
        }
    }

    /// Start a checkout for the order behind `reference`.
    ///
    /// `user` is the authenticated caller when known; the order must be
    /// theirs. At most one gateway order is created per order inside the
    /// duplicate window.
    pub async fn initiate_checkout(
        &self,
        reference: &str,
        user: Option<Uuid>,
    ) -> Result<CheckoutHandle, PaymentError> {
        let order_id = self.references.decode(reference)?;
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::InvalidOrder("order not found".to_string()))?;

        if let Some(user) = user {
            if order.user_id != user {
                tracing::warn!(
                    order_id = %order.id,
                    user_id = %user,
                    "Checkout attempted for another user's order"
                );
                return Err(PaymentError::OrderNotOwned);
            }
        }
        if order.is_completed() {
            return Err(PaymentError::OrderAlreadyCompleted);
        }

        let now = DateTime::now();
        if !self
            .store
            .claim_checkout_lease(order.id, now, millis_after(now, CHECKOUT_LEASE))
            .await?
        {
            let completed = self
                .store
                .get_order(order.id)
                .await?
                .is_some_and(|o| o.is_completed());
            metrics::record_checkout(self.gateway.name(), "duplicate");
            return Err(if completed {
                PaymentError::OrderAlreadyCompleted
            } else {
                PaymentError::DuplicateCheckout {
                    retry_after_secs: CHECKOUT_LEASE.as_secs(),
                }
            });
        }

        let result = self.checkout_holding_lease(&order, now).await;

        if let Err(err) = self.store.release_checkout_lease(order.id).await {
            tracing::warn!(order_id = %order.id, error = %err, "Failed to release checkout lease");
        }

        let outcome = match &result {
            Ok(_) => "created",
            Err(PaymentError::DuplicateCheckout { .. }) => "duplicate",
            Err(PaymentError::Gateway(_)) => "gateway_error",
            Err(PaymentError::Store(_)) => "store_error",
            Err(_) => "rejected",
        };
        metrics::record_checkout(self.gateway.name(), outcome);
        result
    }

    async fn checkout_holding_lease(
        &self,
        order: &Order,
        now: DateTime,
    ) -> Result<CheckoutHandle, PaymentError> {
        self.ensure_no_recent_attempt(order, now).await?;

        let sequence = self.store.next_receipt_sequence().await?;
        let receipt = compose_receipt(sequence, &mut rand::thread_rng());

        let customer = self.customer_details(order).await?;
        let request = CreateGatewayOrder {
            receipt: receipt.clone(),
            amount: order.subscription_amount,
            currency: self.config.currency.clone(),
            order_tag: order.id,
            customer: customer.clone(),
            return_url: self.config.return_url(),
        };

        let created = self.gateway.create_order(&request).await.map_err(|err| {
            tracing::error!(
                order_id = %order.id,
                receipt = %receipt,
                error = %err,
                "Gateway order creation failed"
            );
            PaymentError::Gateway(err)
        })?;

        // An older attempt may have completed the order during the call.
        let completed = self
            .store
            .get_order(order.id)
            .await?
            .map_or(false, |current| current.is_completed());
        if completed {
            tracing::warn!(
                order_id = %order.id,
                gateway_order_id = %created.gateway_order_id,
                "Order completed during checkout, gateway order discarded"
            );
            return Err(PaymentError::OrderAlreadyCompleted);
        }

        let created_at = DateTime::now();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            gateway_order_id: created.gateway_order_id.clone(),
            gateway: self.gateway.name().to_string(),
            environment: self.gateway.environment(),
            amount: order.subscription_amount,
            amount_due: order.subscription_amount,
            amount_paid: Decimal::ZERO,
            attempts: 0,
            currency: self.config.currency.clone(),
            entity: created.entity.clone(),
            receipt: receipt.clone(),
            status: TransactionStatus::Created,
            created_at,
            updated_at: created_at,
            payment_timestamp: None,
            payment_id: None,
            order_id: Some(order.id),
            user_id: Some(order.user_id),
            activation_pending: false,
            needs_reverification: false,
        };

        if let Err(err) = self.store.insert_transaction(&transaction).await {
            // The gateway order exists without a local record. A callback for
            // it is matched back to the order through its tag.
            tracing::error!(
                order_id = %order.id,
                gateway_order_id = %created.gateway_order_id,
                receipt = %receipt,
                error = %err,
                "Orphaned gateway order: transaction could not be persisted"
            );
            return Err(PaymentError::Store(err));
        }

        tracing::info!(
            transaction_id = %transaction.id,
            order_id = %order.id,
            gateway_order_id = %transaction.gateway_order_id,
            amount = %transaction.amount,
            environment = transaction.environment.as_str(),
            "Checkout initiated"
        );

        Ok(CheckoutHandle {
            transaction_id: transaction.id,
            order_id: order.id,
            gateway: self.gateway.name(),
            gateway_order_id: created.gateway_order_id,
            receipt,
            key_id: self.gateway.key_id().to_string(),
            environment: transaction.environment,
            session_token: created.session_token,
            redirect_url: created.redirect_url,
            amount: transaction.amount,
            currency: transaction.currency,
            customer,
            return_url: request.return_url,
        })
    }

    /// Reject the checkout if an earlier attempt on this order is still open.
    ///
    /// Earlier attempts are re-verified first: one may have been paid or
    /// abandoned since.
    async fn ensure_no_recent_attempt(
        &self,
        order: &Order,
        now: DateTime,
    ) -> Result<(), PaymentError> {
        let window = self.config.duplicate_window();
        let recent = self
            .store
            .open_transactions_for_order(order.id, millis_before(now, window))
            .await?;

        let mut newest_open: Option<DateTime> = None;
        for transaction in recent {
            let created_at = transaction.created_at;
            let still_open = match self
                .reconciler
                .reconcile_transaction(&transaction, Trigger::Checkout)
                .await
            {
                Ok(ReconcileOutcome::Activated(_)) => {
                    return Err(PaymentError::OrderAlreadyCompleted);
                }
                Ok(outcome) => outcome.transaction().is_open(),
                Err(err) => {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        error = %err,
                        "Could not re-verify earlier checkout attempt"
                    );
                    true
                }
            };
            if still_open {
                newest_open = newest_open.max(Some(created_at));
            }
        }

        let Some(newest) = newest_open else {
            return Ok(());
        };

        let elapsed_ms = now.timestamp_millis() - newest.timestamp_millis();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let retry_after_secs = u64::try_from((window_ms - elapsed_ms).max(1_000) / 1_000).unwrap_or(1);

        tracing::info!(
            order_id = %order.id,
            retry_after_secs,
            "Payment already initiated for this order"
        );
        Err(PaymentError::DuplicateCheckout { retry_after_secs })
    }

    async fn customer_details(&self, order: &Order) -> Result<CustomerDetails, PaymentError> {
        let customer = self
            .store
            .get_customer(order.user_id)
            .await?
            .or_else(|| {
                order.mobile_number.as_ref().map(|mobile| Customer {
                    id: order.user_id,
                    first_name: None,
                    email: None,
                    mobile_number: Some(mobile.clone()),
                })
            });
        Ok(CustomerDetails::from_customer(
            order.user_id,
            customer.as_ref(),
        ))
    }
}
