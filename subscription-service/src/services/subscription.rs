//! Order intents and the user's subscription window.

use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::config::CheckoutConfig;
use crate::error::PaymentError;
use crate::models::{Customer, Order, OrderReference, SubscriptionPeriod, Transaction};
use crate::services::reconciliation::{ReconciliationHandler, Trigger};
use crate::store::SubscriptionStore;

/// Longest period an order may buy.
pub const MAX_PERIOD_DAYS: u32 = 3660;

/// Largest amount, in major currency units, an order may carry.
pub const MAX_AMOUNT: i64 = 10_000_000;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub amount: Decimal,
    #[validate(range(min = 1, max = 3660, message = "Period must be between 1 and 3660 days"))]
    pub period_days: u32,
    #[validate(length(min = 10, max = 15, message = "Mobile number must be 10 to 15 characters"))]
    pub mobile_number: Option<String>,
    #[validate(length(min = 1, max = 100, message = "Name cannot be empty"))]
    pub first_name: Option<String>,
    #[validate(email(message = "Invalid email address"))]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GrantRequest {
    #[serde(default)]
    pub amount: Decimal,
    #[validate(range(min = 1, max = 3660, message = "Period must be between 1 and 3660 days"))]
    pub period_days: u32,
}

fn ensure_amount(amount: Decimal, allow_zero: bool) -> Result<(), ValidationErrors> {
    let message = if amount > Decimal::from(MAX_AMOUNT) {
        format!("Amount cannot exceed {}", MAX_AMOUNT)
    } else if amount > Decimal::ZERO || (allow_zero && amount == Decimal::ZERO) {
        return Ok(());
    } else {
        "Amount must be positive".to_string()
    };
    let mut errors = ValidationErrors::new();
    let mut error = ValidationError::new("amount");
    error.message = Some(message.into());
    errors.add("amount", error);
    Err(errors)
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order: Order,
    pub reference: String,
    pub checkout_url: String,
}

/// Pick the order that counts as the user's subscription at `now`.
///
/// The earliest-starting current order wins; failing that the
/// earliest-starting upcoming one.
pub fn select_subscription(orders: &[Order], now: DateTime) -> Option<&Order> {
    orders
        .iter()
        .filter(|o| o.is_current_at(now))
        .min_by_key(|o| o.start_date)
        .or_else(|| {
            orders
                .iter()
                .filter(|o| o.is_upcoming_at(now))
                .min_by_key(|o| o.start_date)
        })
}

pub struct SubscriptionLedger {
    store: Arc<dyn SubscriptionStore>,
    reconciler: Arc<ReconciliationHandler>,
    config: CheckoutConfig,
    references: OrderReference,
}

impl SubscriptionLedger {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        reconciler: Arc<ReconciliationHandler>,
        config: CheckoutConfig,
    ) -> Self {
        let references = OrderReference::new(config.reference_prefix.clone());
        Self {
            store,
            reconciler,
            config,
            references,
        }
    }

    pub async fn create_order(
        &self,
        user_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<CreatedOrder, PaymentError> {
        request.validate()?;
        ensure_amount(request.amount, false)?;

        if self.current_subscription(user_id).await?.is_some() {
            return Err(PaymentError::AlreadySubscribed);
        }

        if request.first_name.is_some() || request.email.is_some() || request.mobile_number.is_some() {
            let existing = self.store.get_customer(user_id).await?;
            let customer = Customer {
                id: user_id,
                first_name: request
                    .first_name
                    .clone()
                    .or_else(|| existing.as_ref().and_then(|c| c.first_name.clone())),
                email: request
                    .email
                    .clone()
                    .or_else(|| existing.as_ref().and_then(|c| c.email.clone())),
                mobile_number: request
                    .mobile_number
                    .clone()
                    .or_else(|| existing.as_ref().and_then(|c| c.mobile_number.clone())),
            };
            self.store.upsert_customer(&customer).await?;
        }

        let order = Order::new_pending(
            user_id,
            request.mobile_number,
            request.amount,
            SubscriptionPeriod::days(request.period_days),
        );
        self.store.insert_order(&order).await?;

        let reference = self.references.encode(order.id);
        tracing::info!(
            order_id = %order.id,
            user_id = %user_id,
            amount = %order.subscription_amount,
            period_days = request.period_days,
            "Subscription order created"
        );

        Ok(CreatedOrder {
            checkout_url: self.config.checkout_url(&reference),
            reference,
            order,
        })
    }

    /// The user's subscription right now, after deactivating every other
    /// completed order so at most one stays active.
    pub async fn current_subscription(&self, user_id: Uuid) -> Result<Option<Order>, PaymentError> {
        let orders = self.store.completed_orders_for_user(user_id).await?;
        let keep = select_subscription(&orders, DateTime::now()).cloned();

        let deactivated = self
            .store
            .deactivate_orders_except(user_id, keep.as_ref().map(|o| o.id))
            .await?;
        if deactivated > 0 {
            tracing::info!(
                user_id = %user_id,
                deactivated,
                kept = ?keep.as_ref().map(|o| o.id),
                "Deactivated superseded subscription orders"
            );
        }

        Ok(keep)
    }

    /// Transactions of the user, newest first, with open ones re-verified.
    pub async fn transaction_history(&self, user_id: Uuid) -> Result<Vec<Transaction>, PaymentError> {
        let transactions = self.store.transactions_for_user(user_id).await?;

        let mut refreshed = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            if !transaction.is_open() {
                refreshed.push(transaction);
                continue;
            }
            match self
                .reconciler
                .reconcile_transaction(&transaction, Trigger::History)
                .await
            {
                Ok(outcome) => refreshed.push(outcome.into_transaction()),
                Err(err) => {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        error = %err,
                        "Could not refresh transaction"
                    );
                    refreshed.push(transaction);
                }
            }
        }
        Ok(refreshed)
    }

    /// Give a user a subscription without payment.
    pub async fn grant(&self, user_id: Uuid, request: GrantRequest) -> Result<Order, PaymentError> {
        request.validate()?;
        ensure_amount(request.amount, true)?;

        if self.current_subscription(user_id).await?.is_some() {
            return Err(PaymentError::AlreadySubscribed);
        }

        let order = Order::new_completed(
            user_id,
            request.amount,
            SubscriptionPeriod::days(request.period_days),
            DateTime::now(),
        );
        self.store.insert_order(&order).await?;

        tracing::info!(
            order_id = %order.id,
            user_id = %user_id,
            period_days = request.period_days,
            "Subscription granted"
        );
        Ok(order)
    }

    pub async fn deactivate(&self, user_id: Uuid) -> Result<Order, PaymentError> {
        let Some(mut order) = self.current_subscription(user_id).await? else {
            return Err(PaymentError::InvalidOrder(
                "user has no active subscription".to_string(),
            ));
        };

        self.store.set_order_inactive(order.id).await?;
        order.is_active = false;

        tracing::info!(order_id = %order.id, user_id = %user_id, "Subscription deactivated");
        Ok(order)
    }
}
