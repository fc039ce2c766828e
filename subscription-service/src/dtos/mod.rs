use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::gateway::GatewayEnvironment;
use crate::models::{Order, OrderStatus, Transaction, TransactionStatus};
use crate::services::{CreatedOrder, ReconcileOutcome};

fn to_utc(at: mongodb::bson::DateTime) -> DateTime<Utc> {
    at.to_chrono()
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub period_days: u32,
    pub status: OrderStatus,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            amount: order.subscription_amount,
            period_days: order.subscription_period.as_days(),
            status: order.status,
            is_active: order.is_active,
            created_at: to_utc(order.created_at),
            start_date: order.start_date.map(to_utc),
            expiration_date: order.expiration_date.map(to_utc),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    #[serde(flatten)]
    pub order: OrderResponse,
    pub reference: String,
    pub checkout_url: String,
}

impl From<&CreatedOrder> for CreateOrderResponse {
    fn from(created: &CreatedOrder) -> Self {
        Self {
            order: OrderResponse::from(&created.order),
            reference: created.reference.clone(),
            checkout_url: created.checkout_url.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub active: bool,
    pub subscription: Option<OrderResponse>,
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub gateway: String,
    pub gateway_order_id: String,
    pub environment: GatewayEnvironment,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_paid: Decimal,
    pub currency: String,
    pub receipt: String,
    pub status: TransactionStatus,
    pub payment_id: Option<String>,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub payment_timestamp: Option<DateTime<Utc>>,
}

impl From<&Transaction> for TransactionResponse {
    fn from(transaction: &Transaction) -> Self {
        Self {
            id: transaction.id,
            gateway: transaction.gateway.clone(),
            gateway_order_id: transaction.gateway_order_id.clone(),
            environment: transaction.environment,
            amount: transaction.amount,
            amount_paid: transaction.amount_paid,
            currency: transaction.currency.clone(),
            receipt: transaction.receipt.clone(),
            status: transaction.status,
            payment_id: transaction.payment_id.clone(),
            order_id: transaction.order_id,
            created_at: to_utc(transaction.created_at),
            payment_timestamp: transaction.payment_timestamp.map(to_utc),
        }
    }
}

/// Acknowledgement sent back to a redirect or webhook caller.
#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub outcome: &'static str,
    pub gateway_order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransactionStatus>,
}

impl CallbackResponse {
    pub fn unknown(gateway_order_id: String) -> Self {
        Self {
            outcome: "unknown_transaction",
            gateway_order_id,
            transaction_id: None,
            status: None,
        }
    }

    pub fn ignored() -> Self {
        Self {
            outcome: "ignored",
            gateway_order_id: String::new(),
            transaction_id: None,
            status: None,
        }
    }
}

impl From<&ReconcileOutcome> for CallbackResponse {
    fn from(outcome: &ReconcileOutcome) -> Self {
        let transaction = outcome.transaction();
        Self {
            outcome: outcome.as_str(),
            gateway_order_id: transaction.gateway_order_id.clone(),
            transaction_id: Some(transaction.id),
            status: Some(transaction.status),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub changed: usize,
}
