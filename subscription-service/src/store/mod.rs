//! Persistence for orders, customers and transactions.
//!
//! Every state change that matters goes through a conditional write: the
//! store applies it only if the record is still in the expected state and
//! reports whether it did. A `false` means somebody else got there first.

mod memory;
mod mongo;

use anyhow::Result;
use async_trait::async_trait;
use mongodb::bson::DateTime;
use uuid::Uuid;

use crate::models::{Customer, Order, Transaction, TransactionStatus, TransitionUpdate};

pub use memory::MemoryStore;
pub use mongo::MongoStore;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn insert_order(&self, order: &Order) -> Result<()>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>>;

    async fn upsert_customer(&self, customer: &Customer) -> Result<()>;

    async fn get_customer(&self, id: Uuid) -> Result<Option<Customer>>;

    /// Take the checkout lease on a pending order whose lease is free or
    /// expired at `now`.
    async fn claim_checkout_lease(&self, order_id: Uuid, now: DateTime, until: DateTime)
        -> Result<bool>;

    async fn release_checkout_lease(&self, order_id: Uuid) -> Result<()>;

    /// pending -> completed + active. Only one caller ever sees `true`.
    async fn activate_order(&self, order_id: Uuid, start: DateTime, expiry: DateTime)
        -> Result<bool>;

    /// Completed orders of `user_id`, earliest start first.
    async fn completed_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>>;

    /// Deactivate every completed order of `user_id` other than `keep`.
    async fn deactivate_orders_except(&self, user_id: Uuid, keep: Option<Uuid>) -> Result<u64>;

    async fn set_order_inactive(&self, order_id: Uuid) -> Result<bool>;

    /// Strictly increasing across calls and processes.
    async fn next_receipt_sequence(&self) -> Result<u64>;

    /// Fails if the gateway order id or receipt is already taken.
    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()>;

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    async fn find_transaction_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<Transaction>>;

    /// Created/attempted transactions of an order created at or after `since`.
    async fn open_transactions_for_order(
        &self,
        order_id: Uuid,
        since: DateTime,
    ) -> Result<Vec<Transaction>>;

    /// Newest first.
    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>>;

    /// Open transactions created before `cutoff`, plus any flagged
    /// `activation_pending` or `needs_reverification` regardless of age.
    async fn reconcilable_transactions(&self, cutoff: DateTime) -> Result<Vec<Transaction>>;

    /// Move a transaction to `to` if its status is one of `from`.
    async fn transition_transaction(
        &self,
        id: Uuid,
        from: &[TransactionStatus],
        to: TransactionStatus,
        update: &TransitionUpdate,
    ) -> Result<bool>;

    async fn clear_activation_pending(&self, id: Uuid) -> Result<()>;

    async fn clear_needs_reverification(&self, id: Uuid) -> Result<()>;
}
