//! Process-local store, used by tests and `database.backend = "memory"`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use mongodb::bson::DateTime;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::SubscriptionStore;
use crate::models::{Customer, Order, OrderStatus, Transaction, TransactionStatus, TransitionUpdate};

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    customers: HashMap<Uuid, Customer>,
    transactions: Vec<Transaction>,
    receipt_sequence: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_transaction_inserts: AtomicBool,
    fail_order_activation: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `insert_transaction` fail until switched off again.
    pub fn fail_transaction_inserts(&self, fail: bool) {
        self.fail_transaction_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make `activate_order` fail until switched off again.
    pub fn fail_order_activation(&self, fail: bool) {
        self.fail_order_activation.store(fail, Ordering::SeqCst);
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }
}

fn apply_transition(
    transaction: &mut Transaction,
    to: TransactionStatus,
    update: &TransitionUpdate,
    now: DateTime,
) {
    transaction.status = to;
    transaction.updated_at = now;
    if let Some(payment_id) = &update.payment_id {
        transaction.payment_id = Some(payment_id.clone());
    }
    if let Some(at) = update.payment_timestamp {
        transaction.payment_timestamp = Some(at);
    }
    if let Some(amount_paid) = update.amount_paid {
        transaction.amount_paid = amount_paid;
    }
    if let Some(amount_due) = update.amount_due {
        transaction.amount_due = amount_due;
    }
    if let Some(attempts) = update.attempts {
        transaction.attempts = attempts;
    }
    if let Some(pending) = update.activation_pending {
        transaction.activation_pending = pending;
    }
    transaction.needs_reverification = update.needs_reverification;
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.id) {
            bail!("order {} already exists", order.id);
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn upsert_customer(&self, customer: &Customer) -> Result<()> {
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id, customer.clone());
        Ok(())
    }

    async fn get_customer(&self, id: Uuid) -> Result<Option<Customer>> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }

    async fn claim_checkout_lease(
        &self,
        order_id: Uuid,
        now: DateTime,
        until: DateTime,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        let free = order.checkout_lease_until.map_or(true, |lease| lease <= now);
        if order.status != OrderStatus::Pending || !free {
            return Ok(false);
        }
        order.checkout_lease_until = Some(until);
        Ok(true)
    }

    async fn release_checkout_lease(&self, order_id: Uuid) -> Result<()> {
        if let Some(order) = self.state.lock().await.orders.get_mut(&order_id) {
            order.checkout_lease_until = None;
        }
        Ok(())
    }

    async fn activate_order(
        &self,
        order_id: Uuid,
        start: DateTime,
        expiry: DateTime,
    ) -> Result<bool> {
        if self.fail_order_activation.load(Ordering::SeqCst) {
            bail!("order store unavailable");
        }
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }
        order.status = OrderStatus::Completed;
        order.is_active = true;
        order.start_date = Some(start);
        order.expiration_date = Some(expiry);
        order.checkout_lease_until = None;
        Ok(true)
    }

    async fn completed_orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id && o.is_completed())
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.start_date, o.created_at));
        Ok(orders)
    }

    async fn deactivate_orders_except(&self, user_id: Uuid, keep: Option<Uuid>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for order in state.orders.values_mut() {
            if order.user_id == user_id
                && order.is_completed()
                && order.is_active
                && Some(order.id) != keep
            {
                order.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn set_order_inactive(&self, order_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(&order_id) {
            Some(order) if order.is_active => {
                order.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn next_receipt_sequence(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.receipt_sequence += 1;
        Ok(state.receipt_sequence)
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        if self.fail_transaction_inserts.load(Ordering::SeqCst) {
            bail!("transaction store unavailable");
        }
        let mut state = self.state.lock().await;
        if state.transactions.iter().any(|t| {
            t.gateway_order_id == transaction.gateway_order_id || t.receipt == transaction.receipt
        }) {
            bail!(
                "duplicate transaction for gateway order {}",
                transaction.gateway_order_id
            );
        }
        state.transactions.push(transaction.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn find_transaction_by_gateway_order_id(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| t.gateway_order_id == gateway_order_id)
            .cloned())
    }

    async fn open_transactions_for_order(
        &self,
        order_id: Uuid,
        since: DateTime,
    ) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.order_id == Some(order_id) && t.is_open() && t.created_at >= since)
            .cloned()
            .collect())
    }

    async fn transactions_for_user(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut transactions: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|t| t.user_id == Some(user_id))
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(transactions)
    }

    async fn reconcilable_transactions(&self, cutoff: DateTime) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| {
                (t.is_open() && t.created_at < cutoff)
                    || t.activation_pending
                    || t.needs_reverification
            })
            .cloned()
            .collect())
    }

    async fn transition_transaction(
        &self,
        id: Uuid,
        from: &[TransactionStatus],
        to: TransactionStatus,
        update: &TransitionUpdate,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.transactions.iter_mut().find(|t| t.id == id) {
            Some(transaction) if from.contains(&transaction.status) => {
                apply_transition(transaction, to, update, DateTime::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_activation_pending(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(transaction) = state.transactions.iter_mut().find(|t| t.id == id) {
            transaction.activation_pending = false;
        }
        Ok(())
    }

    async fn clear_needs_reverification(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(transaction) = state.transactions.iter_mut().find(|t| t.id == id) {
            transaction.needs_reverification = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayEnvironment;
    use crate::models::SubscriptionPeriod;
    use rust_decimal::Decimal;

    fn transaction(order_id: Uuid, gateway_order_id: &str) -> Transaction {
        let now = DateTime::now();
        Transaction {
            id: Uuid::new_v4(),
            gateway_order_id: gateway_order_id.to_string(),
            gateway: "cashfree".to_string(),
            environment: GatewayEnvironment::Sandbox,
            amount: Decimal::from(224),
            amount_due: Decimal::from(224),
            amount_paid: Decimal::ZERO,
            attempts: 0,
            currency: "INR".to_string(),
            entity: "order".to_string(),
            receipt: format!("receipt_{}", gateway_order_id),
            status: TransactionStatus::Created,
            created_at: now,
            updated_at: now,
            payment_timestamp: None,
            payment_id: None,
            order_id: Some(order_id),
            user_id: None,
            activation_pending: false,
            needs_reverification: false,
        }
    }

    #[tokio::test]
    async fn transition_is_guarded_by_current_status() {
        let store = MemoryStore::new();
        let tx = transaction(Uuid::new_v4(), "g1");
        store.insert_transaction(&tx).await.unwrap();

        let update = TransitionUpdate::default();
        assert!(store
            .transition_transaction(tx.id, &TransactionStatus::OPEN, TransactionStatus::Paid, &update)
            .await
            .unwrap());
        assert!(!store
            .transition_transaction(tx.id, &TransactionStatus::OPEN, TransactionStatus::Paid, &update)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn gateway_order_ids_are_unique() {
        let store = MemoryStore::new();
        let order_id = Uuid::new_v4();
        store.insert_transaction(&transaction(order_id, "g1")).await.unwrap();
        assert!(store
            .insert_transaction(&transaction(order_id, "g1"))
            .await
            .is_err());
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn activation_happens_once() {
        let store = MemoryStore::new();
        let order = Order::new_pending(Uuid::new_v4(), None, Decimal::from(224), SubscriptionPeriod::days(30));
        store.insert_order(&order).await.unwrap();

        let now = DateTime::now();
        let expiry = order.subscription_period.expiry_from(now);
        assert!(store.activate_order(order.id, now, expiry).await.unwrap());
        assert!(!store.activate_order(order.id, now, expiry).await.unwrap());
    }

    #[tokio::test]
    async fn lease_blocks_until_released_or_expired() {
        let store = MemoryStore::new();
        let order = Order::new_pending(Uuid::new_v4(), None, Decimal::from(224), SubscriptionPeriod::days(30));
        store.insert_order(&order).await.unwrap();

        let now = DateTime::now();
        let until = DateTime::from_millis(now.timestamp_millis() + 60_000);
        assert!(store.claim_checkout_lease(order.id, now, until).await.unwrap());
        assert!(!store.claim_checkout_lease(order.id, now, until).await.unwrap());

        let later = DateTime::from_millis(now.timestamp_millis() + 61_000);
        assert!(store.claim_checkout_lease(order.id, later, until).await.unwrap());

        store.release_checkout_lease(order.id).await.unwrap();
        assert!(store.claim_checkout_lease(order.id, now, until).await.unwrap());
    }

    #[tokio::test]
    async fn receipt_sequence_increases() {
        let store = MemoryStore::new();
        let a = store.next_receipt_sequence().await.unwrap();
        let b = store.next_receipt_sequence().await.unwrap();
        assert!(b > a);
    }
}
