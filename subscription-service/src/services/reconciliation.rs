//! Turning gateway evidence into transaction and order state.
//!
//! A transaction reaches `paid` through one guarded write. Whoever wins that
//! write also activates the order; everyone else gets the stored record back
//! as [`ReconcileOutcome::AlreadyReconciled`]. Paid transactions carry
//! `activation_pending` until the order activation is confirmed, so a crash
//! between the two writes is finished by the next callback or sweep.

use axum::http::StatusCode;
use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::PaymentError;
use crate::gateway::{CallbackPayload, GatewayError, GatewayOrderStatus, GatewayStatus, PaymentGateway};
use crate::models::{Transaction, TransactionStatus, TransitionUpdate};
use crate::services::metrics;
use crate::store::SubscriptionStore;

/// What started a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Callback,
    Checkout,
    History,
    Sweep,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Callback => "callback",
            Trigger::Checkout => "checkout",
            Trigger::History => "history",
            Trigger::Sweep => "sweep",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// This call moved the transaction to paid or finished its order activation.
    Activated(Transaction),
    /// Nothing left to do; carries the stored record.
    AlreadyReconciled(Transaction),
    /// This call moved the transaction to failed.
    Failed(Transaction),
    /// This call moved the transaction to attempted.
    Progressed(Transaction),
    /// The gateway has nothing final to say yet.
    Pending(Transaction),
}

impl ReconcileOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            ReconcileOutcome::Activated(t)
            | ReconcileOutcome::AlreadyReconciled(t)
            | ReconcileOutcome::Failed(t)
            | ReconcileOutcome::Progressed(t)
            | ReconcileOutcome::Pending(t) => t,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            ReconcileOutcome::Activated(t)
            | ReconcileOutcome::AlreadyReconciled(t)
            | ReconcileOutcome::Failed(t)
            | ReconcileOutcome::Progressed(t)
            | ReconcileOutcome::Pending(t) => t,
        }
    }

    /// Whether this call changed stored state.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Activated(_) | ReconcileOutcome::Failed(_) | ReconcileOutcome::Progressed(_)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Activated(_) => "activated",
            ReconcileOutcome::AlreadyReconciled(_) => "already_reconciled",
            ReconcileOutcome::Failed(_) => "failed",
            ReconcileOutcome::Progressed(_) => "progressed",
            ReconcileOutcome::Pending(_) => "pending",
        }
    }
}

/// Where a status came from.
enum Evidence {
    Verified(GatewayOrderStatus),
    Asserted(GatewayStatus),
}

impl Evidence {
    fn status(&self) -> GatewayStatus {
        match self {
            Evidence::Verified(verified) => verified.status,
            Evidence::Asserted(status) => *status,
        }
    }

    fn verified(&self) -> Option<&GatewayOrderStatus> {
        match self {
            Evidence::Verified(verified) => Some(verified),
            Evidence::Asserted(_) => None,
        }
    }
}

pub struct ReconciliationHandler {
    store: Arc<dyn SubscriptionStore>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl ReconciliationHandler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into(),
        }
    }

    /// Apply a redirect or webhook callback.
    ///
    /// The asserted status is only used when the gateway cannot be asked.
    pub async fn handle_callback(
        &self,
        payload: CallbackPayload,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let gateway_order_id = payload.gateway_order_id.trim();
        if gateway_order_id.is_empty() {
            return Err(PaymentError::InvalidOrder(
                "callback without gateway order id".to_string(),
            ));
        }

        tracing::info!(
            gateway_order_id = %gateway_order_id,
            asserted_status = ?payload.asserted_status,
            "Processing payment callback"
        );

        let (transaction, prefetched) = match self
            .store
            .find_transaction_by_gateway_order_id(gateway_order_id)
            .await?
        {
            Some(transaction) => (transaction, None),
            None => match self.adopt_orphan(gateway_order_id).await? {
                Some((transaction, verified)) => (transaction, Some(verified)),
                None => {
                    tracing::warn!(
                        gateway_order_id = %gateway_order_id,
                        "Callback for unknown gateway order"
                    );
                    metrics::record_reconciliation(Trigger::Callback.as_str(), "unknown");
                    return Err(PaymentError::UnknownTransaction {
                        gateway_order_id: gateway_order_id.to_string(),
                    });
                }
            },
        };

        self.reconcile(transaction, Some(&payload), prefetched, Trigger::Callback)
            .await
    }

    /// Re-verify one transaction against the gateway.
    pub async fn reconcile_transaction(
        &self,
        transaction: &Transaction,
        trigger: Trigger,
    ) -> Result<ReconcileOutcome, PaymentError> {
        self.reconcile(transaction.clone(), None, None, trigger).await
    }

    /// Sweep open transactions older than `max_age`, plus anything flagged
    /// for follow-up. Returns how many transactions changed state.
    pub async fn reconcile_stale(&self, max_age: Duration) -> Result<usize, PaymentError> {
        let now = DateTime::now().timestamp_millis();
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = DateTime::from_millis(now.saturating_sub(max_age_ms));

        let candidates = self.store.reconcilable_transactions(cutoff).await?;
        let total = candidates.len();
        let mut changed = 0;

        for transaction in candidates {
            let id = transaction.id;
            match self.reconcile(transaction, None, None, Trigger::Sweep).await {
                Ok(outcome) if outcome.changed() => changed += 1,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        transaction_id = %id,
                        error = %err,
                        "Reconciliation failed, will retry on next sweep"
                    );
                }
            }
        }

        if total > 0 {
            tracing::info!(candidates = total, changed, "Stale transaction sweep finished");
        }
        Ok(changed)
    }

    async fn reconcile(
        &self,
        transaction: Transaction,
        callback: Option<&CallbackPayload>,
        prefetched: Option<GatewayOrderStatus>,
        trigger: Trigger,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let outcome = if transaction.status.is_terminal() {
            self.follow_up_terminal(transaction, prefetched).await?
        } else {
            self.advance_open(transaction, callback, prefetched).await?
        };

        metrics::record_reconciliation(trigger.as_str(), outcome.as_str());
        tracing::debug!(
            transaction_id = %outcome.transaction().id,
            status = outcome.transaction().status.as_str(),
            outcome = outcome.as_str(),
            trigger = trigger.as_str(),
            "Reconciliation finished"
        );
        Ok(outcome)
    }

    /// Finish a pending activation and settle a pending re-verification.
    async fn follow_up_terminal(
        &self,
        transaction: Transaction,
        prefetched: Option<GatewayOrderStatus>,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let mut activated = false;
        if transaction.status == TransactionStatus::Paid && transaction.activation_pending {
            activated = self.finish_activation(&transaction).await?;
        }

        if transaction.needs_reverification {
            let verified = match prefetched {
                Some(verified) => Ok(verified),
                None => self.gateway.fetch_order_status(&transaction.gateway_order_id).await,
            };
            match verified {
                Ok(verified) => {
                    if TransactionStatus::target_for(verified.status) != Some(transaction.status) {
                        tracing::error!(
                            transaction_id = %transaction.id,
                            gateway_order_id = %transaction.gateway_order_id,
                            local_status = transaction.status.as_str(),
                            gateway_status = ?verified.raw_status,
                            "Gateway contradicts a settled transaction"
                        );
                        metrics::record_mismatch();
                    }
                    self.store.clear_needs_reverification(transaction.id).await?;
                }
                Err(err) => {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        error = %err,
                        "Transaction still awaiting re-verification"
                    );
                }
            }
        }

        let current = self.reload(transaction).await?;
        Ok(if activated {
            ReconcileOutcome::Activated(current)
        } else {
            ReconcileOutcome::AlreadyReconciled(current)
        })
    }

    async fn advance_open(
        &self,
        transaction: Transaction,
        callback: Option<&CallbackPayload>,
        prefetched: Option<GatewayOrderStatus>,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let verified = match prefetched {
            Some(verified) => Ok(verified),
            None => self.gateway.fetch_order_status(&transaction.gateway_order_id).await,
        };

        let evidence = match verified {
            Ok(verified) => Evidence::Verified(verified),
            Err(err) => {
                let asserted = callback.map(CallbackPayload::asserted);
                match asserted {
                    Some(status) if status != GatewayStatus::Unknown => {
                        tracing::warn!(
                            transaction_id = %transaction.id,
                            gateway_order_id = %transaction.gateway_order_id,
                            asserted = ?status,
                            error = %err,
                            "Gateway verification failed, applying asserted status"
                        );
                        Evidence::Asserted(status)
                    }
                    _ => {
                        tracing::warn!(
                            transaction_id = %transaction.id,
                            gateway_order_id = %transaction.gateway_order_id,
                            error = %err,
                            "Gateway verification failed"
                        );
                        return Ok(ReconcileOutcome::Pending(transaction));
                    }
                }
            }
        };

        let target = match TransactionStatus::target_for(evidence.status()) {
            Some(target) if transaction.status.can_transition_to(target) => target,
            _ => return Ok(ReconcileOutcome::Pending(transaction)),
        };

        let payment_id = evidence
            .verified()
            .and_then(|v| v.payment_id.clone())
            .or_else(|| callback.and_then(|c| c.payment_id.clone()));
        let attempts = evidence.verified().and_then(|v| v.attempts);
        let from_assertion = matches!(evidence, Evidence::Asserted(_));

        match target {
            TransactionStatus::Paid => {
                let amount_paid = evidence
                    .verified()
                    .and_then(|v| v.amount_paid)
                    .unwrap_or(transaction.amount);
                if amount_paid != transaction.amount {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        expected = %transaction.amount,
                        paid = %amount_paid,
                        "Paid amount differs from order amount"
                    );
                }

                let update = TransitionUpdate {
                    payment_id,
                    payment_timestamp: Some(DateTime::now()),
                    amount_paid: Some(amount_paid),
                    amount_due: Some(Decimal::ZERO),
                    attempts,
                    activation_pending: Some(transaction.order_id.is_some()),
                    needs_reverification: from_assertion,
                };
                self.mark_paid(transaction, update).await
            }
            TransactionStatus::Failed => {
                let update = TransitionUpdate {
                    payment_timestamp: payment_id.as_ref().map(|_| DateTime::now()),
                    payment_id,
                    attempts,
                    needs_reverification: from_assertion,
                    ..Default::default()
                };
                self.transition(transaction, TransactionStatus::Failed, update)
                    .await
                    .map(|changed| {
                        changed.map_or_else(
                            ReconcileOutcome::AlreadyReconciled,
                            ReconcileOutcome::Failed,
                        )
                    })
            }
            _ => {
                let update = TransitionUpdate {
                    payment_id,
                    attempts,
                    needs_reverification: from_assertion,
                    ..Default::default()
                };
                self.transition(transaction, target, update)
                    .await
                    .map(|changed| {
                        changed.map_or_else(
                            |current| {
                                if current.status.is_terminal() {
                                    ReconcileOutcome::AlreadyReconciled(current)
                                } else {
                                    ReconcileOutcome::Pending(current)
                                }
                            },
                            ReconcileOutcome::Progressed,
                        )
                    })
            }
        }
    }

    async fn mark_paid(
        &self,
        transaction: Transaction,
        update: TransitionUpdate,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let paid = match self
            .transition(transaction, TransactionStatus::Paid, update)
            .await?
        {
            Ok(paid) => paid,
            // Someone else settled it first; their result stands.
            Err(current) => return Ok(ReconcileOutcome::AlreadyReconciled(current)),
        };

        tracing::info!(
            transaction_id = %paid.id,
            gateway_order_id = %paid.gateway_order_id,
            payment_id = ?paid.payment_id,
            needs_reverification = paid.needs_reverification,
            "Transaction marked paid"
        );

        if paid.order_id.is_none() {
            tracing::warn!(
                transaction_id = %paid.id,
                "Paid transaction has no order to activate"
            );
        }
        self.finish_activation(&paid).await?;

        Ok(ReconcileOutcome::Activated(self.reload(paid).await?))
    }

    /// Guarded move to `to`. `Ok(updated)` when this call applied it,
    /// `Err(current)` when the transaction had already moved on.
    async fn transition(
        &self,
        transaction: Transaction,
        to: TransactionStatus,
        update: TransitionUpdate,
    ) -> Result<Result<Transaction, Transaction>, PaymentError> {
        let applied = self
            .store
            .transition_transaction(transaction.id, &to.predecessors(), to, &update)
            .await?;

        let current = self.reload(transaction).await?;
        if applied {
            tracing::info!(
                transaction_id = %current.id,
                status = to.as_str(),
                "Transaction status updated"
            );
            Ok(Ok(current))
        } else {
            Ok(Err(current))
        }
    }

    /// Activate the linked order and clear `activation_pending`.
    ///
    /// Returns whether this call was the one that activated the order. A
    /// store failure leaves the flag set for the next attempt.
    async fn finish_activation(&self, transaction: &Transaction) -> Result<bool, PaymentError> {
        let Some(order_id) = transaction.order_id else {
            self.store.clear_activation_pending(transaction.id).await?;
            return Ok(false);
        };

        let Some(order) = self.store.get_order(order_id).await? else {
            tracing::warn!(
                transaction_id = %transaction.id,
                order_id = %order_id,
                "Order for paid transaction no longer exists"
            );
            self.store.clear_activation_pending(transaction.id).await?;
            return Ok(false);
        };

        let (start, expiry) = order.activation_window(DateTime::now());
        let activated = match self.store.activate_order(order_id, start, expiry).await {
            Ok(activated) => activated,
            Err(err) => {
                tracing::error!(
                    transaction_id = %transaction.id,
                    order_id = %order_id,
                    error = %err,
                    "Order activation failed, left pending for the sweep"
                );
                return Err(PaymentError::Store(err));
            }
        };
        self.store.clear_activation_pending(transaction.id).await?;

        if activated {
            tracing::info!(
                order_id = %order_id,
                user_id = %order.user_id,
                period_days = order.subscription_period.as_days(),
                "Subscription activated"
            );
        } else {
            tracing::warn!(
                order_id = %order_id,
                transaction_id = %transaction.id,
                "Order was already completed, payment not applied to entitlement"
            );
        }
        Ok(activated)
    }

    /// Recreate the local record of a gateway order we created but failed
    /// to persist. The gateway echoes our internal order id back as a tag.
    async fn adopt_orphan(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<(Transaction, GatewayOrderStatus)>, PaymentError> {
        let verified = match self.gateway.fetch_order_status(gateway_order_id).await {
            Ok(verified) => verified,
            Err(GatewayError::Http { status, .. }) if status == StatusCode::NOT_FOUND => {
                return Ok(None)
            }
            Err(err) => {
                tracing::warn!(
                    gateway_order_id = %gateway_order_id,
                    error = %err,
                    "Could not look up unknown gateway order"
                );
                return Err(PaymentError::Gateway(err));
            }
        };

        let Some(order_id) = verified.order_tag else {
            return Ok(None);
        };
        let Some(order) = self.store.get_order(order_id).await? else {
            return Ok(None);
        };

        let now = DateTime::now();
        let amount = verified.amount.unwrap_or(order.subscription_amount);
        let receipt = verified
            .raw
            .get("receipt")
            .and_then(|v| v.as_str())
            .unwrap_or(gateway_order_id)
            .to_string();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            gateway_order_id: verified.gateway_order_id.clone(),
            gateway: self.gateway.name().to_string(),
            environment: self.gateway.environment(),
            amount,
            amount_due: amount,
            amount_paid: Decimal::ZERO,
            attempts: 0,
            currency: verified
                .currency
                .clone()
                .unwrap_or_else(|| self.currency.clone()),
            entity: "order".to_string(),
            receipt,
            status: TransactionStatus::Created,
            created_at: now,
            updated_at: now,
            payment_timestamp: None,
            payment_id: None,
            order_id: Some(order.id),
            user_id: Some(order.user_id),
            activation_pending: false,
            needs_reverification: false,
        };

        match self.store.insert_transaction(&transaction).await {
            Ok(()) => {
                tracing::warn!(
                    gateway_order_id = %transaction.gateway_order_id,
                    order_id = %order.id,
                    "Adopted orphaned gateway order"
                );
                Ok(Some((transaction, verified)))
            }
            Err(err) => {
                // A concurrent callback may have adopted it first.
                match self
                    .store
                    .find_transaction_by_gateway_order_id(gateway_order_id)
                    .await?
                {
                    Some(existing) => Ok(Some((existing, verified))),
                    None => Err(PaymentError::Store(err)),
                }
            }
        }
    }

    async fn reload(&self, transaction: Transaction) -> Result<Transaction, PaymentError> {
        Ok(self
            .store
            .get_transaction(transaction.id)
            .await?
            .unwrap_or(transaction))
    }
}
