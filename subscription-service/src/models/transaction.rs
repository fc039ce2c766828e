//! Local audit record of one gateway order.

use mongodb::bson::DateTime;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{GatewayEnvironment, GatewayStatus};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Created,
    Attempted,
    Paid,
    Failed,
}

impl TransactionStatus {
    /// Statuses a reconciliation may still move forward.
    pub const OPEN: [TransactionStatus; 2] = [TransactionStatus::Created, TransactionStatus::Attempted];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "created",
            TransactionStatus::Attempted => "attempted",
            TransactionStatus::Paid => "paid",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Paid | TransactionStatus::Failed)
    }

    /// created -> attempted -> paid | failed, with created allowed to skip
    /// straight to a terminal state. Nothing leaves paid or failed.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Created, Attempted) | (Created, Paid) | (Created, Failed) | (Attempted, Paid) | (Attempted, Failed)
        )
    }

    /// The statuses from which `self` can be reached.
    pub fn predecessors(&self) -> Vec<TransactionStatus> {
        Self::OPEN
            .into_iter()
            .filter(|from| from.can_transition_to(*self))
            .collect()
    }

    /// Where a normalized gateway status would take this transaction, if anywhere.
    pub fn target_for(gateway: GatewayStatus) -> Option<TransactionStatus> {
        match gateway {
            GatewayStatus::Attempted => Some(TransactionStatus::Attempted),
            GatewayStatus::Paid => Some(TransactionStatus::Paid),
            GatewayStatus::Failed => Some(TransactionStatus::Failed),
            GatewayStatus::Created | GatewayStatus::Unknown => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub gateway_order_id: String,
    pub gateway: String,
    pub environment: GatewayEnvironment,
    pub amount: Decimal,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub attempts: u32,
    pub currency: String,
    pub entity: String,
    pub receipt: String,
    pub status: TransactionStatus,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub payment_timestamp: Option<DateTime>,
    pub payment_id: Option<String>,
    /// Nulled, never cascaded, when the order goes away.
    pub order_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// Paid, but the order activation has not been confirmed yet.
    #[serde(default)]
    pub activation_pending: bool,
    /// Last transition came from a client-asserted status.
    #[serde(default)]
    pub needs_reverification: bool,
}

impl Transaction {
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Field changes applied together with a guarded status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub payment_id: Option<String>,
    pub payment_timestamp: Option<DateTime>,
    pub amount_paid: Option<Decimal>,
    pub amount_due: Option<Decimal>,
    pub attempts: Option<u32>,
    pub activation_pending: Option<bool>,
    pub needs_reverification: bool,
}

/// `receipt{sequence}_{ten random digits}`.
///
/// The sequence comes from a store-side counter so it is monotonic across
/// processes; the suffix keeps two racing checkouts apart even if they were
/// ever handed the same sequence.
pub fn compose_receipt<R: Rng>(sequence: u64, rng: &mut R) -> String {
    format!(
        "receipt{}_{}{}",
        sequence,
        rng.gen_range(10000..=99999),
        rng.gen_range(10000..=99999)
    )
}
