//! Subscription orders and the customers that own them.

use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
        }
    }
}

/// Length of the entitlement an order buys, in days.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(transparent)]
pub struct SubscriptionPeriod(u32);

impl SubscriptionPeriod {
    pub fn days(days: u32) -> Self {
        Self(days)
    }

    pub fn as_days(&self) -> u32 {
        self.0
    }

    pub fn expiry_from(&self, start: DateTime) -> DateTime {
        DateTime::from_millis(start.timestamp_millis() + i64::from(self.0) * MILLIS_PER_DAY)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Order {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub user_id: Uuid,
    pub mobile_number: Option<String>,
    pub subscription_amount: Decimal,
    pub subscription_period: SubscriptionPeriod,
    pub status: OrderStatus,
    pub is_active: bool,
    pub created_at: DateTime,
    pub start_date: Option<DateTime>,
    pub expiration_date: Option<DateTime>,
    /// Held by a checkout while it talks to the gateway.
    #[serde(default)]
    pub checkout_lease_until: Option<DateTime>,
}

impl Order {
    pub fn new_pending(
        user_id: Uuid,
        mobile_number: Option<String>,
        subscription_amount: Decimal,
        subscription_period: SubscriptionPeriod,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            mobile_number,
            subscription_amount,
            subscription_period,
            status: OrderStatus::Pending,
            is_active: false,
            created_at: DateTime::now(),
            start_date: None,
            expiration_date: None,
            checkout_lease_until: None,
        }
    }

    /// An order granted outright, already completed and running from `start`.
    pub fn new_completed(
        user_id: Uuid,
        subscription_amount: Decimal,
        subscription_period: SubscriptionPeriod,
        start: DateTime,
    ) -> Self {
        let mut order = Self::new_pending(user_id, None, subscription_amount, subscription_period);
        order.status = OrderStatus::Completed;
        order.is_active = true;
        order.start_date = Some(start);
        order.expiration_date = Some(subscription_period.expiry_from(start));
        order
    }

    pub fn is_completed(&self) -> bool {
        self.status == OrderStatus::Completed
    }

    /// Completed, active and `start_date <= now < expiration_date`.
    pub fn is_current_at(&self, now: DateTime) -> bool {
        match (self.start_date, self.expiration_date) {
            (Some(start), Some(end)) => {
                self.is_completed() && self.is_active && start <= now && now < end
            }
            _ => false,
        }
    }

    /// Completed, active and starting at or after `now`.
    pub fn is_upcoming_at(&self, now: DateTime) -> bool {
        match (self.start_date, self.expiration_date) {
            (Some(start), Some(end)) => {
                self.is_completed() && self.is_active && start >= now && end > now
            }
            _ => false,
        }
    }

    /// Activation window for an order paid at `now`.
    pub fn activation_window(&self, now: DateTime) -> (DateTime, DateTime) {
        (now, self.subscription_period.expiry_from(now))
    }
}

/// Contact fields the gateway wants for its customer record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Customer {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub mobile_number: Option<String>,
}

pub const GUEST_NAME: &str = "Guest User";
pub const GUEST_EMAIL: &str = "guest@lavaott.com";
pub const GUEST_PHONE: &str = "9999999999";

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct CustomerDetails {
    pub customer_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
}

impl CustomerDetails {
    /// Fill gaps in what we know about the user with guest placeholders.
    pub fn from_customer(user_id: Uuid, customer: Option<&Customer>) -> Self {
        let pick = |value: Option<&String>, fallback: &str| {
            value
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };

        Self {
            customer_id: format!("customer_{}", user_id.simple()),
            customer_name: pick(customer.and_then(|c| c.first_name.as_ref()), GUEST_NAME),
            customer_email: pick(customer.and_then(|c| c.email.as_ref()), GUEST_EMAIL),
            customer_phone: pick(customer.and_then(|c| c.mobile_number.as_ref()), GUEST_PHONE),
        }
    }
}
