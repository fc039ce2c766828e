//! Domain models for subscription-service.

mod order;
mod reference;
mod transaction;

pub use order::{
    Customer, CustomerDetails, Order, OrderStatus, SubscriptionPeriod, GUEST_EMAIL, GUEST_NAME,
    GUEST_PHONE,
};
pub use reference::{OrderReference, ReferenceError};
pub use transaction::{compose_receipt, Transaction, TransactionStatus, TransitionUpdate};
