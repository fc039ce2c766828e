pub mod checkout;
pub mod metrics;
pub mod reconciliation;
pub mod subscription;

pub use checkout::{CheckoutHandle, CheckoutOrchestrator};
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::{ReconcileOutcome, ReconciliationHandler, Trigger};
pub use subscription::{CreateOrderRequest, CreatedOrder, GrantRequest, SubscriptionLedger};
