pub mod config;
pub mod dtos;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod store;

use std::sync::Arc;

use config::Config;
use gateway::PaymentGateway;
use services::{CheckoutOrchestrator, ReconciliationHandler, SubscriptionLedger};
use store::SubscriptionStore;

pub use startup::Application;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn SubscriptionStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub checkout: Arc<CheckoutOrchestrator>,
    pub reconciler: Arc<ReconciliationHandler>,
    pub ledger: Arc<SubscriptionLedger>,
}

impl AppState {
    /// Wire the services over an already built store and gateway.
    pub fn new(
        config: Config,
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let reconciler = Arc::new(ReconciliationHandler::new(
            store.clone(),
            gateway.clone(),
            config.checkout.currency.clone(),
        ));
        let checkout = Arc::new(CheckoutOrchestrator::new(
            store.clone(),
            gateway.clone(),
            reconciler.clone(),
            config.checkout.clone(),
        ));
        let ledger = Arc::new(SubscriptionLedger::new(
            store.clone(),
            reconciler.clone(),
            config.checkout.clone(),
        ));

        Self {
            config,
            store,
            gateway,
            checkout,
            reconciler,
            ledger,
        }
    }
}
