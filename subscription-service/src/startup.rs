//! Application startup and lifecycle management.

use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::{Config, StoreBackend};
use crate::gateway::build_gateway;
use crate::handlers;
use crate::services::ReconciliationHandler;
use crate::store::{MemoryStore, MongoStore, SubscriptionStore};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/orders", post(handlers::orders::create_order))
        .route(
            "/payment/checkout/:reference",
            get(handlers::checkout::initiate_checkout),
        )
        .route(
            "/payment/response",
            get(handlers::callbacks::payment_response_get)
                .post(handlers::callbacks::payment_response_post),
        )
        .route("/webhooks/payment", post(handlers::callbacks::webhook))
        .route(
            "/subscription",
            get(handlers::subscription::current_subscription),
        )
        .route(
            "/transactions",
            get(handlers::subscription::transaction_history),
        )
        .route("/admin/reconcile", post(handlers::admin::reconcile_stale))
        .route(
            "/admin/users/:user_id/subscription",
            post(handlers::admin::grant_subscription),
        )
        .route(
            "/admin/users/:user_id/subscription/deactivate",
            post(handlers::admin::deactivate_subscription),
        )
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

/// Re-verify stale and flagged transactions every `interval`.
pub fn spawn_reconciliation_job(
    reconciler: Arc<ReconciliationHandler>,
    interval: Duration,
    stale_after: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = reconciler.reconcile_stale(stale_after).await {
                tracing::error!(error = %e, "Periodic reconciliation failed");
            }
        }
    })
}

async fn build_store(config: &Config) -> Result<Arc<dyn SubscriptionStore>, AppError> {
    match config.database.backend {
        StoreBackend::Mongo => {
            let store = MongoStore::connect(
                config.database.url.expose_secret(),
                &config.database.db_name,
            )
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to MongoDB: {}", e);
                AppError::DatabaseError(e)
            })?;

            store.init_indexes().await.map_err(|e| {
                tracing::error!("Failed to initialize database indexes: {}", e);
                AppError::DatabaseError(e)
            })?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, data will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let store = build_store(&config).await?;
        Self::build_with_store(config, store).await
    }

    /// Build over a caller-supplied store.
    pub async fn build_with_store(
        config: Config,
        store: Arc<dyn SubscriptionStore>,
    ) -> Result<Self, AppError> {
        let gateway = build_gateway(&config.gateway).map_err(|e| {
            tracing::error!("Failed to initialize payment gateway client: {}", e);
            AppError::ConfigError(e.into())
        })?;

        let state = AppState::new(config.clone(), store, gateway);

        // Port 0 = random port for testing
        let http_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| {
                tracing::error!("Invalid listen address: {}", e);
                AppError::ConfigError(anyhow::anyhow!("invalid listen address: {}", e))
            })?;
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", http_addr, e);
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(
            gateway = state.gateway.name(),
            environment = state.gateway.environment().as_str(),
            "Subscription service: HTTP on port {}",
            http_port
        );

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let reconciliation = &self.state.config.reconciliation;
        let job = (reconciliation.sweep_interval_secs > 0).then(|| {
            spawn_reconciliation_job(
                self.state.reconciler.clone(),
                Duration::from_secs(reconciliation.sweep_interval_secs),
                reconciliation.stale_after(),
            )
        });

        let result = axum::serve(self.http_listener, router(self.state)).await;

        if let Some(job) = job {
            job.abort();
        }
        result.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
