#![allow(dead_code)]

use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use service_core::utils::signature::hmac_sha256_base64;
use std::sync::Arc;
use subscription_service::config::{
    AdminConfig, CheckoutConfig, Config, DatabaseConfig, GatewayConfig, GatewayProvider,
    ReconciliationConfig, ServerConfig, StoreBackend,
};
use subscription_service::gateway::build_gateway;
use subscription_service::services::{CreateOrderRequest, CreatedOrder};
use subscription_service::store::{MemoryStore, SubscriptionStore};
use subscription_service::{AppState, Application};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_SECRET: &str = "cfsk_ma_test_secret";
pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";
pub const RAZORPAY_KEY_ID: &str = "rzp_test_K3yId";
pub const RAZORPAY_KEY_SECRET: &str = "rzp_test_secret";
pub const RAZORPAY_WEBHOOK_SECRET: &str = "rzp_webhook_secret";

pub fn test_config(gateway_uri: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Random port
        },
        database: DatabaseConfig {
            backend: StoreBackend::Memory,
            url: Secret::new("mongodb://localhost:27017".to_string()),
            db_name: "subscription_test".to_string(),
        },
        gateway: GatewayConfig {
            provider: GatewayProvider::Cashfree,
            key_id: "test_app_id".to_string(),
            key_secret: Secret::new(TEST_SECRET.to_string()),
            webhook_secret: Secret::new("unused".to_string()),
            api_version: "2023-08-01".to_string(),
            api_base_url: Some(gateway_uri.to_string()),
            timeout_secs: 5,
            verify_retries: 0,
            initial_backoff_ms: 1,
        },
        checkout: CheckoutConfig {
            public_base_url: "https://api.example.com".to_string(),
            currency: "INR".to_string(),
            duplicate_window_secs: 600,
            reference_prefix: "123456".to_string(),
        },
        reconciliation: ReconciliationConfig {
            stale_after_secs: 900,
            sweep_interval_secs: 0,
        },
        admin: AdminConfig {
            token: Secret::new(TEST_ADMIN_TOKEN.to_string()),
        },
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        service_name: "subscription-service-test".to_string(),
    }
}

pub fn razorpay_config(gateway_uri: &str) -> Config {
    let mut config = test_config(gateway_uri);
    config.gateway.provider = GatewayProvider::Razorpay;
    config.gateway.key_id = RAZORPAY_KEY_ID.to_string();
    config.gateway.key_secret = Secret::new(RAZORPAY_KEY_SECRET.to_string());
    config.gateway.webhook_secret = Secret::new(RAZORPAY_WEBHOOK_SECRET.to_string());
    config
}

/// Cashfree order entity as the PG API returns it.
pub fn cashfree_order(gateway_order_id: &str, status: &str, order_id: Uuid) -> Value {
    json!({
        "cf_order_id": 2149460581u64,
        "order_id": gateway_order_id,
        "entity": "order",
        "order_status": status,
        "payment_session_id": format!("session_{}", gateway_order_id),
        "order_amount": 224.0,
        "order_currency": "INR",
        "order_tags": {
            "internal_order_id": order_id.to_string(),
            "receipt": gateway_order_id
        }
    })
}

/// Razorpay order entity for a 224.00 INR order.
pub fn razorpay_order(gateway_order_id: &str, status: &str, order_id: Uuid) -> Value {
    let amount_paid = if status == "paid" { 22400 } else { 0 };
    let attempts = if status == "created" { 0 } else { 1 };
    json!({
        "id": gateway_order_id,
        "entity": "order",
        "amount": 22400,
        "amount_paid": amount_paid,
        "amount_due": 22400 - amount_paid,
        "currency": "INR",
        "receipt": format!("receipt_{}", gateway_order_id),
        "status": status,
        "attempts": attempts,
        "notes": {
            "internal_order_id": order_id.to_string(),
            "customer_id": "cust_1"
        },
        "created_at": 1700000000
    })
}

pub fn signed_webhook_headers(body: &str) -> (String, String) {
    let timestamp = "1700000000".to_string();
    let signature = hmac_sha256_base64(TEST_SECRET, format!("{}{}", timestamp, body).as_bytes())
        .expect("Failed to sign webhook");
    (timestamp, signature)
}

/// Services wired over an in-memory store and a mocked gateway.
pub struct TestContext {
    pub gateway: MockServer,
    pub store: Arc<MemoryStore>,
    pub state: AppState,
    provider: GatewayProvider,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config).await
    }

    pub async fn razorpay() -> Self {
        Self::with_config(razorpay_config).await
    }

    async fn with_config(config: fn(&str) -> Config) -> Self {
        let gateway = MockServer::start().await;
        let config = config(&gateway.uri());
        let provider = config.gateway.provider;
        let store = Arc::new(MemoryStore::new());
        let client = build_gateway(&config.gateway).expect("Failed to build gateway client");
        let state = AppState::new(config, store.clone() as Arc<dyn SubscriptionStore>, client);

        Self {
            gateway,
            store,
            state,
            provider,
        }
    }

    fn order_body(&self, gateway_order_id: &str, status: &str, order_id: Uuid) -> Value {
        match self.provider {
            GatewayProvider::Cashfree => cashfree_order(gateway_order_id, status, order_id),
            GatewayProvider::Razorpay => razorpay_order(gateway_order_id, status, order_id),
        }
    }

    pub async fn create_order(&self, user_id: Uuid) -> CreatedOrder {
        self.state
            .ledger
            .create_order(
                user_id,
                CreateOrderRequest {
                    amount: Decimal::from(224),
                    period_days: 30,
                    mobile_number: Some("9876543210".to_string()),
                    first_name: Some("Asha".to_string()),
                    email: Some("asha@example.com".to_string()),
                },
            )
            .await
            .expect("Failed to create order")
    }

    /// Gateway answers order creation with `gateway_order_id`.
    pub async fn mock_create(&self, gateway_order_id: &str, order_id: Uuid) {
        let initial = match self.provider {
            GatewayProvider::Cashfree => "ACTIVE",
            GatewayProvider::Razorpay => "created",
        };
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(self.order_body(gateway_order_id, initial, order_id)),
            )
            .mount(&self.gateway)
            .await;
    }

    /// Gateway reports `status` for `gateway_order_id`.
    pub async fn mock_status(&self, gateway_order_id: &str, status: &str, order_id: Uuid) {
        Mock::given(method("GET"))
            .and(path(format!("/orders/{}", gateway_order_id)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(self.order_body(gateway_order_id, status, order_id)),
            )
            .mount(&self.gateway)
            .await;
    }

    pub async fn mock_status_error(&self, gateway_order_id: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(format!("/orders/{}", gateway_order_id)))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "code": "order_not_found",
                "message": "order does not exist"
            })))
            .mount(&self.gateway)
            .await;
    }

    pub async fn mock_create_error(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "error": {
                    "code": "SERVER_ERROR",
                    "description": "The server encountered an error"
                }
            })))
            .mount(&self.gateway)
            .await;
    }

    /// Forget every mounted gateway response.
    pub async fn reset_gateway(&self) {
        self.gateway.reset().await;
    }
}

pub struct TestApp {
    pub http_address: String,
    pub http_port: u16,
    pub gateway: MockServer,
    pub store: Arc<MemoryStore>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config).await
    }

    pub async fn spawn_with(config: fn(&str) -> Config) -> Self {
        let gateway = MockServer::start().await;
        let config = config(&gateway.uri());
        let store = Arc::new(MemoryStore::new());

        let app = Application::build_with_store(config, store.clone())
            .await
            .expect("Failed to build test application");

        let http_port = app.http_port();
        let http_address = format!("http://127.0.0.1:{}", http_port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to build HTTP client");

        // Wait for HTTP server to be ready by polling health endpoint
        let health_url = format!("{}/health", http_address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            http_address,
            http_port,
            gateway,
            store,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.http_address, path)
    }
}
