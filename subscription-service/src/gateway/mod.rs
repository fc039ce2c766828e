//! Payment gateway abstraction.
//!
//! Each provider speaks its own vocabulary on the wire. Everything that
//! leaves this module is normalized: statuses become [`GatewayStatus`],
//! callbacks become [`CallbackPayload`], failures become [`GatewayError`].

pub mod cashfree;
pub mod razorpay;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::http::{is_retryable_status, Retryable};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{GatewayConfig, GatewayProvider};
use crate::models::CustomerDetails;

pub use cashfree::CashfreeClient;
pub use razorpay::RazorpayClient;

/// Which side of the provider a credential belongs to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayEnvironment {
    Sandbox,
    Production,
}

impl GatewayEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayEnvironment::Sandbox => "sandbox",
            GatewayEnvironment::Production => "production",
        }
    }
}

const PRODUCTION_PREFIXES: [&str; 2] = ["cfsk_ma_prod_", "rzp_live_"];

/// Classify a credential by its provider-issued prefix.
///
/// Cashfree secrets carry `cfsk_ma_prod_` / `cfsk_ma_test_`, Razorpay key ids
/// `rzp_live_` / `rzp_test_`. Anything unrecognized is treated as sandbox so
/// an unknown key can never move real money.
pub fn credential_kind(credential: &str) -> GatewayEnvironment {
    let credential = credential.trim();
    if PRODUCTION_PREFIXES.iter().any(|p| credential.starts_with(p)) {
        GatewayEnvironment::Production
    } else {
        GatewayEnvironment::Sandbox
    }
}

/// Internal status vocabulary shared by every gateway.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Created,
    Attempted,
    Paid,
    Failed,
    Unknown,
}

impl GatewayStatus {
    /// Normalize a status asserted by a redirect or webhook.
    ///
    /// Accepts order and payment vocabularies of both providers in any case.
    pub fn from_asserted(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" | "active" | "not_attempted" => GatewayStatus::Created,
            "attempted" | "pending" | "authorized" | "termination_requested" => {
                GatewayStatus::Attempted
            }
            "paid" | "success" | "captured" => GatewayStatus::Paid,
            "failed" | "failure" | "expired" | "terminated" | "cancelled" | "user_dropped"
            | "void" => GatewayStatus::Failed,
            _ => GatewayStatus::Unknown,
        }
    }
}

/// Cashfree `order_status`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CashfreeOrderStatus {
    Active,
    Paid,
    Failed,
    Expired,
    Terminated,
    TerminationRequested,
    #[serde(other)]
    Unknown,
}

/// Razorpay order `status`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RazorpayOrderStatus {
    Created,
    Attempted,
    Paid,
    Failed,
    #[serde(other)]
    Unknown,
}

/// A status exactly as one gateway reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawGatewayStatus {
    Cashfree(CashfreeOrderStatus),
    Razorpay(RazorpayOrderStatus),
}

impl From<RawGatewayStatus> for GatewayStatus {
    fn from(raw: RawGatewayStatus) -> Self {
        match raw {
            RawGatewayStatus::Cashfree(status) => match status {
                CashfreeOrderStatus::Active => GatewayStatus::Created,
                CashfreeOrderStatus::TerminationRequested => GatewayStatus::Attempted,
                CashfreeOrderStatus::Paid => GatewayStatus::Paid,
                CashfreeOrderStatus::Failed
                | CashfreeOrderStatus::Expired
                | CashfreeOrderStatus::Terminated => GatewayStatus::Failed,
                CashfreeOrderStatus::Unknown => GatewayStatus::Unknown,
            },
            RawGatewayStatus::Razorpay(status) => match status {
                RazorpayOrderStatus::Created => GatewayStatus::Created,
                RazorpayOrderStatus::Attempted => GatewayStatus::Attempted,
                RazorpayOrderStatus::Paid => GatewayStatus::Paid,
                RazorpayOrderStatus::Failed => GatewayStatus::Failed,
                RazorpayOrderStatus::Unknown => GatewayStatus::Unknown,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway credentials are not configured")]
    NotConfigured,

    #[error("gateway returned HTTP {status}: {message}")]
    Http {
        status: StatusCode,
        message: String,
        body: String,
    },

    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed gateway response: {0}")]
    Malformed(String),

    #[error("invalid gateway signature")]
    InvalidSignature,
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Http { status, .. } => is_retryable_status(*status),
            GatewayError::Transport(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

/// What a checkout asks the gateway to create.
#[derive(Debug, Clone)]
pub struct CreateGatewayOrder {
    pub receipt: String,
    pub amount: Decimal,
    pub currency: String,
    /// Internal order id, echoed back by the gateway so orphaned gateway
    /// orders can be matched later.
    pub order_tag: Uuid,
    pub customer: CustomerDetails,
    pub return_url: String,
}

#[derive(Debug, Clone)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub entity: String,
    pub status: GatewayStatus,
    pub session_token: Option<String>,
    pub redirect_url: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct GatewayOrderStatus {
    pub gateway_order_id: String,
    pub status: GatewayStatus,
    pub raw_status: RawGatewayStatus,
    pub payment_id: Option<String>,
    pub amount: Option<Decimal>,
    pub amount_paid: Option<Decimal>,
    pub attempts: Option<u32>,
    pub currency: Option<String>,
    pub order_tag: Option<Uuid>,
    pub raw: serde_json::Value,
}

/// A callback reduced to what reconciliation needs. The status in here is
/// the caller's claim, not a verified fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPayload {
    pub gateway_order_id: String,
    pub asserted_status: Option<String>,
    pub payment_id: Option<String>,
}

impl CallbackPayload {
    pub fn asserted(&self) -> GatewayStatus {
        self.asserted_status
            .as_deref()
            .map(GatewayStatus::from_asserted)
            .unwrap_or(GatewayStatus::Unknown)
    }

    /// Field names any gateway's redirect may use for the basic triple.
    pub fn from_generic_params(params: &HashMap<String, String>) -> Option<Self> {
        let get = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| params.get(*k))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Some(Self {
            gateway_order_id: get(&["gateway_order_id", "order_id"])?,
            asserted_status: get(&["status", "order_status", "txStatus"]),
            payment_id: get(&["payment_id", "cf_payment_id"]),
        })
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    fn environment(&self) -> GatewayEnvironment;

    /// Public key id the client-side checkout needs.
    fn key_id(&self) -> &str;

    /// Create the remote order. Never retried.
    async fn create_order(&self, request: &CreateGatewayOrder)
        -> Result<GatewayOrder, GatewayError>;

    /// Server-to-server status lookup. Retried on 429/5xx.
    async fn fetch_order_status(
        &self,
        gateway_order_id: &str,
    ) -> Result<GatewayOrderStatus, GatewayError>;

    /// Interpret the query/form parameters of a customer redirect.
    fn parse_redirect(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CallbackPayload, GatewayError>;

    /// Verify and interpret a webhook. `Ok(None)` for events we ignore.
    fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<CallbackPayload>, GatewayError>;
}

pub fn build_gateway(config: &GatewayConfig) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
    let gateway: Arc<dyn PaymentGateway> = match config.provider {
        GatewayProvider::Cashfree => Arc::new(CashfreeClient::new(config.clone())?),
        GatewayProvider::Razorpay => Arc::new(RazorpayClient::new(config.clone())?),
    };

    tracing::info!(
        gateway = gateway.name(),
        environment = gateway.environment().as_str(),
        "Payment gateway client initialized"
    );

    Ok(gateway)
}

/// Gateways reply with numbers or strings for ids depending on API version.
pub(crate) fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
