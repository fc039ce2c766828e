//! Razorpay payment provider client.
//!
//! Implements Razorpay's Orders API for payment initiation and
//! signature verification for checkout redirects and webhooks.

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::{Client, RequestBuilder};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::http::{retry_http_call, RetryConfig};
use service_core::utils::signature::{hmac_sha256_hex, signatures_match};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    credential_kind, CallbackPayload, CreateGatewayOrder, GatewayEnvironment, GatewayError,
    GatewayOrder, GatewayOrderStatus, PaymentGateway, RawGatewayStatus,
    RazorpayOrderStatus,
};
use crate::config::GatewayConfig;

pub const DEFAULT_BASE_URL: &str = "https://api.razorpay.com/v1";

const ORDER_TAG_KEY: &str = "internal_order_id";
const SIGNATURE_HEADER: &str = "x-razorpay-signature";

/// Razorpay client for interacting with the Razorpay API.
#[derive(Clone)]
pub struct RazorpayClient {
    client: Client,
    config: GatewayConfig,
    environment: GatewayEnvironment,
    base_url: String,
    verify_retry: RetryConfig,
}

/// Request to create a Razorpay order.
#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    /// Amount in smallest currency unit (paise for INR).
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    notes: HashMap<&'static str, String>,
}

/// Order entity returned by create and fetch.
#[derive(Debug, Deserialize)]
pub struct RazorpayOrder {
    pub id: String,
    #[serde(default = "default_entity")]
    pub entity: String,
    /// Amounts are in the smallest currency unit.
    pub amount: u64,
    #[serde(default)]
    pub amount_paid: u64,
    #[serde(default)]
    pub amount_due: u64,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: RazorpayOrderStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub notes: Option<serde_json::Value>,
}

fn default_entity() -> String {
    "order".to_string()
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorBody {
    error: RazorpayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RazorpayErrorDetail {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    payment: Option<WebhookEntity<PaymentEntity>>,
    order: Option<WebhookEntity<OrderRef>>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntity<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderRef {
    id: String,
}

/// Paise to rupees.
fn from_minor_units(amount: u64) -> Decimal {
    Decimal::from(amount) / Decimal::from(100)
}

fn to_minor_units(amount: Decimal) -> Result<u64, GatewayError> {
    amount
        .checked_mul(Decimal::from(100))
        .map(|minor| minor.round())
        .and_then(|minor| minor.to_u64())
        .ok_or_else(|| GatewayError::Malformed(format!("amount {} out of range", amount)))
}

impl RazorpayOrder {
    fn order_tag(&self) -> Option<Uuid> {
        self.notes
            .as_ref()
            .and_then(|notes| notes.get(ORDER_TAG_KEY))
            .and_then(|tag| tag.as_str())
            .and_then(|tag| Uuid::parse_str(tag).ok())
    }
}

impl RazorpayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let environment = credential_kind(&config.key_id);
        let base_url = config
            .api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = Client::builder().timeout(config.timeout()).build()?;
        let verify_retry = RetryConfig::with_max_retries(config.verify_retries)
            .with_initial_backoff(config.initial_backoff());

        Ok(Self {
            client,
            config,
            environment,
            base_url: base_url.trim_end_matches('/').to_string(),
            verify_retry,
        })
    }

    /// Check if Razorpay is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(
            &self.config.key_id,
            Some(self.config.key_secret.expose_secret()),
        )
    }

    async fn read_order(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<(RazorpayOrder, serde_json::Value), GatewayError> {
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, body = %body, operation, "Razorpay response");

        if !status.is_success() {
            let message = serde_json::from_str::<RazorpayErrorBody>(&body)
                .map(|e| format!("{} - {}", e.error.code, e.error.description))
                .unwrap_or_else(|_| format!("Payment gateway error (HTTP {})", status.as_u16()));
            tracing::error!(
                status = %status,
                message = %message,
                operation,
                "Razorpay request failed"
            );
            return Err(GatewayError::Http {
                status,
                message,
                body,
            });
        }

        let raw: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Malformed(format!("{}: {}", operation, e)))?;
        let order: RazorpayOrder = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Malformed(format!("{}: {}", operation, e)))?;
        Ok((order, raw))
    }

    async fn send_create(
        &self,
        request: &CreateGatewayOrder,
        amount: u64,
    ) -> Result<(RazorpayOrder, serde_json::Value), GatewayError> {
        let mut notes = HashMap::new();
        notes.insert(ORDER_TAG_KEY, request.order_tag.to_string());
        notes.insert("customer_id", request.customer.customer_id.clone());

        let body = CreateOrderRequest {
            amount,
            currency: &request.currency,
            receipt: &request.receipt,
            notes,
        };

        let response = self
            .authorized(self.client.post(format!("{}/orders", self.base_url)))
            .json(&body)
            .send()
            .await?;

        Self::read_order(response, "create_order").await
    }

    async fn send_fetch(
        &self,
        gateway_order_id: &str,
    ) -> Result<(RazorpayOrder, serde_json::Value), GatewayError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/orders/{}", self.base_url, gateway_order_id)),
            )
            .send()
            .await?;

        Self::read_order(response, "fetch_order").await
    }

    /// `HMAC-SHA256(order_id + "|" + payment_id, key_secret)`
    pub fn verify_payment_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> Result<bool, GatewayError> {
        let payload = format!("{}|{}", order_id, payment_id);
        let expected = hmac_sha256_hex(self.config.key_secret.expose_secret(), payload.as_bytes())
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        let is_valid = signatures_match(&expected, signature);
        if is_valid {
            tracing::info!(
                order_id = %order_id,
                payment_id = %payment_id,
                "Payment signature verified successfully"
            );
        } else {
            tracing::warn!(
                order_id = %order_id,
                payment_id = %payment_id,
                "Payment signature verification failed"
            );
        }
        Ok(is_valid)
    }

    /// `HMAC-SHA256(request_body, webhook_secret)`
    pub fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> Result<bool, GatewayError> {
        let expected = hmac_sha256_hex(self.config.webhook_secret.expose_secret(), body)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        let is_valid = signatures_match(&expected, signature);
        if !is_valid {
            tracing::warn!("Webhook signature verification failed");
        }
        Ok(is_valid)
    }
}

#[async_trait]
impl PaymentGateway for RazorpayClient {
    fn name(&self) -> &'static str {
        "razorpay"
    }

    fn environment(&self) -> GatewayEnvironment {
        self.environment
    }

    fn key_id(&self) -> &str {
        &self.config.key_id
    }

    async fn create_order(
        &self,
        request: &CreateGatewayOrder,
    ) -> Result<GatewayOrder, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let amount = to_minor_units(request.amount)?;
        let (order, raw) = retry_http_call(&RetryConfig::no_retry(), "razorpay_create_order", || {
            self.send_create(request, amount)
        })
        .await?;

        tracing::info!(
            gateway_order_id = %order.id,
            amount = order.amount,
            currency = %order.currency,
            environment = self.environment.as_str(),
            "Razorpay order created"
        );

        Ok(GatewayOrder {
            // Standard checkout opens with the order id itself.
            session_token: Some(order.id.clone()),
            gateway_order_id: order.id,
            entity: order.entity,
            status: RawGatewayStatus::Razorpay(order.status).into(),
            redirect_url: None,
            raw,
        })
    }

    async fn fetch_order_status(
        &self,
        gateway_order_id: &str,
    ) -> Result<GatewayOrderStatus, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let (order, raw) = retry_http_call(&self.verify_retry, "razorpay_fetch_order", || {
            self.send_fetch(gateway_order_id)
        })
        .await?;

        let raw_status = RawGatewayStatus::Razorpay(order.status);
        Ok(GatewayOrderStatus {
            order_tag: order.order_tag(),
            gateway_order_id: order.id,
            status: raw_status.into(),
            raw_status,
            payment_id: None,
            amount: Some(from_minor_units(order.amount)),
            amount_paid: Some(from_minor_units(order.amount_paid)),
            attempts: Some(order.attempts),
            currency: Some(order.currency),
            raw,
        })
    }

    /// Successful standard checkout posts `razorpay_order_id`,
    /// `razorpay_payment_id` and `razorpay_signature`; a valid signature is
    /// taken as an assertion of payment.
    fn parse_redirect(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CallbackPayload, GatewayError> {
        let signed = (
            params.get("razorpay_order_id"),
            params.get("razorpay_payment_id"),
            params.get("razorpay_signature"),
        );

        match signed {
            (Some(order_id), Some(payment_id), Some(signature)) => {
                if !self.verify_payment_signature(order_id, payment_id, signature)? {
                    return Err(GatewayError::InvalidSignature);
                }
                Ok(CallbackPayload {
                    gateway_order_id: order_id.clone(),
                    asserted_status: Some("paid".to_string()),
                    payment_id: Some(payment_id.clone()),
                })
            }
            (Some(order_id), _, _) => Ok(CallbackPayload {
                gateway_order_id: order_id.clone(),
                asserted_status: None,
                payment_id: params.get("razorpay_payment_id").cloned(),
            }),
            _ => CallbackPayload::from_generic_params(params)
                .ok_or_else(|| GatewayError::Malformed("missing order id".to_string())),
        }
    }

    fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<CallbackPayload>, GatewayError> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::InvalidSignature)?;
        if !self.verify_webhook_signature(body, signature)? {
            return Err(GatewayError::InvalidSignature);
        }

        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Malformed(format!("webhook: {}", e)))?;

        let asserted = match event.event.as_str() {
            "payment.captured" | "order.paid" => "paid",
            "payment.failed" => "failed",
            "payment.authorized" => "attempted",
            other => {
                tracing::debug!(event = %other, "Ignoring Razorpay webhook event");
                return Ok(None);
            }
        };

        let payment = event.payload.payment.map(|p| p.entity);
        let gateway_order_id = event
            .payload
            .order
            .map(|o| o.entity.id)
            .or_else(|| payment.as_ref().and_then(|p| p.order_id.clone()))
            .ok_or_else(|| GatewayError::Malformed("webhook without order id".to_string()))?;

        Ok(Some(CallbackPayload {
            gateway_order_id,
            asserted_status: Some(asserted.to_string()),
            payment_id: payment.map(|p| p.id),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayProvider;
    use crate::gateway::GatewayStatus;
    use secrecy::Secret;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            provider: GatewayProvider::Razorpay,
            key_id: "rzp_test_123".to_string(),
            key_secret: Secret::new("my_secret_key".to_string()),
            webhook_secret: Secret::new("webhook_secret".to_string()),
            api_version: String::new(),
            api_base_url: None,
            timeout_secs: 5,
            verify_retries: 1,
            initial_backoff_ms: 1,
        }
    }

    #[test]
    fn test_is_configured() {
        let client = RazorpayClient::new(test_config()).unwrap();
        assert!(client.is_configured());
        assert_eq!(client.environment(), GatewayEnvironment::Sandbox);

        let mut empty = test_config();
        empty.key_id = String::new();
        empty.key_secret = Secret::new(String::new());
        assert!(!RazorpayClient::new(empty).unwrap().is_configured());
    }

    #[test]
    fn live_key_is_production() {
        let mut config = test_config();
        config.key_id = "rzp_live_abc".to_string();
        let client = RazorpayClient::new(config).unwrap();
        assert_eq!(client.environment(), GatewayEnvironment::Production);
    }

    #[test]
    fn minor_units() {
        assert_eq!(to_minor_units(Decimal::new(22450, 2)).unwrap(), 22450);
        assert_eq!(to_minor_units(Decimal::from(224)).unwrap(), 22400);
        assert_eq!(from_minor_units(22400), Decimal::from(224));
        assert!(to_minor_units(Decimal::from(-1)).is_err());
    }

    #[test]
    fn minor_units_reject_overflowing_amounts() {
        let huge: Decimal = "7900000000000000000000000000".parse().unwrap();
        assert!(matches!(to_minor_units(huge), Err(GatewayError::Malformed(_))));
        assert!(matches!(to_minor_units(Decimal::MAX), Err(GatewayError::Malformed(_))));
    }

    #[test]
    fn signed_redirect_asserts_paid() {
        let client = RazorpayClient::new(test_config()).unwrap();
        let signature = hmac_sha256_hex("my_secret_key", b"order_123|pay_456").unwrap();

        let mut params = HashMap::new();
        params.insert("razorpay_order_id".to_string(), "order_123".to_string());
        params.insert("razorpay_payment_id".to_string(), "pay_456".to_string());
        params.insert("razorpay_signature".to_string(), signature);

        let payload = client.parse_redirect(&params).unwrap();
        assert_eq!(payload.gateway_order_id, "order_123");
        assert_eq!(payload.asserted(), GatewayStatus::Paid);
        assert_eq!(payload.payment_id.as_deref(), Some("pay_456"));
    }

    #[test]
    fn test_invalid_signature() {
        let client = RazorpayClient::new(test_config()).unwrap();

        let mut params = HashMap::new();
        params.insert("razorpay_order_id".to_string(), "order_123".to_string());
        params.insert("razorpay_payment_id".to_string(), "pay_456".to_string());
        params.insert("razorpay_signature".to_string(), "invalid_signature".to_string());

        assert!(matches!(
            client.parse_redirect(&params),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[test]
    fn captured_webhook_becomes_paid_callback() {
        let client = RazorpayClient::new(test_config()).unwrap();
        let body = serde_json::to_vec(&serde_json::json!({
            "entity": "event",
            "event": "payment.captured",
            "payload": {
                "payment": { "entity": { "id": "pay_9", "order_id": "order_9", "status": "captured" } }
            }
        }))
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            hmac_sha256_hex("webhook_secret", &body).unwrap().parse().unwrap(),
        );

        let payload = client.parse_webhook(&headers, &body).unwrap().unwrap();
        assert_eq!(payload.gateway_order_id, "order_9");
        assert_eq!(payload.asserted(), GatewayStatus::Paid);
        assert_eq!(payload.payment_id.as_deref(), Some("pay_9"));
    }

    #[test]
    fn unsigned_webhook_is_rejected() {
        let client = RazorpayClient::new(test_config()).unwrap();
        let body = br#"{"event":"payment.captured","payload":{}}"#;
        assert!(matches!(
            client.parse_webhook(&HeaderMap::new(), body),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[test]
    fn order_notes_carry_the_internal_order_id() {
        let id = Uuid::new_v4();
        let order: RazorpayOrder = serde_json::from_value(serde_json::json!({
            "id": "order_1",
            "entity": "order",
            "amount": 22400,
            "amount_paid": 22400,
            "amount_due": 0,
            "currency": "INR",
            "receipt": "receipt1_1234567890",
            "status": "paid",
            "attempts": 1,
            "notes": { "internal_order_id": id.to_string() },
            "created_at": 1700000000
        }))
        .unwrap();
        assert_eq!(order.order_tag(), Some(id));
        assert_eq!(order.status, RazorpayOrderStatus::Paid);
    }
}
