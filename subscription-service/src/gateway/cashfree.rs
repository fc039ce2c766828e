//! Cashfree Payment Gateway (PG Orders API) client.
//!
//! Sandbox and production live on different hosts; which one is used
//! follows from the secret's prefix via [`credential_kind`].

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::http::{retry_http_call, RetryConfig};
use service_core::utils::signature::{hmac_sha256_base64, signatures_match};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    credential_kind, id_to_string, CallbackPayload, CashfreeOrderStatus, CreateGatewayOrder,
    GatewayEnvironment, GatewayError, GatewayOrder, GatewayOrderStatus, GatewayStatus,
    PaymentGateway, RawGatewayStatus,
};
use crate::config::GatewayConfig;
use crate::models::CustomerDetails;

pub const SANDBOX_BASE_URL: &str = "https://sandbox.cashfree.com/pg";
pub const PRODUCTION_BASE_URL: &str = "https://api.cashfree.com/pg";

const ORDER_TAG_KEY: &str = "internal_order_id";
const SIGNATURE_HEADER: &str = "x-webhook-signature";
const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

pub fn base_url_for(environment: GatewayEnvironment) -> &'static str {
    match environment {
        GatewayEnvironment::Sandbox => SANDBOX_BASE_URL,
        GatewayEnvironment::Production => PRODUCTION_BASE_URL,
    }
}

#[derive(Clone)]
pub struct CashfreeClient {
    client: Client,
    config: GatewayConfig,
    environment: GatewayEnvironment,
    base_url: String,
    verify_retry: RetryConfig,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    order_id: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    order_amount: Decimal,
    order_currency: &'a str,
    customer_details: &'a CustomerDetails,
    order_meta: OrderMeta<'a>,
    order_tags: HashMap<&'static str, String>,
}

#[derive(Debug, Serialize)]
struct OrderMeta<'a> {
    return_url: &'a str,
}

/// Order entity returned by create and fetch.
#[derive(Debug, Deserialize)]
pub struct CashfreeOrder {
    #[serde(default)]
    pub cf_order_id: Option<serde_json::Value>,
    pub order_id: String,
    #[serde(default)]
    pub entity: Option<String>,
    pub order_status: CashfreeOrderStatus,
    #[serde(default)]
    pub payment_session_id: Option<String>,
    #[serde(default)]
    pub payment_link: Option<String>,
    #[serde(default)]
    pub order_amount: Option<Decimal>,
    #[serde(default)]
    pub order_currency: Option<String>,
    #[serde(default)]
    pub order_tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct CashfreeErrorBody {
    message: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    order: WebhookOrder,
    payment: Option<WebhookPayment>,
}

#[derive(Debug, Deserialize)]
struct WebhookOrder {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    cf_payment_id: Option<serde_json::Value>,
    payment_status: Option<String>,
}

impl CashfreeClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let environment = credential_kind(config.key_secret.expose_secret());
        let base_url = config
            .api_base_url
            .clone()
            .unwrap_or_else(|| base_url_for(environment).to_string());
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

    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Accept", "application/json")
            .header("x-client-id", &self.config.key_id)
            .header("x-client-secret", self.config.key_secret.expose_secret())
            .header("x-api-version", &self.config.api_version)
    }

    async fn read_order(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<(CashfreeOrder, serde_json::Value), GatewayError> {
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, body = %body, operation, "Cashfree response");

        if !status.is_success() {
            let message = serde_json::from_str::<CashfreeErrorBody>(&body)
                .ok()
                .and_then(|e| match (e.code, e.message) {
                    (Some(code), Some(message)) => Some(format!("{} - {}", code, message)),
                    (None, Some(message)) => Some(message),
                    _ => None,
                })
                .unwrap_or_else(|| format!("Payment gateway error (HTTP {})", status.as_u16()));

            tracing::error!(
                status = %status,
                body = %body,
                operation,
                "Cashfree request failed"
            );
            return Err(GatewayError::Http {
                status,
                message,
                body,
            });
        }

        let raw: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Malformed(format!("{}: {}", operation, e)))?;
        let order: CashfreeOrder = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::Malformed(format!("{}: {}", operation, e)))?;

        Ok((order, raw))
    }

    async fn send_create(
        &self,
        request: &CreateGatewayOrder,
    ) -> Result<(CashfreeOrder, serde_json::Value), GatewayError> {
        let mut order_tags = HashMap::new();
        order_tags.insert(ORDER_TAG_KEY, request.order_tag.to_string());
        order_tags.insert("receipt", request.receipt.clone());

        let body = CreateOrderRequest {
            order_id: &request.receipt,
            order_amount: request.amount,
            order_currency: &request.currency,
            customer_details: &request.customer,
            order_meta: OrderMeta {
                return_url: &request.return_url,
            },
            order_tags,
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
    ) -> Result<(CashfreeOrder, serde_json::Value), GatewayError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/orders/{}", self.base_url, gateway_order_id)),
            )
            .send()
            .await?;

        Self::read_order(response, "fetch_order").await
    }

    fn verify_webhook_signature(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), GatewayError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or(GatewayError::InvalidSignature)
        };
        let signature = header(SIGNATURE_HEADER)?;
        let timestamp = header(TIMESTAMP_HEADER)?;

        let mut signed = timestamp.as_bytes().to_vec();
        signed.extend_from_slice(body);

        let expected = hmac_sha256_base64(self.config.key_secret.expose_secret(), &signed)
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        if signatures_match(&expected, signature) {
            Ok(())
        } else {
            tracing::warn!("Cashfree webhook signature verification failed");
            Err(GatewayError::InvalidSignature)
        }
    }
}

impl CashfreeOrder {
    fn order_tag(&self) -> Option<Uuid> {
        self.order_tags
            .as_ref()
            .and_then(|tags| tags.get(ORDER_TAG_KEY))
            .and_then(|tag| Uuid::parse_str(tag).ok())
    }
}

#[async_trait]
impl PaymentGateway for CashfreeClient {
    fn name(&self) -> &'static str {
        "cashfree"
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

        let (order, raw) = retry_http_call(&RetryConfig::no_retry(), "cashfree_create_order", || {
            self.send_create(request)
        })
        .await?;

        tracing::info!(
            gateway_order_id = %order.order_id,
            amount = %request.amount,
            currency = %request.currency,
            environment = self.environment.as_str(),
            "Cashfree order created"
        );

        Ok(GatewayOrder {
            gateway_order_id: order.order_id,
            entity: order.entity.unwrap_or_else(|| "order".to_string()),
            status: RawGatewayStatus::Cashfree(order.order_status).into(),
            session_token: order.payment_session_id,
            redirect_url: order.payment_link,
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

        let (order, raw) = retry_http_call(&self.verify_retry, "cashfree_fetch_order", || {
            self.send_fetch(gateway_order_id)
        })
        .await?;

        let raw_status = RawGatewayStatus::Cashfree(order.order_status);
        let status = GatewayStatus::from(raw_status);
        let paid = status == GatewayStatus::Paid;

        Ok(GatewayOrderStatus {
            order_tag: order.order_tag(),
            gateway_order_id: order.order_id,
            status,
            raw_status,
            payment_id: order.cf_order_id.as_ref().and_then(id_to_string),
            amount: order.order_amount,
            amount_paid: if paid { order.order_amount } else { None },
            attempts: None,
            currency: order.order_currency,
            raw,
        })
    }

    fn parse_redirect(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CallbackPayload, GatewayError> {
        CallbackPayload::from_generic_params(params)
            .ok_or_else(|| GatewayError::Malformed("missing order_id".to_string()))
    }

    fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<CallbackPayload>, GatewayError> {
        self.verify_webhook_signature(headers, body)?;

        let envelope: WebhookEnvelope = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Malformed(format!("webhook: {}", e)))?;

        match envelope.event_type.as_str() {
            "PAYMENT_SUCCESS_WEBHOOK" | "PAYMENT_FAILED_WEBHOOK" | "PAYMENT_USER_DROPPED_WEBHOOK" => {
                let payment = envelope.data.payment;
                Ok(Some(CallbackPayload {
                    gateway_order_id: envelope.data.order.order_id,
                    asserted_status: payment.as_ref().and_then(|p| p.payment_status.clone()),
                    payment_id: payment
                        .as_ref()
                        .and_then(|p| p.cf_payment_id.as_ref())
                        .and_then(id_to_string),
                }))
            }
            other => {
                tracing::debug!(event_type = %other, "Ignoring Cashfree webhook event");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn test_config(secret: &str) -> GatewayConfig {
        GatewayConfig {
            provider: crate::config::GatewayProvider::Cashfree,
            key_id: "app_123".to_string(),
            key_secret: Secret::new(secret.to_string()),
            webhook_secret: Secret::new("unused".to_string()),
            api_version: "2023-08-01".to_string(),
            api_base_url: None,
            timeout_secs: 5,
            verify_retries: 1,
            initial_backoff_ms: 1,
        }
    }

    #[test]
    fn environment_follows_the_secret() {
        let sandbox = CashfreeClient::new(test_config("cfsk_ma_test_abc")).unwrap();
        assert_eq!(sandbox.environment(), GatewayEnvironment::Sandbox);
        assert_eq!(sandbox.base_url(), SANDBOX_BASE_URL);

        let production = CashfreeClient::new(test_config("cfsk_ma_prod_abc")).unwrap();
        assert_eq!(production.environment(), GatewayEnvironment::Production);
        assert_eq!(production.base_url(), PRODUCTION_BASE_URL);
    }

    #[test]
    fn parses_order_entity_with_numeric_ids() {
        let order: CashfreeOrder = serde_json::from_value(serde_json::json!({
            "cf_order_id": 2149460581u64,
            "order_id": "receipt1_1234567890",
            "entity": "order",
            "order_status": "PAID",
            "order_amount": 224.0,
            "order_currency": "INR",
            "payment_session_id": "session_abc",
            "order_tags": { "internal_order_id": "67e55044-10b1-426f-9247-bb680e5fe0c8" }
        }))
        .unwrap();

        assert_eq!(order.order_status, CashfreeOrderStatus::Paid);
        assert_eq!(order.order_amount, Some(Decimal::from(224)));
        assert_eq!(
            order.cf_order_id.as_ref().and_then(id_to_string).as_deref(),
            Some("2149460581")
        );
        assert_eq!(
            order.order_tag(),
            Some(Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap())
        );
    }

    fn signed_headers(secret: &str, timestamp: &str, body: &[u8]) -> HeaderMap {
        let mut signed = timestamp.as_bytes().to_vec();
        signed.extend_from_slice(body);
        let signature = hmac_sha256_base64(secret, &signed).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, signature.parse().unwrap());
        headers.insert(TIMESTAMP_HEADER, timestamp.parse().unwrap());
        headers
    }

    #[test]
    fn signed_payment_webhook_becomes_callback() {
        let client = CashfreeClient::new(test_config("cfsk_ma_test_abc")).unwrap();
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "PAYMENT_SUCCESS_WEBHOOK",
            "data": {
                "order": { "order_id": "g1", "order_amount": 224 },
                "payment": { "cf_payment_id": 885, "payment_status": "SUCCESS" }
            }
        }))
        .unwrap();
        let headers = signed_headers("cfsk_ma_test_abc", "1700000000", &body);

        let payload = client.parse_webhook(&headers, &body).unwrap().unwrap();
        assert_eq!(payload.gateway_order_id, "g1");
        assert_eq!(payload.asserted(), GatewayStatus::Paid);
        assert_eq!(payload.payment_id.as_deref(), Some("885"));
    }

    #[test]
    fn tampered_webhook_is_rejected() {
        let client = CashfreeClient::new(test_config("cfsk_ma_test_abc")).unwrap();
        let body = br#"{"type":"PAYMENT_SUCCESS_WEBHOOK","data":{"order":{"order_id":"g1"}}}"#;
        let headers = signed_headers("cfsk_ma_test_abc", "1700000000", body);
        let tampered = br#"{"type":"PAYMENT_SUCCESS_WEBHOOK","data":{"order":{"order_id":"g2"}}}"#;

        assert!(matches!(
            client.parse_webhook(&headers, tampered),
            Err(GatewayError::InvalidSignature)
        ));
        assert!(matches!(
            client.parse_webhook(&HeaderMap::new(), body),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[test]
    fn other_webhook_events_are_ignored() {
        let client = CashfreeClient::new(test_config("cfsk_ma_test_abc")).unwrap();
        let body = br#"{"type":"REFUND_STATUS_WEBHOOK","data":{"order":{"order_id":"g1"}}}"#;
        let headers = signed_headers("cfsk_ma_test_abc", "1700000000", body);
        assert!(client.parse_webhook(&headers, body).unwrap().is_none());
    }
}
