//! Opaque order references handed to clients in checkout URLs.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("order reference is not valid base64")]
    Encoding,
    #[error("order reference has an unexpected format")]
    Format,
}

#[derive(Debug, Clone)]
pub struct OrderReference {
    prefix: String,
}

impl OrderReference {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn encode(&self, order_id: Uuid) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}{}", self.prefix, order_id))
    }

    /// URL-safe unpadded is what we hand out; padded standard base64 from
    /// older links is accepted too.
    pub fn decode(&self, reference: &str) -> Result<Uuid, ReferenceError> {
        let reference = reference.trim().trim_end_matches('/');
        let bytes = URL_SAFE_NO_PAD
            .decode(reference)
            .or_else(|_| STANDARD.decode(reference))
            .map_err(|_| ReferenceError::Encoding)?;
        let text = String::from_utf8(bytes).map_err(|_| ReferenceError::Format)?;
        let id = text
            .strip_prefix(&self.prefix)
            .ok_or(ReferenceError::Format)?;
        Uuid::parse_str(id).map_err(|_| ReferenceError::Format)
    }
}
