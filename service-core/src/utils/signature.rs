use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

fn mac_bytes(secret: &str, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-SHA256 of `payload`, hex encoded.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String, anyhow::Error> {
    Ok(hex::encode(mac_bytes(secret, payload)?))
}

/// HMAC-SHA256 of `payload`, standard base64 encoded.
pub fn hmac_sha256_base64(secret: &str, payload: &[u8]) -> Result<String, anyhow::Error> {
    Ok(STANDARD.encode(mac_bytes(secret, payload)?))
}

/// Constant time comparison of two encoded signatures.
pub fn signatures_match(expected: &str, provided: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let provided_bytes = provided.as_bytes();

    if expected_bytes.len() != provided_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(provided_bytes).into()
}
