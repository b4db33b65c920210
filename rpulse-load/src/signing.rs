//! HMAC-SHA256 signing compatible with GitHub's `X-Hub-Signature-256` header.
//!
//! - The signature is computed over the raw request body, byte for byte
//! - The digest is hex encoded and prefixed with `sha256=`
//!
//! See: <https://docs.github.com/en/webhooks/using-webhooks/validating-webhook-deliveries>

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error as ThisError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Prefix of the header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid signature format")]
    Malformed,
    #[error("Invalid signature")]
    Mismatch,
}

/// Sign a request body.
///
/// # Returns
///
/// The header value in format `sha256={hex-hmac-sha256}`
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    let signature = mac.finalize().into_bytes();

    format!("{}{}", SIGNATURE_PREFIX, hex::encode(signature))
}

/// Verify a signature header against a body.
///
/// The `sha256=` prefix is optional. Comparison is constant time.
pub fn verify_signature(body: &[u8], signature: &str, secret: &str) -> Result<(), SignatureError> {
    let digest = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let received = hex::decode(digest).map_err(|_| SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&received).map_err(|_| SignatureError::Mismatch)
}
