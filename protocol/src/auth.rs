//! Shared-secret tunnel authorization tokens.
//!
//! A token is `"<hex-hmac-sha256(secret, ts)>:<ts>"` where `ts` is the Unix
//! time in seconds at generation. The agent generates one per connection
//! attempt; the relay validates it at upgrade time. Tokens carry no request
//! binding, so no replay cache is kept — the ±5 minute window bounds reuse.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token validity window on either side of the embedded timestamp.
const TOKEN_VALIDITY_SECS: i64 = 5 * 60;

/// Reasons a token is rejected. Callers surface a bare 401; the detail is
/// for logs only.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: expected hmac:timestamp")]
    Malformed,
    #[error("token expired: timestamp {0} outside the validity window")]
    Expired(i64),
    #[error("invalid hmac signature")]
    Signature,
}

/// Create an auth token for the given shared secret.
pub fn generate_token(secret: &str) -> String {
    let ts = unix_now().to_string();
    let mac = compute_hmac(secret, &ts);
    format!("{mac}:{ts}")
}

/// Check an auth token against the shared secret.
///
/// The MAC comparison is constant-time; a token whose hex digest does not
/// decode is treated as a signature mismatch.
pub fn validate_token(secret: &str, token: &str) -> Result<(), TokenError> {
    let (mac_hex, ts_str) = token.split_once(':').ok_or(TokenError::Malformed)?;
    let ts: i64 = ts_str.parse().map_err(|_| TokenError::Malformed)?;

    if (unix_now() - ts).abs() > TOKEN_VALIDITY_SECS {
        return Err(TokenError::Expired(ts));
    }

    let mac_bytes = hex::decode(mac_hex).map_err(|_| TokenError::Signature)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(ts_str.as_bytes());
    mac.verify_slice(&mac_bytes).map_err(|_| TokenError::Signature)
}

fn compute_hmac(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
