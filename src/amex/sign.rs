//! MAC request signing for the partner API.
//!
//! ```text
//! bodyhash  = base64(HMAC-SHA256(secret, body))
//! canonical = "{ts}\n{nonce}\n{METHOD}\n{path}\n{host}\n443\n{bodyhash}\n"
//! mac       = base64(HMAC-SHA256(secret, canonical))
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use super::SigningError;
use crate::credentials::ClientCredentials;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-AMEX-API-KEY";

/// The partner signs against the TLS port regardless of the URL actually used.
const SIGNED_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacHeaders {
    pub api_key: String,
    pub authorization: String,
    pub bodyhash: String,
    pub mac: String,
}

impl MacHeaders {
    /// Header pairs to attach to the request, content type included.
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            ("Content-Type", "application/json"),
            (API_KEY_HEADER, self.api_key.as_str()),
            ("Authorization", self.authorization.as_str()),
        ]
    }
}

/// Milliseconds since the epoch, rounded to the nearest millisecond.
pub fn epoch_millis(now: DateTime<Utc>) -> i64 {
    (now.timestamp_micros() + 500).div_euclid(1000)
}

fn hmac_base64(secret: &[u8], data: &[u8]) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SigningError::Key)?;
    mac.update(data);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Build the authentication headers for one request.
pub fn sign(
    credentials: &ClientCredentials,
    method: &str,
    path: &str,
    host: &str,
    body: &str,
    ts_ms: i64,
    nonce: Uuid,
) -> Result<MacHeaders, SigningError> {
    let secret = credentials.client_secret.as_bytes();
    let bodyhash = hmac_base64(secret, body.as_bytes())?;
    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
        ts_ms,
        nonce,
        method.to_uppercase(),
        path,
        host,
        SIGNED_PORT,
        bodyhash
    );
    let mac = hmac_base64(secret, canonical.as_bytes())?;
    let authorization = format!(
        r#"MAC id="{}",ts="{}",nonce="{}",bodyhash="{}",mac="{}""#,
        credentials.client_id, ts_ms, nonce, bodyhash, mac
    );

    Ok(MacHeaders {
        api_key: credentials.client_id.clone(),
        authorization,
        bodyhash,
        mac,
    })
}
