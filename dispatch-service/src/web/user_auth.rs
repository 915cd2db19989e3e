//! User session tokens for the read-only message views.
//!
//! A token is `{payload}.{signature}`: the payload is the JSON session,
//! base64url-encoded without padding, and the signature is the hex
//! HMAC-SHA256 of the encoded payload under the user auth key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::store::CompanyScope;

type HmacSha256 = Hmac<Sha256>;

/// Company value granting access to every company's records.
pub const ALL_COMPANIES: &str = "__all__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub company: String,
    /// Expiry, epoch milliseconds
    pub expires: i64,
}

impl UserSession {
    pub fn scope(&self) -> CompanyScope {
        if self.company == ALL_COMPANIES {
            CompanyScope::All
        } else {
            CompanyScope::Company(self.company.clone())
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UserAuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("bad auth data")]
    BadData,

    #[error("token expired")]
    Expired,
}

fn mac(secret: &str) -> Option<HmacSha256> {
    if secret.is_empty() {
        return None;
    }
    HmacSha256::new_from_slice(secret.as_bytes()).ok()
}

/// Issue a token for `session`. `None` when the key is empty.
pub fn issue_user_token(secret: &str, session: &UserSession) -> Option<String> {
    let json = serde_json::to_vec(session).ok()?;
    let payload = URL_SAFE_NO_PAD.encode(json);

    let mut mac = mac(secret)?;
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    Some(format!("{}.{}", payload, signature))
}

/// Verify a token and decode its session.
///
/// The signature is checked before the payload is decoded; a session whose
/// `expires` is before `now_ms` is rejected.
pub fn verify_user_token(
    secret: &str,
    token: &str,
    now_ms: i64,
) -> Result<UserSession, UserAuthError> {
    let (payload, signature) = token
        .trim()
        .rsplit_once('.')
        .ok_or(UserAuthError::InvalidToken)?;

    let signature = hex::decode(signature).map_err(|_| UserAuthError::InvalidToken)?;
    let mut mac = mac(secret).ok_or(UserAuthError::InvalidToken)?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| UserAuthError::InvalidToken)?;

    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| UserAuthError::BadData)?;
    let session: UserSession =
        serde_json::from_slice(&json).map_err(|_| UserAuthError::BadData)?;

    if session.expires < now_ms {
        return Err(UserAuthError::Expired);
    }
    Ok(session)
}
