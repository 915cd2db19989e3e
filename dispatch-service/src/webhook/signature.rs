//! Signed-provider webhook verification.
//!
//! The provider signs each callback with HMAC-SHA1 keyed by the webhook
//! secret, over the callback URL followed by every posted form field as
//! `key + value` in key order. The binary digest is base64-encoded and sent
//! in the `X-Mandrill-Signature` header.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::warn;

type HmacSha1 = Hmac<Sha1>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Mandrill-Signature";

/// Compute the base64 signature for a set of posted fields.
///
/// Fields are sorted by key before signing; the values are the raw,
/// un-decoded strings exactly as posted.
pub fn sign_webhook(secret: &str, url: &str, fields: &[(&str, &str)]) -> Option<String> {
    let mut sorted = fields.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(url.as_bytes());
    for (key, value) in sorted {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }

    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Verify a signed webhook.
///
/// # Arguments
///
/// * `secret` - The webhook key issued by the provider
/// * `url` - The callback URL exactly as registered with the provider
/// * `fields` - The posted form fields
/// * `signature` - The value of the signature header
///
/// # Returns
///
/// `true` if the signature matches, `false` otherwise.
pub fn verify_webhook_signature(
    secret: &str,
    url: &str,
    fields: &[(&str, &str)],
    signature: &str,
) -> bool {
    if secret.is_empty() || signature.is_empty() {
        warn!(
            has_secret = !secret.is_empty(),
            has_signature = !signature.is_empty(),
            "webhook_signature_missing_fields"
        );
        return false;
    }

    let Some(expected) = sign_webhook(secret, url, fields) else {
        warn!("webhook_signature_invalid_key");
        return false;
    };
    let valid = constant_time_compare(&expected, signature);

    if !valid {
        warn!(
            url = %url,
            expected_length = expected.len(),
            actual_length = signature.len(),
            "webhook_signature_mismatch"
        );
    }

    valid
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check if signed webhooks can be accepted at all.
pub fn is_signature_verification_enabled(secret: &Option<String>) -> bool {
    secret
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/webhook/mandrill/";

    #[test]
    fn test_sign_and_verify() {
        let fields = [("mandrill_events", "[]")];
        let sig = sign_webhook("key", URL, &fields).unwrap();
        assert_eq!(sig.len(), 28);
        assert!(verify_webhook_signature("key", URL, &fields, &sig));
    }

    #[test]
    fn test_fields_are_signed_in_key_order() {
        let a = sign_webhook("key", URL, &[("b", "2"), ("a", "1")]).unwrap();
        let b = sign_webhook("key", URL, &[("a", "1"), ("b", "2")]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_flipped_byte_rejected() {
        let fields = [("mandrill_events", r#"[{"event":"open"}]"#)];
        let sig = sign_webhook("secret", URL, &fields).unwrap();

        let tampered = [("mandrill_events", r#"[{"event":"opEn"}]"#)];
        assert!(!verify_webhook_signature("secret", URL, &tampered, &sig));
        assert!(!verify_webhook_signature("secreT", URL, &fields, &sig));
        assert!(!verify_webhook_signature("secret", "https://example.com/other/", &fields, &sig));
    }

    #[test]
    fn test_missing_inputs_rejected() {
        let fields = [("mandrill_events", "[]")];
        assert!(!verify_webhook_signature("", URL, &fields, "sig"));
        assert!(!verify_webhook_signature("key", URL, &fields, ""));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn test_is_signature_verification_enabled() {
        assert!(!is_signature_verification_enabled(&None));
        assert!(!is_signature_verification_enabled(&Some("   ".to_string())));
        assert!(is_signature_verification_enabled(&Some("key123".to_string())));
    }
}
