//! Webhook signature validation and payload digests
//!
//! The telephony provider signs each callback with its auth token:
//!
//! 1. Start from the public URL the provider posted to
//! 2. Append every form parameter as `key + value`, keys sorted ascending
//! 3. HMAC-SHA256 the result with the auth token
//! 4. Base64-encode the MAC into the `X-Provider-Signature` header
//!
//! This module contains only pure functions; HTTP extraction lives in the
//! service crate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider signature
pub const SIGNATURE_HEADER: &str = "x-provider-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing signature header")]
    Missing,

    #[error("Signature is not valid base64")]
    Malformed,

    #[error("Signature does not match payload")]
    Mismatch,
}

/// Build the string the provider signs
///
/// `BTreeMap` iteration gives the sorted key order.
pub fn signing_input(url: &str, params: &BTreeMap<String, String>) -> String {
    let mut input = String::with_capacity(url.len() + params.len() * 16);
    input.push_str(url);
    for (key, value) in params {
        input.push_str(key);
        input.push_str(value);
    }
    input
}

/// Compute the base64 signature for a callback
///
/// # Examples
///
/// ```
/// use callsync_common::signature::compute_signature;
/// use std::collections::BTreeMap;
///
/// let mut params = BTreeMap::new();
/// params.insert("CallSid".to_string(), "CA1".to_string());
///
/// let sig = compute_signature("token", "https://example.com/webhooks/voice-status", &params);
/// assert!(!sig.is_empty());
/// ```
pub fn compute_signature(auth_token: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let mut mac = HmacSha256::new_from_slice(auth_token.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(signing_input(url, params).as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Validate a provided signature in constant time
pub fn validate_signature(
    auth_token: &str,
    url: &str,
    params: &BTreeMap<String, String>,
    provided: Option<&str>,
) -> Result<(), SignatureError> {
    let provided = provided
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::Missing)?;

    let expected = BASE64
        .decode(provided)
        .map_err(|_| SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(auth_token.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(signing_input(url, params).as_bytes());

    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

/// Compare a presented bearer token against the configured one in constant time
///
/// Both sides are MACed under the configured token first, so neither the
/// length nor the first differing byte of the presented value leaks.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    let tag = |value: &str| {
        let mut mac = HmacSha256::new_from_slice(expected.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(value.as_bytes());
        mac
    };
    let provided_tag = tag(provided).finalize().into_bytes();
    tag(expected).verify_slice(&provided_tag).is_ok()
}

/// Hex SHA-256 over the sorted `key=value` pairs of a payload
///
/// Byte-identical replays of the same callback produce the same digest, which
/// makes it usable as a delivery id when the provider sends none.
pub fn payload_digest(params: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("CallStatus".to_string(), "ringing".to_string());
        params.insert("CallSid".to_string(), "CA1".to_string());
        params.insert("From".to_string(), "+15550001111".to_string());
        params
    }

    const URL: &str = "https://calls.example.com/webhooks/voice-status";

    #[test]
    fn test_signing_input_sorts_keys() {
        let input = signing_input(URL, &params());
        assert_eq!(
            input,
            format!("{}CallSidCA1CallStatusringingFrom+15550001111", URL)
        );
    }

    #[test]
    fn test_valid_signature_accepted() {
        let sig = compute_signature("secret", URL, &params());
        assert!(validate_signature("secret", URL, &params(), Some(&sig)).is_ok());
    }

    #[test]
    fn test_wrong_token_rejected() {
        let sig = compute_signature("other", URL, &params());
        assert_eq!(
            validate_signature("secret", URL, &params(), Some(&sig)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let sig = compute_signature("secret", URL, &params());
        let mut tampered = params();
        tampered.insert("CallStatus".to_string(), "completed".to_string());
        assert_eq!(
            validate_signature("secret", URL, &tampered, Some(&sig)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_missing_and_malformed() {
        assert_eq!(
            validate_signature("secret", URL, &params(), None),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            validate_signature("secret", URL, &params(), Some("  ")),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            validate_signature("secret", URL, &params(), Some("not base64!!")),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_payload_digest_is_order_independent_and_stable() {
        let a = payload_digest(&params());
        let mut reordered = BTreeMap::new();
        reordered.insert("From".to_string(), "+15550001111".to_string());
        reordered.insert("CallSid".to_string(), "CA1".to_string());
        reordered.insert("CallStatus".to_string(), "ringing".to_string());
        assert_eq!(a, payload_digest(&reordered));
        assert_eq!(a.len(), 64);

        let mut changed = params();
        changed.insert("CallStatus".to_string(), "completed".to_string());
        assert_ne!(a, payload_digest(&changed));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("admin-secret", "admin-secret"));
        assert!(!tokens_match("admin-secret", "admin-secreT"));
        assert!(!tokens_match("admin-secret", "admin"));
        assert!(!tokens_match("admin-secret", ""));
    }
}
