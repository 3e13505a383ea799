//! # Stripe Webhook Handling
//!
//! Signature verification and event parsing for Stripe webhooks.
//! The `Stripe-Signature` header carries a timestamp and one or more
//! HMAC-SHA256 signatures: `t=1700000000,v1=5257a869...`.

use checkout_core::{ShopError, ShopResult, WebhookEvent, WebhookEventType};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Events that should be enabled in the Stripe Dashboard
pub const REQUIRED_WEBHOOK_EVENTS: &[&str] = &[
    "checkout.session.completed",
    "checkout.session.expired",
    "payment_intent.succeeded",
    "payment_intent.payment_failed",
];

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> ShopResult<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        ShopError::WebhookVerificationFailed("Missing timestamp in signature".to_string())
    })?;

    if signatures.is_empty() {
        return Err(ShopError::WebhookVerificationFailed(
            "No v1 signature found".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> ShopResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ShopError::Configuration(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Build a `Stripe-Signature` header for `payload` (used by tests and tooling)
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> ShopResult<String> {
    Ok(format!("t={},v1={}", timestamp, compute_signature(secret, timestamp, payload)?))
}

/// Verify a `Stripe-Signature` header against `now`
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> ShopResult<()> {
    let parts = parse_signature_header(header)?;

    let skew = (now.timestamp() - parts.timestamp).unsigned_abs();
    if skew > tolerance.as_secs() {
        return Err(ShopError::WebhookVerificationFailed(
            "Timestamp outside tolerance".to_string(),
        ));
    }

    let expected = compute_signature(secret, parts.timestamp, payload)?;
    if !parts
        .signatures
        .iter()
        .any(|sig| constant_time_compare(sig, &expected))
    {
        return Err(ShopError::WebhookVerificationFailed(
            "Signature mismatch".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StripeWebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Map<String, serde_json::Value>,
}

/// Parse a verified payload into a provider-agnostic event
pub fn parse_event(payload: &[u8]) -> ShopResult<WebhookEvent> {
    let event: StripeWebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| ShopError::Serialization(format!("Failed to parse webhook: {}", e)))?;

    debug!("Parsed Stripe webhook: type={}", event.event_type);

    let event_type = match event.event_type.as_str() {
        "checkout.session.completed" => WebhookEventType::CheckoutCompleted,
        "checkout.session.expired" => WebhookEventType::CheckoutExpired,
        "payment_intent.succeeded" => WebhookEventType::PaymentSucceeded,
        "payment_intent.payment_failed" => WebhookEventType::PaymentFailed,
        other => WebhookEventType::Unknown(other.to_string()),
    };

    let object = &event.data.object;
    let text = |key: &str| object.get(key).and_then(|v| v.as_str()).map(String::from);

    // Session events carry the session id as the object id.
    let session_id = match event_type {
        WebhookEventType::CheckoutCompleted | WebhookEventType::CheckoutExpired => text("id"),
        _ => None,
    };
    let payment_intent_id = match event_type {
        WebhookEventType::PaymentSucceeded | WebhookEventType::PaymentFailed => text("id"),
        _ => text("payment_intent"),
    };

    Ok(WebhookEvent {
        event_id: event.id,
        event_type,
        provider: "stripe".to_string(),
        session_id,
        payment_intent_id,
        amount_paid: object.get("amount_total").and_then(|v| v.as_i64()),
        payment_status: text("payment_status"),
        timestamp: DateTime::from_timestamp(event.created, 0).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    fn completed_payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": {
                "object": {
                    "id": "cs_test_123",
                    "payment_intent": "pi_456",
                    "amount_total": 2997,
                    "payment_status": "paid"
                }
            }
        }))
        .unwrap()
    }

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    #[test]
    fn test_parse_signature_header() {
        let parsed = parse_signature_header("t=1234567890,v1=abc123,v1=def456").unwrap();

        assert_eq!(parsed.timestamp, 1234567890);
        assert_eq!(parsed.signatures.len(), 2);
        assert_eq!(parsed.signatures[0], "abc123");

        assert!(parse_signature_header("v1=abc").is_err());
        assert!(parse_signature_header("t=1").is_err());
    }

    #[test]
    fn test_signature_roundtrip() {
        let payload = completed_payload();
        let header = sign_payload(SECRET, 1_700_000_000, &payload).unwrap();

        let tolerance = Duration::from_secs(300);
        assert!(verify_signature(SECRET, &payload, &header, tolerance, at(1_700_000_100)).is_ok());
        assert!(verify_signature("whsec_other", &payload, &header, tolerance, at(1_700_000_100)).is_err());
        assert!(verify_signature(SECRET, b"{}", &header, tolerance, at(1_700_000_100)).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = completed_payload();
        let header = sign_payload(SECRET, 1_700_000_000, &payload).unwrap();

        let err = verify_signature(SECRET, &payload, &header, Duration::from_secs(300), at(1_700_001_000))
            .unwrap_err();
        assert!(matches!(err, ShopError::WebhookVerificationFailed(_)));
    }

    #[test]
    fn test_parse_completed_event() {
        let event = parse_event(&completed_payload()).unwrap();

        assert_eq!(event.event_type, WebhookEventType::CheckoutCompleted);
        assert_eq!(event.session_id.as_deref(), Some("cs_test_123"));
        assert_eq!(event.payment_intent_id.as_deref(), Some("pi_456"));
        assert_eq!(event.amount_paid, Some(2997));
        assert!(event.is_paid_checkout());
    }

    #[test]
    fn test_unknown_event_passthrough() {
        let payload = serde_json::to_vec(&json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "created": 1_700_000_000,
            "data": { "object": { "id": "ch_1" } }
        }))
        .unwrap();

        let event = parse_event(&payload).unwrap();
        assert_eq!(event.event_type, WebhookEventType::Unknown("charge.refunded".to_string()));
        assert!(event.session_id.is_none());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc123", "abc123"));
        assert!(!constant_time_compare("abc123", "abc124"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
