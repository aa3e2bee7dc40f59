use crate::errors::ServiceError;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Provider event envelope. Only the fields reconciliation reads are typed.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    pub fn object_id(&self) -> Option<&str> {
        self.data.object.get("id").and_then(Value::as_str)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.data
            .object
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Verifies a `t=<unix>,v1=<hex>` signature header over `"{t}.{payload}"`.
///
/// Any of the `v1` entries may match.
pub fn verify_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(invalid_signature)?;
    let ts: i64 = timestamp.parse().map_err(|_| invalid_signature())?;
    if now.abs_diff(ts) > tolerance_secs {
        return Err(ServiceError::Unauthorized(
            "webhook timestamp outside tolerance".to_string(),
        ));
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mac = signed_mac(secret, timestamp, payload)?;
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(invalid_signature())
}

/// Produces a header value accepted by [`verify_signature`].
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, ServiceError> {
    let ts = timestamp.to_string();
    let mac = signed_mac(secret, &ts, payload)?;
    Ok(format!(
        "t={},v1={}",
        ts,
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn signed_mac(secret: &str, timestamp: &str, payload: &[u8]) -> Result<HmacSha256, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

fn invalid_signature() -> ServiceError {
    ServiceError::Unauthorized("invalid webhook signature".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &[u8] = br#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    #[test]
    fn accepts_own_signature() {
        let header = sign_payload(PAYLOAD, SECRET, 1_700_000_000).unwrap();
        assert!(verify_signature(&header, PAYLOAD, SECRET, 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let header = sign_payload(PAYLOAD, SECRET, 1_700_000_000).unwrap();
        assert_matches!(
            verify_signature(&header, b"{}", SECRET, 300, 1_700_000_000),
            Err(ServiceError::Unauthorized(_))
        );
        assert_matches!(
            verify_signature(&header, PAYLOAD, "whsec_other", 300, 1_700_000_000),
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[test]
    fn rejects_stale_timestamps() {
        let header = sign_payload(PAYLOAD, SECRET, 1_700_000_000).unwrap();
        assert!(verify_signature(&header, PAYLOAD, SECRET, 300, 1_700_000_301).is_err());
        assert!(verify_signature(&header, PAYLOAD, SECRET, 300, 1_699_999_699).is_err());
    }

    #[test]
    fn any_v1_entry_may_match() {
        let header = sign_payload(PAYLOAD, SECRET, 1_700_000_000).unwrap();
        let (t, v1) = header.split_once(',').unwrap();
        let rotated = format!("{},v1=deadbeef,{},v0=ignored", t, v1);
        assert!(verify_signature(&rotated, PAYLOAD, SECRET, 300, 1_700_000_000).is_ok());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "v1=abc", "t=notanumber,v1=abc", "t=1700000000"] {
            assert!(verify_signature(header, PAYLOAD, SECRET, 300, 1_700_000_000).is_err());
        }
    }

    #[test]
    fn event_accessors_read_the_object() {
        let event: WebhookEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {"object": {"id": "pi_1", "metadata": {"orderId": "o-1", "empty": ""}}}
        }))
        .unwrap();
        assert_eq!(event.object_id(), Some("pi_1"));
        assert_eq!(event.metadata("orderId"), Some("o-1"));
        assert_eq!(event.metadata("empty"), None);
    }
}
