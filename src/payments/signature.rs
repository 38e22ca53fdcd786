use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use super::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    MissingHeader,

    #[error("malformed signature header")]
    MalformedHeader,

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("no signature matches the payload")]
    Mismatch,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::MalformedHeader)?,
                );
            }
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader {
            timestamp,
            signatures,
        }),
        _ => Err(SignatureError::MalformedHeader),
    }
}

/// Computes the `v1` signature for `payload` signed at `timestamp`.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    hex::encode(mac_for(payload, secret, timestamp).finalize().into_bytes())
}

fn mac_for(payload: &[u8], secret: &str, timestamp: i64) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Checks `header` against the exact request bytes, then parses the event.
///
/// `now` is a unix timestamp in seconds.
pub fn construct_event(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: i64,
) -> Result<WebhookEvent, SignatureError> {
    let parsed = parse_header(header)?;

    if now.abs_diff(parsed.timestamp) > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let mac = mac_for(payload, secret, parsed.timestamp);
    let matched = parsed.signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if !matched {
        return Err(SignatureError::Mismatch);
    }

    serde_json::from_slice(payload).map_err(|e| SignatureError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &[u8] =
        br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_1","metadata":{}}}}"#;

    #[test]
    fn accepts_any_matching_v1_entry() {
        let now = 1_700_000_000;
        let good = sign(PAYLOAD, SECRET, now);
        let header = format!("t={now},v1=deadbeef,v1={good}");
        let event = construct_event(PAYLOAD, &header, SECRET, Duration::from_secs(300), now)
            .expect("valid signature");
        assert_eq!(event.event_type, "payment_intent.succeeded");
    }

    #[test]
    fn rejects_stale_timestamp() {
        let signed_at = 1_700_000_000;
        let header = format!("t={signed_at},v1={}", sign(PAYLOAD, SECRET, signed_at));
        let err = construct_event(
            PAYLOAD,
            &header,
            SECRET,
            Duration::from_secs(300),
            signed_at + 301,
        )
        .unwrap_err();
        assert_eq!(err, SignatureError::Expired);
    }

    #[test]
    fn rejects_header_without_signature() {
        let err = construct_event(PAYLOAD, "t=1700000000", SECRET, Duration::from_secs(300), 1_700_000_000)
            .unwrap_err();
        assert_eq!(err, SignatureError::MalformedHeader);
    }
}
