//! `Stripe-Signature` verification.
//!
//! The header carries `t=<unix seconds>` and one or more `v1=<hex>` entries. Each
//! `v1` is HMAC-SHA256 over `"{t}.{raw body}"` keyed with the endpoint secret.

use std::time::Duration;

use anyhow::{Result, anyhow};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";
pub const DEFAULT_TOLERANCE_SECONDS: u64 = 300;
const MAX_HEADER_LEN: usize = 4096;
const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Stripe-Signature header is missing")]
    MissingHeader,
    #[error("Stripe-Signature header is malformed: {0}")]
    MalformedHeader(&'static str),
    #[error("no v1 signatures found in header")]
    NoSignatures,
    #[error("timestamp {timestamp} is outside the tolerance window (now {now})")]
    TimestampOutsideTolerance { timestamp: i64, now: i64 },
    #[error("no signature matches the expected signature for the payload")]
    Mismatch,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    mac: HmacSha256,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: &str, tolerance: Duration) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(anyhow!("Webhook signing secret must not be empty"));
        }
        assert!(
            tolerance <= Duration::from_secs(3_600),
            "Signature tolerance exceeds one hour"
        );
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|err| anyhow!("Invalid webhook signing secret: {err}"))?;
        Ok(Self { mac, tolerance })
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Verifies `header` against the exact bytes of `payload` at time `now` (unix seconds).
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<(), SignatureError> {
        let parsed = ParsedHeader::parse(header)?;

        // verify_slice compares in constant time
        let matched = parsed.signatures.iter().any(|candidate| {
            self.signed_payload_mac(parsed.timestamp, payload)
                .verify_slice(candidate)
                .is_ok()
        });
        if !matched {
            return Err(SignatureError::Mismatch);
        }

        if now.abs_diff(parsed.timestamp) > self.tolerance.as_secs() {
            return Err(SignatureError::TimestampOutsideTolerance {
                timestamp: parsed.timestamp,
                now,
            });
        }
        Ok(())
    }

    /// Builds a header value the way Stripe does; used by local tooling and tests.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let signature = self
            .signed_payload_mac(timestamp, payload)
            .finalize()
            .into_bytes();
        format!("t={timestamp},v1={}", hex::encode(signature))
    }

    fn signed_payload_mac(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }
}

struct ParsedHeader {
    timestamp: i64,
    signatures: Vec<Vec<u8>>,
}

impl ParsedHeader {
    fn parse(header: &str) -> Result<Self, SignatureError> {
        let header = header.trim();
        if header.is_empty() {
            return Err(SignatureError::MissingHeader);
        }
        if header.len() > MAX_HEADER_LEN {
            return Err(SignatureError::MalformedHeader("header too long"));
        }

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for item in header.split(',') {
            let Some((key, value)) = item.trim().split_once('=') else {
                return Err(SignatureError::MalformedHeader("expected key=value pairs"));
            };
            match key {
                "t" => {
                    let parsed = value.parse::<i64>().map_err(|_| {
                        SignatureError::MalformedHeader("timestamp is not an integer")
                    })?;
                    timestamp = Some(parsed);
                }
                "v1" => {
                    // Undecodable candidates can never match; skip them.
                    if let Ok(bytes) = hex::decode(value) {
                        if signatures.len() < MAX_CANDIDATES {
                            signatures.push(bytes);
                        }
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MalformedHeader("missing timestamp"))?;
        if signatures.is_empty() {
            return Err(SignatureError::NoSignatures);
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SECRET, Duration::from_secs(DEFAULT_TOLERANCE_SECONDS)).unwrap()
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().sign(payload, NOW);
        assert!(header.starts_with("t=1700000000,v1="));
        assert_eq!(verifier().verify(payload, &header, NOW + 10), Ok(()));
    }

    #[test]
    fn known_vector_matches() {
        // HMAC-SHA256("whsec_test_secret", "1700000000.{}")
        let header = verifier().sign(b"{}", NOW);
        let expected = {
            let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
            mac.update(b"1700000000.{}");
            hex::encode(mac.finalize().into_bytes())
        };
        assert_eq!(header, format!("t={NOW},v1={expected}"));
    }

    #[test]
    fn any_matching_candidate_is_accepted() {
        let payload = b"payload";
        let good = verifier().sign(payload, NOW);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1={},v0=abc,v1={good_sig}", "00".repeat(32));
        assert_eq!(verifier().verify(payload, &header, NOW), Ok(()));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let header = verifier().sign(b"original", NOW);
        assert_eq!(
            verifier().verify(b"tampered", &header, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let other = WebhookVerifier::new("whsec_other", Duration::from_secs(300)).unwrap();
        let header = other.sign(b"body", NOW);
        assert_eq!(
            verifier().verify(b"body", &header, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_and_future_timestamps_are_rejected() {
        let header = verifier().sign(b"body", NOW);
        assert!(matches!(
            verifier().verify(b"body", &header, NOW + 301),
            Err(SignatureError::TimestampOutsideTolerance { .. })
        ));
        assert!(matches!(
            verifier().verify(b"body", &header, NOW - 301),
            Err(SignatureError::TimestampOutsideTolerance { .. })
        ));
        assert_eq!(verifier().verify(b"body", &header, NOW + 300), Ok(()));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(
            verifier().verify(b"body", "", NOW),
            Err(SignatureError::MissingHeader)
        );
        assert!(matches!(
            verifier().verify(b"body", "garbage", NOW),
            Err(SignatureError::MalformedHeader(_))
        ));
        assert!(matches!(
            verifier().verify(b"body", "v1=abcd", NOW),
            Err(SignatureError::MalformedHeader("missing timestamp"))
        ));
        assert_eq!(
            verifier().verify(b"body", &format!("t={NOW},v0=abcd"), NOW),
            Err(SignatureError::NoSignatures)
        );
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(WebhookVerifier::new("  ", Duration::from_secs(300)).is_err());
    }
}
