//! Typed view of the Stripe event envelope.
//!
//! Only the fields the ledger acts on are modelled. Unknown event types parse into
//! [`EventKind::Unhandled`]; a completed checkout whose object does not match the
//! expected shape parses into [`EventKind::MalformedCheckout`] so it can be dropped
//! explicitly rather than rejected back to the provider.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
const MAX_EVENT_ID_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    #[error("event payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event id must be non-empty and at most {MAX_EVENT_ID_LEN} characters")]
    InvalidId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub livemode: bool,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutSessionCompleted(CheckoutSession),
    MalformedCheckout(String),
    Unhandled,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<PaymentIntentRef>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl CheckoutSession {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get(key))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn charge_reference(&self) -> Option<&str> {
        self.payment_intent.as_ref().map(PaymentIntentRef::id)
    }
}

/// `payment_intent` is an id string unless the event was expanded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PaymentIntentRef {
    Id(String),
    Expanded { id: String },
}

impl PaymentIntentRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Expanded { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    livemode: bool,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: Value,
}

pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent, EventParseError> {
    let raw: RawEvent = serde_json::from_slice(payload)?;
    let id = raw.id.trim().to_string();
    if id.is_empty() || id.len() > MAX_EVENT_ID_LEN {
        return Err(EventParseError::InvalidId);
    }

    let kind = match raw.event_type.as_str() {
        CHECKOUT_SESSION_COMPLETED => {
            match serde_json::from_value::<CheckoutSession>(raw.data.object) {
                Ok(session) => EventKind::CheckoutSessionCompleted(session),
                Err(err) => EventKind::MalformedCheckout(err.to_string()),
            }
        }
        _ => EventKind::Unhandled,
    };

    Ok(WebhookEvent {
        id,
        event_type: raw.event_type,
        created: raw.created,
        livemode: raw.livemode,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn completed_checkout_is_typed() {
        let body = payload(json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "livemode": false,
            "data": {"object": {
                "id": "cs_test_1",
                "payment_intent": "pi_1",
                "payment_status": "paid",
                "metadata": {"userId": "u", "packageId": "100"}
            }}
        }));
        let event = parse_event(&body).unwrap();
        assert_eq!(event.id, "evt_1");
        let EventKind::CheckoutSessionCompleted(session) = event.kind else {
            panic!("expected checkout session");
        };
        assert_eq!(session.id, "cs_test_1");
        assert_eq!(session.charge_reference(), Some("pi_1"));
        assert_eq!(session.metadata_value("packageId"), Some("100"));
        assert_eq!(session.metadata_value("missing"), None);
    }

    #[test]
    fn expanded_payment_intent_is_accepted() {
        let body = payload(json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_2", "payment_intent": {"id": "pi_2", "amount": 1499}}}
        }));
        let event = parse_event(&body).unwrap();
        let EventKind::CheckoutSessionCompleted(session) = event.kind else {
            panic!("expected checkout session");
        };
        assert_eq!(session.charge_reference(), Some("pi_2"));
        assert!(session.metadata.is_none());
    }

    #[test]
    fn other_event_types_are_unhandled() {
        let body = payload(json!({
            "id": "evt_3",
            "type": "payment_intent.created",
            "data": {"object": {"id": "pi_3"}}
        }));
        assert_eq!(parse_event(&body).unwrap().kind, EventKind::Unhandled);
    }

    #[test]
    fn malformed_checkout_object_is_flagged() {
        let body = payload(json!({
            "id": "evt_4",
            "type": "checkout.session.completed",
            "data": {"object": {"metadata": "not-a-map"}}
        }));
        assert!(matches!(
            parse_event(&body).unwrap().kind,
            EventKind::MalformedCheckout(_)
        ));
    }

    #[test]
    fn invalid_envelopes_are_errors() {
        assert!(matches!(parse_event(b"not json"), Err(EventParseError::Json(_))));
        let body = payload(json!({"id": " ", "type": "x", "data": {"object": {}}}));
        assert!(matches!(parse_event(&body), Err(EventParseError::InvalidId)));
    }
}
