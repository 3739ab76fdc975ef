//! Turns verified provider events into ledger credits.
//!
//! The HTTP handler only verifies and parses; everything after that happens here, off
//! the response path. A completed checkout becomes a [`CreditInstruction`] keyed by the
//! provider event id, so replays and concurrent deliveries collapse to one entry.

use uuid::Uuid;

use crate::ledger::{ChangeType, CreditRequest};
use crate::packages::{METADATA_PACKAGE_ID, METADATA_USER_ID, TokenPackage};
use crate::stripe::{CheckoutSession, EventKind, WebhookEvent};

mod worker;

pub use worker::{
    RecentEvents, WebhookProcessor, WebhookQueue, WebhookSettings, WebhookWorker,
    recent_events_cache, webhook_channel,
};

pub const METADATA_STRIPE_SESSION_ID: &str = "stripe_session_id";
pub const METADATA_STRIPE_CHARGE_ID: &str = "stripe_charge_id";
pub const METADATA_LEDGER_PACKAGE_ID: &str = "package_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditInstruction {
    pub event_id: String,
    pub user_id: Uuid,
    pub package: TokenPackage,
    pub session_id: String,
    pub charge_id: Option<String>,
}

impl CreditInstruction {
    pub fn credit_request(&self) -> CreditRequest {
        let mut request =
            CreditRequest::new(self.user_id, ChangeType::StripePurchase, self.package.tokens())
                .with_idempotency_key(self.event_id.clone())
                .with_metadata(METADATA_STRIPE_SESSION_ID, self.session_id.clone())
                .with_metadata(METADATA_LEDGER_PACKAGE_ID, self.package.id());
        if let Some(charge_id) = &self.charge_id {
            request = request.with_metadata(METADATA_STRIPE_CHARGE_ID, charge_id.clone());
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DropReason {
    #[error("session {session_id} is missing {key} metadata")]
    MissingMetadata {
        session_id: String,
        key: &'static str,
    },
    #[error("session {session_id} carries invalid user id {value:?}")]
    InvalidUserId { session_id: String, value: String },
    #[error("session {session_id} carries unknown package {value:?}")]
    UnknownPackage { session_id: String, value: String },
    #[error("checkout session object is malformed: {0}")]
    MalformedSession(String),
    #[error("ledger rejected the credit: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    Credit(CreditInstruction),
    Drop(DropReason),
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied { entry_id: i64, balance: i64 },
    Duplicate { entry_id: i64 },
    Dropped(DropReason),
    Ignored,
    /// Storage kept failing; the event needs manual reconciliation.
    Failed { attempts: u32 },
}

pub fn interpret(event: &WebhookEvent) -> Interpretation {
    match &event.kind {
        EventKind::CheckoutSessionCompleted(session) => match instruction_for(&event.id, session) {
            Ok(instruction) => Interpretation::Credit(instruction),
            Err(reason) => Interpretation::Drop(reason),
        },
        EventKind::MalformedCheckout(detail) => {
            Interpretation::Drop(DropReason::MalformedSession(detail.clone()))
        }
        EventKind::Unhandled => Interpretation::Ignore,
    }
}

fn instruction_for(
    event_id: &str,
    session: &CheckoutSession,
) -> Result<CreditInstruction, DropReason> {
    let user_value = session
        .metadata_value(METADATA_USER_ID)
        .ok_or_else(|| DropReason::MissingMetadata {
            session_id: session.id.clone(),
            key: METADATA_USER_ID,
        })?;
    let package_value = session
        .metadata_value(METADATA_PACKAGE_ID)
        .ok_or_else(|| DropReason::MissingMetadata {
            session_id: session.id.clone(),
            key: METADATA_PACKAGE_ID,
        })?;

    let user_id = Uuid::parse_str(user_value).map_err(|_| DropReason::InvalidUserId {
        session_id: session.id.clone(),
        value: user_value.to_string(),
    })?;
    let package = TokenPackage::from_id(package_value).ok_or_else(|| DropReason::UnknownPackage {
        session_id: session.id.clone(),
        value: package_value.to_string(),
    })?;

    Ok(CreditInstruction {
        event_id: event_id.to_string(),
        user_id,
        package,
        session_id: session.id.clone(),
        charge_id: session.charge_reference().map(str::to_string),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stripe::parse_event;
    use serde_json::json;

    pub(crate) fn checkout_payload(event_id: &str, user_id: &str, package_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": {"object": {
                "id": format!("cs_{event_id}"),
                "payment_intent": format!("pi_{event_id}"),
                "metadata": {"userId": user_id, "packageId": package_id}
            }}
        }))
        .unwrap()
    }

    pub(crate) fn checkout_event(event_id: &str, user_id: Uuid, package_id: &str) -> WebhookEvent {
        parse_event(&checkout_payload(event_id, &user_id.to_string(), package_id)).unwrap()
    }

    #[test]
    fn completed_checkout_becomes_instruction() {
        let user = Uuid::now_v7();
        let Interpretation::Credit(instruction) = interpret(&checkout_event("evt_1", user, "100"))
        else {
            panic!("expected credit instruction");
        };
        assert_eq!(instruction.user_id, user);
        assert_eq!(instruction.package, TokenPackage::Tokens100);
        assert_eq!(instruction.charge_id.as_deref(), Some("pi_evt_1"));

        let request = instruction.credit_request();
        assert_eq!(request.amount, 100);
        assert_eq!(request.change_type, ChangeType::StripePurchase);
        assert_eq!(request.idempotency_key.as_deref(), Some("evt_1"));
        assert_eq!(
            request.metadata[METADATA_STRIPE_SESSION_ID].as_text(),
            Some("cs_evt_1")
        );
        assert_eq!(request.metadata[METADATA_LEDGER_PACKAGE_ID].as_text(), Some("100"));
    }

    #[test]
    fn unknown_package_is_dropped() {
        let event = checkout_event("evt_2", Uuid::now_v7(), "999");
        assert!(matches!(
            interpret(&event),
            Interpretation::Drop(DropReason::UnknownPackage { value, .. }) if value == "999"
        ));
    }

    #[test]
    fn bad_user_metadata_is_dropped() {
        let event = parse_event(&checkout_payload("evt_3", "not-a-uuid", "30")).unwrap();
        assert!(matches!(
            interpret(&event),
            Interpretation::Drop(DropReason::InvalidUserId { .. })
        ));

        let event = parse_event(&checkout_payload("evt_4", "", "30")).unwrap();
        assert!(matches!(
            interpret(&event),
            Interpretation::Drop(DropReason::MissingMetadata { key: "userId", .. })
        ));
    }

    #[test]
    fn other_events_are_ignored() {
        let body = serde_json::to_vec(&json!({
            "id": "evt_5",
            "type": "invoice.paid",
            "data": {"object": {}}
        }))
        .unwrap();
        assert_eq!(interpret(&parse_event(&body).unwrap()), Interpretation::Ignore);
    }
}
