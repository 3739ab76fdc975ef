//! Stripe boundary: signed webhook intake types and the checkout session client.

pub mod checkout;
pub mod event;
pub mod signature;

pub use checkout::{
    CheckoutError, CheckoutGateway, CheckoutSessionRequest, CreatedCheckoutSession, StripeClient,
};
pub use event::{CheckoutSession, EventKind, EventParseError, WebhookEvent, parse_event};
pub use signature::{SIGNATURE_HEADER, SignatureError, WebhookVerifier};
