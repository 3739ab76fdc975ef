//! Prepaid token ledger with idempotent crediting from Stripe checkout webhooks.

pub mod config;
pub mod entities;
pub mod http;
pub mod ledger;
pub mod models;
pub mod packages;
pub mod state;
pub mod stripe;
pub mod webhook;
