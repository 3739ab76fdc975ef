use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::config::LedgerConfig;
use crate::ledger::LedgerService;
use crate::packages::TokenPackage;
use crate::stripe::{CheckoutGateway, WebhookVerifier};
use crate::webhook::WebhookQueue;

#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerService,
    pub verifier: WebhookVerifier,
    pub checkout: Arc<dyn CheckoutGateway>,
    pub catalog: Arc<CheckoutCatalog>,
    pub webhooks: WebhookQueue,
    pub start_time: Instant,
    /// Flips to true when long-lived streams must end.
    pub streams_closing: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(
        ledger: LedgerService,
        verifier: WebhookVerifier,
        checkout: Arc<dyn CheckoutGateway>,
        catalog: CheckoutCatalog,
        webhooks: WebhookQueue,
    ) -> Self {
        Self {
            ledger,
            verifier,
            checkout,
            catalog: Arc::new(catalog),
            webhooks,
            start_time: Instant::now(),
            streams_closing: Arc::new(watch::channel(false).0),
        }
    }

    /// Ends every open balance stream so graceful shutdown can finish.
    pub fn close_streams(&self) {
        self.streams_closing.send_replace(true);
    }
}

/// Price ids and redirect targets used when opening a checkout session.
#[derive(Debug, Clone, Default)]
pub struct CheckoutCatalog {
    prices: HashMap<TokenPackage, String>,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutCatalog {
    pub fn new(
        prices: HashMap<TokenPackage, String>,
        success_url: String,
        cancel_url: String,
    ) -> Self {
        assert!(
            prices.values().all(|price| !price.is_empty()),
            "Price ids must be non-empty"
        );
        Self {
            prices,
            success_url,
            cancel_url,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        let prices = TokenPackage::ALL
            .into_iter()
            .filter_map(|package| {
                config
                    .price_for(package)
                    .map(|price| (package, price.to_string()))
            })
            .collect();
        Self::new(
            prices,
            config.stripe.success_url.clone(),
            config.stripe.cancel_url.clone(),
        )
    }

    pub fn price_for(&self, package: TokenPackage) -> Option<&str> {
        self.prices.get(&package).map(String::as_str)
    }
}
