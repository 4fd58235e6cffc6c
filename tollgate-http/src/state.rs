//! Shared state behind every route.

use std::sync::Arc;

use tollgate::credential::CredentialVerifier;
use tollgate::pricing::CostModel;
use tollgate_ledger::Ledger;

use crate::paygate::Paygate;
use crate::providers::RoutingTable;
use crate::settlement::SettlementEngine;

/// Everything a request handler needs.
#[derive(Debug)]
pub struct Gateway {
    /// Balances, reservations and settlement records.
    pub ledger: Ledger,
    /// Resolves bearers into principals.
    pub verifier: CredentialVerifier,
    /// Prices and platform markup.
    pub costs: CostModel,
    /// Provider routes.
    pub routes: RoutingTable,
    /// Client for upstream provider calls.
    pub http: reqwest::Client,
    /// x402 on-demand payments, when enabled.
    pub paygate: Option<Paygate>,
    /// Settles x402 payments; present whenever `paygate` is.
    pub settlement: Option<SettlementEngine>,
    /// Shared secret of the card-payment webhook.
    pub webhook_secret: Option<String>,
}

/// State handed to axum.
pub type GatewayState = Arc<Gateway>;

impl Gateway {
    /// A gateway serving prepaid balances only.
    #[must_use]
    pub fn new(
        ledger: Ledger,
        verifier: CredentialVerifier,
        costs: CostModel,
        routes: RoutingTable,
        http: reqwest::Client,
    ) -> Self {
        Self {
            ledger,
            verifier,
            costs,
            routes,
            http,
            paygate: None,
            settlement: None,
            webhook_secret: None,
        }
    }

    /// Enables x402 on-demand payments.
    #[must_use]
    pub fn with_x402(mut self, paygate: Paygate, settlement: SettlementEngine) -> Self {
        self.paygate = Some(paygate);
        self.settlement = Some(settlement);
        self
    }

    /// Accepts signed card-payment webhooks.
    #[must_use]
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }
}
