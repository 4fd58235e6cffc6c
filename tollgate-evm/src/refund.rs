//! Overpayment refunds as plain ERC-20 transfers from the proxy's wallet.

use std::collections::HashMap;
use std::time::Duration;

use alloy_network::EthereumWallet;
use alloy_primitives::{Address, Bytes, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use tracing::Instrument;
use tollgate::settlement::{BoxError, RefundReceipt, RefundRequest, RefundSender};
use url::Url;

use crate::contract::IERC20::{balanceOfCall, transferCall};
use crate::networks::chain_id;

/// Default time to wait for a refund receipt.
pub const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 60;

/// Errors raised while sending a refund.
#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    /// No RPC endpoint is configured for the network.
    #[error("no rpc endpoint configured for network {0}")]
    UnknownNetwork(String),
    /// The refund names an unparseable address.
    #[error("invalid {field} address {value:?}")]
    InvalidAddress {
        /// Which address.
        field: &'static str,
        /// Offending value.
        value: String,
    },
    /// The wallet cannot cover the refund.
    #[error("refund wallet holds {available} units, {required} required")]
    InsufficientBalance {
        /// Wallet balance.
        available: U256,
        /// Refund amount.
        required: U256,
    },
    /// The RPC node failed.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// The transfer was mined but reverted.
    #[error("refund transaction {0} reverted")]
    Reverted(String),
}

/// Sends refunds from one wallet across the configured networks.
pub struct Erc20RefundSender {
    signer: PrivateKeySigner,
    chains: HashMap<String, DynProvider>,
    receipt_timeout: Duration,
}

impl std::fmt::Debug for Erc20RefundSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Erc20RefundSender")
            .field("address", &self.signer.address())
            .field("networks", &self.chains.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Erc20RefundSender {
    /// A sender signing with `signer` and no networks yet.
    #[must_use]
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self {
            signer,
            chains: HashMap::new(),
            receipt_timeout: Duration::from_secs(DEFAULT_RECEIPT_TIMEOUT_SECS),
        }
    }

    /// Adds an RPC endpoint for a CAIP-2 network.
    ///
    /// # Errors
    ///
    /// [`RefundError::UnknownNetwork`] if `network` is not an `eip155:` id.
    pub fn with_chain(mut self, network: &str, rpc_url: Url) -> Result<Self, RefundError> {
        if chain_id(network).is_none() {
            return Err(RefundError::UnknownNetwork(network.to_owned()));
        }
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(rpc_url)
            .erased();
        tracing::info!(network, signer = %self.signer.address(), "Registered refund network");
        self.chains.insert(network.to_owned(), provider);
        Ok(self)
    }

    /// How long to wait for the refund to be mined.
    #[must_use]
    pub const fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    /// The refund wallet's address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    async fn token_balance(
        &self,
        provider: &DynProvider,
        token: Address,
    ) -> Result<U256, RefundError> {
        let call = balanceOfCall {
            account: self.signer.address(),
        };
        let tx = TransactionRequest::default()
            .to(token)
            .input(Bytes::from(call.abi_encode()).into());
        let result: Bytes = provider
            .call(tx)
            .await
            .map_err(|e| RefundError::Rpc(e.to_string()))?;
        if result.len() >= 32 {
            Ok(U256::from_be_slice(&result[..32]))
        } else {
            Err(RefundError::Rpc("invalid balanceOf response".to_owned()))
        }
    }

    async fn transfer(&self, refund: &RefundRequest) -> Result<RefundReceipt, RefundError> {
        let provider = self
            .chains
            .get(&refund.network)
            .ok_or_else(|| RefundError::UnknownNetwork(refund.network.clone()))?;
        let token = parse_address("asset", &refund.asset)?;
        let to = parse_address("payer", &refund.to)?;
        let amount = U256::from(refund.amount_units);

        let available = self.token_balance(provider, token).await?;
        if available < amount {
            return Err(RefundError::InsufficientBalance {
                available,
                required: amount,
            });
        }

        let calldata = transferCall { to, amount }.abi_encode();
        let tx = TransactionRequest::default()
            .from(self.signer.address())
            .to(token)
            .input(Bytes::from(calldata).into());
        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|e| RefundError::Rpc(e.to_string()))?;
        let receipt = pending
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt()
            .await
            .map_err(|e| RefundError::Rpc(e.to_string()))?;
        let hash = format!("{:?}", receipt.transaction_hash);
        if !receipt.status() {
            return Err(RefundError::Reverted(hash));
        }
        Ok(RefundReceipt { transaction: hash })
    }
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, RefundError> {
    value.parse().map_err(|_| RefundError::InvalidAddress {
        field,
        value: value.to_owned(),
    })
}

#[async_trait]
impl RefundSender for Erc20RefundSender {
    async fn send_refund(&self, refund: &RefundRequest) -> Result<RefundReceipt, BoxError> {
        let span = tracing::info_span!(
            "x402.refund",
            network = %refund.network,
            to = %refund.to,
            amount_units = refund.amount_units,
            idempotency_key = %refund.idempotency_key,
        );
        match self.transfer(refund).instrument(span.clone()).await {
            Ok(receipt) => {
                tracing::info!(parent: &span, transaction = %receipt.transaction, "Refund sent");
                Ok(receipt)
            }
            Err(err) => {
                tracing::warn!(parent: &span, error = %err, "Refund failed");
                Err(Box::new(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> PrivateKeySigner {
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse()
            .unwrap()
    }

    fn refund(network: &str, to: &str) -> RefundRequest {
        RefundRequest {
            idempotency_key: "txn_1".into(),
            network: network.into(),
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            to: to.into(),
            amount_units: 650_000,
        }
    }

    #[test]
    fn non_evm_networks_are_rejected() {
        let err = Erc20RefundSender::new(signer())
            .with_chain("solana:mainnet", "http://127.0.0.1:8545".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, RefundError::UnknownNetwork(_)));
    }

    #[tokio::test]
    async fn unconfigured_network_fails_without_rpc() {
        let sender = Erc20RefundSender::new(signer())
            .with_chain("eip155:84532", "http://127.0.0.1:9".parse().unwrap())
            .unwrap();
        let err = sender
            .send_refund(&refund("eip155:8453", "0x0000000000000000000000000000000000000001"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no rpc endpoint configured for network eip155:8453");
    }

    #[tokio::test]
    async fn bad_payer_address_fails_without_rpc() {
        let sender = Erc20RefundSender::new(signer())
            .with_chain("eip155:84532", "http://127.0.0.1:9".parse().unwrap())
            .unwrap();
        let err = sender
            .send_refund(&refund("eip155:84532", "not-an-address"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid payer address"));
    }
}
