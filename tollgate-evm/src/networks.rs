//! Known USDC deployments, used to fill in x402 payment settings.

use alloy_primitives::{Address, address};

/// Base Mainnet chain ID.
pub const BASE_MAINNET: u64 = 8453;

/// Base Sepolia (testnet) chain ID.
pub const BASE_SEPOLIA: u64 = 84532;

/// Ethereum Mainnet chain ID.
pub const ETHEREUM_MAINNET: u64 = 1;

/// Polygon Mainnet chain ID.
pub const POLYGON_MAINNET: u64 = 137;

/// Avalanche C-Chain chain ID.
pub const AVALANCHE_MAINNET: u64 = 43114;

/// USDC contract address on Base Mainnet.
pub const USDC_BASE: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");

/// USDC contract address on Base Sepolia.
pub const USDC_BASE_SEPOLIA: Address = address!("036CbD53842c5426634e7929541eC2318f3dCF7e");

/// USDC contract address on Ethereum Mainnet.
pub const USDC_ETHEREUM: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");

/// USDC contract address on Polygon Mainnet.
pub const USDC_POLYGON: Address = address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359");

/// USDC contract address on Avalanche C-Chain.
pub const USDC_AVALANCHE: Address = address!("B97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E");

/// Default EIP-712 domain name for USDC.
pub const DEFAULT_USDC_NAME: &str = "USD Coin";

/// EIP-712 domain name of USDC on Base Sepolia.
pub const BASE_SEPOLIA_USDC_NAME: &str = "USDC";

/// Default EIP-712 domain version for USDC.
pub const DEFAULT_USDC_VERSION: &str = "2";

/// Default token decimals for USDC.
pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;

/// A USDC deployment on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsdcDeployment {
    /// CAIP-2 network id.
    pub network: String,
    /// EVM chain id.
    pub chain_id: u64,
    /// Token contract.
    pub address: Address,
    /// EIP-712 domain name.
    pub name: &'static str,
    /// EIP-712 domain version.
    pub version: &'static str,
    /// Token decimals.
    pub decimals: u8,
}

/// All known deployments.
#[must_use]
pub fn known_usdc() -> Vec<UsdcDeployment> {
    [
        (BASE_MAINNET, USDC_BASE, DEFAULT_USDC_NAME),
        (BASE_SEPOLIA, USDC_BASE_SEPOLIA, BASE_SEPOLIA_USDC_NAME),
        (ETHEREUM_MAINNET, USDC_ETHEREUM, DEFAULT_USDC_NAME),
        (POLYGON_MAINNET, USDC_POLYGON, DEFAULT_USDC_NAME),
        (AVALANCHE_MAINNET, USDC_AVALANCHE, DEFAULT_USDC_NAME),
    ]
    .into_iter()
    .map(|(chain_id, address, name)| UsdcDeployment {
        network: format!("eip155:{chain_id}"),
        chain_id,
        address,
        name,
        version: DEFAULT_USDC_VERSION,
        decimals: DEFAULT_TOKEN_DECIMALS,
    })
    .collect()
}

/// The USDC deployment on a CAIP-2 network, if known.
#[must_use]
pub fn usdc(network: &str) -> Option<UsdcDeployment> {
    known_usdc().into_iter().find(|usdc| usdc.network == network)
}

/// Parses the chain id out of an `eip155:<id>` network.
#[must_use]
pub fn chain_id(network: &str) -> Option<u64> {
    network.strip_prefix("eip155:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_sepolia_uses_its_own_domain_name() {
        let usdc = usdc("eip155:84532").unwrap();
        assert_eq!(usdc.address, USDC_BASE_SEPOLIA);
        assert_eq!(usdc.name, "USDC");
        assert_eq!(usdc.decimals, 6);
        assert!(super::usdc("eip155:999").is_none());
    }

    #[test]
    fn chain_id_parses_caip2() {
        assert_eq!(chain_id("eip155:8453"), Some(8453));
        assert_eq!(chain_id("solana:mainnet"), None);
    }
}
