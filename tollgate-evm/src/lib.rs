#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EIP-155 (EVM) support for tollgate.
//!
//! Settlement itself goes through the x402 facilitator. What the proxy does
//! on-chain on its own is return overpayments: when a caller authorizes more
//! than a call ends up costing, [`Erc20RefundSender`] transfers the difference
//! back from the proxy's wallet.
//!
//! - [`networks`] - USDC deployments and CAIP-2 helpers
//! - [`refund`] - The ERC-20 refund sender

mod contract;
pub mod networks;
pub mod refund;

pub use refund::{Erc20RefundSender, RefundError};
