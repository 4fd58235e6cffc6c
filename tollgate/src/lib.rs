#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the tollgate metered-billing LLM proxy.
//!
//! This crate holds everything that does not need a database or an HTTP stack:
//! exact money arithmetic, the cost model, credential verification, the x402
//! wire types, and the explicit x402 flow state machine.
//!
//! # Modules
//!
//! - [`money`] - Exact USD amounts, ledger fixed-point and asset unit conversion
//! - [`pricing`] - Model prices, markup multipliers and cost breakdowns
//! - [`credential`] - API key hashing, access tokens and the credential verifier
//! - [`error`] - The billing error taxonomy shared by every layer
//! - [`proto`] - x402 wire format (challenges, payloads, facilitator messages)
//! - [`flow`] - Per-call x402 state machine
//! - [`settlement`] - Facilitator and refund-sender seams
//! - [`timestamp`] - Unix timestamps used by authorizations and challenges

pub mod credential;
pub mod error;
pub mod flow;
pub mod money;
pub mod pricing;
pub mod proto;
pub mod settlement;
pub mod timestamp;

pub use error::BillingError;
pub use money::Usd;
