//! # Configuration Chain
//!
//! Per-node coordination of distributed key generation (DKG) and threshold
//! signatures (TSIG) for a Byzantine-fault-tolerant consensus node.
//!
//! This crate provides:
//! - The DKG phase controller: MPK collection, private share exchange,
//!   complaints, anti-nack reveals, finalization and qualification
//! - Secret recovery with idempotent persistence of the signing key
//! - The threshold signature coordinator
//! - In-memory bulletin board, network and database collaborators
//!
//! ## Protocol Overview
//!
//! Every node of a round deals Feldman shares of a degree-`k` polynomial on
//! secp256k1. Phases are bounded by multiples of a network-wide λ. A node's
//! signing key is the sum of the shares it received from qualified nodes,
//! and any `k+1` partial signatures of a message recover the same group
//! signature.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cfgchain_core::ConfigurationChain;
//!
//! chain.register_dkg(round, threshold).await?;
//! chain.run_dkg(round).await?;
//!
//! let psig = chain.prepare_partial_signature(round, hash)?;
//! let signature = chain.run_tsig(round, hash).await?;
//! ```

pub mod chain;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dkg;
pub mod error;
pub mod governance;
pub mod identity;
pub mod node_set;
mod tsig;
pub mod types;

pub use chain::ConfigurationChain;
pub use config::{DkgConfig, PhaseMultiples};
pub use dkg::DkgPhase;
pub use error::{Error, Result};
pub use identity::Signer;
pub use types::{Hash, NodeId, NodePublicKeys, NodeSet, Round, ThresholdSignature};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
