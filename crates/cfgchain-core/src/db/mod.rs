//! Database collaborator
//!
//! Stores blocks, the compaction chain tip and the per-round DKG signing key.
//! The DKG key is written at most once per round; a repeated write reports
//! [`DbError::DkgPrivateKeyExists`] instead of overwriting.

use crate::types::{Block, DkgPrivateKey, Hash, Round};
use thiserror::Error;

pub mod memory;

pub use memory::MemBackedDb;

/// Database error conditions
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Block exists: {0}")]
    BlockExists(Hash),

    #[error("Block does not exist: {0}")]
    BlockDoesNotExist(Hash),

    /// End of a block iteration
    #[error("Iteration finished")]
    IterationFinished,

    /// Compaction chain tip height must strictly increase
    #[error("Invalid compaction chain tip height: current {current}, got {height}")]
    InvalidCompactionChainTipHeight { current: u64, height: u64 },

    #[error("DKG private key exists for round {0}")]
    DkgPrivateKeyExists(Round),

    #[error("DKG private key does not exist for round {0}")]
    DkgPrivateKeyDoesNotExist(Round),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

/// Database result alias
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Lazy iterator over stored blocks.
///
/// [`BlockIterator::next_block`] ends with [`DbError::IterationFinished`];
/// call [`Database::get_all_blocks`] again to restart.
pub trait BlockIterator: Send {
    fn next_block(&mut self) -> DbResult<Block>;
}

/// Key-value storage used by the configuration chain
pub trait Database: Send + Sync {
    fn has_block(&self, hash: &Hash) -> bool;

    fn get_block(&self, hash: &Hash) -> DbResult<Block>;

    fn get_all_blocks(&self) -> DbResult<Box<dyn BlockIterator>>;

    /// Store a new block, rejecting an existing hash
    fn put_block(&self, block: Block) -> DbResult<()>;

    /// Record the compaction chain tip, rejecting a non-increasing height
    fn put_compaction_chain_tip_info(&self, hash: Hash, height: u64) -> DbResult<()>;

    fn get_compaction_chain_tip_info(&self) -> (Hash, u64);

    fn has_dkg_private_key(&self, round: Round) -> DbResult<bool>;

    fn get_dkg_private_key(&self, round: Round) -> DbResult<DkgPrivateKey>;

    /// Persist the round's signing key once
    fn put_dkg_private_key(&self, round: Round, key: &DkgPrivateKey) -> DbResult<()>;

    /// Flush and release resources
    fn close(&self) -> DbResult<()>;
}
