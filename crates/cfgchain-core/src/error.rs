//! Error types for configuration chain operations

use crate::db::DbError;
use crate::types::{NodeId, Round};
use thiserror::Error;

/// Result type alias for configuration chain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running DKG or TSIG for a round
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `register_dkg` called twice for the same round
    #[error("DKG already registered for round {0}")]
    DkgAlreadyRegistered(Round),

    /// `run_dkg` called for a round that was never registered
    #[error("DKG not registered for round {0}")]
    DkgNotRegistered(Round),

    /// `run_dkg` called while another `run_dkg` drives the same round
    #[error("DKG already running for round {0}")]
    DkgAlreadyRunning(Round),

    /// No node public keys for the round yet
    #[error("DKG not ready for round {0}")]
    DkgNotReady(Round),

    /// This node is not part of the round's configured node set
    #[error("Node {node} is not in the node set of round {round}")]
    NotInNodeSet { node: NodeId, round: Round },

    /// Sender has no accepted master public key in the round
    #[error("Node {0} is not a DKG participant")]
    NotDkgParticipant(NodeId),

    /// Sender is not in the round's qualified set
    #[error("Node {node} is not qualified in round {round}")]
    NotQualified { node: NodeId, round: Round },

    /// Fewer master public keys than `k+1` were collected
    #[error("Not enough DKG candidates: required {required}, got {actual}")]
    NotEnoughCandidates { required: usize, actual: usize },

    /// Fewer qualified nodes than `k+1` remain after complaints
    #[error("Not enough qualified nodes: required {required}, got {actual}")]
    NotEnoughQualified { required: usize, actual: usize },

    /// TSIG timed out before reaching the threshold
    #[error("Not enough partial signatures")]
    NotEnoughPartialSignatures,

    /// Private share sent to this node by direct delivery has another receiver
    #[error("Private share addressed to {0}")]
    MisaddressedShare(NodeId),

    /// A second, different share from the same sender for the same round
    #[error("Private share from {0} does not match the one already accepted")]
    ShareMismatch(NodeId),

    /// Share or partial signature failed cryptographic verification
    #[error("Invalid share from {0}")]
    InvalidShare(NodeId),

    /// Outer message signature failed verification
    #[error("Invalid signature")]
    InvalidSignature,

    /// Message belongs to another round than the one it was filed under
    #[error("Round mismatch: expected {expected}, got {actual}")]
    RoundMismatch { expected: Round, actual: Round },

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Round ended without a usable signing key on this node
    #[error("DKG failed for round {0}")]
    DkgFailed(Round),

    /// Database holds a different signing key than the one recovered
    #[error("Stored DKG private key of round {0} differs from the recovered key")]
    StoredKeyMismatch(Round),

    /// Timeout waiting for a protocol condition
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Database collaborator error
    #[error(transparent)]
    Db(#[from] DbError),

    /// Broadcaster failed to hand off a message
    #[error("Broadcast error: {0}")]
    Broadcast(String),
}
