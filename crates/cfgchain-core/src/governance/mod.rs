//! Bulletin board and broadcaster collaborators
//!
//! [`Governance`] is the shared, append-only view of round-scoped DKG records.
//! [`Recv`] is how a configuration chain publishes: implementations sign each
//! message with the node's identity key and deliver it to the board or to
//! peers.

use crate::types::{
    AntiNackComplaint, Complaint, Finalize, MasterPublicKey, MpkReady, NodeSet, PrivateShare,
    Round,
};
use crate::Result;

pub use ::async_trait::async_trait;

/// Read/append access to the bulletin board
pub trait Governance: Send + Sync {
    /// Configured node set of `round`
    fn configuration(&self, round: Round) -> NodeSet;

    fn add_dkg_master_public_key(&self, mpk: MasterPublicKey);

    fn dkg_master_public_keys(&self, round: Round) -> Vec<MasterPublicKey>;

    fn add_dkg_complaint(&self, complaint: Complaint);

    fn dkg_complaints(&self, round: Round) -> Vec<Complaint>;

    fn add_dkg_mpk_ready(&self, ready: MpkReady);

    /// Whether enough nodes signalled the end of MPK collection
    fn is_dkg_mpk_ready(&self, round: Round) -> bool;

    fn add_dkg_finalize(&self, finalize: Finalize);

    fn dkg_finalizes(&self, round: Round) -> Vec<Finalize>;

    /// Whether enough nodes finalized the round
    fn is_dkg_final(&self, round: Round) -> bool;
}

/// Outbound side of a configuration chain.
///
/// Messages are handed over unsigned; the implementation fills in
/// `proposer_id` and the outer signature.
#[async_trait]
pub trait Recv: Send + Sync {
    async fn propose_dkg_master_public_key(&self, mpk: MasterPublicKey) -> Result<()>;

    /// Deliver a share to its receiver only
    async fn propose_dkg_private_share(&self, share: PrivateShare) -> Result<()>;

    /// Publish a revealed share to every node
    async fn propose_dkg_anti_nack_complaint(&self, anti_nack: AntiNackComplaint) -> Result<()>;

    async fn propose_dkg_complaint(&self, complaint: Complaint) -> Result<()>;

    async fn propose_dkg_mpk_ready(&self, ready: MpkReady) -> Result<()>;

    async fn propose_dkg_finalize(&self, finalize: Finalize) -> Result<()>;
}

/// In-process board and network
pub mod memory;

pub use memory::{DispatchError, Inbox, MemoryGovernance, MemoryNetwork, NodeRecv};
