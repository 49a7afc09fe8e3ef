//! Distributed key generation for one round
//!
//! A round moves through `Registered → CollectingMpk → ExchangingShares →
//! ComplaintWindow → Finalizing` and ends `Qualified`, `Excluded` or `Failed`.
//! Candidates are the signed master public keys this node observed on the
//! board at its MPK-ready deadline. Qualification removes candidates with a valid evidence
//! complaint and candidates with a NACK that no revealed share rebutted.

pub(crate) mod protocol;
pub mod qualify;
pub(crate) mod recovery;
mod share_store;

use crate::crypto::{vss, DkgId};
use crate::identity;
use crate::node_set::NodeSetCache;
use crate::types::{MasterPublicKey, NodeId, Round};
use k256::ProjectivePoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Local DKG state of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgPhase {
    Registered,
    CollectingMpk,
    ExchangingShares,
    ComplaintWindow,
    Finalizing,
    /// Signing key and node public keys are available
    Qualified,
    /// This node is not part of the round's group
    Excluded,
    /// Qualified by the group but missing material to sign
    Failed,
}

impl DkgPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DkgPhase::Qualified | DkgPhase::Excluded | DkgPhase::Failed)
    }
}

impl fmt::Display for DkgPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DkgPhase::Registered => "registered",
            DkgPhase::CollectingMpk => "collecting-mpk",
            DkgPhase::ExchangingShares => "exchanging-shares",
            DkgPhase::ComplaintWindow => "complaint-window",
            DkgPhase::Finalizing => "finalizing",
            DkgPhase::Qualified => "qualified",
            DkgPhase::Excluded => "excluded",
            DkgPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Accepted master public key of a round
#[derive(Clone)]
pub(crate) struct Candidate {
    pub dkg_id: DkgId,
    pub commitments: Vec<ProjectivePoint>,
}

pub(crate) type Candidates = BTreeMap<NodeId, Candidate>;

/// Turn board MPKs into candidates.
///
/// An MPK is kept when it is signed, belongs to `round`, comes from a member
/// of the round's node set and commits to a polynomial of degree `threshold`.
pub(crate) fn collect_candidates(
    mpks: &[MasterPublicKey],
    round: Round,
    threshold: usize,
    cache: &NodeSetCache,
) -> Candidates {
    let mut candidates = Candidates::new();
    for mpk in mpks {
        if mpk.round != round
            || mpk.commitments.len() != threshold + 1
            || !cache.exists(round, &mpk.proposer_id)
        {
            debug!(round, proposer = %mpk.proposer_id, "Skipping MPK");
            continue;
        }
        if identity::verify_master_public_key(mpk).is_err() {
            debug!(round, proposer = %mpk.proposer_id, "Skipping MPK with bad signature");
            continue;
        }
        let Ok(commitments) = vss::decode_commitments(&mpk.commitments) else {
            debug!(round, proposer = %mpk.proposer_id, "Skipping MPK with bad commitments");
            continue;
        };
        let Ok(dkg_id) = cache.dkg_id(&mpk.proposer_id) else {
            continue;
        };
        candidates.insert(mpk.proposer_id, Candidate { dkg_id, commitments });
    }
    candidates
}
