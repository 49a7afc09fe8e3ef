//! Complaint validation and qualification
//!
//! Both steps are pure functions of the board snapshot taken at the complaint
//! cutoff and of the rebuttals seen before finalization, so honest nodes that
//! see the same records compute the same qualified set.

use super::Candidates;
use crate::crypto::vss;
use crate::identity;
use crate::types::{Complaint, NodeId, Round};
use std::collections::BTreeSet;
use tracing::debug;

/// Valid complaints of a round at the cutoff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComplaintSnapshot {
    /// (accused, complainer) of every valid NACK
    pub nacks: BTreeSet<(NodeId, NodeId)>,
    /// Candidates proven to have sent an invalid share
    pub disqualified: BTreeSet<NodeId>,
}

impl ComplaintSnapshot {
    /// Complainers of NACKs naming `accused`
    pub fn nacks_against<'a>(
        &'a self,
        accused: &'a NodeId,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.nacks
            .iter()
            .filter(move |(a, _)| a == accused)
            .map(|(_, complainer)| *complainer)
    }

    pub fn is_resolved(&self, rebuttals: &BTreeSet<(NodeId, NodeId)>) -> bool {
        self.nacks.iter().all(|nack| rebuttals.contains(nack))
    }
}

/// Keep the complaints that can affect qualification.
///
/// Accuser and accused must both be candidates. An evidence complaint only
/// counts when the embedded share is signed by the accused, addressed to the
/// accuser, and fails verification against the accused's commitments.
pub(crate) fn snapshot_complaints(
    complaints: &[Complaint],
    round: Round,
    candidates: &Candidates,
) -> ComplaintSnapshot {
    let mut snapshot = ComplaintSnapshot::default();

    for complaint in complaints {
        if complaint.round != round || complaint.proposer_id == complaint.accused {
            continue;
        }
        let (Some(accuser), Some(accused)) = (
            candidates.get(&complaint.proposer_id),
            candidates.get(&complaint.accused),
        ) else {
            continue;
        };
        if identity::verify_complaint(complaint).is_err() {
            debug!(round, proposer = %complaint.proposer_id, "Ignoring forged complaint");
            continue;
        }

        match &complaint.evidence {
            None => {
                snapshot.nacks.insert((complaint.accused, complaint.proposer_id));
            }
            Some(evidence) => {
                let bound = evidence.proposer_id == complaint.accused
                    && evidence.receiver_id == complaint.proposer_id
                    && evidence.round == round;
                let valid =
                    vss::verify_share(&evidence.share, &accuser.dkg_id, &accused.commitments);
                if bound && !valid {
                    snapshot.disqualified.insert(complaint.accused);
                } else {
                    debug!(round, proposer = %complaint.proposer_id, "Unfounded complaint");
                }
            }
        }
    }

    snapshot
}

/// Candidates minus disqualified nodes minus nodes with an unrebutted NACK
pub fn qualify(
    candidates: &BTreeSet<NodeId>,
    snapshot: &ComplaintSnapshot,
    rebuttals: &BTreeSet<(NodeId, NodeId)>,
) -> BTreeSet<NodeId> {
    candidates
        .iter()
        .filter(|node| !snapshot.disqualified.contains(node))
        .filter(|node| {
            snapshot
                .nacks_against(node)
                .all(|complainer| rebuttals.contains(&(**node, complainer)))
        })
        .copied()
        .collect()
}
