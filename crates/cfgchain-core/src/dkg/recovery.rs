//! Signing key recovery, node public keys and persistence

use super::{collect_candidates, Candidates};
use crate::crypto::vss;
use crate::db::{Database, DbError};
use crate::governance::Governance;
use crate::node_set::NodeSetCache;
use crate::types::{DkgPrivateKey, NodeId, NodePublicKeys, PublicShare, Round};
use crate::{Error, Result};
use k256::ProjectivePoint;
#[cfg(feature = "multi-thread")]
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};
use zeroize::Zeroize;

/// Material of a round this node qualified in
pub(crate) struct QualifiedRound {
    pub round: Round,
    pub threshold: usize,
    /// Qualified candidates
    pub qualified: Candidates,
    /// Shares received from each qualified proposer
    pub shares: Vec<[u8; 32]>,
}

impl Drop for QualifiedRound {
    fn drop(&mut self) {
        for share in self.shares.iter_mut() {
            share.zeroize();
        }
    }
}

/// Derive the signing key and the round's node public keys
pub(crate) fn recover(
    me: &NodeId,
    material: &QualifiedRound,
) -> Result<(DkgPrivateKey, NodePublicKeys)> {
    let npks = node_public_keys(material.round, material.threshold, &material.qualified);
    let key = DkgPrivateKey::from_bytes(vss::combine_shares(material.shares.iter()));

    let own = npks
        .public_shares
        .get(me)
        .ok_or(Error::NotQualified { node: *me, round: material.round })?;
    if vss::public_key_of(key.as_bytes()) != own.point {
        return Err(Error::Crypto("recovered key does not match public share".into()));
    }

    info!(
        round = material.round,
        qualified = npks.qualify_node_ids.len(),
        group_public_key = hex::encode(&npks.group_public_key),
        "Recovered DKG signing key"
    );
    Ok((key, npks))
}

/// Public share of every qualified node and the group public key
pub(crate) fn node_public_keys(
    round: Round,
    threshold: usize,
    qualified: &Candidates,
) -> NodePublicKeys {
    let commitments: Vec<Vec<ProjectivePoint>> =
        qualified.values().map(|c| c.commitments.clone()).collect();

    #[cfg(feature = "multi-thread")]
    let public_shares: BTreeMap<NodeId, PublicShare> = qualified
        .par_iter()
        .map(|(node, candidate)| public_share(node, candidate, &commitments))
        .collect::<Vec<_>>()
        .into_iter()
        .collect();

    #[cfg(not(feature = "multi-thread"))]
    let public_shares: BTreeMap<NodeId, PublicShare> = qualified
        .iter()
        .map(|(node, candidate)| public_share(node, candidate, &commitments))
        .collect();

    NodePublicKeys {
        round,
        threshold,
        qualify_node_ids: qualified.keys().copied().collect(),
        group_public_key: vss::group_public_key(&commitments),
        public_shares,
    }
}

fn public_share(
    node: &NodeId,
    candidate: &super::Candidate,
    commitments: &[Vec<ProjectivePoint>],
) -> (NodeId, PublicShare) {
    let share = PublicShare {
        dkg_id: candidate.dkg_id.to_bytes(),
        point: vss::public_share(&candidate.dkg_id, commitments),
    };
    (*node, share)
}

/// Reject a stored key that does not match this node's public share
pub(crate) fn check_stored_key(
    me: &NodeId,
    npks: &NodePublicKeys,
    key: &DkgPrivateKey,
) -> Result<()> {
    let own = npks
        .public_shares
        .get(me)
        .ok_or(Error::NotQualified { node: *me, round: npks.round })?;
    if vss::public_key_of(key.as_bytes()) != own.point {
        return Err(Error::StoredKeyMismatch(npks.round));
    }
    Ok(())
}

/// Store the signing key.
///
/// An existing key for the round counts as success only when it equals
/// `key`; any other instance sharing the store must sign with the same key.
pub(crate) fn persist(db: &dyn Database, round: Round, key: &DkgPrivateKey) -> Result<()> {
    match db.put_dkg_private_key(round, key) {
        Ok(()) => Ok(()),
        Err(DbError::DkgPrivateKeyExists(_)) => {
            if db.get_dkg_private_key(round)? != *key {
                return Err(Error::StoredKeyMismatch(round));
            }
            info!(round, "DKG private key already stored");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Rebuild node public keys from this node's Finalize record on the board.
///
/// Returns `None` when the node has not finalized the round.
pub(crate) fn restore_public_keys(
    me: &NodeId,
    round: Round,
    gov: &dyn Governance,
    cache: &NodeSetCache,
) -> Result<Option<NodePublicKeys>> {
    let Some(finalize) = gov
        .dkg_finalizes(round)
        .into_iter()
        .find(|f| f.proposer_id == *me)
    else {
        return Ok(None);
    };
    if !finalize.qualify_ids.contains(me) {
        return Err(Error::NotQualified { node: *me, round });
    }

    let mpks = gov.dkg_master_public_keys(round);
    let threshold = mpks
        .iter()
        .find(|mpk| mpk.proposer_id == *me)
        .map(|mpk| mpk.threshold())
        .ok_or(Error::DkgNotReady(round))?;

    let mut qualified = collect_candidates(&mpks, round, threshold, cache);
    qualified.retain(|node, _| finalize.qualify_ids.contains(node));
    if qualified.len() != finalize.qualify_ids.len() {
        return Err(Error::Crypto(format!(
            "board holds {} of {} qualified master public keys",
            qualified.len(),
            finalize.qualify_ids.len()
        )));
    }

    debug!(round, qualified = qualified.len(), "Restored node public keys from board");
    Ok(Some(node_public_keys(round, threshold, &qualified)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::vss::{decode_commitments, SecretPolynomial};
    use crate::crypto::DkgId;
    use crate::db::MemBackedDb;
    use crate::dkg::Candidate;

    fn round_of(n: u8, threshold: usize) -> (Vec<NodeId>, Vec<SecretPolynomial>, Candidates) {
        let nodes: Vec<NodeId> = (1..=n).map(|i| NodeId::from_public_key(&[i; 32])).collect();
        let polys: Vec<SecretPolynomial> =
            nodes.iter().map(|_| SecretPolynomial::generate(threshold)).collect();
        let candidates = nodes
            .iter()
            .zip(&polys)
            .map(|(node, poly)| {
                let candidate = Candidate {
                    dkg_id: DkgId::from_node_id(node).unwrap(),
                    commitments: decode_commitments(&poly.commitments()).unwrap(),
                };
                (*node, candidate)
            })
            .collect();
        (nodes, polys, candidates)
    }

    #[test]
    fn test_recovered_key_matches_public_share() {
        let (nodes, polys, candidates) = round_of(4, 2);
        let me = nodes[1];
        let my_id = DkgId::from_node_id(&me).unwrap();

        let material = QualifiedRound {
            round: 7,
            threshold: 2,
            shares: polys.iter().map(|p| p.share(&my_id)).collect(),
            qualified: candidates,
        };
        let (key, npks) = recover(&me, &material).unwrap();

        assert_eq!(npks.qualify_node_ids.len(), 4);
        assert_eq!(npks.public_shares[&me].point, vss::public_key_of(key.as_bytes()));
    }

    #[test]
    fn test_recover_rejects_wrong_shares() {
        let (nodes, polys, candidates) = round_of(3, 1);
        let other_id = DkgId::from_node_id(&nodes[2]).unwrap();

        let material = QualifiedRound {
            round: 1,
            threshold: 1,
            shares: polys.iter().map(|p| p.share(&other_id)).collect(),
            qualified: candidates,
        };
        assert!(matches!(recover(&nodes[0], &material), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_stored_key_checked_against_public_share() {
        let (nodes, polys, candidates) = round_of(3, 1);
        let me = nodes[0];
        let my_id = DkgId::from_node_id(&me).unwrap();

        let material = QualifiedRound {
            round: 2,
            threshold: 1,
            shares: polys.iter().map(|p| p.share(&my_id)).collect(),
            qualified: candidates,
        };
        let (key, npks) = recover(&me, &material).unwrap();

        check_stored_key(&me, &npks, &key).unwrap();
        assert!(matches!(
            check_stored_key(&me, &npks, &DkgPrivateKey::from_bytes([7; 32])),
            Err(Error::StoredKeyMismatch(2))
        ));
        let outsider = NodeId::from_public_key(&[9; 32]);
        assert!(matches!(
            check_stored_key(&outsider, &npks, &key),
            Err(Error::NotQualified { .. })
        ));
    }

    #[test]
    fn test_persist_is_idempotent() {
        let db = MemBackedDb::new();
        let key = DkgPrivateKey::from_bytes([1; 32]);

        persist(&db, 3, &key).unwrap();
        persist(&db, 3, &key).unwrap();
        assert_eq!(db.get_dkg_private_key(3).unwrap(), key);
    }

    #[test]
    fn test_persist_rejects_different_stored_key() {
        let db = MemBackedDb::new();
        let key = DkgPrivateKey::from_bytes([1; 32]);
        persist(&db, 3, &key).unwrap();

        assert!(matches!(
            persist(&db, 3, &DkgPrivateKey::from_bytes([2; 32])),
            Err(Error::StoredKeyMismatch(3))
        ));
        assert_eq!(db.get_dkg_private_key(3).unwrap(), key);
    }
}
