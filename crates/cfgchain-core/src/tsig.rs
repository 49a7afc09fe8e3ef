//! Threshold signature coordinator
//!
//! Partial signatures are collected in independent buckets keyed by
//! (round, hash). A waiter recovers the group signature from the `k+1`
//! contributors with the lowest node IDs, so every node holding the same
//! shares returns the same bytes.

use crate::crypto::{self, DkgId};
use crate::types::{
    Hash, NodeId, NodePublicKeys, PartialSignature, Round, SignatureShare, ThresholdSignature,
};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument};

#[derive(Default)]
struct BucketState {
    shares: BTreeMap<NodeId, SignatureShare>,
    signature: Option<ThresholdSignature>,
}

#[derive(Default)]
struct Bucket {
    state: Mutex<BucketState>,
    notify: Notify,
}

#[derive(Default)]
pub(crate) struct TsigCoordinator {
    buckets: DashMap<(Round, Hash), Arc<Bucket>>,
}

impl TsigCoordinator {
    fn bucket(&self, round: Round, hash: Hash) -> Arc<Bucket> {
        self.buckets.entry((round, hash)).or_default().clone()
    }

    /// Verify a partial signature against the sender's public share and
    /// add it to its bucket. The outer signature is checked by the caller.
    pub fn process(&self, npks: &NodePublicKeys, psig: PartialSignature) -> Result<()> {
        if psig.round != npks.round {
            return Err(Error::RoundMismatch {
                expected: npks.round,
                actual: psig.round,
            });
        }
        let public_share = npks
            .public_shares
            .get(&psig.proposer_id)
            .filter(|_| npks.is_qualified(&psig.proposer_id))
            .ok_or(Error::NotQualified {
                node: psig.proposer_id,
                round: psig.round,
            })?;
        if !crypto::tsig::verify_share(&public_share.point, &psig.hash, &psig.partial_signature)? {
            return Err(Error::InvalidShare(psig.proposer_id));
        }

        let bucket = self.bucket(psig.round, psig.hash);
        let inserted = {
            let mut state = bucket.state.lock();
            if state.shares.contains_key(&psig.proposer_id) {
                false
            } else {
                state.shares.insert(psig.proposer_id, psig.partial_signature);
                true
            }
        };
        if inserted {
            debug!(
                round = psig.round,
                hash = ?psig.hash,
                proposer = %psig.proposer_id,
                "Partial signature added"
            );
            bucket.notify.notify_waiters();
        }
        Ok(())
    }

    /// Wait for `k+1` partial signatures on `hash` and recover the group
    /// signature, or fail once `timeout` elapses
    #[instrument(skip(self, npks), fields(round = npks.round))]
    pub async fn run(
        &self,
        npks: &NodePublicKeys,
        hash: Hash,
        timeout: Duration,
    ) -> Result<ThresholdSignature> {
        let bucket = self.bucket(npks.round, hash);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = bucket.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(signature) = try_recover(&bucket, npks, hash)? {
                return Ok(signature);
            }
            if timeout_at(deadline, notified).await.is_err() {
                let collected = bucket.state.lock().shares.len();
                info!(collected, required = npks.threshold + 1, "TSIG timed out");
                return Err(Error::NotEnoughPartialSignatures);
            }
        }
    }

    /// Drop every bucket of `round`
    pub fn purge(&self, round: Round) {
        self.buckets.retain(|(r, _), _| *r != round);
    }
}

fn try_recover(
    bucket: &Bucket,
    npks: &NodePublicKeys,
    hash: Hash,
) -> Result<Option<ThresholdSignature>> {
    let mut state = bucket.state.lock();
    if let Some(signature) = &state.signature {
        return Ok(Some(signature.clone()));
    }
    let required = npks.threshold + 1;
    if state.shares.len() < required {
        return Ok(None);
    }

    let mut shares = Vec::with_capacity(required);
    for (node, share) in state.shares.iter().take(required) {
        let public_share = npks
            .public_shares
            .get(node)
            .ok_or(Error::NotQualified { node: *node, round: npks.round })?;
        shares.push((DkgId::from_bytes(&public_share.dkg_id)?, share.clone()));
    }

    let signature = ThresholdSignature {
        round: npks.round,
        hash,
        point: crypto::tsig::recover_signature(&shares)?,
    };
    info!(
        round = npks.round,
        hash = ?hash,
        signature = %signature.to_hex(),
        "Recovered threshold signature"
    );
    state.signature = Some(signature.clone());
    Ok(Some(signature))
}
