//! Private shares held for one round

use crate::types::{NodeId, PrivateShare};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use zeroize::Zeroize;

/// Shares received and sent by this node, plus complaint bookkeeping
#[derive(Default)]
pub(crate) struct ShareStore {
    /// Verified shares addressed to this node, by proposer
    received: BTreeMap<NodeId, [u8; 32]>,
    /// Shares this node sent, by receiver
    sent: BTreeMap<NodeId, PrivateShare>,
    /// Proposers this node already filed an evidence complaint against
    complained: BTreeSet<NodeId>,
    /// (accused, complainer) pairs answered by a valid revealed share
    rebuttals: BTreeSet<(NodeId, NodeId)>,
}

impl ShareStore {
    /// Compare against an accepted share from `proposer`.
    ///
    /// `Ok(true)` when the same share is already held, `Ok(false)` when none
    /// is, [`Error::ShareMismatch`] when a different one is.
    pub fn check_received(&self, proposer: &NodeId, share: &[u8; 32]) -> Result<bool> {
        match self.received.get(proposer) {
            None => Ok(false),
            Some(held) if held == share => Ok(true),
            Some(_) => Err(Error::ShareMismatch(*proposer)),
        }
    }

    pub fn accept(&mut self, proposer: NodeId, share: [u8; 32]) {
        self.received.entry(proposer).or_insert(share);
    }

    pub fn has_received(&self, proposer: &NodeId) -> bool {
        self.received.contains_key(proposer)
    }

    /// Shares from every node in `proposers`, or `None` if one is missing
    pub fn received_from<'a>(
        &self,
        proposers: impl IntoIterator<Item = &'a NodeId>,
    ) -> Option<Vec<[u8; 32]>> {
        proposers
            .into_iter()
            .map(|proposer| self.received.get(proposer).copied())
            .collect()
    }

    pub fn record_sent(&mut self, share: PrivateShare) {
        self.sent.insert(share.receiver_id, share);
    }

    pub fn sent_to(&self, receiver: &NodeId) -> Option<&PrivateShare> {
        self.sent.get(receiver)
    }

    /// Returns `true` the first time `proposer` is complained about
    pub fn mark_complained(&mut self, proposer: NodeId) -> bool {
        self.complained.insert(proposer)
    }

    /// Returns `true` the first time the pair is rebutted
    pub fn record_rebuttal(&mut self, accused: NodeId, complainer: NodeId) -> bool {
        self.rebuttals.insert((accused, complainer))
    }

    pub fn rebuttals(&self) -> &BTreeSet<(NodeId, NodeId)> {
        &self.rebuttals
    }
}

impl Drop for ShareStore {
    fn drop(&mut self) {
        for share in self.received.values_mut() {
            share.zeroize();
        }
        for share in self.sent.values_mut() {
            share.share.zeroize();
        }
    }
}
