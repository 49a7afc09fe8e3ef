//! Per-round node set cache

use crate::crypto::DkgId;
use crate::governance::Governance;
use crate::types::{NodeId, NodeSet, Round};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Memoizes [`Governance::configuration`] and the `NodeId -> DkgId` mapping
pub struct NodeSetCache {
    gov: Arc<dyn Governance>,
    node_sets: DashMap<Round, Arc<NodeSet>>,
    dkg_ids: DashMap<NodeId, DkgId>,
}

impl NodeSetCache {
    pub fn new(gov: Arc<dyn Governance>) -> Self {
        Self {
            gov,
            node_sets: DashMap::new(),
            dkg_ids: DashMap::new(),
        }
    }

    /// Node set of `round`; empty sets are not cached
    pub fn node_set(&self, round: Round) -> Arc<NodeSet> {
        if let Some(set) = self.node_sets.get(&round) {
            return set.clone();
        }
        let set = Arc::new(self.gov.configuration(round));
        if !set.is_empty() {
            self.node_sets.insert(round, set.clone());
        }
        set
    }

    pub fn exists(&self, round: Round, node: &NodeId) -> bool {
        self.node_set(round).contains(node)
    }

    /// Evaluation coordinate of `node`
    pub fn dkg_id(&self, node: &NodeId) -> Result<DkgId> {
        if let Some(id) = self.dkg_ids.get(node) {
            return Ok(*id);
        }
        let id = DkgId::from_node_id(node)?;
        self.dkg_ids.insert(*node, id);
        Ok(id)
    }

    /// Fail unless `node` is configured for `round`
    pub fn require_member(&self, round: Round, node: &NodeId) -> Result<()> {
        if self.exists(round, node) {
            Ok(())
        } else {
            Err(Error::NotInNodeSet { node: *node, round })
        }
    }

    pub fn purge(&self, round: Round) {
        self.node_sets.remove(&round);
    }
}
