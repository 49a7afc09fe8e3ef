//! In-memory bulletin board and message hub for local networks and tests

use super::{async_trait, Governance, Recv};
use crate::chain::ConfigurationChain;
use crate::identity::{self, Signer};
use crate::types::{
    AntiNackComplaint, Complaint, Finalize, MasterPublicKey, MpkReady, NodeId, NodeSet,
    PartialSignature, PrivateShare, Round,
};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Records of one round
#[derive(Default)]
struct Board {
    mpks: BTreeMap<NodeId, MasterPublicKey>,
    /// One complaint per (accuser, accused)
    complaints: BTreeMap<(NodeId, NodeId), Complaint>,
    ready: BTreeSet<NodeId>,
    finalizes: BTreeMap<NodeId, Finalize>,
}

/// Append-only bulletin board shared by every node of a local network.
///
/// Only signed records from members of the round's node set are kept, one
/// per proposer. MPKs are refused once the ready quorum is reached and
/// complaints are refused from nodes that already finalized.
pub struct MemoryGovernance {
    default_node_set: NodeSet,
    node_sets: RwLock<BTreeMap<Round, NodeSet>>,
    boards: DashMap<Round, Board>,
}

impl MemoryGovernance {
    /// Board where every round is configured with `node_set`
    pub fn new(node_set: NodeSet) -> Self {
        Self {
            default_node_set: node_set,
            node_sets: RwLock::new(BTreeMap::new()),
            boards: DashMap::new(),
        }
    }

    /// Override the node set of one round
    pub fn set_configuration(&self, round: Round, node_set: NodeSet) {
        self.node_sets.write().insert(round, node_set);
    }

    /// Quorum of ready and finalize signals, `2n/3 + 1`
    pub fn quorum(&self, round: Round) -> usize {
        self.configuration(round).len() * 2 / 3 + 1
    }

    fn is_member(&self, round: Round, node: &NodeId) -> bool {
        self.configuration(round).contains(node)
    }
}

impl Governance for MemoryGovernance {
    fn configuration(&self, round: Round) -> NodeSet {
        self.node_sets
            .read()
            .get(&round)
            .cloned()
            .unwrap_or_else(|| self.default_node_set.clone())
    }

    fn add_dkg_master_public_key(&self, mpk: MasterPublicKey) {
        let round = mpk.round;
        if identity::verify_master_public_key(&mpk).is_err()
            || !self.is_member(round, &mpk.proposer_id)
        {
            debug!(round, proposer = %mpk.proposer_id, "Dropping unauthenticated MPK");
            return;
        }
        let quorum = self.quorum(round);

        let mut board = self.boards.entry(round).or_default();
        if board.ready.len() >= quorum {
            debug!(round, proposer = %mpk.proposer_id, "Dropping MPK after ready quorum");
            return;
        }
        board.mpks.entry(mpk.proposer_id).or_insert(mpk);
    }

    fn dkg_master_public_keys(&self, round: Round) -> Vec<MasterPublicKey> {
        self.boards
            .get(&round)
            .map(|board| board.mpks.values().cloned().collect())
            .unwrap_or_default()
    }

    fn add_dkg_complaint(&self, complaint: Complaint) {
        let round = complaint.round;
        if identity::verify_complaint(&complaint).is_err()
            || !self.is_member(round, &complaint.proposer_id)
        {
            debug!(round, proposer = %complaint.proposer_id, "Dropping unauthenticated complaint");
            return;
        }

        let mut board = self.boards.entry(round).or_default();
        if board.finalizes.contains_key(&complaint.proposer_id) {
            debug!(round, proposer = %complaint.proposer_id, "Dropping complaint after finalize");
            return;
        }
        board
            .complaints
            .entry((complaint.proposer_id, complaint.accused))
            .or_insert(complaint);
    }

    fn dkg_complaints(&self, round: Round) -> Vec<Complaint> {
        self.boards
            .get(&round)
            .map(|board| board.complaints.values().cloned().collect())
            .unwrap_or_default()
    }

    fn add_dkg_mpk_ready(&self, ready: MpkReady) {
        if identity::verify_mpk_ready(&ready).is_err()
            || !self.is_member(ready.round, &ready.proposer_id)
        {
            return;
        }
        self.boards
            .entry(ready.round)
            .or_default()
            .ready
            .insert(ready.proposer_id);
    }

    fn is_dkg_mpk_ready(&self, round: Round) -> bool {
        let quorum = self.quorum(round);
        self.boards
            .get(&round)
            .map(|board| board.ready.len() >= quorum)
            .unwrap_or(false)
    }

    fn add_dkg_finalize(&self, finalize: Finalize) {
        if identity::verify_finalize(&finalize).is_err()
            || !self.is_member(finalize.round, &finalize.proposer_id)
        {
            return;
        }
        self.boards
            .entry(finalize.round)
            .or_default()
            .finalizes
            .entry(finalize.proposer_id)
            .or_insert(finalize);
    }

    fn dkg_finalizes(&self, round: Round) -> Vec<Finalize> {
        self.boards
            .get(&round)
            .map(|board| board.finalizes.values().cloned().collect())
            .unwrap_or_default()
    }

    fn is_dkg_final(&self, round: Round) -> bool {
        let quorum = self.quorum(round);
        self.boards
            .get(&round)
            .map(|board| board.finalizes.len() >= quorum)
            .unwrap_or(false)
    }
}

/// Point-to-point or broadcast message waiting in a node's inbox
#[derive(Debug, Clone)]
pub enum Inbound {
    PrivateShare(PrivateShare),
    AntiNackComplaint(AntiNackComplaint),
    PartialSignature(PartialSignature),
}

impl Inbound {
    fn kind(&self) -> &'static str {
        match self {
            Inbound::PrivateShare(_) => "private share",
            Inbound::AntiNackComplaint(_) => "anti-nack complaint",
            Inbound::PartialSignature(_) => "partial signature",
        }
    }
}

/// Inbound message rejected by a node's configuration chain
#[derive(Debug, Clone, Error)]
#[error("node {node} rejected {kind}: {reason}")]
pub struct DispatchError {
    pub node: NodeId,
    pub kind: &'static str,
    pub reason: String,
}

/// In-process hub connecting the nodes of a local network
pub struct MemoryNetwork {
    board: Arc<MemoryGovernance>,
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<Inbound>>,
    errors: Mutex<Vec<DispatchError>>,
}

impl MemoryNetwork {
    pub fn new(board: Arc<MemoryGovernance>) -> Arc<Self> {
        Arc::new(Self {
            board,
            inboxes: DashMap::new(),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn board(&self) -> Arc<MemoryGovernance> {
        self.board.clone()
    }

    /// Attach a node, returning its broadcaster and its inbox
    pub fn join(self: &Arc<Self>, signer: Arc<Signer>) -> (NodeRecv, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = signer.node_id();
        self.inboxes.insert(node, tx);

        let recv = NodeRecv {
            signer,
            network: self.clone(),
        };
        let inbox = Inbox {
            node,
            rx,
            network: self.clone(),
        };
        (recv, inbox)
    }

    fn send(&self, to: &NodeId, message: Inbound) -> Result<()> {
        let inbox = self
            .inboxes
            .get(to)
            .map(|tx| tx.clone())
            .ok_or_else(|| Error::Broadcast(format!("no inbox for node {}", to)))?;
        inbox
            .send(message)
            .map_err(|_| Error::Broadcast(format!("inbox of node {} closed", to)))
    }

    fn broadcast(&self, message: Inbound) {
        let inboxes: Vec<_> = self.inboxes.iter().map(|e| e.value().clone()).collect();
        for inbox in inboxes {
            let _ = inbox.send(message.clone());
        }
    }

    /// Deliver a signed partial signature to every node
    pub fn broadcast_partial_signature(&self, psig: PartialSignature) {
        self.broadcast(Inbound::PartialSignature(psig));
    }

    /// Errors reported by dispatchers so far
    pub fn dispatch_errors(&self) -> Vec<DispatchError> {
        self.errors.lock().clone()
    }

    fn report(&self, error: DispatchError) {
        warn!(node = %error.node, kind = error.kind, reason = %error.reason, "Dispatch failed");
        self.errors.lock().push(error);
    }
}

/// Receiving end of a node's connection to a [`MemoryNetwork`]
pub struct Inbox {
    node: NodeId,
    rx: mpsc::UnboundedReceiver<Inbound>,
    network: Arc<MemoryNetwork>,
}

impl Inbox {
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Feed every inbound message into `chain` until the network is dropped
    pub fn spawn_dispatcher(mut self, chain: Arc<ConfigurationChain>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = self.rx.recv().await {
                let kind = message.kind();
                let result = match message {
                    Inbound::PrivateShare(share) => chain.process_private_share(share).await,
                    Inbound::AntiNackComplaint(anti_nack) => {
                        chain.process_anti_nack_complaint(anti_nack).await
                    }
                    Inbound::PartialSignature(psig) => chain.process_partial_signature(psig),
                };
                if let Err(e) = result {
                    self.network.report(DispatchError {
                        node: self.node,
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
            debug!(node = %self.node, "Dispatcher stopped");
        })
    }
}

/// [`Recv`] of one node on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct NodeRecv {
    signer: Arc<Signer>,
    network: Arc<MemoryNetwork>,
}

impl NodeRecv {
    pub fn signer(&self) -> &Signer {
        &self.signer
    }
}

#[async_trait]
impl Recv for NodeRecv {
    async fn propose_dkg_master_public_key(&self, mut mpk: MasterPublicKey) -> Result<()> {
        self.signer.sign_master_public_key(&mut mpk);
        self.network.board.add_dkg_master_public_key(mpk);
        Ok(())
    }

    async fn propose_dkg_private_share(&self, mut share: PrivateShare) -> Result<()> {
        self.signer.sign_private_share(&mut share);
        let to = share.receiver_id;
        self.network.send(&to, Inbound::PrivateShare(share))
    }

    async fn propose_dkg_anti_nack_complaint(
        &self,
        mut anti_nack: AntiNackComplaint,
    ) -> Result<()> {
        self.signer.sign_anti_nack_complaint(&mut anti_nack);
        self.network.broadcast(Inbound::AntiNackComplaint(anti_nack));
        Ok(())
    }

    async fn propose_dkg_complaint(&self, mut complaint: Complaint) -> Result<()> {
        self.signer.sign_complaint(&mut complaint);
        self.network.board.add_dkg_complaint(complaint);
        Ok(())
    }

    async fn propose_dkg_mpk_ready(&self, mut ready: MpkReady) -> Result<()> {
        self.signer.sign_mpk_ready(&mut ready);
        self.network.board.add_dkg_mpk_ready(ready);
        Ok(())
    }

    async fn propose_dkg_finalize(&self, mut finalize: Finalize) -> Result<()> {
        self.signer.sign_finalize(&mut finalize);
        self.network.board.add_dkg_finalize(finalize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signers(n: usize) -> Vec<Signer> {
        (0..n).map(|_| Signer::generate()).collect()
    }

    fn board(signers: &[Signer]) -> MemoryGovernance {
        MemoryGovernance::new(signers.iter().map(|s| s.node_id()).collect())
    }

    fn mpk(signer: &Signer, round: Round) -> MasterPublicKey {
        let mut mpk = MasterPublicKey {
            proposer_id: NodeId::default(),
            round,
            commitments: vec![vec![2; 33]],
            signature: None,
        };
        signer.sign_master_public_key(&mut mpk);
        mpk
    }

    fn ready(signer: &Signer, round: Round) -> MpkReady {
        let mut ready = MpkReady {
            proposer_id: NodeId::default(),
            round,
            signature: None,
        };
        signer.sign_mpk_ready(&mut ready);
        ready
    }

    #[test]
    fn test_rejects_unsigned_and_foreign_records() {
        let signers = signers(4);
        let gov = board(&signers);

        let mut unsigned = mpk(&signers[0], 1);
        unsigned.signature = None;
        gov.add_dkg_master_public_key(unsigned);
        gov.add_dkg_master_public_key(mpk(&Signer::generate(), 1));

        assert!(gov.dkg_master_public_keys(1).is_empty());
    }

    #[test]
    fn test_one_mpk_per_proposer() {
        let signers = signers(4);
        let gov = board(&signers);

        gov.add_dkg_master_public_key(mpk(&signers[0], 1));
        gov.add_dkg_master_public_key(mpk(&signers[0], 1));
        gov.add_dkg_master_public_key(mpk(&signers[1], 2));

        assert_eq!(gov.dkg_master_public_keys(1).len(), 1);
        assert_eq!(gov.dkg_master_public_keys(2).len(), 1);
    }

    #[test]
    fn test_mpk_refused_after_ready_quorum() {
        let signers = signers(4);
        let gov = board(&signers);
        assert_eq!(gov.quorum(1), 3);

        for signer in &signers[..2] {
            gov.add_dkg_mpk_ready(ready(signer, 1));
        }
        assert!(!gov.is_dkg_mpk_ready(1));
        gov.add_dkg_master_public_key(mpk(&signers[0], 1));

        gov.add_dkg_mpk_ready(ready(&signers[2], 1));
        assert!(gov.is_dkg_mpk_ready(1));
        gov.add_dkg_master_public_key(mpk(&signers[3], 1));

        let mpks = gov.dkg_master_public_keys(1);
        assert_eq!(mpks.len(), 1);
        assert_eq!(mpks[0].proposer_id, signers[0].node_id());
    }

    #[test]
    fn test_complaint_refused_after_finalize() {
        let signers = signers(4);
        let gov = board(&signers);
        let complaint = |signer: &Signer, accused: NodeId| {
            let mut complaint = Complaint {
                proposer_id: NodeId::default(),
                round: 1,
                accused,
                evidence: None,
                signature: None,
            };
            signer.sign_complaint(&mut complaint);
            complaint
        };

        gov.add_dkg_complaint(complaint(&signers[0], signers[1].node_id()));

        let mut finalize = Finalize {
            proposer_id: NodeId::default(),
            round: 1,
            qualify_ids: BTreeSet::new(),
            signature: None,
        };
        signers[0].sign_finalize(&mut finalize);
        gov.add_dkg_finalize(finalize);
        gov.add_dkg_complaint(complaint(&signers[0], signers[2].node_id()));

        let complaints = gov.dkg_complaints(1);
        assert_eq!(complaints.len(), 1);
        assert_eq!(complaints[0].accused, signers[1].node_id());
        assert!(!gov.is_dkg_final(1));
    }

    #[tokio::test]
    async fn test_private_share_reaches_only_receiver() {
        let signers: Vec<Arc<Signer>> = (0..3).map(|_| Arc::new(Signer::generate())).collect();
        let gov = Arc::new(MemoryGovernance::new(
            signers.iter().map(|s| s.node_id()).collect(),
        ));
        let network = MemoryNetwork::new(gov);
        let mut inboxes = Vec::new();
        let mut recvs = Vec::new();
        for signer in &signers {
            let (recv, inbox) = network.join(signer.clone());
            recvs.push(recv);
            inboxes.push(inbox);
        }

        let share = PrivateShare {
            proposer_id: NodeId::default(),
            receiver_id: signers[1].node_id(),
            round: 1,
            share: [1; 32],
            signature: None,
        };
        recvs[0].propose_dkg_private_share(share).await.unwrap();

        match inboxes[1].rx.try_recv().unwrap() {
            Inbound::PrivateShare(share) => {
                assert_eq!(share.proposer_id, signers[0].node_id());
                identity::verify_private_share(&share).unwrap();
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(inboxes[0].rx.try_recv().is_err());
        assert!(inboxes[2].rx.try_recv().is_err());
    }
}
