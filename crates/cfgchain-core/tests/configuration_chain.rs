//! End-to-end DKG and TSIG over an in-memory network

use cfgchain_core::crypto::vss::SecretPolynomial;
use cfgchain_core::db::{BlockIterator, Database, DbError, DbResult, MemBackedDb};
use cfgchain_core::governance::{Governance, MemoryGovernance, MemoryNetwork, NodeRecv, Recv};
use cfgchain_core::node_set::NodeSetCache;
use cfgchain_core::types::{
    Block, Complaint, DkgPrivateKey, Finalize, MasterPublicKey, MpkReady, PartialSignature,
};
use cfgchain_core::{
    ConfigurationChain, DkgConfig, DkgPhase, Error, Hash, NodeId, NodeSet, Result, Round, Signer,
    ThresholdSignature,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const ROUND: Round = 1;

struct Node {
    signer: Arc<Signer>,
    recv: Arc<NodeRecv>,
    gov: Arc<dyn Governance>,
    cache: Arc<NodeSetCache>,
    db: Arc<dyn Database>,
    chain: Arc<ConfigurationChain>,
    _dispatcher: JoinHandle<()>,
}

impl Node {
    fn id(&self) -> NodeId {
        self.signer.node_id()
    }

    /// Second chain instance sharing this node's identity, board and database
    fn restart(&self, config: DkgConfig) -> ConfigurationChain {
        ConfigurationChain::new(
            self.id(),
            self.recv.clone(),
            self.gov.clone(),
            self.cache.clone(),
            self.db.clone(),
            config,
        )
        .unwrap()
    }

    fn partial_signature(&self, round: Round, hash: Hash) -> PartialSignature {
        let mut psig = self.chain.prepare_partial_signature(round, hash).unwrap();
        self.signer.sign_partial_signature(&mut psig);
        psig
    }
}

type Backends = (Arc<dyn Governance>, Arc<dyn Database>);

struct Network {
    gov: Arc<MemoryGovernance>,
    network: Arc<MemoryNetwork>,
    config: DkgConfig,
    nodes: Vec<Node>,
}

impl Network {
    fn new(n: usize, config: DkgConfig) -> Self {
        Self::with(n, config, |_, gov| -> Backends {
            (gov.clone(), Arc::new(MemBackedDb::new()))
        })
    }

    /// Network whose node `i` reads the board and stores keys through
    /// `backends(i, board)`
    fn with(
        n: usize,
        config: DkgConfig,
        backends: impl Fn(usize, &Arc<MemoryGovernance>) -> Backends,
    ) -> Self {
        init_tracing();
        let signers: Vec<Arc<Signer>> = (0..n).map(|_| Arc::new(Signer::generate())).collect();
        let node_set: NodeSet = signers.iter().map(|s| s.node_id()).collect();
        let gov = Arc::new(MemoryGovernance::new(node_set));
        let network = MemoryNetwork::new(gov.clone());

        let nodes = signers
            .into_iter()
            .enumerate()
            .map(|(i, signer)| {
                let (recv, inbox) = network.join(signer.clone());
                let recv = Arc::new(recv);
                let (node_gov, db) = backends(i, &gov);
                let cache = Arc::new(NodeSetCache::new(node_gov.clone()));
                let chain = Arc::new(
                    ConfigurationChain::new(
                        signer.node_id(),
                        recv.clone(),
                        node_gov.clone(),
                        cache.clone(),
                        db.clone(),
                        config.clone(),
                    )
                    .unwrap(),
                );
                let dispatcher = inbox.spawn_dispatcher(chain.clone());
                Node {
                    signer,
                    recv,
                    gov: node_gov,
                    cache,
                    db,
                    chain,
                    _dispatcher: dispatcher,
                }
            })
            .collect();

        Self {
            gov,
            network,
            config,
            nodes,
        }
    }

    async fn register_all(&self, round: Round, threshold: usize) {
        for node in &self.nodes {
            node.chain.register_dkg(round, threshold).await.unwrap();
        }
    }

    /// Run the DKG on every node concurrently
    async fn run_all(&self, round: Round) -> Vec<Result<()>> {
        run_nodes(&self.nodes, round).await
    }

    async fn dkg(&self, round: Round, threshold: usize) {
        self.register_all(round, threshold).await;
        for result in self.run_all(round).await {
            result.unwrap();
        }
    }

    fn qualified(&self, round: Round) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| node.chain.npks(round).is_some())
            .collect()
    }
}

async fn run_nodes(nodes: &[Node], round: Round) -> Vec<Result<()>> {
    let handles = nodes.iter().map(|node| {
        let chain = node.chain.clone();
        tokio::spawn(async move { chain.run_dkg(round).await })
    });
    join_all(handles).await.into_iter().map(|r| r.unwrap()).collect()
}

/// Database whose DKG key writes always fail
struct FailingDb(MemBackedDb);

impl Database for FailingDb {
    fn has_block(&self, hash: &Hash) -> bool {
        self.0.has_block(hash)
    }

    fn get_block(&self, hash: &Hash) -> DbResult<Block> {
        self.0.get_block(hash)
    }

    fn get_all_blocks(&self) -> DbResult<Box<dyn BlockIterator>> {
        self.0.get_all_blocks()
    }

    fn put_block(&self, block: Block) -> DbResult<()> {
        self.0.put_block(block)
    }

    fn put_compaction_chain_tip_info(&self, hash: Hash, height: u64) -> DbResult<()> {
        self.0.put_compaction_chain_tip_info(hash, height)
    }

    fn get_compaction_chain_tip_info(&self) -> (Hash, u64) {
        self.0.get_compaction_chain_tip_info()
    }

    fn has_dkg_private_key(&self, round: Round) -> DbResult<bool> {
        self.0.has_dkg_private_key(round)
    }

    fn get_dkg_private_key(&self, round: Round) -> DbResult<DkgPrivateKey> {
        self.0.get_dkg_private_key(round)
    }

    fn put_dkg_private_key(&self, _round: Round, _key: &DkgPrivateKey) -> DbResult<()> {
        Err(DbError::Io("disk full".into()))
    }

    fn close(&self) -> DbResult<()> {
        self.0.close()
    }
}

/// Board view that also lists MPKs recorded after the ready quorum
struct LateMpkBoard {
    board: Arc<MemoryGovernance>,
    late: Arc<Mutex<Vec<MasterPublicKey>>>,
}

impl Governance for LateMpkBoard {
    fn configuration(&self, round: Round) -> NodeSet {
        self.board.configuration(round)
    }

    fn add_dkg_master_public_key(&self, mpk: MasterPublicKey) {
        self.board.add_dkg_master_public_key(mpk)
    }

    fn dkg_master_public_keys(&self, round: Round) -> Vec<MasterPublicKey> {
        let mut mpks = self.board.dkg_master_public_keys(round);
        mpks.extend(self.late.lock().iter().filter(|mpk| mpk.round == round).cloned());
        mpks
    }

    fn add_dkg_complaint(&self, complaint: Complaint) {
        self.board.add_dkg_complaint(complaint)
    }

    fn dkg_complaints(&self, round: Round) -> Vec<Complaint> {
        self.board.dkg_complaints(round)
    }

    fn add_dkg_mpk_ready(&self, ready: MpkReady) {
        self.board.add_dkg_mpk_ready(ready)
    }

    fn is_dkg_mpk_ready(&self, round: Round) -> bool {
        self.board.is_dkg_mpk_ready(round)
    }

    fn add_dkg_finalize(&self, finalize: Finalize) {
        self.board.add_dkg_finalize(finalize)
    }

    fn dkg_finalizes(&self, round: Round) -> Vec<Finalize> {
        self.board.dkg_finalizes(round)
    }

    fn is_dkg_final(&self, round: Round) -> bool {
        self.board.is_dkg_final(round)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lambda(ms: u64) -> DkgConfig {
    DkgConfig::new(Duration::from_millis(ms))
}

/// Every qualified node feeds its partial signature to every other node,
/// then all of them wait for the group signature
async fn run_tsig(net: &Network, round: Round, hash: Hash) -> Vec<Result<ThresholdSignature>> {
    let qualified = net.qualified(round);
    let psigs: Vec<PartialSignature> = qualified
        .iter()
        .map(|node| node.partial_signature(round, hash))
        .collect();

    let waiters: Vec<_> = qualified
        .iter()
        .map(|node| {
            let chain = node.chain.clone();
            tokio::spawn(async move { chain.run_tsig(round, hash).await })
        })
        .collect();
    for node in &qualified {
        for psig in &psigs {
            node.chain.process_partial_signature(psig.clone()).unwrap();
        }
    }
    join_all(waiters).await.into_iter().map(|r| r.unwrap()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dkg_and_tsig() {
    let (n, k) = (10, 4);
    let net = Network::new(n, lambda(100));

    net.register_all(ROUND, k).await;
    assert_eq!(net.gov.dkg_master_public_keys(ROUND).len(), n);
    for result in net.run_all(ROUND).await {
        result.unwrap();
    }

    let ids: Vec<NodeId> = net.nodes.iter().map(Node::id).collect();
    let reference = net.nodes[0].chain.npks(ROUND).unwrap();
    for node in &net.nodes {
        let npks = node.chain.npks(ROUND).unwrap();
        assert_eq!(npks.qualify_node_ids.len(), n);
        assert!(ids.iter().all(|id| npks.is_qualified(id)));
        assert_eq!(npks.group_public_key, reference.group_public_key);
        assert_eq!(node.chain.dkg_phase(ROUND), Some(DkgPhase::Qualified));
        assert!(node.db.has_dkg_private_key(ROUND).unwrap());
    }
    assert!(net.gov.is_dkg_final(ROUND));

    let hash = Hash::keccak256(b"Hello world");
    let signatures = run_tsig(&net, ROUND, hash).await;
    let first = signatures[0].as_ref().unwrap();
    assert_eq!(first.hash, hash);
    for signature in &signatures {
        assert_eq!(signature.as_ref().unwrap(), first);
    }
    assert!(net.network.dispatch_errors().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_mpk_is_excluded() {
    let (n, k) = (10, 4);
    let net = Network::new(n, lambda(100));
    let (late, on_time) = net.nodes.split_last().unwrap();

    for node in on_time {
        node.chain.register_dkg(ROUND, k).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1000)).await;
    late.chain.register_dkg(ROUND, k).await.unwrap();
    assert_eq!(net.gov.dkg_master_public_keys(ROUND).len(), n - 1);

    for result in net.run_all(ROUND).await {
        result.unwrap();
    }

    assert!(late.chain.npks(ROUND).is_none());
    assert_eq!(late.chain.dkg_phase(ROUND), Some(DkgPhase::Excluded));
    for node in on_time {
        let npks = node.chain.npks(ROUND).unwrap();
        assert_eq!(npks.qualify_node_ids.len(), n - 1);
        assert!(!npks.is_qualified(&late.id()));
    }

    let hash = Hash::keccak256(b"late");
    for signature in run_tsig(&net, ROUND, hash).await {
        signature.unwrap();
    }
    assert!(matches!(
        late.chain.prepare_partial_signature(ROUND, hash),
        Err(Error::DkgNotReady(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_complaint_after_cutoff_is_ignored() {
    let (n, k) = (7, 2);
    let net = Network::new(n, lambda(300));
    net.register_all(ROUND, k).await;

    // The accuser never runs the round, so it never finalizes and the board
    // keeps taking its complaints
    let (accuser, running) = net.nodes.split_first().unwrap();
    let recv = accuser.recv.clone();
    let accuser_id = accuser.id();
    let accused: Vec<NodeId> = running.iter().map(Node::id).collect();
    let late_nacks = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(950)).await;
        for accused in accused {
            let complaint = Complaint {
                proposer_id: accuser_id,
                round: ROUND,
                accused,
                evidence: None,
                signature: None,
            };
            recv.propose_dkg_complaint(complaint).await.unwrap();
        }
    });

    for result in run_nodes(running, ROUND).await {
        result.unwrap();
    }
    late_nacks.await.unwrap();

    let late = net
        .gov
        .dkg_complaints(ROUND)
        .into_iter()
        .filter(|c| c.proposer_id == accuser_id)
        .count();
    assert_eq!(late, n - 1);
    for node in running {
        let npks = node.chain.npks(ROUND).unwrap();
        assert_eq!(npks.qualify_node_ids.len(), n - 1);
        assert!(running.iter().all(|other| npks.is_qualified(&other.id())));
        assert!(!npks.is_qualified(&accuser_id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mpk_recorded_after_ready_is_ignored() {
    let (n, k) = (5, 1);
    let late = Arc::new(Mutex::new(Vec::new()));
    let backends = |i: usize, gov: &Arc<MemoryGovernance>| -> Backends {
        let db = Arc::new(MemBackedDb::new());
        if i == 0 {
            let board = LateMpkBoard {
                board: gov.clone(),
                late: late.clone(),
            };
            return (Arc::new(board), db);
        }
        (gov.clone(), db)
    };
    let net = Network::with(n, lambda(100), backends);
    let (absent, present) = net.nodes.split_last().unwrap();

    for node in present {
        node.chain.register_dkg(ROUND, k).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(net.gov.is_dkg_mpk_ready(ROUND));

    let mut mpk = MasterPublicKey {
        proposer_id: absent.id(),
        round: ROUND,
        commitments: SecretPolynomial::generate(k).commitments(),
        signature: None,
    };
    absent.signer.sign_master_public_key(&mut mpk);
    late.lock().push(mpk);
    assert_eq!(present[0].gov.dkg_master_public_keys(ROUND).len(), n);

    for result in run_nodes(present, ROUND).await {
        result.unwrap();
    }

    assert!(net.gov.dkg_complaints(ROUND).is_empty());
    let reference = present[1].chain.npks(ROUND).unwrap();
    assert_eq!(reference.qualify_node_ids.len(), n - 1);
    assert_eq!(present[0].chain.npks(ROUND), Some(reference));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiple_tsig() {
    let (n, k) = (7, 2);
    let net = Network::new(n, lambda(100));
    net.dkg(ROUND, k).await;

    let hashes = [Hash::keccak256(b"first"), Hash::keccak256(b"second"), Hash::random()];
    let runs = join_all(hashes.iter().map(|hash| run_tsig(&net, ROUND, *hash))).await;

    let mut recovered = Vec::new();
    for (hash, signatures) in hashes.iter().zip(runs) {
        let first = signatures[0].as_ref().unwrap().clone();
        assert_eq!(first.hash, *hash);
        assert!(signatures.iter().all(|s| s.as_ref().unwrap() == &first));
        recovered.push(first.point);
    }
    assert_ne!(recovered[0], recovered[1]);
    assert_ne!(recovered[1], recovered[2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tsig_timeout() {
    let (n, k) = (7, 2);
    let net = Network::new(n, lambda(100).with_tsig_timeout(Duration::from_millis(500)));
    net.dkg(ROUND, k).await;

    let hash = Hash::keccak256(b"timeout");
    let psig = net.nodes[0].partial_signature(ROUND, hash);

    let waiters: Vec<_> = net
        .nodes
        .iter()
        .map(|node| {
            let chain = node.chain.clone();
            tokio::spawn(async move { chain.run_tsig(ROUND, hash).await })
        })
        .collect();
    for node in &net.nodes {
        node.chain.process_partial_signature(psig.clone()).unwrap();
    }
    for result in join_all(waiters).await {
        assert!(matches!(result.unwrap(), Err(Error::NotEnoughPartialSignatures)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restarted_chain_recovers_signer() {
    let (n, k) = (7, 2);
    let net = Network::new(n, lambda(100));
    net.dkg(ROUND, k).await;

    let hash = Hash::keccak256(b"recovery");
    for node in &net.nodes {
        let restarted = node.restart(net.config.clone());
        assert!(restarted.npks(ROUND).is_none());

        let original = node.chain.prepare_partial_signature(ROUND, hash).unwrap();
        let recovered = restarted.prepare_partial_signature(ROUND, hash).unwrap();
        assert_eq!(original.partial_signature, recovered.partial_signature);

        restarted.run_dkg(ROUND).await.unwrap();
        assert_eq!(restarted.npks(ROUND), node.chain.npks(ROUND));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_stored_key_fails_round() {
    let (n, k) = (4, 1);
    let net = Network::new(n, lambda(100));
    let stale = DkgPrivateKey::from_bytes([7; 32]);
    net.nodes[0].db.put_dkg_private_key(ROUND, &stale).unwrap();

    net.register_all(ROUND, k).await;
    let results = net.run_all(ROUND).await;
    assert!(matches!(results[0], Err(Error::StoredKeyMismatch(ROUND))));
    for result in &results[1..] {
        assert!(result.is_ok());
    }

    let node = &net.nodes[0];
    assert!(node.chain.npks(ROUND).is_none());
    assert_eq!(node.chain.dkg_phase(ROUND), Some(DkgPhase::Failed));
    assert_eq!(node.db.get_dkg_private_key(ROUND).unwrap(), stale);

    let hash = Hash::keccak256(b"stale");
    assert!(matches!(
        node.chain.prepare_partial_signature(ROUND, hash),
        Err(Error::StoredKeyMismatch(ROUND))
    ));
    let restarted = node.restart(net.config.clone());
    assert!(matches!(
        restarted.prepare_partial_signature(ROUND, hash),
        Err(Error::StoredKeyMismatch(ROUND))
    ));
    assert!(restarted.npks(ROUND).is_none());

    for node in &net.nodes {
        assert!(matches!(
            node.db.put_dkg_private_key(ROUND, &DkgPrivateKey::from_bytes([1; 32])),
            Err(DbError::DkgPrivateKeyExists(ROUND))
        ));
    }
    // Finished rounds return immediately
    net.nodes[1].chain.run_dkg(ROUND).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_persist_leaves_round_unusable() {
    let (n, k) = (4, 1);
    let backends = |i: usize, gov: &Arc<MemoryGovernance>| -> Backends {
        if i == 0 {
            return (gov.clone(), Arc::new(FailingDb(MemBackedDb::new())));
        }
        (gov.clone(), Arc::new(MemBackedDb::new()))
    };
    let net = Network::with(n, lambda(100), backends);

    net.register_all(ROUND, k).await;
    let results = net.run_all(ROUND).await;
    assert!(matches!(results[0], Err(Error::Db(DbError::Io(_)))));
    for result in &results[1..] {
        assert!(result.is_ok());
    }

    let node = &net.nodes[0];
    assert!(node.chain.npks(ROUND).is_none());
    assert_eq!(node.chain.dkg_phase(ROUND), Some(DkgPhase::Failed));

    // Checking a peer's share rebuilds node public keys without keeping them
    let hash = Hash::keccak256(b"disk full");
    node.chain
        .process_partial_signature(net.nodes[1].partial_signature(ROUND, hash))
        .unwrap();
    assert!(node.chain.npks(ROUND).is_none());

    assert!(matches!(node.chain.run_dkg(ROUND).await, Err(Error::DkgFailed(ROUND))));
    assert!(node.chain.npks(ROUND).is_none());
    assert!(matches!(
        node.chain.prepare_partial_signature(ROUND, hash),
        Err(Error::DkgNotReady(ROUND))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registration_errors_and_purge() {
    let (n, k) = (4, 1);
    let net = Network::new(n, lambda(100));
    let chain = &net.nodes[0].chain;

    assert!(matches!(chain.run_dkg(ROUND).await, Err(Error::DkgNotRegistered(ROUND))));
    assert!(matches!(
        chain.run_tsig(ROUND, Hash::random()).await,
        Err(Error::DkgNotReady(ROUND))
    ));
    assert!(matches!(chain.register_dkg(ROUND, n).await, Err(Error::InvalidConfig(_))));

    let outsider = net.nodes[1].restart(net.config.clone());
    net.gov.set_configuration(2, net.nodes[2..].iter().map(Node::id).collect());
    assert!(matches!(outsider.register_dkg(2, k).await, Err(Error::NotInNodeSet { .. })));

    net.dkg(ROUND, k).await;
    assert!(matches!(chain.register_dkg(ROUND, k).await, Err(Error::DkgAlreadyRegistered(ROUND))));

    chain.purge_round(ROUND);
    assert_eq!(chain.dkg_phase(ROUND), None);
    assert!(chain.npks(ROUND).is_none());

    // Board and database still hold the round
    chain.run_dkg(ROUND).await.unwrap();
    assert_eq!(chain.dkg_phase(ROUND), Some(DkgPhase::Qualified));
}
