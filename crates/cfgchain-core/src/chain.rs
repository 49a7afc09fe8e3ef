//! Configuration chain
//!
//! Per-node orchestrator of DKG and TSIG. Every round has its own state in
//! concurrent maps, so rounds are registered, run and purged independently.

use crate::config::DkgConfig;
use crate::crypto::{self, vss::SecretPolynomial};
use crate::db::Database;
use crate::dkg::protocol::{self, DkgDriver, DkgOutcome, DkgRound, InboundShare};
use crate::dkg::{recovery, DkgPhase};
use crate::governance::{Governance, Recv};
use crate::identity;
use crate::node_set::NodeSetCache;
use crate::tsig::TsigCoordinator;
use crate::types::{
    AntiNackComplaint, DkgPrivateKey, Hash, MasterPublicKey, MpkReady, NodeId, NodePublicKeys,
    PartialSignature, PrivateShare, Round, ThresholdSignature,
};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// DKG and TSIG coordination of one node
pub struct ConfigurationChain {
    id: NodeId,
    recv: Arc<dyn Recv>,
    gov: Arc<dyn Governance>,
    cache: Arc<NodeSetCache>,
    db: Arc<dyn Database>,
    config: DkgConfig,
    dkgs: DashMap<Round, Arc<DkgRound>>,
    npks: DashMap<Round, Arc<NodePublicKeys>>,
    signing_keys: DashMap<Round, Arc<DkgPrivateKey>>,
    tsig: TsigCoordinator,
}

impl ConfigurationChain {
    pub fn new(
        id: NodeId,
        recv: Arc<dyn Recv>,
        gov: Arc<dyn Governance>,
        cache: Arc<NodeSetCache>,
        db: Arc<dyn Database>,
        config: DkgConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id,
            recv,
            gov,
            cache,
            db,
            config,
            dkgs: DashMap::new(),
            npks: DashMap::new(),
            signing_keys: DashMap::new(),
            tsig: TsigCoordinator::default(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &DkgConfig {
        &self.config
    }

    /// Node public keys of a round this node qualified in
    pub fn npks(&self, round: Round) -> Option<Arc<NodePublicKeys>> {
        self.npks.get(&round).map(|npks| npks.value().clone())
    }

    /// Local DKG phase, `None` when the round is unknown
    pub fn dkg_phase(&self, round: Round) -> Option<DkgPhase> {
        if let Some(dkg) = self.dkgs.get(&round) {
            return Some(dkg.phase());
        }
        self.npks.contains_key(&round).then_some(DkgPhase::Qualified)
    }

    /// Generate this node's polynomial for `round` and publish its MPK
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn register_dkg(&self, round: Round, threshold: usize) -> Result<()> {
        self.cache.require_member(round, &self.id)?;
        let n = self.cache.node_set(round).len();
        if threshold + 1 > n {
            return Err(Error::InvalidConfig(format!(
                "threshold {} needs {} nodes, round {} has {}",
                threshold,
                threshold + 1,
                round,
                n
            )));
        }

        let polynomial = SecretPolynomial::generate(threshold);
        let mpk = MasterPublicKey {
            proposer_id: self.id,
            round,
            commitments: polynomial.commitments(),
            signature: None,
        };
        let dkg = match self.dkgs.entry(round) {
            Entry::Occupied(_) => return Err(Error::DkgAlreadyRegistered(round)),
            Entry::Vacant(entry) => {
                let dkg = Arc::new(DkgRound::new(round, polynomial));
                entry.insert(dkg.clone());
                dkg
            }
        };

        info!(round, threshold, "Registered DKG");
        self.recv.propose_dkg_master_public_key(mpk).await?;

        let (recv, gov, observer) = (self.recv.clone(), self.gov.clone(), dkg.clone());
        let ready_at = dkg.started_at + self.config.mpk_ready_offset();
        let ready = MpkReady {
            proposer_id: self.id,
            round,
            signature: None,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            observer.observe_mpks(|| gov.dkg_master_public_keys(round));
            if let Err(e) = recv.propose_dkg_mpk_ready(ready).await {
                warn!(round, error = %e, "Failed to propose MPK ready");
            }
        });
        dkg.set_ready_task(handle);
        Ok(())
    }

    /// Drive the round to its end.
    ///
    /// Returns `Ok` when this node ends qualified, excluded or failed; the
    /// node public keys exist only in the first case. Calling it again for a
    /// round that already failed returns `Error::DkgFailed`.
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn run_dkg(&self, round: Round) -> Result<()> {
        if self.npks.contains_key(&round) && self.signing_keys.contains_key(&round) {
            return Ok(());
        }
        if self.restore(round)? {
            info!(round, "Restored DKG result from board and database");
            return Ok(());
        }

        let dkg = self
            .dkgs
            .get(&round)
            .map(|dkg| dkg.value().clone())
            .ok_or(Error::DkgNotRegistered(round))?;
        let phase = dkg.phase();
        if phase.is_terminal() {
            return match phase {
                DkgPhase::Qualified | DkgPhase::Excluded => Ok(()),
                _ => Err(Error::DkgFailed(round)),
            };
        }
        let _running = dkg.start()?;

        let driver = DkgDriver {
            id: self.id,
            recv: self.recv.as_ref(),
            gov: self.gov.as_ref(),
            cache: self.cache.as_ref(),
            config: &self.config,
        };
        let material = match driver.run(&dkg).await? {
            DkgOutcome::Qualified(material) => material,
            DkgOutcome::Excluded | DkgOutcome::Failed => return Ok(()),
        };

        let (key, npks) = match recovery::recover(&self.id, &material) {
            Ok(recovered) => recovered,
            Err(e) => {
                dkg.set_phase(DkgPhase::Failed);
                return Err(e);
            }
        };
        if let Err(e) = recovery::persist(self.db.as_ref(), round, &key) {
            dkg.set_phase(DkgPhase::Failed);
            return Err(e);
        }

        self.signing_keys.insert(round, Arc::new(key));
        self.npks.insert(round, Arc::new(npks));
        dkg.set_phase(DkgPhase::Qualified);
        Ok(())
    }

    /// Rebuild a finished round from this node's Finalize and stored key.
    ///
    /// The only other writer of `npks` is `run_dkg`; both insert the signing
    /// key alongside.
    fn restore(&self, round: Round) -> Result<bool> {
        if !self.db.has_dkg_private_key(round)? {
            return Ok(false);
        }
        let restored =
            recovery::restore_public_keys(&self.id, round, self.gov.as_ref(), &self.cache)?;
        let Some(npks) = restored else {
            return Ok(false);
        };
        let key = self.db.get_dkg_private_key(round)?;
        recovery::check_stored_key(&self.id, &npks, &key)?;
        self.signing_keys.insert(round, Arc::new(key));
        self.npks.insert(round, Arc::new(npks));
        Ok(true)
    }

    /// Handle a share sent directly to this node
    pub async fn process_private_share(&self, share: PrivateShare) -> Result<()> {
        let Some(dkg) = self.dkgs.get(&share.round).map(|dkg| dkg.value().clone()) else {
            debug!(
                round = share.round,
                proposer = %share.proposer_id,
                "Ignoring share of unregistered round"
            );
            return Ok(());
        };
        identity::verify_private_share(&share)?;
        if share.receiver_id != self.id {
            return Err(Error::MisaddressedShare(share.receiver_id));
        }

        let outbound = dkg.accept(&self.id, InboundShare::Direct(share))?;
        protocol::publish(self.recv.as_ref(), outbound).await
    }

    /// Handle a share revealed in answer to a NACK
    pub async fn process_anti_nack_complaint(&self, anti_nack: AntiNackComplaint) -> Result<()> {
        let Some(dkg) = self.dkgs.get(&anti_nack.round).map(|dkg| dkg.value().clone()) else {
            return Ok(());
        };
        identity::verify_anti_nack_complaint(&anti_nack)?;
        if anti_nack.private_share.round != anti_nack.round {
            return Err(Error::RoundMismatch {
                expected: anti_nack.round,
                actual: anti_nack.private_share.round,
            });
        }

        let outbound = dkg.accept(&self.id, InboundShare::Reveal(anti_nack))?;
        protocol::publish(self.recv.as_ref(), outbound).await
    }

    /// Node public keys of a round this node can sign in, restored from the
    /// board and database when this instance did not run the round
    fn local_public_keys(&self, round: Round) -> Result<Arc<NodePublicKeys>> {
        if let Some(npks) = self.npks.get(&round) {
            return Ok(npks.value().clone());
        }
        self.restore(round)?;
        self.npks
            .get(&round)
            .map(|npks| npks.value().clone())
            .ok_or(Error::DkgNotReady(round))
    }

    /// Node public keys for checking peers' messages.
    ///
    /// Falls back to the board alone when no signing key is stored; that
    /// copy is never cached.
    fn node_public_keys(&self, round: Round) -> Result<Arc<NodePublicKeys>> {
        match self.local_public_keys(round) {
            Err(Error::DkgNotReady(_)) => {}
            other => return other,
        }
        recovery::restore_public_keys(&self.id, round, self.gov.as_ref(), &self.cache)?
            .map(Arc::new)
            .ok_or(Error::DkgNotReady(round))
    }

    fn signing_key(&self, round: Round) -> Result<Arc<DkgPrivateKey>> {
        if let Some(key) = self.signing_keys.get(&round) {
            return Ok(key.value().clone());
        }
        let key = Arc::new(self.db.get_dkg_private_key(round)?);
        self.signing_keys.insert(round, key.clone());
        Ok(key)
    }

    /// Sign `hash` with this node's DKG key of `round`.
    ///
    /// The result carries no outer signature; the caller signs it before
    /// handing it to peers. Identical inputs give identical bytes.
    pub fn prepare_partial_signature(&self, round: Round, hash: Hash) -> Result<PartialSignature> {
        let npks = self.local_public_keys(round)?;
        if !npks.is_qualified(&self.id) {
            return Err(Error::NotQualified { node: self.id, round });
        }
        let key = self.signing_key(round)?;

        Ok(PartialSignature {
            proposer_id: self.id,
            round,
            hash,
            partial_signature: crypto::tsig::sign_share(key.as_bytes(), &hash)?,
            signature: None,
        })
    }

    /// Verify and collect a peer's partial signature; never blocks
    pub fn process_partial_signature(&self, psig: PartialSignature) -> Result<()> {
        identity::verify_partial_signature(&psig)?;
        let npks = self.node_public_keys(psig.round)?;
        self.tsig.process(&npks, psig)
    }

    /// Wait for the group signature on `hash`
    pub async fn run_tsig(&self, round: Round, hash: Hash) -> Result<ThresholdSignature> {
        let npks = self.node_public_keys(round)?;
        self.tsig.run(&npks, hash, self.config.tsig_timeout).await
    }

    /// Drop every piece of state held for `round`
    pub fn purge_round(&self, round: Round) {
        if let Some((_, dkg)) = self.dkgs.remove(&round) {
            dkg.abort();
        }
        self.npks.remove(&round);
        self.signing_keys.remove(&round);
        self.tsig.purge(round);
        self.cache.purge(round);
        debug!(round, node = %self.id, "Purged round");
    }
}
