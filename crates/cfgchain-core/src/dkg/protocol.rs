//! Per-round DKG state and the phase driver

use super::qualify::{self, ComplaintSnapshot};
use super::recovery::QualifiedRound;
use super::share_store::ShareStore;
use super::{collect_candidates, Candidates, DkgPhase};
use crate::config::DkgConfig;
use crate::crypto::vss::{self, SecretPolynomial};
use crate::governance::{Governance, Recv};
use crate::node_set::NodeSetCache;
use crate::types::{
    AntiNackComplaint, Complaint, Finalize, MasterPublicKey, NodeId, PrivateShare, Round,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Share delivered to this node, directly or as a public reveal
#[derive(Debug)]
pub(crate) enum InboundShare {
    Direct(PrivateShare),
    Reveal(AntiNackComplaint),
}

/// Message to publish once the round lock is released
#[derive(Debug)]
pub(crate) enum Outbound {
    Complaint(Complaint),
    AntiNack(AntiNackComplaint),
}

/// Hand outbound messages to the broadcaster
pub(crate) async fn publish(recv: &dyn Recv, outbound: Vec<Outbound>) -> Result<()> {
    for message in outbound {
        match message {
            Outbound::Complaint(complaint) => recv.propose_dkg_complaint(complaint).await?,
            Outbound::AntiNack(anti_nack) => recv.propose_dkg_anti_nack_complaint(anti_nack).await?,
        }
    }
    Ok(())
}

struct RoundState {
    phase: DkgPhase,
    /// Dropped once shares are dealt
    polynomial: Option<SecretPolynomial>,
    candidates: Option<Arc<Candidates>>,
    /// Shares that arrived before the candidate set was known
    pending: Vec<InboundShare>,
    shares: ShareStore,
}

/// DKG state of one round on one node
pub(crate) struct DkgRound {
    pub round: Round,
    pub threshold: usize,
    pub started_at: Instant,
    state: Mutex<RoundState>,
    /// MPKs on the board at the MPK-ready deadline
    observed_mpks: Mutex<Option<Vec<MasterPublicKey>>>,
    rebutted: Notify,
    running: AtomicBool,
    ready_task: Mutex<Option<JoinHandle<()>>>,
}

/// Resets the running flag of a round when `run_dkg` returns
pub(crate) struct RunGuard<'a>(&'a DkgRound);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Result of driving a round to its end
pub(crate) enum DkgOutcome {
    Qualified(QualifiedRound),
    Excluded,
    Failed,
}

impl DkgRound {
    pub fn new(round: Round, polynomial: SecretPolynomial) -> Self {
        Self {
            round,
            threshold: polynomial.threshold(),
            started_at: Instant::now(),
            state: Mutex::new(RoundState {
                phase: DkgPhase::Registered,
                polynomial: Some(polynomial),
                candidates: None,
                pending: Vec::new(),
                shares: ShareStore::default(),
            }),
            observed_mpks: Mutex::new(None),
            rebutted: Notify::new(),
            running: AtomicBool::new(false),
            ready_task: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> DkgPhase {
        self.state.lock().phase
    }

    pub fn set_phase(&self, phase: DkgPhase) {
        let mut state = self.state.lock();
        debug!(round = self.round, from = %state.phase, to = %phase, "DKG phase");
        state.phase = phase;
    }

    /// Claim the round for one `run_dkg` caller
    pub fn start(&self) -> Result<RunGuard<'_>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::DkgAlreadyRunning(self.round));
        }
        Ok(RunGuard(self))
    }

    /// MPKs this node observed at its MPK-ready deadline.
    ///
    /// The first caller reads the board; later callers get the same set, so
    /// MPKs recorded after the deadline never become candidates.
    pub fn observe_mpks(
        &self,
        read: impl FnOnce() -> Vec<MasterPublicKey>,
    ) -> Vec<MasterPublicKey> {
        self.observed_mpks.lock().get_or_insert_with(read).clone()
    }

    pub fn set_ready_task(&self, handle: JoinHandle<()>) {
        *self.ready_task.lock() = Some(handle);
    }

    /// Stop background work of the round
    pub fn abort(&self) {
        if let Some(handle) = self.ready_task.lock().take() {
            handle.abort();
        }
        self.rebutted.notify_waiters();
    }

    /// Fix the candidate set and deal this node's shares.
    ///
    /// Returns the shares to send and the inbound shares queued so far, or
    /// `None` when this node is not a candidate.
    fn freeze(
        &self,
        me: &NodeId,
        candidates: Arc<Candidates>,
    ) -> Option<(Vec<PrivateShare>, Vec<InboundShare>)> {
        let mut state = self.state.lock();
        state.candidates = Some(candidates.clone());
        let pending = std::mem::take(&mut state.pending);
        let polynomial = state.polynomial.take();

        let Some(polynomial) = polynomial.filter(|_| candidates.contains_key(me)) else {
            state.phase = DkgPhase::Excluded;
            return None;
        };

        let shares: Vec<PrivateShare> = candidates
            .iter()
            .map(|(receiver, candidate)| PrivateShare {
                proposer_id: *me,
                receiver_id: *receiver,
                round: self.round,
                share: polynomial.share(&candidate.dkg_id),
                signature: None,
            })
            .collect();
        for share in &shares {
            state.shares.record_sent(share.clone());
        }
        state.phase = DkgPhase::ExchangingShares;
        Some((shares, pending))
    }

    /// Validate and store an inbound share
    pub fn accept(&self, me: &NodeId, share: InboundShare) -> Result<Vec<Outbound>> {
        let mut state = self.state.lock();
        let Some(candidates) = state.candidates.clone() else {
            state.pending.push(share);
            return Ok(Vec::new());
        };

        match share {
            InboundShare::Direct(share) => self.accept_direct(&mut state, me, &candidates, share),
            InboundShare::Reveal(anti_nack) => {
                self.accept_reveal(&mut state, me, &candidates, anti_nack)
            }
        }
    }

    fn accept_direct(
        &self,
        state: &mut RoundState,
        me: &NodeId,
        candidates: &Candidates,
        share: PrivateShare,
    ) -> Result<Vec<Outbound>> {
        let proposer = candidates
            .get(&share.proposer_id)
            .ok_or(Error::NotDkgParticipant(share.proposer_id))?;
        let Some(receiver) = candidates.get(me) else {
            return Ok(Vec::new());
        };
        if state.shares.check_received(&share.proposer_id, &share.share)? {
            return Ok(Vec::new());
        }

        if !vss::verify_share(&share.share, &receiver.dkg_id, &proposer.commitments) {
            warn!(round = self.round, proposer = %share.proposer_id, "Invalid private share");
            if !state.shares.mark_complained(share.proposer_id) {
                return Ok(Vec::new());
            }
            let complaint = Complaint {
                proposer_id: *me,
                round: self.round,
                accused: share.proposer_id,
                evidence: Some(share),
                signature: None,
            };
            return Ok(vec![Outbound::Complaint(complaint)]);
        }

        state.shares.accept(share.proposer_id, share.share);
        Ok(Vec::new())
    }

    fn accept_reveal(
        &self,
        state: &mut RoundState,
        me: &NodeId,
        candidates: &Candidates,
        anti_nack: AntiNackComplaint,
    ) -> Result<Vec<Outbound>> {
        let share = &anti_nack.private_share;
        let proposer = candidates
            .get(&share.proposer_id)
            .ok_or(Error::NotDkgParticipant(share.proposer_id))?;
        let Some(receiver) = candidates.get(&share.receiver_id) else {
            return Ok(Vec::new());
        };
        if !vss::verify_share(&share.share, &receiver.dkg_id, &proposer.commitments) {
            return Err(Error::InvalidShare(share.proposer_id));
        }

        if !state.shares.record_rebuttal(share.proposer_id, share.receiver_id) {
            return Ok(Vec::new());
        }
        debug!(
            round = self.round,
            accused = %share.proposer_id,
            complainer = %share.receiver_id,
            "NACK rebutted"
        );
        self.rebutted.notify_waiters();
        if share.receiver_id == *me
            && !state.shares.check_received(&share.proposer_id, &share.share)?
        {
            state.shares.accept(share.proposer_id, share.share);
        }
        if anti_nack.proposer_id == *me {
            return Ok(Vec::new());
        }

        let rebroadcast = AntiNackComplaint {
            proposer_id: *me,
            round: self.round,
            private_share: anti_nack.private_share,
            signature: None,
        };
        Ok(vec![Outbound::AntiNack(rebroadcast)])
    }

    fn missing_shares(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        let Some(candidates) = &state.candidates else {
            return Vec::new();
        };
        candidates
            .keys()
            .filter(|node| !state.shares.has_received(node))
            .copied()
            .collect()
    }

    fn sent_to(&self, receiver: &NodeId) -> Option<PrivateShare> {
        self.state.lock().shares.sent_to(receiver).cloned()
    }

    fn rebuttals(&self) -> BTreeSet<(NodeId, NodeId)> {
        self.state.lock().shares.rebuttals().clone()
    }

    fn received_from(&self, qualified: &BTreeSet<NodeId>) -> Option<Vec<[u8; 32]>> {
        self.state.lock().shares.received_from(qualified)
    }
}

/// Drives one round of one node through the DKG phases
pub(crate) struct DkgDriver<'a> {
    pub id: NodeId,
    pub recv: &'a dyn Recv,
    pub gov: &'a dyn Governance,
    pub cache: &'a NodeSetCache,
    pub config: &'a DkgConfig,
}

impl DkgDriver<'_> {
    /// Deadline of the phase at `offset` from the round start, shifted to
    /// count from the freeze instant
    fn deadline(&self, frozen_at: Instant, offset: Duration) -> Instant {
        frozen_at + offset.saturating_sub(self.config.mpk_ready_offset())
    }

    async fn poll_until(
        &self,
        deadline: Instant,
        what: &str,
        mut condition: impl FnMut() -> bool,
    ) -> Result<()> {
        loop {
            if condition() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(
        skip(self, dkg),
        fields(node = %self.id, round = dkg.round, threshold = dkg.threshold)
    )]
    pub async fn run(&self, dkg: &DkgRound) -> Result<DkgOutcome> {
        let round = dkg.round;

        // Candidates are the MPKs observed at the deadline; the board must
        // also report ready before shares are dealt
        dkg.set_phase(DkgPhase::CollectingMpk);
        let ready_at = dkg.started_at + self.config.mpk_ready_offset();
        sleep_until(ready_at).await;
        let mpks = dkg.observe_mpks(|| self.gov.dkg_master_public_keys(round));
        self.poll_until(ready_at + self.config.finalize_timeout, "MPK ready", || {
            self.gov.is_dkg_mpk_ready(round)
        })
        .await?;

        let candidates = Arc::new(collect_candidates(&mpks, round, dkg.threshold, self.cache));
        let frozen_at = Instant::now().max(ready_at);
        info!(candidates = candidates.len(), "Candidate set frozen");

        let Some((shares, pending)) = dkg.freeze(&self.id, candidates.clone()) else {
            info!("Not a candidate, excluded from round");
            return Ok(DkgOutcome::Excluded);
        };
        if candidates.len() < dkg.threshold + 1 {
            dkg.set_phase(DkgPhase::Failed);
            return Err(Error::NotEnoughCandidates {
                required: dkg.threshold + 1,
                actual: candidates.len(),
            });
        }

        for share in shares {
            let to = share.receiver_id;
            if let Err(e) = self.recv.propose_dkg_private_share(share).await {
                warn!(receiver = %to, error = %e, "Failed to send private share");
            }
        }
        for share in pending {
            match dkg.accept(&self.id, share) {
                Ok(outbound) => publish(self.recv, outbound).await?,
                Err(e) => warn!(error = %e, "Dropping queued share"),
            }
        }

        // NACK candidates whose share is still missing
        sleep_until(self.deadline(frozen_at, self.config.nack_offset())).await;
        let missing = dkg.missing_shares();
        for accused in &missing {
            warn!(accused = %accused, "No valid share, proposing NACK");
            let complaint = Complaint {
                proposer_id: self.id,
                round,
                accused: *accused,
                evidence: None,
                signature: None,
            };
            self.recv.propose_dkg_complaint(complaint).await?;
        }
        dkg.set_phase(DkgPhase::ComplaintWindow);

        // Complaints missing from this snapshot are ignored for good
        let cutoff_at = self.deadline(frozen_at, self.config.complaint_cutoff_offset());
        sleep_until(cutoff_at).await;
        let complaints = self.gov.dkg_complaints(round);
        let snapshot = qualify::snapshot_complaints(&complaints, round, &candidates);
        debug!(
            nacks = snapshot.nacks.len(),
            disqualified = snapshot.disqualified.len(),
            "Complaint snapshot"
        );
        for complainer in snapshot.nacks_against(&self.id) {
            let Some(share) = dkg.sent_to(&complainer) else {
                continue;
            };
            info!(complainer = %complainer, "Revealing share against NACK");
            let reveal = AntiNackComplaint {
                proposer_id: self.id,
                round,
                private_share: share,
                signature: None,
            };
            self.recv.propose_dkg_anti_nack_complaint(reveal).await?;
        }
        dkg.set_phase(DkgPhase::Finalizing);

        let finalize_at = self.deadline(frozen_at, self.config.finalize_offset());
        self.wait_rebuttals(dkg, &snapshot, finalize_at).await;

        let candidate_ids: BTreeSet<NodeId> = candidates.keys().copied().collect();
        let qualify_ids = qualify::qualify(&candidate_ids, &snapshot, &dkg.rebuttals());
        info!(qualified = qualify_ids.len(), "Proposing finalize");
        let finalize = Finalize {
            proposer_id: self.id,
            round,
            qualify_ids: qualify_ids.clone(),
            signature: None,
        };
        self.recv.propose_dkg_finalize(finalize).await?;

        let final_deadline = Instant::now() + self.config.finalize_timeout;
        self.poll_until(final_deadline, "finalize quorum", || self.gov.is_dkg_final(round))
            .await?;

        if qualify_ids.len() < dkg.threshold + 1 {
            dkg.set_phase(DkgPhase::Failed);
            return Err(Error::NotEnoughQualified {
                required: dkg.threshold + 1,
                actual: qualify_ids.len(),
            });
        }
        if !qualify_ids.contains(&self.id) {
            info!("Not qualified, excluded from round");
            dkg.set_phase(DkgPhase::Excluded);
            return Ok(DkgOutcome::Excluded);
        }
        let Some(shares) = dkg.received_from(&qualify_ids) else {
            warn!("Missing shares from qualified nodes");
            dkg.set_phase(DkgPhase::Failed);
            return Ok(DkgOutcome::Failed);
        };

        let qualified: Candidates = candidates
            .iter()
            .filter(|(node, _)| qualify_ids.contains(node))
            .map(|(node, candidate)| (*node, candidate.clone()))
            .collect();
        Ok(DkgOutcome::Qualified(QualifiedRound {
            round,
            threshold: dkg.threshold,
            qualified,
            shares,
        }))
    }

    /// Wait until every NACK of the snapshot is rebutted or `deadline` passes
    async fn wait_rebuttals(
        &self,
        dkg: &DkgRound,
        snapshot: &ComplaintSnapshot,
        deadline: Instant,
    ) {
        loop {
            let notified = dkg.rebutted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if snapshot.is_resolved(&dkg.rebuttals()) {
                return;
            }
            if timeout_at(deadline, notified).await.is_err() {
                debug!("Finalize deadline reached with unrebutted NACKs");
                return;
            }
        }
    }
}
