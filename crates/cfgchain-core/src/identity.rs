//! Node identity and outer message signatures
//!
//! Every protocol message is signed over a SHA3-256 digest of its fields with
//! the proposer's ed25519 key. Verification checks that the embedded
//! verifying key hashes to the claimed proposer ID.

use crate::types::{
    AntiNackComplaint, Complaint, Finalize, MasterPublicKey, MessageSignature, MpkReady, NodeId,
    PartialSignature, PrivateShare,
};
use crate::{Error, Result};
use digest::Digest;
use ed25519_dalek::{Signer as _, SigningKey, Verifier, VerifyingKey};
use sha3::Sha3_256;

/// Signs protocol messages on behalf of one node
pub struct Signer {
    key: SigningKey,
    id: NodeId,
}

impl Signer {
    /// Create a signer with a fresh random identity key
    pub fn generate() -> Self {
        Self::from_bytes(rand::random())
    }

    /// Create a signer from a 32-byte ed25519 secret
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        let key = SigningKey::from_bytes(&secret);
        let id = NodeId::from_public_key(key.verifying_key().as_bytes());
        Self { key, id }
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    fn sign_digest(&self, digest: &[u8]) -> MessageSignature {
        let signature = self.key.sign(digest);
        MessageSignature {
            public_key: self.key.verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
        }
    }

    pub fn sign_master_public_key(&self, mpk: &mut MasterPublicKey) {
        mpk.proposer_id = self.id;
        mpk.signature = Some(self.sign_digest(&master_public_key_digest(mpk)));
    }

    pub fn sign_private_share(&self, share: &mut PrivateShare) {
        share.proposer_id = self.id;
        share.signature = Some(self.sign_digest(&private_share_digest(share)));
    }

    pub fn sign_complaint(&self, complaint: &mut Complaint) {
        complaint.proposer_id = self.id;
        complaint.signature = Some(self.sign_digest(&complaint_digest(complaint)));
    }

    pub fn sign_anti_nack_complaint(&self, anti_nack: &mut AntiNackComplaint) {
        anti_nack.proposer_id = self.id;
        anti_nack.signature = Some(self.sign_digest(&anti_nack_digest(anti_nack)));
    }

    pub fn sign_mpk_ready(&self, ready: &mut MpkReady) {
        ready.proposer_id = self.id;
        ready.signature = Some(self.sign_digest(&mpk_ready_digest(ready)));
    }

    pub fn sign_finalize(&self, finalize: &mut Finalize) {
        finalize.proposer_id = self.id;
        finalize.signature = Some(self.sign_digest(&finalize_digest(finalize)));
    }

    pub fn sign_partial_signature(&self, psig: &mut PartialSignature) {
        psig.proposer_id = self.id;
        psig.signature = Some(self.sign_digest(&partial_signature_digest(psig)));
    }
}

fn verify(proposer: &NodeId, signature: Option<&MessageSignature>, digest: &[u8]) -> Result<()> {
    let signature = signature.ok_or(Error::InvalidSignature)?;
    if NodeId::from_public_key(&signature.public_key) != *proposer {
        return Err(Error::InvalidSignature);
    }
    let key = VerifyingKey::from_bytes(&signature.public_key)
        .map_err(|_| Error::InvalidSignature)?;
    let signature = ed25519_dalek::Signature::from_slice(&signature.signature)
        .map_err(|_| Error::InvalidSignature)?;
    key.verify(digest, &signature)
        .map_err(|_| Error::InvalidSignature)
}

pub fn verify_master_public_key(mpk: &MasterPublicKey) -> Result<()> {
    verify(&mpk.proposer_id, mpk.signature.as_ref(), &master_public_key_digest(mpk))
}

pub fn verify_private_share(share: &PrivateShare) -> Result<()> {
    verify(&share.proposer_id, share.signature.as_ref(), &private_share_digest(share))
}

/// Verifies the complaint and, for evidence complaints, the embedded share
pub fn verify_complaint(complaint: &Complaint) -> Result<()> {
    verify(
        &complaint.proposer_id,
        complaint.signature.as_ref(),
        &complaint_digest(complaint),
    )?;
    if let Some(evidence) = &complaint.evidence {
        verify_private_share(evidence)?;
    }
    Ok(())
}

/// Verifies the reveal and the revealed share's original signature
pub fn verify_anti_nack_complaint(anti_nack: &AntiNackComplaint) -> Result<()> {
    verify(
        &anti_nack.proposer_id,
        anti_nack.signature.as_ref(),
        &anti_nack_digest(anti_nack),
    )?;
    verify_private_share(&anti_nack.private_share)
}

pub fn verify_mpk_ready(ready: &MpkReady) -> Result<()> {
    verify(&ready.proposer_id, ready.signature.as_ref(), &mpk_ready_digest(ready))
}

pub fn verify_finalize(finalize: &Finalize) -> Result<()> {
    verify(&finalize.proposer_id, finalize.signature.as_ref(), &finalize_digest(finalize))
}

pub fn verify_partial_signature(psig: &PartialSignature) -> Result<()> {
    verify(&psig.proposer_id, psig.signature.as_ref(), &partial_signature_digest(psig))
}

fn master_public_key_digest(mpk: &MasterPublicKey) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"dkg-master-public-key");
    hasher.update(mpk.proposer_id.as_bytes());
    hasher.update(mpk.round.to_be_bytes());
    for commitment in &mpk.commitments {
        hasher.update((commitment.len() as u32).to_be_bytes());
        hasher.update(commitment);
    }
    hasher.finalize().to_vec()
}

fn private_share_digest(share: &PrivateShare) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"dkg-private-share");
    hasher.update(share.proposer_id.as_bytes());
    hasher.update(share.receiver_id.as_bytes());
    hasher.update(share.round.to_be_bytes());
    hasher.update(share.share);
    hasher.finalize().to_vec()
}

fn complaint_digest(complaint: &Complaint) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"dkg-complaint");
    hasher.update(complaint.proposer_id.as_bytes());
    hasher.update(complaint.round.to_be_bytes());
    hasher.update(complaint.accused.as_bytes());
    match &complaint.evidence {
        None => hasher.update([0u8]),
        Some(evidence) => {
            hasher.update([1u8]);
            hasher.update(private_share_digest(evidence));
        }
    }
    hasher.finalize().to_vec()
}

fn anti_nack_digest(anti_nack: &AntiNackComplaint) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"dkg-anti-nack-complaint");
    hasher.update(anti_nack.proposer_id.as_bytes());
    hasher.update(anti_nack.round.to_be_bytes());
    hasher.update(private_share_digest(&anti_nack.private_share));
    hasher.finalize().to_vec()
}

fn mpk_ready_digest(ready: &MpkReady) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"dkg-mpk-ready");
    hasher.update(ready.proposer_id.as_bytes());
    hasher.update(ready.round.to_be_bytes());
    hasher.finalize().to_vec()
}

fn finalize_digest(finalize: &Finalize) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"dkg-finalize");
    hasher.update(finalize.proposer_id.as_bytes());
    hasher.update(finalize.round.to_be_bytes());
    for id in &finalize.qualify_ids {
        hasher.update(id.as_bytes());
    }
    hasher.finalize().to_vec()
}

fn partial_signature_digest(psig: &PartialSignature) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"dkg-partial-signature");
    hasher.update(psig.proposer_id.as_bytes());
    hasher.update(psig.round.to_be_bytes());
    hasher.update(psig.hash.as_bytes());
    hasher.update(&psig.partial_signature.point);
    hasher.update(psig.partial_signature.proof.challenge);
    hasher.update(psig.partial_signature.proof.response);
    hasher.finalize().to_vec()
}
