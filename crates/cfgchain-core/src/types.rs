//! Core types for the configuration chain

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// DKG epoch identifier
pub type Round = u64;

/// Compressed secp256k1 point bytes
pub type PointBytes = Vec<u8>;

/// Stable identity of a node, BLAKE3 of its ed25519 verifying key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Derive the node ID from an ed25519 verifying key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// 32-byte hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Keccak-256 of `data`
    pub fn keccak256(data: &[u8]) -> Self {
        let mut keccak = Keccak::v256();
        let mut output = [0u8; 32];
        keccak.update(data);
        keccak.finalize(&mut output);
        Self(output)
    }

    /// Random hash, used by tests and demos
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(&self.0[..6]))
    }
}

/// Configured node set of a round
pub type NodeSet = BTreeSet<NodeId>;

/// Outer signature of a protocol message.
///
/// Carries the signer's ed25519 verifying key; the sender is authentic when
/// the key hashes to the claimed proposer ID and the signature verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature {
    /// ed25519 verifying key
    pub public_key: [u8; 32],
    /// ed25519 signature bytes
    pub signature: Vec<u8>,
}

/// Feldman commitments to a node's degree-`k` secret polynomial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterPublicKey {
    pub proposer_id: NodeId,
    pub round: Round,
    /// `k+1` compressed points `a_i * G`
    pub commitments: Vec<PointBytes>,
    pub signature: Option<MessageSignature>,
}

impl MasterPublicKey {
    /// Degree of the committed polynomial
    pub fn threshold(&self) -> usize {
        self.commitments.len().saturating_sub(1)
    }
}

/// Evaluation of the proposer's polynomial at the receiver's coordinate
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateShare {
    pub proposer_id: NodeId,
    pub receiver_id: NodeId,
    pub round: Round,
    pub share: [u8; 32],
    pub signature: Option<MessageSignature>,
}

impl fmt::Debug for PrivateShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateShare")
            .field("proposer_id", &self.proposer_id)
            .field("receiver_id", &self.receiver_id)
            .field("round", &self.round)
            .finish_non_exhaustive()
    }
}

/// Accusation against `accused`.
///
/// Without evidence it is a NACK: no valid share arrived before the deadline.
/// With evidence it carries a share signed by `accused` that fails
/// verification against its master public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complaint {
    pub proposer_id: NodeId,
    pub round: Round,
    pub accused: NodeId,
    pub evidence: Option<PrivateShare>,
    pub signature: Option<MessageSignature>,
}

/// Public reveal of `private_share` answering a NACK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiNackComplaint {
    /// Node publishing the reveal
    pub proposer_id: NodeId,
    pub round: Round,
    pub private_share: PrivateShare,
    pub signature: Option<MessageSignature>,
}

/// Signal that the proposer considers MPK collection complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpkReady {
    pub proposer_id: NodeId,
    pub round: Round,
    pub signature: Option<MessageSignature>,
}

/// Signal that the proposer resolved its complaints and qualified the round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    pub proposer_id: NodeId,
    pub round: Round,
    /// Qualified node IDs computed by the proposer
    pub qualify_ids: BTreeSet<NodeId>,
    pub signature: Option<MessageSignature>,
}

/// Chaum-Pedersen proof that a signature share uses the signer's secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DleqProof {
    pub challenge: [u8; 32],
    pub response: [u8; 32],
}

/// `x_i * H(hash)` together with its proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    pub point: PointBytes,
    pub proof: DleqProof,
}

/// Signature share over (round, hash) produced with the node's DKG key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub proposer_id: NodeId,
    pub round: Round,
    pub hash: Hash,
    pub partial_signature: SignatureShare,
    pub signature: Option<MessageSignature>,
}

/// Group signature recovered from `k+1` partial signatures
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThresholdSignature {
    pub round: Round,
    pub hash: Hash,
    pub point: PointBytes,
}

impl ThresholdSignature {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.point)
    }
}

/// Node's share of the round's group secret
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct DkgPrivateKey {
    bytes: [u8; 32],
}

impl DkgPrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl fmt::Debug for DkgPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DkgPrivateKey(..)")
    }
}

/// Public share of one qualified node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicShare {
    /// Evaluation coordinate (scalar bytes)
    pub dkg_id: [u8; 32],
    /// `x_i * G`
    pub point: PointBytes,
}

/// Verification material of a completed round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePublicKeys {
    pub round: Round,
    pub threshold: usize,
    pub qualify_node_ids: BTreeSet<NodeId>,
    pub group_public_key: PointBytes,
    pub public_shares: BTreeMap<NodeId, PublicShare>,
}

impl NodePublicKeys {
    pub fn is_qualified(&self, node: &NodeId) -> bool {
        self.qualify_node_ids.contains(node)
    }
}

/// Position of a block in its chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub height: u64,
}

/// Block as stored by the database collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub proposer_id: NodeId,
    pub parent_hash: Hash,
    pub hash: Hash,
    pub position: Position,
    pub acks: Vec<Hash>,
}
