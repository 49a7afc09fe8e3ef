//! Threshold signature shares and recovery

use super::{
    decode_point, encode_point, lagrange_coefficient, scalar_from_bytes, scalar_to_bytes, DkgId,
};
use crate::types::{DleqProof, Hash, PointBytes, SignatureShare};
use crate::{Error, Result};
use digest::Digest;
use elliptic_curve::point::DecompressPoint;
use hmac::{Hmac, Mac};
use k256::{AffinePoint, ProjectivePoint, Scalar};
use merlin::Transcript;
use sha2::Sha256;
use subtle::Choice;

const HASH_TO_POINT_DST: &[u8] = b"cfgchain-tsig-hash-to-point-v1";

/// Map a message hash to a curve point by try-and-increment
pub fn hash_to_point(hash: &Hash) -> ProjectivePoint {
    let mut counter: u32 = 0;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(HASH_TO_POINT_DST);
        hasher.update(hash.as_bytes());
        hasher.update(counter.to_be_bytes());
        let x = hasher.finalize();

        let candidate = AffinePoint::decompress(&x, Choice::from(0));
        if let Some(point) = Option::<AffinePoint>::from(candidate) {
            return ProjectivePoint::from(point);
        }
        counter = counter.wrapping_add(1);
    }
}

/// Sign `hash` with a DKG signing key.
///
/// The proof nonce is derived from the key and the hash, so the same inputs
/// always produce the same bytes.
pub fn sign_share(secret: &[u8; 32], hash: &Hash) -> Result<SignatureShare> {
    let x = scalar_from_bytes(secret);
    let h = hash_to_point(hash);
    let public = ProjectivePoint::GENERATOR * x;
    let sigma = h * x;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(b"cfgchain-tsig-nonce");
    mac.update(hash.as_bytes());
    let nonce_bytes = mac.finalize().into_bytes();
    let r = scalar_from_bytes(&nonce_bytes.into());

    let r1 = ProjectivePoint::GENERATOR * r;
    let r2 = h * r;
    let c = challenge(&public, &h, &sigma, &r1, &r2);
    let s = r - c * x;

    Ok(SignatureShare {
        point: encode_point(&sigma),
        proof: DleqProof {
            challenge: scalar_to_bytes(&c),
            response: scalar_to_bytes(&s),
        },
    })
}

/// Verify a share against the signer's public share `x_i * G`
pub fn verify_share(public_share: &[u8], hash: &Hash, share: &SignatureShare) -> Result<bool> {
    let public = decode_point(public_share)?;
    let sigma = decode_point(&share.point)?;
    let h = hash_to_point(hash);
    let c = scalar_from_bytes(&share.proof.challenge);
    let s = scalar_from_bytes(&share.proof.response);

    let r1 = ProjectivePoint::GENERATOR * s + public * c;
    let r2 = h * s + sigma * c;

    Ok(challenge(&public, &h, &sigma, &r1, &r2) == c)
}

/// Recover the group signature from at least `k+1` verified shares
pub fn recover_signature(shares: &[(DkgId, SignatureShare)]) -> Result<PointBytes> {
    if shares.is_empty() {
        return Err(Error::Crypto("no signature shares".into()));
    }
    let ids: Vec<DkgId> = shares.iter().map(|(id, _)| *id).collect();

    let mut signature = ProjectivePoint::IDENTITY;
    for (id, share) in shares {
        let sigma = decode_point(&share.point)?;
        signature += sigma * lagrange_coefficient(id, &ids)?;
    }

    Ok(encode_point(&signature))
}

fn challenge(
    public: &ProjectivePoint,
    h: &ProjectivePoint,
    sigma: &ProjectivePoint,
    r1: &ProjectivePoint,
    r2: &ProjectivePoint,
) -> Scalar {
    let mut transcript = Transcript::new(b"cfgchain-tsig-dleq");
    transcript.append_message(b"public", &encode_point(public));
    transcript.append_message(b"h", &encode_point(h));
    transcript.append_message(b"sigma", &encode_point(sigma));
    transcript.append_message(b"r1", &encode_point(r1));
    transcript.append_message(b"r2", &encode_point(r2));

    let mut bytes = [0u8; 32];
    transcript.challenge_bytes(b"challenge", &mut bytes);
    scalar_from_bytes(&bytes)
}
