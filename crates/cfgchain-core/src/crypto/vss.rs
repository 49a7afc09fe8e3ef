//! Feldman verifiable secret sharing

use super::{decode_point, encode_point, scalar_from_bytes, scalar_to_bytes, DkgId};
use crate::types::PointBytes;
use crate::{Error, Result};
use elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use zeroize::Zeroize;

/// Secret polynomial of degree `k`
pub struct SecretPolynomial {
    coefficients: Vec<Scalar>,
}

impl SecretPolynomial {
    /// Generate a random polynomial of degree `threshold`
    pub fn generate(threshold: usize) -> Self {
        let mut rng = OsRng;
        let coefficients = (0..=threshold).map(|_| Scalar::random(&mut rng)).collect();
        Self { coefficients }
    }

    pub fn threshold(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// Feldman commitments `a_i * G`
    pub fn commitments(&self) -> Vec<PointBytes> {
        self.coefficients
            .iter()
            .map(|coef| encode_point(&(ProjectivePoint::GENERATOR * coef)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn share_at_zero(&self) -> [u8; 32] {
        scalar_to_bytes(&self.coefficients[0])
    }

    /// Share for the node at `id`
    pub fn share(&self, id: &DkgId) -> [u8; 32] {
        scalar_to_bytes(&evaluate_polynomial(&self.coefficients, id.scalar()))
    }
}

impl Drop for SecretPolynomial {
    fn drop(&mut self) {
        for coef in self.coefficients.iter_mut() {
            coef.zeroize();
        }
    }
}

/// Evaluate a polynomial with Horner's method
fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coef| acc * x + coef)
}

/// Evaluate committed polynomial `Σ C_i * x^i` in the exponent
fn evaluate_commitments(commitments: &[ProjectivePoint], x: &Scalar) -> ProjectivePoint {
    commitments
        .iter()
        .rev()
        .fold(ProjectivePoint::IDENTITY, |acc, c| acc * x + c)
}

/// Decode a master public key's commitments
pub fn decode_commitments(commitments: &[PointBytes]) -> Result<Vec<ProjectivePoint>> {
    if commitments.is_empty() {
        return Err(Error::Crypto("empty commitments".into()));
    }
    commitments.iter().map(|c| decode_point(c)).collect()
}

/// Check `share * G == Σ C_i * id^i`
pub fn verify_share(share: &[u8; 32], id: &DkgId, commitments: &[ProjectivePoint]) -> bool {
    let expected = ProjectivePoint::GENERATOR * scalar_from_bytes(share);
    expected == evaluate_commitments(commitments, id.scalar())
}

/// Public share of the node at `id` over the qualified commitments
pub fn public_share(id: &DkgId, qualified: &[Vec<ProjectivePoint>]) -> PointBytes {
    let point = qualified
        .iter()
        .map(|commitments| evaluate_commitments(commitments, id.scalar()))
        .fold(ProjectivePoint::IDENTITY, |acc, p| acc + p);
    encode_point(&point)
}

/// Group public key `Σ C_0` over the qualified commitments
pub fn group_public_key(qualified: &[Vec<ProjectivePoint>]) -> PointBytes {
    let point = qualified
        .iter()
        .filter_map(|commitments| commitments.first())
        .fold(ProjectivePoint::IDENTITY, |acc, p| acc + p);
    encode_point(&point)
}

/// Sum the shares received from qualified proposers into a signing key
pub fn combine_shares<'a>(shares: impl IntoIterator<Item = &'a [u8; 32]>) -> [u8; 32] {
    let mut secret = shares
        .into_iter()
        .fold(Scalar::ZERO, |acc, share| acc + scalar_from_bytes(share));
    let bytes = scalar_to_bytes(&secret);
    secret.zeroize();
    bytes
}

/// Public key of a combined signing key
pub fn public_key_of(secret: &[u8; 32]) -> PointBytes {
    encode_point(&(ProjectivePoint::GENERATOR * scalar_from_bytes(secret)))
}
