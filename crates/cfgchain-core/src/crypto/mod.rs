//! Cryptographic collaborator
//!
//! Feldman VSS over secp256k1 for key generation and a threshold signature
//! scheme where a share is `x_i * H(m)` with a Chaum-Pedersen proof binding it
//! to the public share `x_i * G`. Group signatures are recovered by Lagrange
//! interpolation in the exponent, so any `k+1` valid shares of the same
//! message yield the same bytes.

pub mod tsig;
pub mod vss;

use crate::types::{NodeId, PointBytes};
use crate::{Error, Result};
use elliptic_curve::{
    bigint::U256,
    ops::Reduce,
    sec1::{FromEncodedPoint, ToEncodedPoint},
};
use k256::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar};

/// Evaluation coordinate of a node's share
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DkgId(Scalar);

impl DkgId {
    /// Derive the coordinate from the node ID
    pub fn from_node_id(id: &NodeId) -> Result<Self> {
        let scalar = scalar_from_bytes(id.as_bytes());
        if bool::from(scalar.is_zero()) {
            return Err(Error::Crypto(format!("node {} maps to the zero coordinate", id)));
        }
        Ok(Self(scalar))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let scalar = scalar_from_bytes(bytes);
        if bool::from(scalar.is_zero()) {
            return Err(Error::Crypto("zero coordinate".into()));
        }
        Ok(Self(scalar))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        scalar_to_bytes(&self.0)
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.0
    }
}

pub(crate) fn scalar_from_bytes(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*bytes).into())
}

pub(crate) fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

pub(crate) fn encode_point(point: &ProjectivePoint) -> PointBytes {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|e| Error::Crypto(e.to_string()))?;
    let affine: AffinePoint = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::Crypto("invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Lagrange coefficient at zero for `id` over `ids`
///
/// λ_i = Π_{j≠i} x_j / (x_j - x_i)
pub(crate) fn lagrange_coefficient(id: &DkgId, ids: &[DkgId]) -> Result<Scalar> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for other in ids {
        if other == id {
            continue;
        }
        numerator *= other.0;
        denominator *= other.0 - id.0;
    }

    Option::<Scalar>::from(denominator.invert())
        .map(|inverse| numerator * inverse)
        .ok_or_else(|| Error::Crypto("duplicate coordinates in interpolation".into()))
}
