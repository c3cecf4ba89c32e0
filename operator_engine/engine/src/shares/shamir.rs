//! Shamir secret sharing over the BLS12-381 scalar field.
//!
//! Shares are the polynomial evaluated at x = 1..=total. Private key shares
//! are never recombined here; only their public keys are, which works because
//! sk -> sk·G1 is a group homomorphism.

use std::collections::BTreeMap;

use bls12_381::{G1Affine, G1Projective, Scalar};
use ff::Field;
use group::Curve;
use num_bigint::BigUint;
use rand_core::{CryptoRng, RngCore};

use crate::error::{EngineError, EngineResult};
use crate::types::PublicKey;

/// Splits `secret` into `total` shares, any `threshold` of which determine it.
pub fn split<R: RngCore + CryptoRng>(
    secret: &Scalar,
    total: usize,
    threshold: usize,
    rng: &mut R,
) -> EngineResult<Vec<Scalar>> {
    if threshold < 2 {
        return Err(EngineError::InvalidShareParameters(format!(
            "invalid shares threshold: {threshold}"
        )));
    }
    if total < 2 {
        return Err(EngineError::InvalidShareParameters(format!(
            "invalid total shares: {total}"
        )));
    }
    if threshold > total {
        return Err(EngineError::InvalidShareParameters(format!(
            "threshold {threshold} exceeds total shares {total}"
        )));
    }

    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(*secret);
    coefficients.extend((1..threshold).map(|_| Scalar::random(&mut *rng)));

    Ok((1..=total as u64)
        .map(|x| evaluate(&coefficients, &Scalar::from(x)))
        .collect())
}

/// Horner evaluation.
fn evaluate(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

/// Lagrange coefficients at zero for evaluation points `xs`, in input order.
///
/// λ_i = Π_{j≠i} x_j / (x_j − x_i), computed with a single inversion.
pub fn lagrange_coefficients(xs: &[u64]) -> EngineResult<Vec<Scalar>> {
    if xs.is_empty() {
        return Err(EngineError::InvalidInput("no shares to combine".into()));
    }
    if xs.contains(&0) {
        return Err(EngineError::InvalidInput("share index 0 is reserved for the secret".into()));
    }
    let mut sorted = xs.to_vec();
    sorted.sort_unstable();
    if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(EngineError::InvalidInput(format!("duplicate share index {}", pair[0])));
    }

    let points: Vec<Scalar> = xs.iter().map(|x| Scalar::from(*x)).collect();
    let k = points.len();

    let mut numerators = vec![Scalar::ONE; k];
    let mut denominators = vec![Scalar::ONE; k];
    for i in 0..k {
        for j in 0..k {
            if i != j {
                numerators[i] *= points[j];
                denominators[i] *= points[j] - points[i];
            }
        }
    }

    // batch inversion: prefix products, one invert, walk back
    let mut prefix = Vec::with_capacity(k);
    let mut running = Scalar::ONE;
    for d in &denominators {
        prefix.push(running);
        running *= d;
    }
    let mut inverse: Scalar = Option::from(running.invert())
        .ok_or_else(|| EngineError::CryptoError("lagrange denominator is zero".into()))?;

    let mut coefficients = vec![Scalar::ZERO; k];
    for i in (0..k).rev() {
        coefficients[i] = numerators[i] * inverse * prefix[i];
        inverse *= denominators[i];
    }
    Ok(coefficients)
}

fn decode_point(key: &PublicKey) -> EngineResult<G1Projective> {
    Option::<G1Affine>::from(G1Affine::from_compressed(key.as_bytes()))
        .map(G1Projective::from)
        .ok_or_else(|| EngineError::InvalidInput(format!("public key {key} is not a G1 point")))
}

pub fn public_key_of_scalar(scalar: &Scalar) -> PublicKey {
    PublicKey((G1Projective::generator() * scalar).to_affine().to_compressed())
}

/// Combines public key shares keyed by evaluation point into the public key of the secret.
pub fn reconstruct_public_key(shares: &BTreeMap<u64, PublicKey>) -> EngineResult<PublicKey> {
    let xs: Vec<u64> = shares.keys().copied().collect();
    let coefficients = lagrange_coefficients(&xs)?;

    let mut acc = G1Projective::identity();
    for (key, coefficient) in shares.values().zip(coefficients.iter()) {
        acc += decode_point(key)? * coefficient;
    }
    Ok(PublicKey(acc.to_affine().to_compressed()))
}

/// Decimal rendering used inside committee share files.
pub fn scalar_to_decimal(scalar: &Scalar) -> String {
    BigUint::from_bytes_le(&scalar.to_bytes()).to_string()
}

pub fn scalar_from_decimal(text: &str) -> EngineResult<Scalar> {
    let value: BigUint = text
        .trim()
        .parse()
        .map_err(|_| EngineError::InvalidInput(format!("'{text}' is not a decimal scalar")))?;
    let bytes = value.to_bytes_le();
    if bytes.len() > 32 {
        return Err(EngineError::InvalidInput("scalar exceeds 32 bytes".into()));
    }
    let mut le = [0u8; 32];
    le[..bytes.len()].copy_from_slice(&bytes);
    Option::from(Scalar::from_bytes(&le))
        .ok_or_else(|| EngineError::InvalidInput("scalar is not below the field modulus".into()))
}
