//! BLS12-381 keys and signatures for validator deposits.
//!
//! Wraps the `blst` min_pk variant (48-byte public keys, 96-byte signatures)
//! with the Ethereum proof-of-possession ciphersuite.

use blst::BLST_ERROR;
use blst::min_pk::{
    AggregatePublicKey as BlstAggPubKey, AggregateSignature as BlstAggSig,
    PublicKey as BlstPubKey, SecretKey as BlstSecKey, Signature as BlstSig,
};
use bls12_381::Scalar;
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult};
use crate::types::{PublicKey, SignatureBytes};

/// Ethereum consensus signature ciphersuite.
pub const DST_POP: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Validator secret key.
#[derive(Clone)]
pub struct SecretKey(BlstSecKey);

impl SecretKey {
    /// EIP-2333 master key from a seed of at least 32 bytes.
    pub fn derive_master(seed: &[u8]) -> EngineResult<Self> {
        BlstSecKey::derive_master_eip2333(seed)
            .map(Self)
            .map_err(|e| EngineError::CryptoError(format!("master key derivation failed: {e:?}")))
    }

    /// EIP-2333 hardened child key.
    pub fn derive_child(&self, index: u32) -> Self {
        Self(self.0.derive_child_eip2333(index))
    }

    /// Loads a big-endian scalar.
    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        BlstSecKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| EngineError::InvalidInput(format!("invalid secret key: {e:?}")))
    }

    /// Big-endian scalar bytes.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk().to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> SignatureBytes {
        SignatureBytes(self.0.sign(msg, DST_POP, &[]).to_bytes())
    }

    /// Same key as a field element for Shamir arithmetic.
    pub fn to_scalar(&self) -> EngineResult<Scalar> {
        let mut le = *self.to_bytes();
        le.reverse();
        Option::from(Scalar::from_bytes(&le))
            .ok_or_else(|| EngineError::CryptoError("secret key outside scalar field".into()))
    }

    pub fn from_scalar(scalar: &Scalar) -> EngineResult<Self> {
        let mut be = Zeroizing::new(scalar.to_bytes());
        be.reverse();
        Self::from_bytes(&be[..])
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Verifies a proof-of-possession signature. Malformed keys or signatures fail verification.
pub fn verify(public_key: &PublicKey, msg: &[u8], signature: &SignatureBytes) -> bool {
    let Ok(pk) = BlstPubKey::key_validate(public_key.as_bytes()) else {
        return false;
    };
    let Ok(sig) = BlstSig::from_bytes(signature.as_bytes()) else {
        return false;
    };
    sig.verify(true, msg, DST_POP, &[], &pk, false) == BLST_ERROR::BLST_SUCCESS
}

/// Sum of public keys as G1 points.
pub fn aggregate_public_keys(keys: &[PublicKey]) -> EngineResult<PublicKey> {
    let parsed = keys
        .iter()
        .map(|key| {
            BlstPubKey::from_bytes(key.as_bytes())
                .map_err(|e| EngineError::InvalidInput(format!("public key {key}: {e:?}")))
        })
        .collect::<EngineResult<Vec<_>>>()?;
    let refs: Vec<&BlstPubKey> = parsed.iter().collect();
    let aggregate = BlstAggPubKey::aggregate(&refs, true)
        .map_err(|e| EngineError::CryptoError(format!("aggregation failed: {e:?}")))?;
    Ok(PublicKey(aggregate.to_public_key().to_bytes()))
}

pub fn aggregate_signatures(signatures: &[SignatureBytes]) -> EngineResult<SignatureBytes> {
    let parsed = signatures
        .iter()
        .map(|signature| {
            BlstSig::from_bytes(signature.as_bytes())
                .map_err(|e| EngineError::InvalidInput(format!("signature {signature}: {e:?}")))
        })
        .collect::<EngineResult<Vec<_>>>()?;
    let refs: Vec<&BlstSig> = parsed.iter().collect();
    let aggregate = BlstAggSig::aggregate(&refs, true)
        .map_err(|e| EngineError::CryptoError(format!("signature aggregation failed: {e:?}")))?;
    Ok(SignatureBytes(aggregate.to_signature().to_bytes()))
}

/// Aggregate signature of every key over the same message.
pub fn fast_aggregate_verify(
    public_keys: &[PublicKey],
    msg: &[u8],
    signature: &SignatureBytes,
) -> bool {
    if public_keys.is_empty() {
        return false;
    }
    let Ok(parsed) = public_keys
        .iter()
        .map(|key| BlstPubKey::key_validate(key.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
    else {
        return false;
    };
    let Ok(sig) = BlstSig::from_bytes(signature.as_bytes()) else {
        return false;
    };
    let refs: Vec<&BlstPubKey> = parsed.iter().collect();
    sig.fast_aggregate_verify(true, msg, DST_POP, &refs) == BLST_ERROR::BLST_SUCCESS
}
