//! Keccak Merkle tree over deposit data entries.
//!
//! Leaves stay in caller order; the leaf position is the proof index.
//! Pairs are hashed as `keccak256(min(a, b) || max(a, b))`, so proofs
//! carry no direction bits and verify against OpenZeppelin's
//! `MerkleProof.verify`. An unpaired last node at any level is promoted to
//! the next level unchanged and contributes no sibling to proofs.

use alloy_primitives::{B256, Bytes, keccak256};
use alloy_sol_types::SolValue;

use crate::error::{EngineError, EngineResult};
use crate::types::{Bytes32, PublicKey, SignatureBytes};

fn hash_sorted_pair(a: &Bytes32, b: &Bytes32) -> Bytes32 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&low.0);
    buf[32..].copy_from_slice(&high.0);
    Bytes32(keccak256(buf).0)
}

/// `keccak256(abi.encode(bytes public_key, bytes32 wc, bytes signature, bytes32 root))`
pub fn deposit_leaf(
    public_key: &PublicKey,
    withdrawal_credentials: &Bytes32,
    signature: &SignatureBytes,
    deposit_data_root: &Bytes32,
) -> Bytes32 {
    let encoded = (
        Bytes::copy_from_slice(&public_key.0),
        B256::new(withdrawal_credentials.0),
        Bytes::copy_from_slice(&signature.0),
        B256::new(deposit_data_root.0),
    )
        .abi_encode_params();
    Bytes32(keccak256(encoded).0)
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    layers: Vec<Vec<Bytes32>>,
}

impl MerkleTree {
    pub fn new(leaves: Vec<Bytes32>) -> EngineResult<Self> {
        if leaves.is_empty() {
            return Err(EngineError::InvalidInput(
                "merkle tree needs at least one leaf".into(),
            ));
        }

        let mut layers = vec![leaves];
        while let Some(top) = layers.last().filter(|layer| layer.len() > 1) {
            let next = top
                .chunks(2)
                .map(|pair| match pair.get(1) {
                    Some(right) => hash_sorted_pair(&pair[0], right),
                    None => pair[0],
                })
                .collect();
            layers.push(next);
        }
        Ok(Self { layers })
    }

    pub fn leaves(&self) -> &[Bytes32] {
        &self.layers[0]
    }

    pub fn root(&self) -> Bytes32 {
        self.layers
            .last()
            .and_then(|layer| layer.first())
            .copied()
            .unwrap_or(Bytes32([0u8; 32]))
    }

    /// Sibling hashes from leaf to root.
    pub fn proof(&self, leaf_index: usize) -> EngineResult<Vec<Bytes32>> {
        if leaf_index >= self.leaves().len() {
            return Err(EngineError::InvalidInput(format!(
                "leaf index {leaf_index} out of range for {} leaves",
                self.leaves().len()
            )));
        }

        let mut proof = Vec::new();
        let mut index = leaf_index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling = index ^ 1;
            if sibling < layer.len() {
                proof.push(layer[sibling]);
            }
            index /= 2;
        }
        Ok(proof)
    }
}

pub fn verify_proof(root: &Bytes32, leaf: &Bytes32, proof: &[Bytes32]) -> bool {
    let computed = proof
        .iter()
        .fold(*leaf, |node, sibling| hash_sorted_pair(&node, sibling));
    computed == *root
}
