//! Batch verification of a published deposit data file.

use std::collections::HashSet;

use rayon::prelude::*;
use tracing::{info, warn};

use super::merkle::{MerkleTree, deposit_leaf, verify_proof};
use super::verify_deposit;
use crate::error::{EngineError, EngineResult};
use crate::types::{Bytes4, Bytes32, Gwei, MerkleDepositData, PublicKey};

/// Outcome of a successful batch verification.
#[derive(Debug, Clone)]
pub struct DepositDatumReport {
    pub merkle_root: Bytes32,
    pub public_keys: Vec<PublicKey>,
}

/// Verifies every entry, rebuilds the Merkle tree and compares it to the
/// stored proofs. Fails on the first offending entry in file order.
pub fn verify_deposit_datum(
    datum: &[MerkleDepositData],
    withdrawal_credentials: &Bytes32,
    amount_gwei: Gwei,
    fork_version: &Bytes4,
    expected_root: Option<&Bytes32>,
    expected_count: Option<usize>,
) -> EngineResult<DepositDatumReport> {
    if datum.is_empty() {
        return Err(EngineError::InvalidInput("deposit data is empty".into()));
    }
    if let Some(count) = expected_count {
        if datum.len() != count {
            return Err(EngineError::InvalidInput(format!(
                "expected {count} deposit data entries, found {}",
                datum.len()
            )));
        }
    }

    let mut seen = HashSet::with_capacity(datum.len());
    for entry in datum {
        if !seen.insert(entry.public_key) {
            return Err(EngineError::InvalidInput(format!(
                "public key {} is repeated in deposit data",
                entry.public_key
            )));
        }
    }

    let first_failure = datum
        .par_iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            check_entry(entry, withdrawal_credentials, amount_gwei, fork_version)
                .err()
                .map(|err| (i, err))
        })
        .min_by_key(|(i, _)| *i);
    if let Some((i, err)) = first_failure {
        warn!(index = i, error = %err, "deposit data entry failed verification");
        return Err(err);
    }

    let leaves: Vec<Bytes32> = datum
        .iter()
        .map(|entry| {
            deposit_leaf(
                &entry.public_key,
                &entry.withdrawal_credentials,
                &entry.signature,
                &entry.deposit_data_root,
            )
        })
        .collect();
    let tree = MerkleTree::new(leaves.clone())?;
    let root = tree.root();

    for (i, entry) in datum.iter().enumerate() {
        if entry.proof != tree.proof(i)? || !verify_proof(&root, &leaves[i], &entry.proof) {
            return Err(EngineError::InvalidInput(format!(
                "merkle proof mismatch for public key {}",
                entry.public_key
            )));
        }
    }

    if let Some(expected) = expected_root {
        if *expected != root {
            return Err(EngineError::InvalidInput(format!(
                "merkle root {root} does not match expected {expected}"
            )));
        }
    }

    info!(count = datum.len(), merkle_root = %root, "deposit data verified");
    Ok(DepositDatumReport {
        merkle_root: root,
        public_keys: datum.iter().map(|entry| entry.public_key).collect(),
    })
}

fn check_entry(
    entry: &MerkleDepositData,
    withdrawal_credentials: &Bytes32,
    amount_gwei: Gwei,
    fork_version: &Bytes4,
) -> EngineResult<()> {
    if entry.withdrawal_credentials != *withdrawal_credentials {
        return Err(EngineError::InvalidInput(format!(
            "public key {} has withdrawal credentials {}, expected {}",
            entry.public_key, entry.withdrawal_credentials, withdrawal_credentials
        )));
    }
    if entry.amount_gwei()? != amount_gwei {
        return Err(EngineError::InvalidInput(format!(
            "public key {} has amount {} wei, expected {} gwei",
            entry.public_key, entry.amount, amount_gwei
        )));
    }
    verify_deposit(
        &entry.signature,
        &entry.public_key,
        withdrawal_credentials,
        amount_gwei,
        &entry.deposit_data_root,
        fork_version,
    )
}
