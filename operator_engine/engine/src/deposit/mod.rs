//! Deposit data signing, verification and Merkle publication.

pub mod merkle;
pub mod ssz;
pub mod verify;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::bls::{self, SecretKey};
use crate::derivation::KeyPair;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    Bytes4, Bytes32, Gwei, MerkleDepositData, PublicKey, SignatureBytes, WEI_PER_GWEI,
};

pub use merkle::{MerkleTree, deposit_leaf, verify_proof};
pub use ssz::{DepositData, DepositMessage, compute_deposit_domain, compute_signing_root};
pub use verify::{DepositDatumReport, verify_deposit_datum};

fn signing_root_of(
    public_key: &PublicKey,
    withdrawal_credentials: &Bytes32,
    amount: Gwei,
    fork_version: &Bytes4,
) -> Bytes32 {
    let message = DepositMessage {
        public_key: *public_key,
        withdrawal_credentials: *withdrawal_credentials,
        amount,
    };
    compute_signing_root(&message.hash_tree_root(), &compute_deposit_domain(fork_version))
}

fn data_root_of(
    public_key: &PublicKey,
    withdrawal_credentials: &Bytes32,
    amount: Gwei,
    signature: &SignatureBytes,
) -> Bytes32 {
    DepositData {
        public_key: *public_key,
        withdrawal_credentials: *withdrawal_credentials,
        amount,
        signature: *signature,
    }
    .hash_tree_root()
}

/// Signs a deposit message. Returns the signature and the deposit data root.
pub fn sign_deposit(
    private_key: &SecretKey,
    public_key: &PublicKey,
    withdrawal_credentials: &Bytes32,
    amount: Gwei,
    fork_version: &Bytes4,
) -> EngineResult<(SignatureBytes, Bytes32)> {
    if private_key.public_key() != *public_key {
        return Err(EngineError::InvalidInput(format!(
            "public key {public_key} does not belong to the signing key"
        )));
    }
    let signing_root = signing_root_of(public_key, withdrawal_credentials, amount, fork_version);
    let signature = private_key.sign(&signing_root.0);
    let root = data_root_of(public_key, withdrawal_credentials, amount, &signature);
    Ok((signature, root))
}

/// Signing root and deposit data root for an already signed deposit.
pub fn deposit_data_roots(
    public_key: &PublicKey,
    withdrawal_credentials: &Bytes32,
    signature: &SignatureBytes,
    amount: Gwei,
    fork_version: &Bytes4,
) -> (Bytes32, Bytes32) {
    (
        signing_root_of(public_key, withdrawal_credentials, amount, fork_version),
        data_root_of(public_key, withdrawal_credentials, amount, signature),
    )
}

/// Checks the signature first, then the data root.
pub fn verify_deposit(
    signature: &SignatureBytes,
    public_key: &PublicKey,
    withdrawal_credentials: &Bytes32,
    amount: Gwei,
    expected_root: &Bytes32,
    fork_version: &Bytes4,
) -> EngineResult<()> {
    let (signing_root, data_root) =
        deposit_data_roots(public_key, withdrawal_credentials, signature, amount, fork_version);
    if !bls::verify(public_key, &signing_root.0, signature) {
        return Err(EngineError::InvalidSignature {
            public_key: public_key.to_hex(),
        });
    }
    if data_root != *expected_root {
        return Err(EngineError::RootMismatch {
            public_key: public_key.to_hex(),
        });
    }
    Ok(())
}

pub fn is_valid_deposit(
    signature: &SignatureBytes,
    public_key: &PublicKey,
    withdrawal_credentials: &Bytes32,
    amount: Gwei,
    expected_root: &Bytes32,
    fork_version: &Bytes4,
) -> bool {
    verify_deposit(
        signature,
        public_key,
        withdrawal_credentials,
        amount,
        expected_root,
        fork_version,
    )
    .is_ok()
}

/// Signs every keypair in parallel and attaches Merkle proofs.
///
/// Entries keep the order of `keypairs`; that order is the proof index basis.
pub fn generate_merkle_deposit_datum(
    keypairs: &[KeyPair],
    withdrawal_credentials: &Bytes32,
    amount_gwei: Gwei,
    fork_version: &Bytes4,
) -> EngineResult<(Bytes32, Vec<MerkleDepositData>)> {
    info!(count = keypairs.len(), "signing deposit data");

    let signed = keypairs
        .par_iter()
        .map(|pair| -> EngineResult<_> {
            let (signature, root) = sign_deposit(
                &pair.private_key,
                &pair.public_key,
                withdrawal_credentials,
                amount_gwei,
                fork_version,
            )?;
            let leaf = deposit_leaf(&pair.public_key, withdrawal_credentials, &signature, &root);
            Ok((pair.public_key, signature, root, leaf))
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let tree = MerkleTree::new(signed.iter().map(|entry| entry.3).collect())?;
    let amount = (u128::from(amount_gwei) * WEI_PER_GWEI).to_string();

    let datum = signed
        .into_iter()
        .enumerate()
        .map(|(i, (public_key, signature, root, _))| -> EngineResult<_> {
            Ok(MerkleDepositData {
                public_key,
                signature,
                amount: amount.clone(),
                withdrawal_credentials: *withdrawal_credentials,
                deposit_data_root: root,
                proof: tree.proof(i)?,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    debug!(root = %tree.root(), "deposit data merkle root");
    Ok((tree.root(), datum))
}
