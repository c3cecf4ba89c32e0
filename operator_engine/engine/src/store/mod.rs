//! Keystore persistence backends.
//!
//! A backend enumerates every stored keystore honestly (so duplicate detection
//! means something) and applies reconciliation plans. Secrets for new keys
//! travel alongside the plan so each backend encrypts them its own way.

pub mod keystore;
pub mod local;
pub mod memory;
pub mod password;
pub mod signer;

use std::collections::HashMap;

use crate::derivation::KeyPair;
use crate::error::{EngineError, EngineResult};
use crate::reconcile::ReconciliationPlan;
use crate::types::{KeystoreRecord, PublicKey};

pub use keystore::Keystore;
pub use local::LocalKeystoreStore;
pub use memory::{
    DatabaseKeyRecord, MemoryKeystoreStore, parse_decryption_key, validators_count,
};
pub use password::generate_password;
pub use signer::{lighthouse_definitions, public_keys_for_validator, write_validator_keys};

pub trait KeystorePersistence: Send + Sync {
    /// Every stored keystore, across all containers.
    fn list_current(&self) -> EngineResult<Vec<KeystoreRecord>>;

    /// Applies `plan`; `new_keys` must cover every addition.
    fn apply(&self, plan: &ReconciliationPlan, new_keys: &[KeyPair]) -> EngineResult<()>;
}

/// Pairs each planned addition with its key material.
pub(crate) fn keys_for_additions<'a>(
    plan: &ReconciliationPlan,
    new_keys: &'a [KeyPair],
) -> EngineResult<Vec<&'a KeyPair>> {
    let by_key: HashMap<PublicKey, &KeyPair> =
        new_keys.iter().map(|pair| (pair.public_key, pair)).collect();
    plan.additions
        .iter()
        .map(|addition| {
            by_key.get(&addition.public_key).copied().ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "no key material supplied for {}",
                    addition.public_key
                ))
            })
        })
        .collect()
}
