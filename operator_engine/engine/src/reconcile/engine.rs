use std::collections::HashSet;

use tracing::{info, info_span};

use super::cache::RunCache;
use super::desired::{DEFAULT_BATCH_SIZE, DesiredStateBuilder};
use super::plan::{CurrentState, ReconciliationPlan, check_binding_with, reconcile_with_limit};
use crate::collaborators::{RegistrationStatusProvider, ValidatorStatusProvider};
use crate::derivation::{KeyPair, Mnemonic};
use crate::error::{EngineError, EngineResult};
use crate::store::KeystorePersistence;
use crate::types::{MerkleDepositData, PublicKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub legacy: bool,
    pub capacity: usize,
    pub batch_size: usize,
    pub max_containers: Option<usize>,
    pub walk_limit: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            legacy: false,
            capacity: 100,
            batch_size: DEFAULT_BATCH_SIZE,
            max_containers: None,
            walk_limit: u32::MAX,
        }
    }
}

pub struct Collaborators<'a> {
    pub registrations: &'a dyn RegistrationStatusProvider,
    pub statuses: &'a dyn ValidatorStatusProvider,
}

/// A computed plan plus the key material its additions need.
#[derive(Debug)]
pub struct RunOutcome {
    pub plan: ReconciliationPlan,
    pub new_keys: Vec<KeyPair>,
    /// Derivation index the mnemonic was checked against, if anything was stored.
    pub checked_index: Option<u32>,
    pub desired_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    settings: ReconcileSettings,
}

impl ReconciliationEngine {
    pub fn new(settings: ReconcileSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Lists the store, checks the mnemonic, walks the desired keys and
    /// computes the plan. Nothing is written; see [`Self::apply`].
    pub fn run(
        &self,
        mnemonic: &Mnemonic,
        persistence: &dyn KeystorePersistence,
        collaborators: &Collaborators<'_>,
        deposit_datum: &[MerkleDepositData],
    ) -> EngineResult<RunOutcome> {
        let span = info_span!("reconcile", legacy = self.settings.legacy);
        let _enter = span.enter();

        let current = CurrentState::from_records(persistence.list_current()?)?;
        info!(stored = current.len(), "current state listed");

        let mut cache = RunCache::from_mnemonic(mnemonic, self.settings.legacy)?;
        let checked_index = check_binding_with(&current, &mut cache)?;

        let deposit_keys = deposit_public_keys(deposit_datum)?;
        let desired = DesiredStateBuilder::new(collaborators.registrations, collaborators.statuses)
            .batch_size(self.settings.batch_size)
            .walk_limit(self.settings.walk_limit)
            .build(&mut cache, &current, &deposit_keys)?;

        let plan = reconcile_with_limit(
            &current,
            &desired.keys,
            &desired.exited,
            self.settings.capacity,
            self.settings.max_containers,
        )?;
        let added: Vec<PublicKey> = plan.additions.iter().map(|a| a.public_key).collect();
        let new_keys = cache.keypairs_for(&added)?;

        Ok(RunOutcome {
            plan,
            new_keys,
            checked_index,
            desired_count: desired.keys.len(),
        })
    }

    pub fn apply(
        &self,
        persistence: &dyn KeystorePersistence,
        outcome: &RunOutcome,
    ) -> EngineResult<()> {
        if outcome.plan.is_empty() {
            info!("store already up to date");
            return Ok(());
        }
        persistence.apply(&outcome.plan, &outcome.new_keys)
    }
}

/// Public keys of a deposit data file, refusing repeats.
pub fn deposit_public_keys(datum: &[MerkleDepositData]) -> EngineResult<HashSet<PublicKey>> {
    let mut keys = HashSet::with_capacity(datum.len());
    for entry in datum {
        if !keys.insert(entry.public_key) {
            return Err(EngineError::InvalidInput(format!(
                "public key {} is repeated in deposit data",
                entry.public_key
            )));
        }
    }
    Ok(keys)
}
