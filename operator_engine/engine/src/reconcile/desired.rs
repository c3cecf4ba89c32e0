//! Walks the derivation sequence to find which keys should be served.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::collaborators::{RegistrationStatusProvider, ValidatorStatusProvider};
use crate::error::{EngineError, EngineResult};
use crate::reconcile::cache::RunCache;
use crate::reconcile::plan::CurrentState;
use crate::types::PublicKey;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Keys to serve in derivation order, plus the ones the beacon chain reports exited.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub keys: Vec<PublicKey>,
    pub indexes: Vec<u32>,
    pub exited: HashSet<PublicKey>,
}

pub struct DesiredStateBuilder<'a> {
    registrations: &'a dyn RegistrationStatusProvider,
    statuses: &'a dyn ValidatorStatusProvider,
    batch_size: usize,
    walk_limit: u32,
}

impl<'a> DesiredStateBuilder<'a> {
    pub fn new(
        registrations: &'a dyn RegistrationStatusProvider,
        statuses: &'a dyn ValidatorStatusProvider,
    ) -> Self {
        Self {
            registrations,
            statuses,
            batch_size: DEFAULT_BATCH_SIZE,
            walk_limit: u32::MAX,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Highest index (exclusive) the walk may reach before giving up.
    pub fn walk_limit(mut self, walk_limit: u32) -> Self {
        self.walk_limit = walk_limit;
        self
    }

    /// From index 0, keeps every key that is stored, published in deposit
    /// data or registered; stops at the first key that is none of these.
    pub fn build(
        &self,
        cache: &mut RunCache,
        current: &CurrentState,
        deposit_keys: &HashSet<PublicKey>,
    ) -> EngineResult<DesiredState> {
        if self.batch_size == 0 {
            return Err(EngineError::InvalidInput("batch size must be positive".into()));
        }
        let step = u32::try_from(self.batch_size).unwrap_or(u32::MAX);

        let mut desired = DesiredState::default();
        let mut next = 0u32;
        'walk: loop {
            if next >= self.walk_limit {
                return Err(EngineError::InvalidInput(format!(
                    "derivation walk reached index {next} without finding an unused key"
                )));
            }
            let end = next.saturating_add(step).min(self.walk_limit);
            cache.prefetch(next..end);

            let batch: Vec<(u32, PublicKey)> =
                (next..end).map(|i| (i, cache.public_key(i))).collect();
            let unknown: Vec<PublicKey> = batch
                .iter()
                .map(|(_, key)| *key)
                .filter(|key| !current.contains(key) && !deposit_keys.contains(key))
                .collect();
            let registered = if unknown.is_empty() {
                HashSet::new()
            } else {
                self.registrations.registered_subset(&unknown)?
            };

            for (index, key) in batch {
                if current.contains(&key)
                    || deposit_keys.contains(&key)
                    || registered.contains(&key)
                {
                    desired.keys.push(key);
                    desired.indexes.push(index);
                } else {
                    debug!(index, "derivation walk stopped");
                    break 'walk;
                }
            }
            next = end;
        }

        let found: HashSet<&PublicKey> = desired.keys.iter().collect();
        let unreached = deposit_keys.iter().filter(|key| !found.contains(key)).count();
        if unreached > 0 {
            warn!(
                count = unreached,
                "deposit data holds keys not reachable from this mnemonic"
            );
        }

        desired.exited = self.exited_keys(&desired.keys, current)?;
        info!(
            desired = desired.keys.len(),
            exited = desired.exited.len(),
            "desired state built"
        );
        Ok(desired)
    }

    /// Status lookups for desired and stored keys, one batch at a time.
    fn exited_keys(
        &self,
        desired: &[PublicKey],
        current: &CurrentState,
    ) -> EngineResult<HashSet<PublicKey>> {
        let desired_set: HashSet<&PublicKey> = desired.iter().collect();
        let lookup: Vec<PublicKey> = desired
            .iter()
            .copied()
            .chain(
                current
                    .assignments()
                    .map(|(key, _)| *key)
                    .filter(|key| !desired_set.contains(key)),
            )
            .collect();

        let mut exited = HashSet::new();
        for chunk in lookup.chunks(self.batch_size) {
            for (key, status) in self.statuses.statuses(chunk)? {
                if status.is_exited() {
                    exited.insert(key);
                }
            }
        }
        Ok(exited)
    }
}
