//! Diff between stored keystores and the keys that should be served.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::derivation::{DerivationPath, Mnemonic};
use crate::error::{EngineError, EngineResult};
use crate::reconcile::cache::RunCache;
use crate::types::{ContainerName, KeystoreRecord, PublicKey};

/// Which container holds each stored public key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentState {
    assignments: BTreeMap<PublicKey, ContainerName>,
    paths: BTreeMap<PublicKey, String>,
}

impl CurrentState {
    /// Builds the state from enumerated records, refusing keys stored twice.
    pub fn from_records<I>(records: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = KeystoreRecord>,
    {
        let mut state = Self::default();
        for record in records {
            state.insert(record.public_key, record.container)?;
            state.paths.insert(record.public_key, record.path);
        }
        Ok(state)
    }

    pub fn from_assignments<I>(assignments: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (PublicKey, ContainerName)>,
    {
        let mut state = Self::default();
        for (public_key, container) in assignments {
            state.insert(public_key, container)?;
        }
        Ok(state)
    }

    fn insert(&mut self, public_key: PublicKey, container: ContainerName) -> EngineResult<()> {
        if let Some(first) = self.assignments.get(&public_key) {
            error!(
                public_key = %public_key,
                first = %first,
                second = %container,
                "public key is stored in two containers"
            );
            return Err(EngineError::DuplicateKeyDetected {
                public_key: public_key.to_hex(),
                first: first.to_string(),
                second: container.to_string(),
            });
        }
        self.assignments.insert(public_key, container);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn contains(&self, public_key: &PublicKey) -> bool {
        self.assignments.contains_key(public_key)
    }

    pub fn container_of(&self, public_key: &PublicKey) -> Option<&ContainerName> {
        self.assignments.get(public_key)
    }

    /// Derivation path recorded in the keystore, when the backend keeps one.
    pub fn path_of(&self, public_key: &PublicKey) -> Option<&str> {
        self.paths.get(public_key).map(String::as_str)
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&PublicKey, &ContainerName)> {
        self.assignments.iter()
    }

    /// Containers holding at least one key, oldest first.
    pub fn containers(&self) -> Vec<ContainerName> {
        self.fill_counts().into_iter().map(|(name, _)| name).collect()
    }

    /// `validator{N}` containers order by N, anything else after them by name.
    fn fill_counts(&self) -> Vec<(ContainerName, usize)> {
        let mut counts: BTreeMap<(u32, ContainerName), usize> = BTreeMap::new();
        for container in self.assignments.values() {
            let rank = container.index().unwrap_or(u32::MAX);
            *counts.entry((rank, container.clone())).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|((_, name), count)| (name, count))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAddition {
    pub public_key: PublicKey,
    pub container: ContainerName,
}

/// Minimal set of changes taking the current state to the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationPlan {
    /// In desired order.
    pub additions: Vec<PlannedAddition>,
    pub removals: Vec<PublicKey>,
    pub containers_to_delete: Vec<ContainerName>,
    pub containers_to_create: Vec<ContainerName>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty()
            && self.removals.is_empty()
            && self.containers_to_delete.is_empty()
            && self.containers_to_create.is_empty()
    }

    pub fn container_for(&self, public_key: &PublicKey) -> Option<&ContainerName> {
        self.additions
            .iter()
            .find(|addition| addition.public_key == *public_key)
            .map(|addition| &addition.container)
    }
}

/// Lowest `validator{N}` not already taken.
fn next_container_name(taken: &HashSet<ContainerName>) -> ContainerName {
    (0..)
        .map(ContainerName::from_index)
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| ContainerName::from_index(u32::MAX))
}

pub fn reconcile(
    current: &CurrentState,
    desired: &[PublicKey],
    exited: &HashSet<PublicKey>,
    capacity: usize,
) -> EngineResult<ReconciliationPlan> {
    reconcile_with_limit(current, desired, exited, capacity, None)
}

/// Computes the plan; `max_containers` caps how many containers may exist afterwards.
pub fn reconcile_with_limit(
    current: &CurrentState,
    desired: &[PublicKey],
    exited: &HashSet<PublicKey>,
    capacity: usize,
    max_containers: Option<usize>,
) -> EngineResult<ReconciliationPlan> {
    if capacity == 0 {
        return Err(EngineError::InvalidInput(
            "container capacity must be positive".into(),
        ));
    }

    let mut seen = HashSet::with_capacity(desired.len());
    let missing: Vec<PublicKey> = desired
        .iter()
        .filter(|key| seen.insert(**key))
        .filter(|key| !current.contains(key) && !exited.contains(*key))
        .copied()
        .collect();
    let removable: Vec<PublicKey> = current
        .assignments()
        .map(|(key, _)| *key)
        .filter(|key| exited.contains(key))
        .collect();

    let mut fills = current.fill_counts();
    let existing = fills.len();
    let mut taken: HashSet<ContainerName> = fills.iter().map(|(name, _)| name.clone()).collect();

    // exited keys still count against free slots until they are gone
    let mut available_slots =
        (existing * capacity) as i128 - current.len() as i128 - removable.len() as i128;
    while !missing.is_empty() && available_slots < missing.len() as i128 {
        if let Some(limit) = max_containers {
            if fills.len() >= limit {
                return Err(EngineError::CapacityExhausted(format!(
                    "{} keys need a container but the limit of {limit} containers is reached",
                    missing.len()
                )));
            }
        }
        let name = next_container_name(&taken);
        debug!(container = %name, "synthesizing container");
        taken.insert(name.clone());
        fills.push((name, 0));
        available_slots += capacity as i128;
    }

    for key in &removable {
        if let Some(container) = current.container_of(key) {
            warn!(public_key = %key, container = %container, "removing exited key");
            if let Some(fill) = fills.iter_mut().find(|(name, _)| name == container) {
                fill.1 = fill.1.saturating_sub(1);
            }
        }
    }

    let mut additions = Vec::with_capacity(missing.len());
    for key in missing {
        // first minimum wins, so ties go to the oldest container
        let (container, fill) = fills
            .iter_mut()
            .min_by_key(|(_, fill)| *fill)
            .ok_or_else(|| {
                EngineError::CapacityExhausted(format!("no container available for {key}"))
            })?;
        *fill += 1;
        additions.push(PlannedAddition {
            public_key: key,
            container: container.clone(),
        });
    }

    let (previous, synthesized) = fills.split_at(existing);
    let plan = ReconciliationPlan {
        additions,
        removals: removable,
        containers_to_delete: previous
            .iter()
            .filter(|(_, fill)| *fill == 0)
            .map(|(name, _)| name.clone())
            .collect(),
        containers_to_create: synthesized
            .iter()
            .filter(|(_, fill)| *fill > 0)
            .map(|(name, _)| name.clone())
            .collect(),
    };

    info!(
        additions = plan.additions.len(),
        removals = plan.removals.len(),
        create = plan.containers_to_create.len(),
        delete = plan.containers_to_delete.len(),
        "reconciliation plan computed"
    );
    Ok(plan)
}

/// State after applying `plan`, failing if the plan does not fit `current`.
pub fn apply_plan(current: &CurrentState, plan: &ReconciliationPlan) -> EngineResult<CurrentState> {
    let mut next = current.clone();
    for key in &plan.removals {
        if next.assignments.remove(key).is_none() {
            return Err(EngineError::PersistenceConflict(format!(
                "cannot remove {key}: it is not stored"
            )));
        }
        next.paths.remove(key);
    }
    for addition in &plan.additions {
        if let Some(existing) = next.assignments.get(&addition.public_key) {
            return Err(EngineError::PersistenceConflict(format!(
                "cannot add {} to {}: already stored in {existing}",
                addition.public_key, addition.container
            )));
        }
        next.assignments
            .insert(addition.public_key, addition.container.clone());
    }
    Ok(next)
}

/// Re-derives the stored key with the lowest recorded index and compares it.
///
/// Returns the checked index, or `None` when nothing is stored yet.
pub fn check_mnemonic_binding(
    current: &CurrentState,
    mnemonic: &Mnemonic,
    legacy: bool,
) -> EngineResult<Option<u32>> {
    let mut cache = RunCache::from_mnemonic(mnemonic, legacy)?;
    check_binding_with(current, &mut cache)
}

pub fn check_binding_with(
    current: &CurrentState,
    cache: &mut RunCache,
) -> EngineResult<Option<u32>> {
    let scheme = cache.scheme();
    let mut first: Option<(u32, PublicKey)> = None;
    for (public_key, path) in &current.paths {
        let index = match DerivationPath::parse(path, scheme) {
            Ok(parsed) => parsed.index,
            Err(err) => {
                // path written under the other scheme
                let foreign = DerivationPath::parse(path, scheme.other()).map_err(|_| err)?;
                error!(
                    public_key = %public_key,
                    path = %path,
                    "stored keystore uses the other derivation scheme"
                );
                return Err(EngineError::MnemonicMismatch {
                    public_key: public_key.to_hex(),
                    index: foreign.index,
                });
            }
        };
        if first.is_none_or(|(lowest, _)| index < lowest) {
            first = Some((index, *public_key));
        }
    }

    let Some((index, stored)) = first else {
        return Ok(None);
    };
    let derived = cache.public_key(index);
    if derived != stored {
        error!(public_key = %stored, index, "stored keystore does not belong to this mnemonic");
        return Err(EngineError::MnemonicMismatch {
            public_key: stored.to_hex(),
            index,
        });
    }
    debug!(index, "mnemonic matches stored keystores");
    Ok(Some(index))
}
