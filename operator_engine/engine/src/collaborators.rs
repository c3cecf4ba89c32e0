//! Interfaces to the outside world: registration lookups, beacon statuses and
//! published deposit data. Implementations here are in-memory or file-backed;
//! network clients live outside the engine and own their own retries.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::{MerkleDepositData, PublicKey, ValidatorStatus};

pub trait RegistrationStatusProvider: Send + Sync {
    fn is_registered(&self, public_key: &PublicKey) -> EngineResult<bool>;

    /// Registered members of `public_keys`. Callers pass one batch at a time.
    fn registered_subset(&self, public_keys: &[PublicKey]) -> EngineResult<HashSet<PublicKey>> {
        let mut registered = HashSet::new();
        for key in public_keys {
            if self.is_registered(key)? {
                registered.insert(*key);
            }
        }
        Ok(registered)
    }
}

pub trait ValidatorStatusProvider: Send + Sync {
    /// Keys unknown to the beacon chain are simply absent from the result.
    fn statuses(
        &self,
        public_keys: &[PublicKey],
    ) -> EngineResult<HashMap<PublicKey, ValidatorStatus>>;
}

pub trait DepositDataSource: Send + Sync {
    /// Content is not re-validated here; see `deposit::verify_deposit_datum`.
    fn fetch(&self, locator: &str) -> EngineResult<Vec<MerkleDepositData>>;
}

/// Fixed set of registered keys.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    registered: HashSet<PublicKey>,
}

impl InMemoryRegistry {
    pub fn new<I: IntoIterator<Item = PublicKey>>(keys: I) -> Self {
        Self {
            registered: keys.into_iter().collect(),
        }
    }

    /// Reads a JSON array of public keys.
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let keys: Vec<PublicKey> = serde_json::from_str(&fs::read_to_string(path)?)?;
        debug!(count = keys.len(), path = %path.display(), "loaded registrations");
        Ok(Self::new(keys))
    }
}

impl RegistrationStatusProvider for InMemoryRegistry {
    fn is_registered(&self, public_key: &PublicKey) -> EngineResult<bool> {
        Ok(self.registered.contains(public_key))
    }

    fn registered_subset(&self, public_keys: &[PublicKey]) -> EngineResult<HashSet<PublicKey>> {
        Ok(public_keys
            .iter()
            .filter(|key| self.registered.contains(*key))
            .copied()
            .collect())
    }
}

/// Fixed beacon statuses.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStatuses {
    statuses: HashMap<PublicKey, ValidatorStatus>,
}

impl InMemoryStatuses {
    pub fn new<I: IntoIterator<Item = (PublicKey, ValidatorStatus)>>(statuses: I) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }

    /// Reads a JSON object `{ "0x..": "active_ongoing", .. }`.
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct StatusFile(HashMap<String, ValidatorStatus>);

        let raw: StatusFile = serde_json::from_str(&fs::read_to_string(path)?)?;
        let statuses = raw
            .0
            .into_iter()
            .map(|(key, status)| Ok((PublicKey::from_hex(&key)?, status)))
            .collect::<EngineResult<HashMap<_, _>>>()?;
        debug!(count = statuses.len(), path = %path.display(), "loaded validator statuses");
        Ok(Self { statuses })
    }
}

impl ValidatorStatusProvider for InMemoryStatuses {
    fn statuses(
        &self,
        public_keys: &[PublicKey],
    ) -> EngineResult<HashMap<PublicKey, ValidatorStatus>> {
        Ok(public_keys
            .iter()
            .filter_map(|key| self.statuses.get(key).map(|status| (*key, *status)))
            .collect())
    }
}

/// Resolves locators as file names under a base directory.
#[derive(Debug, Clone)]
pub struct FileDepositDataSource {
    base: PathBuf,
}

impl FileDepositDataSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl DepositDataSource for FileDepositDataSource {
    fn fetch(&self, locator: &str) -> EngineResult<Vec<MerkleDepositData>> {
        let locator = locator.trim();
        if locator.is_empty() || locator.split(['/', '\\']).any(|part| part == "..") {
            return Err(EngineError::InvalidInput(format!(
                "invalid deposit data locator '{locator}'"
            )));
        }
        let path = self.base.join(locator);
        let datum: Vec<MerkleDepositData> = serde_json::from_str(&fs::read_to_string(&path)?)?;
        debug!(count = datum.len(), path = %path.display(), "fetched deposit data");
        Ok(datum)
    }
}
