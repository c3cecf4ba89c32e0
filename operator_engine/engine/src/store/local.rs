//! Keystores on the local filesystem, one directory per container:
//!
//! ```text
//! {root}/{container}/keystores/keystore-m_12381_3600_{i}_0_0.json
//! {root}/{container}/password/password.txt
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::keystore::{DEFAULT_KDF_LOG_N, Keystore, kdf_parallelism};
use super::password::generate_password;
use super::{KeystorePersistence, keys_for_additions};
use crate::derivation::{DerivationPath, KeyPair, PathScheme};
use crate::error::{EngineError, EngineResult};
use crate::reconcile::ReconciliationPlan;
use crate::types::{ContainerName, KeystoreRecord, PublicKey};

const KEYSTORES_DIR: &str = "keystores";
const PASSWORD_DIR: &str = "password";
const PASSWORD_FILE: &str = "password.txt";

pub fn keystore_filename(path: &str) -> String {
    format!("keystore-{}.json", path.replace('/', "_"))
}

#[derive(Debug, Clone)]
pub struct LocalKeystoreStore {
    root: PathBuf,
    kdf_log_n: u8,
    scheme: PathScheme,
}

struct StoredFile {
    record: KeystoreRecord,
    file: PathBuf,
}

struct ContainerPassword {
    value: Zeroizing<String>,
    is_new: bool,
}

/// Encrypted keystore waiting to be written.
struct PendingKeystore {
    container: ContainerName,
    path: String,
    json: String,
}

impl LocalKeystoreStore {
    pub fn new(root: impl Into<PathBuf>, legacy: bool) -> Self {
        Self {
            root: root.into(),
            kdf_log_n: DEFAULT_KDF_LOG_N,
            scheme: PathScheme::from_legacy_flag(legacy),
        }
    }

    pub fn with_kdf_log_n(mut self, kdf_log_n: u8) -> Self {
        self.kdf_log_n = kdf_log_n;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &ContainerName) -> PathBuf {
        self.root.join(container.as_str())
    }

    fn password_path(&self, container: &ContainerName) -> PathBuf {
        self.container_dir(container).join(PASSWORD_DIR).join(PASSWORD_FILE)
    }

    fn read_password(&self, container: &ContainerName) -> EngineResult<Zeroizing<String>> {
        let raw = Zeroizing::new(fs::read_to_string(self.password_path(container))?);
        Ok(Zeroizing::new(raw.lines().next().unwrap_or_default().to_string()))
    }

    /// Reads the container's password, or generates one without writing it.
    fn existing_or_new_password(
        &self,
        container: &ContainerName,
    ) -> EngineResult<ContainerPassword> {
        if self.password_path(container).exists() {
            return Ok(ContainerPassword {
                value: self.read_password(container)?,
                is_new: false,
            });
        }
        Ok(ContainerPassword {
            value: generate_password(),
            is_new: true,
        })
    }

    fn write_password(&self, container: &ContainerName, password: &str) -> EngineResult<()> {
        let path = self.password_path(container);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, password.as_bytes())?;
        debug!(container = %container, "created keystore password");
        Ok(())
    }

    /// Encrypts every addition, at most [`kdf_parallelism`] at a time.
    fn encrypt_additions(
        &self,
        plan: &ReconciliationPlan,
        pairs: &[&KeyPair],
        passwords: &HashMap<ContainerName, ContainerPassword>,
    ) -> EngineResult<Vec<PendingKeystore>> {
        let batch_size = kdf_parallelism(self.kdf_log_n);
        let mut pending = Vec::with_capacity(pairs.len());
        for (additions, pairs) in plan.additions.chunks(batch_size).zip(pairs.chunks(batch_size)) {
            let batch = additions
                .par_iter()
                .zip(pairs.par_iter())
                .map(|(addition, pair)| -> EngineResult<_> {
                    let password = passwords.get(&addition.container).ok_or_else(|| {
                        EngineError::InvalidInput(format!("no password for {}", addition.container))
                    })?;
                    let path = DerivationPath::new(pair.index, self.scheme).to_string();
                    let keystore = Keystore::encrypt(
                        &pair.private_key,
                        &password.value,
                        &path,
                        self.kdf_log_n,
                    )?;
                    Ok(PendingKeystore {
                        container: addition.container.clone(),
                        path,
                        json: keystore.to_json()?,
                    })
                })
                .collect::<EngineResult<Vec<_>>>()?;
            pending.extend(batch);
        }
        Ok(pending)
    }

    /// `validator{N}` directories ordered by N. Anything else under the root is skipped.
    fn container_names(&self) -> EngineResult<Vec<ContainerName>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let container = entry
                .file_name()
                .to_str()
                .and_then(|name| ContainerName::parse(name).ok())
                .filter(|name| name.index().is_some());
            match container {
                Some(container) => names.push(container),
                None => debug!(path = %entry.path().display(), "skipping non-container directory"),
            }
        }
        names.sort_by_key(|name| name.index());
        Ok(names)
    }

    fn stored_files(&self) -> EngineResult<Vec<StoredFile>> {
        let mut stored = Vec::new();
        for container in self.container_names()? {
            let dir = self.container_dir(&container).join(KEYSTORES_DIR);
            if !dir.exists() {
                continue;
            }
            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<_, _>>()?;
            files.retain(|file| file.extension().is_some_and(|ext| ext == "json"));
            files.sort();

            for file in files {
                let raw = fs::read_to_string(&file)?;
                let keystore = Keystore::from_json(&raw).map_err(|e| {
                    EngineError::InvalidInput(format!("{}: {e}", file.display()))
                })?;
                stored.push(StoredFile {
                    record: KeystoreRecord {
                        public_key: keystore.public_key()?,
                        container: container.clone(),
                        path: keystore.path.clone(),
                        payload: raw.into_bytes(),
                    },
                    file,
                });
            }
        }
        Ok(stored)
    }

    /// Decrypts every keystore and checks its public key and uniqueness.
    /// Returns the number of verified keystores.
    pub fn verify(&self) -> EngineResult<usize> {
        let mut seen: HashMap<PublicKey, ContainerName> = HashMap::new();
        let mut passwords: HashMap<ContainerName, Zeroizing<String>> = HashMap::new();
        for stored in self.stored_files()? {
            let container = &stored.record.container;
            if !passwords.contains_key(container) {
                passwords.insert(container.clone(), self.read_password(container)?);
            }
            let password = passwords
                .get(container)
                .ok_or_else(|| EngineError::InvalidInput(format!("no password for {container}")))?;

            let keystore = Keystore::from_json(&String::from_utf8_lossy(&stored.record.payload))?;
            let derived = keystore.decrypt(password)?.public_key();
            if let Some(first) = seen.insert(derived, container.clone()) {
                return Err(EngineError::DuplicateKeyDetected {
                    public_key: derived.to_hex(),
                    first: first.to_string(),
                    second: container.to_string(),
                });
            }
            if derived != stored.record.public_key {
                return Err(EngineError::InvalidInput(format!(
                    "failed to verify keystore {} for container {container}",
                    stored.file.display()
                )));
            }
        }
        info!(count = seen.len(), root = %self.root.display(), "local keystores verified");
        Ok(seen.len())
    }
}

impl KeystorePersistence for LocalKeystoreStore {
    fn list_current(&self) -> EngineResult<Vec<KeystoreRecord>> {
        Ok(self.stored_files()?.into_iter().map(|s| s.record).collect())
    }

    fn apply(&self, plan: &ReconciliationPlan, new_keys: &[KeyPair]) -> EngineResult<()> {
        let pairs = keys_for_additions(plan, new_keys)?;
        let stored = self.stored_files()?;
        let files: HashMap<PublicKey, &StoredFile> =
            stored.iter().map(|s| (s.record.public_key, s)).collect();

        for key in &plan.removals {
            if !files.contains_key(key) {
                return Err(EngineError::PersistenceConflict(format!(
                    "cannot remove {key}: no keystore on disk"
                )));
            }
        }
        if let Some(existing) = plan.additions.iter().find(|a| files.contains_key(&a.public_key)) {
            return Err(EngineError::PersistenceConflict(format!(
                "cannot add {}: keystore already on disk",
                existing.public_key
            )));
        }

        // nothing is touched on disk until every keystore is encrypted
        let mut passwords = HashMap::new();
        for addition in &plan.additions {
            if !passwords.contains_key(&addition.container) {
                let password = self.existing_or_new_password(&addition.container)?;
                passwords.insert(addition.container.clone(), password);
            }
        }
        let pending = self.encrypt_additions(plan, &pairs, &passwords)?;

        for key in &plan.removals {
            if let Some(stored) = files.get(key) {
                warn!(public_key = %key, container = %stored.record.container, "removing keystore");
                fs::remove_file(&stored.file)?;
            }
        }
        for container in &plan.containers_to_delete {
            let dir = self.container_dir(container);
            if dir.exists() {
                warn!(container = %container, "deleting container");
                fs::remove_dir_all(dir)?;
            }
        }

        for (container, password) in &passwords {
            if password.is_new {
                self.write_password(container, &password.value)?;
            }
        }
        for keystore in pending {
            let dir = self.container_dir(&keystore.container).join(KEYSTORES_DIR);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(keystore_filename(&keystore.path)), keystore.json)?;
        }

        info!(
            added = plan.additions.len(),
            removed = plan.removals.len(),
            deleted = plan.containers_to_delete.len(),
            root = %self.root.display(),
            "local keystores synced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::{KeyDeriver, Mnemonic};
    use crate::reconcile::PlannedAddition;

    const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";
    const FAST_LOG_N: u8 = 4;

    fn pairs(count: u32) -> Vec<KeyPair> {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        KeyDeriver::new(&mnemonic, false)
            .unwrap()
            .keypairs(&(0..count).collect::<Vec<_>>())
    }

    fn addition(pair: &KeyPair, container: u32) -> PlannedAddition {
        PlannedAddition {
            public_key: pair.public_key,
            container: ContainerName::from_index(container),
        }
    }

    #[test]
    fn test_keystore_filename() {
        assert_eq!(
            keystore_filename("m/12381/3600/4/0/0"),
            "keystore-m_12381_3600_4_0_0.json"
        );
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalKeystoreStore::new(dir.path().join("absent"), false);
        assert!(store.list_current().unwrap().is_empty());
        assert_eq!(store.verify().unwrap(), 0);
    }

    #[test]
    fn test_failed_encryption_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let keys = pairs(2);
        let store = LocalKeystoreStore::new(dir.path(), false).with_kdf_log_n(FAST_LOG_N);
        let first = ReconciliationPlan {
            additions: vec![addition(&keys[0], 0)],
            containers_to_create: vec![ContainerName::from_index(0)],
            ..Default::default()
        };
        store.apply(&first, &keys).unwrap();
        let before = store.list_current().unwrap();

        let broken = LocalKeystoreStore::new(dir.path(), false).with_kdf_log_n(0);
        let moving = ReconciliationPlan {
            additions: vec![addition(&keys[1], 1)],
            removals: vec![keys[0].public_key],
            containers_to_delete: vec![ContainerName::from_index(0)],
            containers_to_create: vec![ContainerName::from_index(1)],
        };
        assert!(matches!(
            broken.apply(&moving, &keys),
            Err(EngineError::CryptoError(_))
        ));

        assert_eq!(store.list_current().unwrap(), before);
        assert!(dir.path().join("validator0").join(PASSWORD_DIR).join(PASSWORD_FILE).exists());
        assert!(!dir.path().join("validator1").exists());
        assert_eq!(store.verify().unwrap(), 1);
    }

    #[test]
    fn test_foreign_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        for name in [".git", "lost+found", "backup"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        let keys = pairs(2);
        let store = LocalKeystoreStore::new(dir.path(), false).with_kdf_log_n(FAST_LOG_N);
        let plan = ReconciliationPlan {
            additions: vec![addition(&keys[0], 0), addition(&keys[1], 1)],
            containers_to_create: vec![ContainerName::from_index(0), ContainerName::from_index(1)],
            ..Default::default()
        };
        store.apply(&plan, &keys).unwrap();

        let records = store.list_current().unwrap();
        let containers: Vec<&str> = records.iter().map(|r| r.container.as_str()).collect();
        assert_eq!(containers, vec!["validator0", "validator1"]);
        assert_eq!(store.verify().unwrap(), 2);
    }
}
