use std::collections::BTreeMap;
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{KeystorePersistence, keys_for_additions};
use crate::bls::SecretKey;
use crate::derivation::{DerivationPath, KeyPair, PathScheme};
use crate::error::{EngineError, EngineResult};
use crate::reconcile::ReconciliationPlan;
use crate::types::{ContainerName, KeystoreRecord, PublicKey};

/// Private key sealed with AES-256-GCM.
#[derive(Clone)]
struct SealedKey {
    ciphertext: Vec<u8>,
    nonce: [u8; 12],
}

impl SealedKey {
    fn to_payload(&self) -> Vec<u8> {
        let mut payload = self.nonce.to_vec();
        payload.extend_from_slice(&self.ciphertext);
        payload
    }
}

#[derive(Clone)]
struct Entry {
    container: ContainerName,
    path: String,
    sealed: SealedKey,
}

pub const SEALING_KEY_LEN: usize = 32;

fn cipher_for(key: &[u8; SEALING_KEY_LEN]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]))
}

fn decode_base64(field: &str, value: &str) -> EngineResult<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| EngineError::InvalidInput(format!("{field} is not base64: {e}")))
}

/// Parses a base64 sealing key as printed by [`MemoryKeystoreStore::decryption_key`].
pub fn parse_decryption_key(text: &str) -> EngineResult<Zeroizing<[u8; SEALING_KEY_LEN]>> {
    let raw = Zeroizing::new(decode_base64("decryption key", text)?);
    let mut key = Zeroizing::new([0u8; SEALING_KEY_LEN]);
    if raw.len() != SEALING_KEY_LEN {
        return Err(EngineError::InvalidInput(format!(
            "decryption key must be {SEALING_KEY_LEN} bytes, got {}",
            raw.len()
        )));
    }
    key.copy_from_slice(&raw);
    Ok(key)
}

/// Row layout used when the store is exported to a relational database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseKeyRecord {
    pub public_key: PublicKey,
    /// Base64 ciphertext.
    pub private_key: String,
    /// Base64 nonce.
    pub nonce: String,
    pub validator_index: Option<u32>,
}

impl DatabaseKeyRecord {
    /// Opens the row with the store's exported decryption key and checks the public key.
    pub fn decrypt(&self, decryption_key: &str) -> EngineResult<SecretKey> {
        let key = parse_decryption_key(decryption_key)?;
        let nonce = decode_base64("nonce", &self.nonce)?;
        if nonce.len() != 12 {
            return Err(EngineError::InvalidInput(format!(
                "nonce of {} must be 12 bytes",
                self.public_key
            )));
        }
        let plaintext = Zeroizing::new(
            cipher_for(&key)
                .decrypt(
                    Nonce::from_slice(&nonce),
                    decode_base64("private key", &self.private_key)?.as_slice(),
                )
                .map_err(|e| {
                    EngineError::CryptoError(format!("cannot open row {}: {e:?}", self.public_key))
                })?,
        );
        let secret = SecretKey::from_bytes(&plaintext)?;
        if secret.public_key() != self.public_key {
            return Err(EngineError::InvalidInput(format!(
                "row {} holds a different private key",
                self.public_key
            )));
        }
        Ok(secret)
    }
}

/// Validator clients needed to serve `records`.
pub fn validators_count(records: &[DatabaseKeyRecord]) -> usize {
    records
        .iter()
        .filter_map(|record| record.validator_index)
        .max()
        .map_or(0, |index| index as usize + 1)
}

/// Keystores held in memory, sealed under an AES-256-GCM key.
pub struct MemoryKeystoreStore {
    entries: RwLock<BTreeMap<PublicKey, Entry>>,
    key: Zeroizing<[u8; SEALING_KEY_LEN]>,
    scheme_legacy: bool,
}

impl MemoryKeystoreStore {
    /// Store with a fresh random sealing key.
    pub fn new(legacy: bool) -> Self {
        let mut key = Zeroizing::new([0u8; SEALING_KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self::with_key(legacy, key)
    }

    /// Store sealing under `key`, e.g. one a remote signer already holds.
    pub fn with_key(legacy: bool, key: Zeroizing<[u8; SEALING_KEY_LEN]>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            key,
            scheme_legacy: legacy,
        }
    }

    /// Base64 sealing key; whoever holds it can open exported rows.
    pub fn decryption_key(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(&self.key[..]))
    }

    fn cipher(&self) -> Aes256Gcm {
        cipher_for(&self.key)
    }

    fn seal(&self, secret: &SecretKey) -> EngineResult<SealedKey> {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), &secret.to_bytes()[..])
            .map_err(|e| EngineError::CryptoError(format!("sealing failed: {e:?}")))?;
        Ok(SealedKey { ciphertext, nonce })
    }

    fn unseal_entry(&self, sealed: &SealedKey) -> EngineResult<SecretKey> {
        let plaintext = Zeroizing::new(
            self.cipher()
                .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
                .map_err(|e| EngineError::CryptoError(format!("unsealing failed: {e:?}")))?,
        );
        SecretKey::from_bytes(&plaintext)
    }

    pub fn unseal(&self, public_key: &PublicKey) -> EngineResult<SecretKey> {
        let entries = self.read()?;
        let entry = entries
            .get(public_key)
            .ok_or_else(|| EngineError::InvalidInput(format!("{public_key} is not stored")))?;
        self.unseal_entry(&entry.sealed)
    }

    /// Unseals every key and checks it against its public key. Returns the count.
    pub fn verify(&self) -> EngineResult<usize> {
        let entries = self.read()?;
        for (public_key, entry) in entries.iter() {
            if self.unseal_entry(&entry.sealed)?.public_key() != *public_key {
                return Err(EngineError::InvalidInput(format!(
                    "sealed key in {} does not match {public_key}",
                    entry.container
                )));
            }
        }
        Ok(entries.len())
    }

    pub fn export_database_records(&self) -> EngineResult<Vec<DatabaseKeyRecord>> {
        let entries = self.read()?;
        Ok(entries
            .iter()
            .map(|(public_key, entry)| DatabaseKeyRecord {
                public_key: *public_key,
                private_key: STANDARD.encode(&entry.sealed.ciphertext),
                nonce: STANDARD.encode(entry.sealed.nonce),
                validator_index: entry.container.index(),
            })
            .collect())
    }

    fn read(&self) -> EngineResult<std::sync::RwLockReadGuard<'_, BTreeMap<PublicKey, Entry>>> {
        self.entries
            .read()
            .map_err(|_| EngineError::PersistenceConflict("keystore store lock poisoned".into()))
    }
}

impl KeystorePersistence for MemoryKeystoreStore {
    fn list_current(&self) -> EngineResult<Vec<KeystoreRecord>> {
        let entries = self.read()?;
        Ok(entries
            .iter()
            .map(|(public_key, entry)| KeystoreRecord {
                public_key: *public_key,
                container: entry.container.clone(),
                path: entry.path.clone(),
                payload: entry.sealed.to_payload(),
            })
            .collect())
    }

    fn apply(&self, plan: &ReconciliationPlan, new_keys: &[KeyPair]) -> EngineResult<()> {
        let pairs = keys_for_additions(plan, new_keys)?;
        let scheme = PathScheme::from_legacy_flag(self.scheme_legacy);

        // seal before taking the write lock
        let sealed = pairs
            .iter()
            .map(|pair| self.seal(&pair.private_key))
            .collect::<EngineResult<Vec<_>>>()?;

        let mut entries = self
            .entries
            .write()
            .map_err(|_| EngineError::PersistenceConflict("keystore store lock poisoned".into()))?;

        for key in &plan.removals {
            if !entries.contains_key(key) {
                return Err(EngineError::PersistenceConflict(format!(
                    "cannot remove {key}: it is not stored"
                )));
            }
        }
        if let Some(existing) = plan
            .additions
            .iter()
            .find(|a| entries.contains_key(&a.public_key))
        {
            return Err(EngineError::PersistenceConflict(format!(
                "cannot add {}: already stored",
                existing.public_key
            )));
        }

        for key in &plan.removals {
            entries.remove(key);
        }
        for ((addition, pair), sealed) in plan.additions.iter().zip(pairs).zip(sealed) {
            debug!(
                public_key = %addition.public_key,
                container = %addition.container,
                "storing key"
            );
            entries.insert(
                addition.public_key,
                Entry {
                    container: addition.container.clone(),
                    path: DerivationPath::new(pair.index, scheme).to_string(),
                    sealed,
                },
            );
        }
        info!(
            added = plan.additions.len(),
            removed = plan.removals.len(),
            total = entries.len(),
            "memory keystore store updated"
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

    fn pairs(count: u32) -> Vec<KeyPair> {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        KeyDeriver::new(&mnemonic, false)
            .unwrap()
            .keypairs(&(0..count).collect::<Vec<_>>())
    }

    fn add_plan(keys: &[KeyPair]) -> ReconciliationPlan {
        ReconciliationPlan {
            additions: keys
                .iter()
                .map(|pair| PlannedAddition {
                    public_key: pair.public_key,
                    container: ContainerName::from_index(0),
                })
                .collect(),
            containers_to_create: vec![ContainerName::from_index(0)],
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_and_list() {
        let store = MemoryKeystoreStore::new(false);
        let keys = pairs(2);
        store.apply(&add_plan(&keys), &keys).unwrap();

        let records = store.list_current().unwrap();
        assert_eq!(records.len(), 2);
        let first = records.iter().find(|r| r.public_key == keys[1].public_key).unwrap();
        assert_eq!(first.path, "m/12381/3600/1/0/0");
        assert_eq!(store.verify().unwrap(), 2);
        assert_eq!(store.unseal(&keys[0].public_key).unwrap().public_key(), keys[0].public_key);
    }

    #[test]
    fn test_conflicting_plan_is_rejected() {
        let store = MemoryKeystoreStore::new(false);
        let keys = pairs(1);
        store.apply(&add_plan(&keys), &keys).unwrap();
        assert!(matches!(
            store.apply(&add_plan(&keys), &keys),
            Err(EngineError::PersistenceConflict(_))
        ));
        assert!(matches!(
            store.apply(&add_plan(&keys), &[]),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_database_export() {
        let store = MemoryKeystoreStore::new(false);
        let keys = pairs(1);
        store.apply(&add_plan(&keys), &keys).unwrap();
        let rows = store.export_database_records().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].validator_index, Some(0));
        assert_eq!(STANDARD.decode(&rows[0].nonce).unwrap().len(), 12);
    }

    #[test]
    fn test_exported_rows_open_with_exported_key() {
        let store = MemoryKeystoreStore::new(false);
        let keys = pairs(2);
        store.apply(&add_plan(&keys), &keys).unwrap();
        let rows = store.export_database_records().unwrap();
        let decryption_key = store.decryption_key();

        for row in &rows {
            let pair = keys.iter().find(|p| p.public_key == row.public_key).unwrap();
            let secret = row.decrypt(&decryption_key).unwrap();
            assert_eq!(*secret.to_bytes(), *pair.private_key.to_bytes());
        }
        assert_eq!(validators_count(&rows), 1);

        let other = MemoryKeystoreStore::new(false);
        assert!(matches!(
            rows[0].decrypt(&other.decryption_key()),
            Err(EngineError::CryptoError(_))
        ));
        assert!(rows[0].decrypt("not base64!").is_err());
    }

    #[test]
    fn test_store_reuses_given_key() {
        let first = MemoryKeystoreStore::new(false);
        let key = parse_decryption_key(&first.decryption_key()).unwrap();
        let second = MemoryKeystoreStore::with_key(false, key);
        assert_eq!(*second.decryption_key(), *first.decryption_key());

        let keys = pairs(1);
        second.apply(&add_plan(&keys), &keys).unwrap();
        let rows = second.export_database_records().unwrap();
        assert!(rows[0].decrypt(&first.decryption_key()).is_ok());
        assert!(parse_decryption_key(&STANDARD.encode([1u8; 16])).is_err());
    }
}
