use std::collections::BTreeMap;

use operator_engine::collaborators::{InMemoryRegistry, InMemoryStatuses};
use operator_engine::config::NetworkConfig;
use operator_engine::deposit::generate_merkle_deposit_datum;
use operator_engine::derivation::{KeyPair, Mnemonic, derive_keypairs, generate_new_mnemonic};
use operator_engine::error::{EngineError, EngineResult};
use operator_engine::reconcile::{
    Collaborators, ReconcileSettings, ReconciliationEngine, ReconciliationPlan,
};
use operator_engine::store::{
    KeystorePersistence, LocalKeystoreStore, MemoryKeystoreStore, parse_decryption_key,
    public_keys_for_validator, validators_count, write_validator_keys,
};
use operator_engine::types::{ContainerName, KeystoreRecord, MerkleDepositData, ValidatorStatus};

const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";
const FAST_LOG_N: u8 = 4;

fn mnemonic() -> Mnemonic {
    Mnemonic::parse(TEST_MNEMONIC).unwrap()
}

fn pairs(count: u32, legacy: bool) -> Vec<KeyPair> {
    derive_keypairs(&mnemonic(), &(0..count).collect::<Vec<_>>(), legacy).unwrap()
}

fn deposit_datum(keys: &[KeyPair]) -> Vec<MerkleDepositData> {
    let network = NetworkConfig::preset("goerli").unwrap();
    generate_merkle_deposit_datum(
        keys,
        &network.withdrawal_credentials,
        network.deposit_amount_gwei,
        &network.genesis_fork_version,
    )
    .unwrap()
    .1
}

fn engine(legacy: bool) -> ReconciliationEngine {
    ReconciliationEngine::new(ReconcileSettings {
        legacy,
        capacity: 2,
        batch_size: 4,
        walk_limit: 64,
        ..ReconcileSettings::default()
    })
}

fn containers_by_key(store: &dyn KeystorePersistence) -> BTreeMap<String, String> {
    store
        .list_current()
        .unwrap()
        .into_iter()
        .map(|r| (r.public_key.to_hex(), r.container.to_string()))
        .collect()
}

#[test]
fn test_memory_store_sync_is_idempotent() {
    let keys = pairs(3, false);
    let datum = deposit_datum(&keys);
    let registry = InMemoryRegistry::default();
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let store = MemoryKeystoreStore::new(false);
    let engine = engine(false);

    let outcome = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    assert_eq!(outcome.desired_count, 3);
    assert_eq!(outcome.checked_index, None);
    assert_eq!(
        outcome.plan.containers_to_create,
        vec![ContainerName::from_index(0), ContainerName::from_index(1)]
    );
    engine.apply(&store, &outcome).unwrap();

    let stored = containers_by_key(&store);
    assert_eq!(stored[&keys[0].public_key.to_hex()], "validator0");
    assert_eq!(stored[&keys[1].public_key.to_hex()], "validator1");
    assert_eq!(stored[&keys[2].public_key.to_hex()], "validator0");
    assert_eq!(store.verify().unwrap(), 3);

    let second = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    assert!(second.plan.is_empty());
    assert_eq!(second.checked_index, Some(0));
    engine.apply(&store, &second).unwrap();
}

#[test]
fn test_registered_keys_extend_the_walk_and_exits_are_removed() {
    let keys = pairs(4, false);
    let datum = deposit_datum(&keys[..2]);
    let registry = InMemoryRegistry::new([keys[2].public_key, keys[3].public_key]);
    let statuses = InMemoryStatuses::new([
        (keys[0].public_key, ValidatorStatus::ActiveOngoing),
        (keys[1].public_key, ValidatorStatus::ExitedUnslashed),
    ]);
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let store = MemoryKeystoreStore::new(false);
    let engine = engine(false);

    let outcome = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    assert_eq!(outcome.desired_count, 4);
    assert!(outcome.plan.container_for(&keys[1].public_key).is_none());
    assert_eq!(outcome.plan.additions.len(), 3);
    engine.apply(&store, &outcome).unwrap();
    assert!(!containers_by_key(&store).contains_key(&keys[1].public_key.to_hex()));
}

#[test]
fn test_exit_after_sync_removes_key_and_empty_container() {
    let keys = pairs(3, false);
    let datum = deposit_datum(&keys);
    let registry = InMemoryRegistry::default();
    let store = MemoryKeystoreStore::new(false);
    let engine = engine(false);

    let active = InMemoryStatuses::default();
    let first = engine
        .run(
            &mnemonic(),
            &store,
            &Collaborators {
                registrations: &registry,
                statuses: &active,
            },
            &datum,
        )
        .unwrap();
    engine.apply(&store, &first).unwrap();

    // keys[1] is alone in validator1
    let exited = InMemoryStatuses::new([(keys[1].public_key, ValidatorStatus::WithdrawalDone)]);
    let second = engine
        .run(
            &mnemonic(),
            &store,
            &Collaborators {
                registrations: &registry,
                statuses: &exited,
            },
            &datum,
        )
        .unwrap();
    assert_eq!(second.plan.removals, vec![keys[1].public_key]);
    assert_eq!(second.plan.containers_to_delete, vec![ContainerName::from_index(1)]);
    assert!(second.plan.additions.is_empty());
    engine.apply(&store, &second).unwrap();
    assert_eq!(store.list_current().unwrap().len(), 2);
}

#[test]
fn test_foreign_mnemonic_is_refused() {
    let keys = pairs(2, false);
    let datum = deposit_datum(&keys);
    let registry = InMemoryRegistry::default();
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let store = MemoryKeystoreStore::new(false);
    let engine = engine(false);
    let outcome = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    engine.apply(&store, &outcome).unwrap();

    let other = generate_new_mnemonic("english").unwrap();
    let err = engine.run(&other, &store, &collaborators, &datum).unwrap_err();
    assert!(matches!(err, EngineError::MnemonicMismatch { index: 0, .. }));
    assert!(err.is_safety_critical());
}

#[test]
fn test_scheme_mix_is_refused() {
    let keys = pairs(2, true);
    let datum = deposit_datum(&keys);
    let registry = InMemoryRegistry::default();
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let store = MemoryKeystoreStore::new(true);
    let legacy = engine(true);
    let outcome = legacy.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    legacy.apply(&store, &outcome).unwrap();
    assert!(legacy.run(&mnemonic(), &store, &collaborators, &datum).unwrap().plan.is_empty());

    let current = engine(false);
    let err = current.run(&mnemonic(), &store, &collaborators, &datum).unwrap_err();
    assert!(matches!(err, EngineError::MnemonicMismatch { index: 1, .. }));
    assert!(err.is_safety_critical());
}

/// Backend reporting whatever records it was built with.
struct FixedRecords(Vec<KeystoreRecord>);

impl KeystorePersistence for FixedRecords {
    fn list_current(&self) -> EngineResult<Vec<KeystoreRecord>> {
        Ok(self.0.clone())
    }

    fn apply(&self, _plan: &ReconciliationPlan, _new_keys: &[KeyPair]) -> EngineResult<()> {
        Err(EngineError::PersistenceConflict("read only".into()))
    }
}

#[test]
fn test_duplicate_key_aborts_before_planning() {
    let keys = pairs(1, false);
    let record = |container: u32| KeystoreRecord {
        public_key: keys[0].public_key,
        container: ContainerName::from_index(container),
        path: "m/12381/3600/0/0/0".into(),
        payload: Vec::new(),
    };
    let store = FixedRecords(vec![record(0), record(4)]);
    let registry = InMemoryRegistry::default();
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };

    let err = engine(false)
        .run(&mnemonic(), &store, &collaborators, &deposit_datum(&keys))
        .unwrap_err();
    match &err {
        EngineError::DuplicateKeyDetected { first, second, .. } => {
            assert_eq!(first, "validator0");
            assert_eq!(second, "validator4");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_safety_critical());
}

#[test]
fn test_walk_limit_is_enforced() {
    let keys = pairs(3, false);
    let registry = InMemoryRegistry::new(keys.iter().map(|k| k.public_key));
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let engine = ReconciliationEngine::new(ReconcileSettings {
        walk_limit: 2,
        batch_size: 1,
        ..ReconcileSettings::default()
    });
    let store = MemoryKeystoreStore::new(false);
    assert!(matches!(
        engine.run(&mnemonic(), &store, &collaborators, &[]),
        Err(EngineError::InvalidInput(_))
    ));
}

#[test]
fn test_local_store_sync_and_verify() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalKeystoreStore::new(dir.path(), false).with_kdf_log_n(FAST_LOG_N);
    let keys = pairs(3, false);
    let datum = deposit_datum(&keys);
    let registry = InMemoryRegistry::default();
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let engine = engine(false);

    let outcome = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    engine.apply(&store, &outcome).unwrap();

    assert!(dir.path().join("validator0/password/password.txt").exists());
    assert!(
        dir.path()
            .join("validator1/keystores/keystore-m_12381_3600_1_0_0.json")
            .exists()
    );
    assert_eq!(store.verify().unwrap(), 3);

    let again = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    assert!(again.plan.is_empty());

    // exit the only key in validator1: its directory goes away
    let exited = InMemoryStatuses::new([(keys[1].public_key, ValidatorStatus::ExitedSlashed)]);
    let removal = engine
        .run(
            &mnemonic(),
            &store,
            &Collaborators {
                registrations: &registry,
                statuses: &exited,
            },
            &datum,
        )
        .unwrap();
    engine.apply(&store, &removal).unwrap();
    assert!(!dir.path().join("validator1").exists());
    assert_eq!(store.verify().unwrap(), 2);
}

#[test]
fn test_local_store_detects_copied_keystore() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalKeystoreStore::new(dir.path(), false).with_kdf_log_n(FAST_LOG_N);
    let keys = pairs(3, false);
    let datum = deposit_datum(&keys);
    let registry = InMemoryRegistry::default();
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let engine = engine(false);
    let outcome = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    engine.apply(&store, &outcome).unwrap();

    let name = "keystore-m_12381_3600_0_0_0.json";
    std::fs::copy(
        dir.path().join("validator0/keystores").join(name),
        dir.path().join("validator1/keystores").join(name),
    )
    .unwrap();

    let err = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateKeyDetected { .. }));
}

#[test]
fn test_database_sync_rows_open_with_printed_key() {
    let keys = pairs(3, false);
    let datum = deposit_datum(&keys);
    let registry = InMemoryRegistry::default();
    let statuses = InMemoryStatuses::default();
    let collaborators = Collaborators {
        registrations: &registry,
        statuses: &statuses,
    };
    let first = MemoryKeystoreStore::new(false);
    let decryption_key = first.decryption_key();

    // a second run with the same key produces rows the signer can still open
    let store =
        MemoryKeystoreStore::with_key(false, parse_decryption_key(&decryption_key).unwrap());
    let engine = engine(false);
    let outcome = engine.run(&mnemonic(), &store, &collaborators, &datum).unwrap();
    engine.apply(&store, &outcome).unwrap();

    let rows = store.export_database_records().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(validators_count(&rows), 2);
    for row in &rows {
        let secret = row.decrypt(&decryption_key).unwrap();
        assert_eq!(secret.public_key(), row.public_key);
    }

    let dir = tempfile::tempdir().unwrap();
    let first_validator = public_keys_for_validator(&rows, 0);
    assert_eq!(first_validator.len(), 2);
    assert!(write_validator_keys(dir.path(), &first_validator, "http://signer:9000").unwrap());
    assert!(!write_validator_keys(dir.path(), &first_validator, "http://signer:9000").unwrap());
}
