use operator_engine::derivation::{
    DerivationPath, KeyDeriver, Mnemonic, PathScheme, derive, derive_keypairs, find_index,
    index_from_path, public_key_of,
};
use operator_engine::types::PublicKey;

const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

const INDEX_0: &str = "0xa39882700ed7f72fcdbac07081b7c0c912cb8647ed8494926e6c9c2fc1a7415c7c60e3afcc3d3278fe25b50b851c3ad5";
const INDEX_1: &str = "0x8efdefbccd6479b9953a5ec6416e6d48201865968567379b213040dbf0be7efa00d66343c21a7e801d6bfd7403cfcfa7";
const LEGACY_INDEX_1: &str = "0xb93492a681580ce506a46459d2bbbccdbc8be39cf7adafaf262c02544a7c481c8c95950f7b266b0fa8ab30758ccf4623";

fn mnemonic() -> Mnemonic {
    Mnemonic::parse(TEST_MNEMONIC).unwrap()
}

#[test]
fn test_known_public_keys() {
    let mnemonic = mnemonic();
    let key = derive(&mnemonic, 0, false).unwrap();
    assert_eq!(key.path.to_string(), "m/12381/3600/0/0/0");
    assert_eq!(public_key_of(&key).to_hex(), INDEX_0);

    assert_eq!(public_key_of(&derive(&mnemonic, 1, false).unwrap()).to_hex(), INDEX_1);
    assert_eq!(
        public_key_of(&derive(&mnemonic, 1, true).unwrap()).to_hex(),
        LEGACY_INDEX_1
    );
}

#[test]
fn test_legacy_and_current_agree_at_zero() {
    let mnemonic = mnemonic();
    let legacy = public_key_of(&derive(&mnemonic, 0, true).unwrap());
    assert_eq!(legacy.to_hex(), INDEX_0);
}

#[test]
fn test_batch_derivation_matches_single() {
    let mnemonic = mnemonic();
    let pairs = derive_keypairs(&mnemonic, &[0, 1], false).unwrap();
    assert_eq!(pairs[0].public_key.to_hex(), INDEX_0);
    assert_eq!(pairs[1].public_key.to_hex(), INDEX_1);
    assert_eq!(pairs[1].private_key.public_key(), pairs[1].public_key);
}

#[test]
fn test_find_index_of_known_key() {
    let mnemonic = mnemonic();
    let target = PublicKey::from_hex(LEGACY_INDEX_1).unwrap();
    assert_eq!(find_index(&mnemonic, &target, true, 4).unwrap(), Some(1));
    assert_eq!(find_index(&mnemonic, &target, false, 4).unwrap(), None);
}

#[test]
fn test_paths_round_trip_through_index() {
    let deriver = KeyDeriver::new(&mnemonic(), true).unwrap();
    let path = deriver.signing_key(7).path;
    assert_eq!(path, DerivationPath::new(7, PathScheme::Legacy));
    assert_eq!(index_from_path(&path.to_string(), true).unwrap(), 7);
    assert!(index_from_path(&path.to_string(), false).is_err());
}
