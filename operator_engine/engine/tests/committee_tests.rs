use std::collections::BTreeMap;
use std::fs;

use operator_engine::derivation::{KeyPair, Mnemonic, derive_keypairs};
use operator_engine::error::EngineError;
use operator_engine::shares::{
    COMMITTEE_PROOF_MESSAGE, Committee, RecipientSecret, aggregate_public_key,
    aggregate_shard_public_key, decrypt_envelope, parse_share_filename, shard_public_keys,
    split_for_committee, verify_committee_file, verify_committee_public_keys,
    verify_shard_public_keys, write_committee_shares,
};
use operator_engine::types::PublicKey;

const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";
const OPERATOR: &str = "0x5FC60576B92C5Ce5C341c43E3B2866eb9E0cddD1";

const MEMBERS: [&str; 6] = ["alice", "bob", "carol", "dave", "erin", "frank"];

fn fixture(name: &str, ext: &str) -> String {
    fs::read_to_string(format!(
        "{}/tests/fixtures/committee/{name}.{ext}",
        env!("CARGO_MANIFEST_DIR")
    ))
    .unwrap()
}

fn committee() -> Committee {
    let lists: Vec<Vec<String>> = MEMBERS
        .chunks(3)
        .map(|shard| shard.iter().map(|name| fixture(name, "pub")).collect())
        .collect();
    Committee::from_recipient_lists(&lists).unwrap()
}

fn keypairs(count: u32) -> Vec<KeyPair> {
    let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
    derive_keypairs(&mnemonic, &(0..count).collect::<Vec<_>>(), false).unwrap()
}

/// Writes the share files, then decrypts each one with its member's key.
/// Returns shard position -> member position -> share public keys.
fn decrypted_member_keys(
    pairs: &[KeyPair],
) -> BTreeMap<u32, BTreeMap<u32, Vec<PublicKey>>> {
    let committee = committee();
    let set = split_for_committee(&committee, pairs).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let written = write_committee_shares(&set, dir.path(), OPERATOR, "7").unwrap();
    assert_eq!(written.len(), MEMBERS.len());

    let mut keys: BTreeMap<u32, BTreeMap<u32, Vec<PublicKey>>> = BTreeMap::new();
    for member in &set.members {
        let handle = member.member.handle();
        let path = &written[handle];
        let meta = parse_share_filename(&path.to_string_lossy()).unwrap();
        assert_eq!(meta.member_handle, handle);
        assert_eq!(meta.allocation_name, "5fc60576-7");

        let secret = RecipientSecret::parse_pem(&fixture(handle, "pem")).unwrap();
        let plaintext = decrypt_envelope(&secret, &fs::read(path).unwrap()).unwrap();
        let text = String::from_utf8(plaintext.to_vec()).unwrap();
        assert_eq!(text, member.plaintext().as_str());

        keys.entry(member.shard_index as u32)
            .or_default()
            .insert(member.member_index as u32, shard_public_keys(&text).unwrap());
    }
    keys
}

#[test]
fn test_committee_shares_rebuild_deposit_keys() {
    let pairs = keypairs(2);
    let deposit_keys: Vec<PublicKey> = pairs.iter().map(|p| p.public_key).collect();
    let members = decrypted_member_keys(&pairs);

    assert_eq!(members.len(), 2);
    assert!(members.values().all(|shard| shard.len() == 3));
    verify_committee_public_keys(&deposit_keys, &members).unwrap();
}

#[test]
fn test_member_majority_is_enough() {
    let pairs = keypairs(2);
    let deposit_keys: Vec<PublicKey> = pairs.iter().map(|p| p.public_key).collect();
    let mut members = decrypted_member_keys(&pairs);

    // drop a different member from each shard
    members.get_mut(&0).unwrap().remove(&0);
    members.get_mut(&1).unwrap().remove(&2);
    verify_committee_public_keys(&deposit_keys, &members).unwrap();

    // a single member per shard is below threshold
    members.get_mut(&0).unwrap().remove(&1);
    assert!(matches!(
        verify_committee_public_keys(&deposit_keys, &members),
        Err(EngineError::InvalidInput(_))
    ));
}

#[test]
fn test_shard_level_verification() {
    let pairs = keypairs(3);
    let deposit_keys: Vec<PublicKey> = pairs.iter().map(|p| p.public_key).collect();
    let members = decrypted_member_keys(&pairs);

    let shards: BTreeMap<u32, Vec<PublicKey>> = members
        .iter()
        .map(|(shard, member_keys)| {
            (*shard, operator_engine::shares::reconstruct_public_keys(member_keys).unwrap())
        })
        .collect();
    verify_shard_public_keys(&deposit_keys, &shards).unwrap();

    let mut reordered = deposit_keys.clone();
    reordered.swap(0, 2);
    assert!(verify_shard_public_keys(&reordered, &shards).is_err());
    assert!(verify_shard_public_keys(&deposit_keys[..2], &shards).is_err());
}

#[test]
fn test_aggregate_of_shard_file() {
    let pairs = keypairs(2);
    let committee = committee();
    let set = split_for_committee(&committee, &pairs).unwrap();
    let alice = set.for_member("alice").unwrap();

    let aggregate = aggregate_shard_public_key(&alice.plaintext()).unwrap();
    assert_eq!(aggregate, aggregate_public_key(&alice.public_keys()).unwrap());
    assert!(set.for_member("mallory").is_none());
}

#[test]
fn test_wrong_member_key_cannot_open_file() {
    let pairs = keypairs(1);
    let set = split_for_committee(&committee(), &pairs).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let written = write_committee_shares(&set, dir.path(), OPERATOR, "1").unwrap();

    let bob = RecipientSecret::parse_pem(&fixture("bob", "pem")).unwrap();
    let alice_file = fs::read(&written["alice"]).unwrap();
    assert!(matches!(
        decrypt_envelope(&bob, &alice_file),
        Err(EngineError::CryptoError(_))
    ));
}

#[test]
fn test_committee_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("committee.json");
    let lists: Vec<Vec<String>> = vec![
        vec![fixture("alice", "pub"), fixture("bob", "pub")],
        vec![fixture("carol", "pub"), fixture("dave", "pub")],
    ];
    fs::write(&path, serde_json::to_string(&lists).unwrap()).unwrap();

    let committee = Committee::from_json_file(&path).unwrap();
    assert_eq!(committee.shards().len(), 2);
    assert_eq!(committee.member_count(), 4);
    assert_eq!(committee.shard_threshold(), 2);
}

#[test]
fn test_verify_committee_file() {
    let pairs = keypairs(2);
    let set = split_for_committee(&committee(), &pairs).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let written = write_committee_shares(&set, dir.path(), OPERATOR, "7").unwrap();

    let carol = set.for_member("carol").unwrap();
    let secret = RecipientSecret::parse_pem(&fixture("carol", "pem")).unwrap();
    let carol_keys = carol.public_keys();
    let proof =
        verify_committee_file(&written["carol"], &secret, Some(carol_keys.as_slice())).unwrap();
    assert_eq!(proof.public_keys, carol.public_keys());
    assert!(operator_engine::bls::fast_aggregate_verify(
        &proof.public_keys,
        &COMMITTEE_PROOF_MESSAGE,
        &proof.aggregate_signature
    ));

    // another member's keys are rejected
    let dave_keys = set.for_member("dave").unwrap().public_keys();
    assert!(matches!(
        verify_committee_file(&written["carol"], &secret, Some(dave_keys.as_slice())),
        Err(EngineError::InvalidInput(_))
    ));
}

#[test]
fn test_tampered_committee_file_fails() {
    let pairs = keypairs(1);
    let set = split_for_committee(&committee(), &pairs).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let written = write_committee_shares(&set, dir.path(), OPERATOR, "7").unwrap();

    let path = &written["erin"];
    let mut bytes = fs::read(path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    fs::write(path, &bytes).unwrap();

    let secret = RecipientSecret::parse_pem(&fixture("erin", "pem")).unwrap();
    assert!(matches!(
        verify_committee_file(path, &secret, None),
        Err(EngineError::CryptoError(_))
    ));

    let frank = RecipientSecret::parse_pem(&fixture("frank", "pem")).unwrap();
    assert!(matches!(
        verify_committee_file(&written["frank"], &frank, None),
        Ok(_)
    ));
}
