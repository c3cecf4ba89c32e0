//! Two-level committee sharing of validator keys.
//!
//! Each validator key is split (n, n) across the committee's shards, then each
//! shard's share is split among that shard's members with a simple majority
//! threshold. A member's file holds one share per validator key, comma-joined
//! in keypair order.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use bls12_381::Scalar;
use rand::rngs::OsRng;
use serde::Deserialize;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::envelope::{RecipientKey, RecipientSecret, decrypt_envelope, encrypt_for_recipient};
use super::filename::{allocation_name, share_filename};
use super::shamir::{
    public_key_of_scalar, reconstruct_public_key, scalar_from_decimal, scalar_to_decimal, split,
};
use crate::bls::{self, SecretKey};
use crate::derivation::KeyPair;
use crate::error::{EngineError, EngineResult};
use crate::types::{PublicKey, SignatureBytes};

/// Committee member identified by their RSA public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberId {
    key: String,
    handle: String,
}

impl MemberId {
    /// Takes the handle from the last whitespace-separated token (the OpenSSH comment).
    pub fn new(rsa_public_key: &str) -> EngineResult<Self> {
        let key = rsa_public_key.trim();
        if key.starts_with("-----BEGIN") {
            return Err(EngineError::InvalidInput(
                "PEM member keys need an explicit handle".into(),
            ));
        }
        let handle = key
            .split_whitespace()
            .last()
            .ok_or_else(|| EngineError::InvalidInput("empty committee member key".into()))?;
        Self::with_handle(key, handle)
    }

    pub fn with_handle(rsa_public_key: &str, handle: &str) -> EngineResult<Self> {
        let key = rsa_public_key.trim();
        let handle = handle.trim();
        if key.is_empty() || handle.is_empty() || handle.contains(['/', '\\']) {
            return Err(EngineError::InvalidInput(format!(
                "invalid committee member handle '{handle}'"
            )));
        }
        RecipientKey::parse(key)?;
        Ok(Self {
            key: key.to_string(),
            handle: handle.to_string(),
        })
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn public_key_text(&self) -> &str {
        &self.key
    }
}

/// One organization of the committee.
#[derive(Debug, Clone)]
pub struct Shard {
    members: Vec<MemberId>,
}

impl Shard {
    pub fn new(members: Vec<MemberId>) -> EngineResult<Self> {
        if members.len() < 2 {
            return Err(EngineError::InvalidShareParameters(format!(
                "a shard needs at least 2 members, got {}",
                members.len()
            )));
        }
        Ok(Self { members })
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }
}

/// How many of `n` parties must cooperate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdRule {
    All,
    Majority,
}

impl ThresholdRule {
    pub fn threshold(&self, parties: usize) -> usize {
        match self {
            ThresholdRule::All => parties,
            ThresholdRule::Majority => parties / 2 + 1,
        }
    }
}

/// Threshold rules for the two sharing levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitteePolicy {
    pub shard_rule: ThresholdRule,
    pub member_rule: ThresholdRule,
}

impl Default for CommitteePolicy {
    fn default() -> Self {
        Self {
            shard_rule: ThresholdRule::All,
            member_rule: ThresholdRule::Majority,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Committee {
    shards: Vec<Shard>,
    policy: CommitteePolicy,
}

impl Committee {
    pub fn new(shards: Vec<Shard>) -> EngineResult<Self> {
        Self::with_policy(shards, CommitteePolicy::default())
    }

    pub fn with_policy(shards: Vec<Shard>, policy: CommitteePolicy) -> EngineResult<Self> {
        if shards.len() < 2 {
            return Err(EngineError::InvalidShareParameters(format!(
                "a committee needs at least 2 shards, got {}",
                shards.len()
            )));
        }
        let mut handles = HashSet::new();
        for member in shards.iter().flat_map(|shard| shard.members()) {
            if !handles.insert(member.handle()) {
                return Err(EngineError::InvalidInput(format!(
                    "committee member '{}' appears more than once",
                    member.handle()
                )));
            }
        }
        Ok(Self { shards, policy })
    }

    /// Builds from nested lists of OpenSSH public key lines.
    pub fn from_recipient_lists(lists: &[Vec<String>]) -> EngineResult<Self> {
        let shards = lists
            .iter()
            .map(|members| {
                Shard::new(
                    members
                        .iter()
                        .map(|key| MemberId::new(key))
                        .collect::<EngineResult<Vec<_>>>()?,
                )
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Self::new(shards)
    }

    /// Reads a JSON file of the form `[["ssh-rsa ... handle", ...], ...]`.
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct CommitteeFile(Vec<Vec<String>>);

        let raw = fs::read_to_string(path)?;
        let parsed: CommitteeFile = serde_json::from_str(&raw)?;
        Self::from_recipient_lists(&parsed.0)
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn policy(&self) -> CommitteePolicy {
        self.policy
    }

    pub fn shard_threshold(&self) -> usize {
        self.policy.shard_rule.threshold(self.shards.len())
    }

    pub fn member_threshold(&self, shard: &Shard) -> usize {
        self.policy.member_rule.threshold(shard.members.len())
    }

    pub fn member_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.members.len()).sum()
    }
}

/// Shares held by one member, one per validator key.
#[derive(Clone)]
pub struct MemberShares {
    pub shard_index: usize,
    pub member_index: usize,
    pub member: MemberId,
    pub shares: Vec<Scalar>,
}

impl MemberShares {
    pub fn plaintext(&self) -> Zeroizing<String> {
        Zeroizing::new(
            self.shares
                .iter()
                .map(scalar_to_decimal)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.shares.iter().map(public_key_of_scalar).collect()
    }
}

impl std::fmt::Debug for MemberShares {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberShares")
            .field("shard_index", &self.shard_index)
            .field("member_index", &self.member_index)
            .field("member", &self.member.handle())
            .field("shares", &self.shares.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CommitteeShareSet {
    pub members: Vec<MemberShares>,
}

impl CommitteeShareSet {
    pub fn for_member(&self, handle: &str) -> Option<&MemberShares> {
        self.members.iter().find(|m| m.member.handle() == handle)
    }
}

pub fn split_for_committee(
    committee: &Committee,
    keypairs: &[KeyPair],
) -> EngineResult<CommitteeShareSet> {
    if keypairs.is_empty() {
        return Err(EngineError::InvalidInput("no keypairs to share".into()));
    }
    let mut rng = OsRng;

    let mut members: Vec<MemberShares> = committee
        .shards()
        .iter()
        .enumerate()
        .flat_map(|(shard_index, shard)| {
            shard
                .members()
                .iter()
                .enumerate()
                .map(move |(member_index, member)| MemberShares {
                    shard_index,
                    member_index,
                    member: member.clone(),
                    shares: Vec::with_capacity(keypairs.len()),
                })
        })
        .collect();

    for pair in keypairs {
        let secret = pair.private_key.to_scalar()?;
        let shard_shares = split(
            &secret,
            committee.shards().len(),
            committee.shard_threshold(),
            &mut rng,
        )?;

        let mut slot = 0;
        for (shard, shard_share) in committee.shards().iter().zip(shard_shares.iter()) {
            let member_shares = split(
                shard_share,
                shard.members().len(),
                committee.member_threshold(shard),
                &mut rng,
            )?;
            for member_share in member_shares {
                members[slot].shares.push(member_share);
                slot += 1;
            }
        }
        debug!(index = pair.index, "split validator key across committee");
    }

    info!(
        keys = keypairs.len(),
        shards = committee.shards().len(),
        members = committee.member_count(),
        "committee shares created"
    );
    Ok(CommitteeShareSet { members })
}

/// Encrypts every member's shares and writes one `.bin` file per member.
/// Returns member handle -> written path.
pub fn write_committee_shares(
    set: &CommitteeShareSet,
    dir: &Path,
    operator: &str,
    allocation_id: &str,
) -> EngineResult<BTreeMap<String, PathBuf>> {
    let allocation = allocation_name(operator, allocation_id)?;
    fs::create_dir_all(dir)?;

    let mut paths = BTreeMap::new();
    for member in &set.members {
        let recipient = RecipientKey::parse(member.member.public_key_text())?;
        let envelope = encrypt_for_recipient(&recipient, member.plaintext().as_bytes())?;
        let path = dir.join(share_filename(member.member.handle(), &allocation));
        fs::write(&path, envelope.to_bytes())?;
        debug!(member = member.member.handle(), path = %path.display(), "wrote share file");
        paths.insert(member.member.handle().to_string(), path);
    }
    Ok(paths)
}

/// Public keys of the shares inside a decrypted share file.
pub fn shard_public_keys(plaintext: &str) -> EngineResult<Vec<PublicKey>> {
    plaintext
        .split(',')
        .map(|value| scalar_from_decimal(value).map(|scalar| public_key_of_scalar(&scalar)))
        .collect()
}

/// Aggregate public key of all shares in a decrypted share file.
pub fn aggregate_shard_public_key(plaintext: &str) -> EngineResult<PublicKey> {
    bls::aggregate_public_keys(&shard_public_keys(plaintext)?)
}

/// Reconstructs per-key public keys from share public keys keyed by zero-based position.
pub fn reconstruct_public_keys(
    shares: &BTreeMap<u32, Vec<PublicKey>>,
) -> EngineResult<Vec<PublicKey>> {
    let count = shares
        .values()
        .next()
        .map(Vec::len)
        .ok_or_else(|| EngineError::InvalidInput("no share public keys supplied".into()))?;
    if let Some((position, keys)) = shares.iter().find(|(_, keys)| keys.len() != count) {
        return Err(EngineError::InvalidInput(format!(
            "position {position} supplied {} public keys, expected {count}",
            keys.len()
        )));
    }

    (0..count)
        .map(|i| {
            let points: BTreeMap<u64, PublicKey> = shares
                .iter()
                .map(|(position, keys)| (u64::from(*position) + 1, keys[i]))
                .collect();
            reconstruct_public_key(&points)
        })
        .collect()
}

/// Checks that share public keys reconstruct every deposit public key, in order.
pub fn verify_shard_public_keys(
    deposit_public_keys: &[PublicKey],
    shards: &BTreeMap<u32, Vec<PublicKey>>,
) -> EngineResult<()> {
    let reconstructed = reconstruct_public_keys(shards)?;
    if reconstructed.len() != deposit_public_keys.len() {
        return Err(EngineError::InvalidInput(format!(
            "shards cover {} keys, deposit data has {}",
            reconstructed.len(),
            deposit_public_keys.len()
        )));
    }
    for (i, (expected, actual)) in deposit_public_keys.iter().zip(&reconstructed).enumerate() {
        if expected != actual {
            return Err(EngineError::InvalidInput(format!(
                "failed to reconstruct public key with index {i} ({expected})"
            )));
        }
    }
    info!(count = reconstructed.len(), "shard public keys verified");
    Ok(())
}

/// Two-level check: member keys rebuild each shard's keys, shards rebuild the deposit keys.
pub fn verify_committee_public_keys(
    deposit_public_keys: &[PublicKey],
    members: &BTreeMap<u32, BTreeMap<u32, Vec<PublicKey>>>,
) -> EngineResult<()> {
    let shard_keys = members
        .iter()
        .map(|(shard, member_keys)| Ok((*shard, reconstruct_public_keys(member_keys)?)))
        .collect::<EngineResult<BTreeMap<_, _>>>()?;
    verify_shard_public_keys(deposit_public_keys, &shard_keys)
}

/// Message every share signs when a member proves their file opens.
pub const COMMITTEE_PROOF_MESSAGE: [u8; 32] = [0xab; 32];

/// Result of opening one member's share file.
#[derive(Debug, Clone)]
pub struct CommitteeFileProof {
    pub public_keys: Vec<PublicKey>,
    pub aggregate_signature: SignatureBytes,
}

/// Decrypts a member's share file, signs [`COMMITTEE_PROOF_MESSAGE`] with
/// every share and checks the aggregate signature against the share public
/// keys. When `expected` is given the shares must produce exactly those keys.
pub fn verify_committee_file(
    path: &Path,
    secret: &RecipientSecret,
    expected: Option<&[PublicKey]>,
) -> EngineResult<CommitteeFileProof> {
    let plaintext = decrypt_envelope(secret, &fs::read(path)?)?;
    let text = std::str::from_utf8(&plaintext).map_err(|_| {
        EngineError::InvalidInput(format!("{} does not hold share scalars", path.display()))
    })?;
    let secrets = text
        .split(',')
        .map(|value| scalar_from_decimal(value).and_then(|scalar| SecretKey::from_scalar(&scalar)))
        .collect::<EngineResult<Vec<_>>>()?;
    let public_keys: Vec<PublicKey> = secrets.iter().map(SecretKey::public_key).collect();

    if let Some(expected) = expected {
        if expected.len() != public_keys.len() {
            return Err(EngineError::InvalidInput(format!(
                "share file holds {} keys, expected {}",
                public_keys.len(),
                expected.len()
            )));
        }
        if let Some(i) = expected.iter().zip(&public_keys).position(|(e, a)| e != a) {
            return Err(EngineError::InvalidInput(format!(
                "share {i} does not match public key {}",
                expected[i]
            )));
        }
    }

    let signatures: Vec<SignatureBytes> = secrets
        .iter()
        .map(|key| key.sign(&COMMITTEE_PROOF_MESSAGE))
        .collect();
    let aggregate_signature = bls::aggregate_signatures(&signatures)?;
    if !bls::fast_aggregate_verify(&public_keys, &COMMITTEE_PROOF_MESSAGE, &aggregate_signature) {
        return Err(EngineError::InvalidSignature {
            public_key: bls::aggregate_public_keys(&public_keys)?.to_hex(),
        });
    }

    info!(shares = public_keys.len(), path = %path.display(), "committee file verified");
    Ok(CommitteeFileProof {
        public_keys,
        aggregate_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = include_str!("../../tests/fixtures/committee/alice.pub");
    const BOB: &str = include_str!("../../tests/fixtures/committee/bob.pub");
    const CAROL: &str = include_str!("../../tests/fixtures/committee/carol.pub");
    const DAVE: &str = include_str!("../../tests/fixtures/committee/dave.pub");
    const ERIN: &str = include_str!("../../tests/fixtures/committee/erin.pub");
    const FRANK: &str = include_str!("../../tests/fixtures/committee/frank.pub");

    fn members(keys: &[&str]) -> Vec<MemberId> {
        keys.iter().map(|k| MemberId::new(k).unwrap()).collect()
    }

    #[test]
    fn test_member_handle_is_last_token() {
        let member = MemberId::new(ALICE).unwrap();
        assert_eq!(member.handle(), "alice");
    }

    #[test]
    fn test_committee_validation() {
        let alice = MemberId::new(ALICE).unwrap();
        let bob = MemberId::new(BOB).unwrap();
        assert!(Shard::new(vec![alice.clone()]).is_err());

        let single = Shard::new(vec![alice.clone(), bob.clone()]).unwrap();
        assert!(Committee::new(vec![single.clone()]).is_err());

        let again = Shard::new(vec![alice, bob]).unwrap();
        assert!(Committee::new(vec![single, again]).is_err());
    }

    #[test]
    fn test_member_threshold_is_majority_by_default() {
        let small = Shard::new(members(&[ALICE, BOB])).unwrap();
        let large = Shard::new(members(&[CAROL, DAVE, ERIN, FRANK])).unwrap();
        let committee = Committee::new(vec![small, large]).unwrap();
        assert_eq!(committee.member_threshold(&committee.shards()[0]), 2);
        assert_eq!(committee.member_threshold(&committee.shards()[1]), 3);
    }

    #[test]
    fn test_member_threshold_follows_policy() {
        let policy = CommitteePolicy {
            shard_rule: ThresholdRule::All,
            member_rule: ThresholdRule::All,
        };
        let committee = Committee::with_policy(
            vec![
                Shard::new(members(&[ALICE, BOB, CAROL])).unwrap(),
                Shard::new(members(&[DAVE, ERIN, FRANK])).unwrap(),
            ],
            policy,
        )
        .unwrap();
        assert_eq!(committee.policy(), policy);
        for shard in committee.shards() {
            assert_eq!(committee.member_threshold(shard), 3);
        }
    }

    #[test]
    fn test_default_policy() {
        let shard = |a: &str, b: &str| {
            Shard::new(vec![MemberId::new(a).unwrap(), MemberId::new(b).unwrap()]).unwrap()
        };
        let committee = Committee::new(vec![shard(ALICE, BOB), shard(CAROL, DAVE)]).unwrap();
        assert_eq!(committee.shard_threshold(), 2);
        assert_eq!(committee.member_threshold(&committee.shards()[0]), 2);
        assert_eq!(ThresholdRule::Majority.threshold(5), 3);
        assert_eq!(ThresholdRule::All.threshold(5), 5);
    }

    #[test]
    fn test_plaintext_format() {
        let shares = MemberShares {
            shard_index: 0,
            member_index: 0,
            member: MemberId::new(ALICE).unwrap(),
            shares: vec![Scalar::from(5u64), Scalar::from(17u64)],
        };
        assert_eq!(shares.plaintext().as_str(), "5,17");
        assert_eq!(shard_public_keys("5,17").unwrap(), shares.public_keys());
    }

    #[test]
    fn test_reconstruct_requires_equal_lengths() {
        let mut shares = BTreeMap::new();
        shares.insert(0, vec![public_key_of_scalar(&Scalar::from(1u64))]);
        shares.insert(1, vec![]);
        assert!(reconstruct_public_keys(&shares).is_err());
        assert!(reconstruct_public_keys(&BTreeMap::new()).is_err());
    }
}
