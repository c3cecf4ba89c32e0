//! Threshold sharing of validator keys among a committee.

pub mod committee;
pub mod envelope;
pub mod filename;
pub mod shamir;

pub use committee::{
    COMMITTEE_PROOF_MESSAGE, Committee, CommitteeFileProof, CommitteePolicy, CommitteeShareSet,
    MemberId, MemberShares, Shard, ThresholdRule, aggregate_shard_public_key,
    reconstruct_public_keys, shard_public_keys, split_for_committee, verify_committee_file,
    verify_committee_public_keys, verify_shard_public_keys, write_committee_shares,
};
pub use envelope::{
    Envelope, RecipientKey, RecipientSecret, decrypt_envelope, encrypt_for_recipient,
};
pub use filename::{ShareFileMetadata, allocation_name, parse_share_filename, share_filename};
pub use shamir::{lagrange_coefficients, public_key_of_scalar, reconstruct_public_key, split};

use crate::error::EngineResult;
use crate::types::PublicKey;

/// Sum of public keys, as used to check one operator shard.
pub fn aggregate_public_key(keys: &[PublicKey]) -> EngineResult<PublicKey> {
    crate::bls::aggregate_public_keys(keys)
}
