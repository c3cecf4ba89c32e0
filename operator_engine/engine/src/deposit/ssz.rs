//! SSZ hash-tree-roots for the handful of containers deposits touch.

use sha2::{Digest, Sha256};

use crate::types::{Bytes32, Bytes4, Gwei, PublicKey, SignatureBytes};

pub const DOMAIN_DEPOSIT: [u8; 4] = [0x03, 0x00, 0x00, 0x00];

type Chunk = [u8; 32];

const ZERO_CHUNK: Chunk = [0u8; 32];

fn hash_pair(left: &Chunk, right: &Chunk) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Merkleizes chunks, padding with zero chunks to the next power of two.
fn merkleize(chunks: &[Chunk]) -> Chunk {
    let width = chunks.len().next_power_of_two().max(1);
    let mut layer: Vec<Chunk> = chunks.to_vec();
    layer.resize(width, ZERO_CHUNK);
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    layer[0]
}

fn pack_bytes(bytes: &[u8]) -> Vec<Chunk> {
    bytes
        .chunks(32)
        .map(|piece| {
            let mut chunk = ZERO_CHUNK;
            chunk[..piece.len()].copy_from_slice(piece);
            chunk
        })
        .collect()
}

fn uint64_chunk(value: u64) -> Chunk {
    let mut chunk = ZERO_CHUNK;
    chunk[..8].copy_from_slice(&value.to_le_bytes());
    chunk
}

fn public_key_root(public_key: &PublicKey) -> Chunk {
    merkleize(&pack_bytes(public_key.as_bytes()))
}

fn signature_root(signature: &SignatureBytes) -> Chunk {
    merkleize(&pack_bytes(signature.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct DepositMessage {
    pub public_key: PublicKey,
    pub withdrawal_credentials: Bytes32,
    pub amount: Gwei,
}

impl DepositMessage {
    pub fn hash_tree_root(&self) -> Bytes32 {
        Bytes32(merkleize(&[
            public_key_root(&self.public_key),
            self.withdrawal_credentials.0,
            uint64_chunk(self.amount),
        ]))
    }
}

#[derive(Debug, Clone)]
pub struct DepositData {
    pub public_key: PublicKey,
    pub withdrawal_credentials: Bytes32,
    pub amount: Gwei,
    pub signature: SignatureBytes,
}

impl DepositData {
    pub fn hash_tree_root(&self) -> Bytes32 {
        Bytes32(merkleize(&[
            public_key_root(&self.public_key),
            self.withdrawal_credentials.0,
            uint64_chunk(self.amount),
            signature_root(&self.signature),
        ]))
    }
}

fn fork_data_root(fork_version: &Bytes4, genesis_validators_root: &Bytes32) -> Chunk {
    let mut version = ZERO_CHUNK;
    version[..4].copy_from_slice(fork_version.as_bytes());
    hash_pair(&version, &genesis_validators_root.0)
}

/// Deposits are always signed against a zero genesis validators root.
pub fn compute_deposit_domain(fork_version: &Bytes4) -> Bytes32 {
    let root = fork_data_root(fork_version, &Bytes32(ZERO_CHUNK));
    let mut domain = ZERO_CHUNK;
    domain[..4].copy_from_slice(&DOMAIN_DEPOSIT);
    domain[4..].copy_from_slice(&root[..28]);
    Bytes32(domain)
}

pub fn compute_signing_root(object_root: &Bytes32, domain: &Bytes32) -> Bytes32 {
    Bytes32(hash_pair(&object_root.0, &domain.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_deposit_domain() {
        let domain = compute_deposit_domain(&Bytes4([0, 0, 0, 0]));
        assert_eq!(
            domain.to_hex(),
            "0x03000000f5a5fd42d16a20302798ef6ed309979b43003d2320d9f0e8ea9831a9"
        );
    }

    #[test]
    fn test_deposit_message_and_signing_root() {
        let message = DepositMessage {
            public_key: PublicKey::from_hex("0xa39882700ed7f72fcdbac07081b7c0c912cb8647ed8494926e6c9c2fc1a7415c7c60e3afcc3d3278fe25b50b851c3ad5").unwrap(),
            withdrawal_credentials: Bytes32::from_hex("0x0100000000000000000000002296e122c1a20fca3cac3371357bdad3be0df079").unwrap(),
            amount: 32_000_000_000,
        };
        let root = message.hash_tree_root();
        assert_eq!(
            root.to_hex(),
            "0x7f6a8fbfecb09f811dcbb5424c29dfa89a24d52b95e2bf95e336a6e8c9d0f9e1"
        );
        let signing_root = compute_signing_root(&root, &compute_deposit_domain(&Bytes4([0; 4])));
        assert_eq!(
            signing_root.to_hex(),
            "0x272869d903c891910292e5190eff4b04680b38837311cb89c4062d8d9a614fca"
        );
    }

    #[test]
    fn test_merkleize_pads_to_power_of_two() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &ZERO_CHUNK));
        assert_eq!(merkleize(&[a, b, c]), expected);
    }
}
