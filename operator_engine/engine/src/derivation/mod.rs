//! Mnemonic key derivation.
//!
//! BIP-39 seed (empty passphrase) -> EIP-2333 master key -> EIP-2334 path.
//! Derivation is deterministic: the same mnemonic, index and scheme always
//! yield the same key, which is what lets reconciliation regenerate keys
//! after a restart.

pub mod path;

use rayon::prelude::*;
use tracing::debug;
use zeroize::Zeroizing;

use crate::bls::SecretKey;
use crate::error::{EngineError, EngineResult};
use crate::types::PublicKey;

pub use path::{DerivationPath, PathScheme, index_from_path};

/// Number of words in newly generated mnemonics (256 bits of entropy).
pub const MNEMONIC_WORD_COUNT: usize = 24;

/// Validated BIP-39 mnemonic. Never persisted.
#[derive(Clone)]
pub struct Mnemonic(bip39::Mnemonic);

impl Mnemonic {
    /// Validates words and checksum. Input is trimmed, lower-cased and
    /// whitespace-normalized first.
    pub fn parse(phrase: &str) -> EngineResult<Self> {
        let normalized = normalize_phrase(phrase);
        bip39::Mnemonic::parse(normalized.as_str())
            .map(Self)
            .map_err(|e| EngineError::InvalidMnemonic(e.to_string()))
    }

    pub fn phrase(&self) -> Zeroizing<String> {
        Zeroizing::new(self.0.to_string())
    }

    pub fn seed(&self) -> Zeroizing<[u8; 64]> {
        Zeroizing::new(self.0.to_seed(""))
    }
}

impl std::fmt::Debug for Mnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mnemonic")
            .field("words", &self.0.word_count())
            .field("phrase", &"[REDACTED]")
            .finish()
    }
}

fn normalize_phrase(phrase: &str) -> Zeroizing<String> {
    Zeroizing::new(
        phrase
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Key at one derivation path.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub path: DerivationPath,
    pub key: SecretKey,
}

/// Derived key with its position in the derivation sequence.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub index: u32,
    pub public_key: PublicKey,
    pub private_key: SecretKey,
}

/// Holds the master key of one mnemonic so batches do not repeat the seed stretch.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    master: SecretKey,
    scheme: PathScheme,
}

impl KeyDeriver {
    pub fn new(mnemonic: &Mnemonic, legacy: bool) -> EngineResult<Self> {
        let seed = mnemonic.seed();
        Ok(Self {
            master: SecretKey::derive_master(&seed[..])?,
            scheme: PathScheme::from_legacy_flag(legacy),
        })
    }

    pub fn scheme(&self) -> PathScheme {
        self.scheme
    }

    pub fn signing_key(&self, index: u32) -> SigningKey {
        let path = DerivationPath::new(index, self.scheme);
        let key = path
            .nodes()
            .iter()
            .fold(self.master.clone(), |parent, node| parent.derive_child(*node));
        SigningKey { path, key }
    }

    pub fn keypair(&self, index: u32) -> KeyPair {
        let signing_key = self.signing_key(index);
        KeyPair {
            index,
            public_key: signing_key.key.public_key(),
            private_key: signing_key.key,
        }
    }

    /// Derives in parallel; output follows `indexes` order.
    pub fn keypairs(&self, indexes: &[u32]) -> Vec<KeyPair> {
        indexes.par_iter().map(|index| self.keypair(*index)).collect()
    }
}

pub fn derive(mnemonic: &Mnemonic, index: u32, legacy: bool) -> EngineResult<SigningKey> {
    Ok(KeyDeriver::new(mnemonic, legacy)?.signing_key(index))
}

pub fn public_key_of(signing_key: &SigningKey) -> PublicKey {
    signing_key.key.public_key()
}

pub fn derive_keypairs(
    mnemonic: &Mnemonic,
    indexes: &[u32],
    legacy: bool,
) -> EngineResult<Vec<KeyPair>> {
    let deriver = KeyDeriver::new(mnemonic, legacy)?;
    debug!(count = indexes.len(), "deriving keypairs");
    Ok(deriver.keypairs(indexes))
}

/// Linear search for the derivation index of `public_key` below `limit`.
pub fn find_index(
    mnemonic: &Mnemonic,
    public_key: &PublicKey,
    legacy: bool,
    limit: u32,
) -> EngineResult<Option<u32>> {
    let deriver = KeyDeriver::new(mnemonic, legacy)?;
    Ok((0..limit).find(|index| deriver.keypair(*index).public_key == *public_key))
}

/// Word lists selectable by lowercase name.
pub fn language_by_name(name: &str) -> EngineResult<bip39::Language> {
    use bip39::Language;

    let language = match name.trim().to_lowercase().replace('-', "_").as_str() {
        "english" => Language::English,
        "chinese_simplified" => Language::SimplifiedChinese,
        "chinese_traditional" => Language::TraditionalChinese,
        "czech" => Language::Czech,
        "french" => Language::French,
        "italian" => Language::Italian,
        "japanese" => Language::Japanese,
        "korean" => Language::Korean,
        "portuguese" => Language::Portuguese,
        "spanish" => Language::Spanish,
        other => {
            return Err(EngineError::InvalidInput(format!(
                "unsupported mnemonic language '{other}'"
            )));
        }
    };
    Ok(language)
}

pub fn generate_new_mnemonic(language: &str) -> EngineResult<Mnemonic> {
    let language = language_by_name(language)?;
    bip39::Mnemonic::generate_in(language, MNEMONIC_WORD_COUNT)
        .map(Mnemonic)
        .map_err(|e| EngineError::CryptoError(format!("mnemonic generation failed: {e}")))
}

/// True when the operator typed back the same phrase, ignoring case and spacing.
pub fn confirm_mnemonic(mnemonic: &Mnemonic, typed: &str) -> bool {
    *normalize_phrase(typed) == *mnemonic.phrase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

    #[test]
    fn test_rejects_bad_checksum() {
        let err = Mnemonic::parse("test test test test test test test test test test test test")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidMnemonic(_)));
        assert!(Mnemonic::parse("not a real mnemonic at all").is_err());
    }

    #[test]
    fn test_parse_normalizes_input() {
        let mnemonic =
            Mnemonic::parse("  TEST test  test test test test test test test test test JUNK ")
                .unwrap();
        assert_eq!(mnemonic.phrase().as_str(), TEST_MNEMONIC);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        let first = public_key_of(&derive(&mnemonic, 3, false).unwrap());
        let second = public_key_of(&derive(&mnemonic, 3, false).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_schemes_coincide_only_at_zero() {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        let current = KeyDeriver::new(&mnemonic, false).unwrap();
        let legacy = KeyDeriver::new(&mnemonic, true).unwrap();
        assert_eq!(current.keypair(0).public_key, legacy.keypair(0).public_key);
        assert_ne!(current.keypair(1).public_key, legacy.keypair(1).public_key);
        assert_eq!(legacy.signing_key(1).path.to_string(), "m/12381/3600/0/0/1");
    }

    #[test]
    fn test_parallel_keypairs_keep_order() {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        let pairs = derive_keypairs(&mnemonic, &[4, 0, 2], false).unwrap();
        let indexes: Vec<u32> = pairs.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![4, 0, 2]);
        let deriver = KeyDeriver::new(&mnemonic, false).unwrap();
        assert_eq!(pairs[0].public_key, deriver.keypair(4).public_key);
    }

    #[test]
    fn test_find_index() {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        let target = KeyDeriver::new(&mnemonic, false).unwrap().keypair(6).public_key;
        assert_eq!(find_index(&mnemonic, &target, false, 10).unwrap(), Some(6));
        assert_eq!(find_index(&mnemonic, &target, false, 5).unwrap(), None);
    }

    #[test]
    fn test_generate_and_confirm() {
        let mnemonic = generate_new_mnemonic("english").unwrap();
        let phrase = mnemonic.phrase();
        assert_eq!(phrase.split(' ').count(), MNEMONIC_WORD_COUNT);
        assert!(confirm_mnemonic(&mnemonic, &phrase.to_uppercase()));
        assert!(!confirm_mnemonic(&mnemonic, TEST_MNEMONIC));
        assert!(generate_new_mnemonic("klingon").is_err());
    }
}
