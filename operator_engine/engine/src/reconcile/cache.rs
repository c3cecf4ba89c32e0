use std::collections::HashMap;
use std::ops::Range;

use tracing::debug;

use crate::derivation::{KeyDeriver, KeyPair, Mnemonic, PathScheme};
use crate::error::{EngineError, EngineResult};
use crate::types::PublicKey;

/// Derived keys memoized for a single reconciliation run.
///
/// Dropped with the run; nothing outlives it.
#[derive(Debug)]
pub struct RunCache {
    deriver: KeyDeriver,
    by_index: HashMap<u32, KeyPair>,
    by_key: HashMap<PublicKey, u32>,
}

impl RunCache {
    pub fn new(deriver: KeyDeriver) -> Self {
        Self {
            deriver,
            by_index: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn from_mnemonic(mnemonic: &Mnemonic, legacy: bool) -> EngineResult<Self> {
        Ok(Self::new(KeyDeriver::new(mnemonic, legacy)?))
    }

    pub fn scheme(&self) -> PathScheme {
        self.deriver.scheme()
    }

    /// Derives every index in `range` not yet cached, in parallel.
    pub fn prefetch(&mut self, range: Range<u32>) {
        let wanted: Vec<u32> = range.filter(|i| !self.by_index.contains_key(i)).collect();
        if wanted.is_empty() {
            return;
        }
        debug!(count = wanted.len(), "deriving keys for run cache");
        for pair in self.deriver.keypairs(&wanted) {
            self.by_key.insert(pair.public_key, pair.index);
            self.by_index.insert(pair.index, pair);
        }
    }

    pub fn keypair(&mut self, index: u32) -> &KeyPair {
        let deriver = &self.deriver;
        let by_key = &mut self.by_key;
        self.by_index.entry(index).or_insert_with(|| {
            let pair = deriver.keypair(index);
            by_key.insert(pair.public_key, index);
            pair
        })
    }

    pub fn public_key(&mut self, index: u32) -> PublicKey {
        self.keypair(index).public_key
    }

    pub fn index_of(&self, public_key: &PublicKey) -> Option<u32> {
        self.by_key.get(public_key).copied()
    }

    /// Cached keypairs for `keys`, in the same order.
    pub fn keypairs_for(&self, keys: &[PublicKey]) -> EngineResult<Vec<KeyPair>> {
        keys.iter()
            .map(|key| {
                self.index_of(key)
                    .and_then(|index| self.by_index.get(&index))
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::InvalidInput(format!("{key} was not derived in this run"))
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

    #[test]
    fn test_cache_matches_direct_derivation() {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        let deriver = KeyDeriver::new(&mnemonic, false).unwrap();
        let mut cache = RunCache::new(deriver.clone());

        cache.prefetch(0..4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.public_key(2), deriver.keypair(2).public_key);
        assert_eq!(cache.public_key(7), deriver.keypair(7).public_key);
        assert_eq!(cache.len(), 5);

        let key = cache.public_key(3);
        assert_eq!(cache.index_of(&key), Some(3));
        assert_eq!(cache.keypairs_for(&[key]).unwrap()[0].index, 3);
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        let mnemonic = Mnemonic::parse(TEST_MNEMONIC).unwrap();
        let cache = RunCache::from_mnemonic(&mnemonic, false).unwrap();
        assert!(cache.is_empty());
        assert!(cache.keypairs_for(&[PublicKey([1u8; 48])]).is_err());
    }
}
