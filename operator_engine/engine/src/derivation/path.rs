use std::fmt;

use crate::error::{EngineError, EngineResult};

pub const PURPOSE: u32 = 12381;
pub const COIN_TYPE: u32 = 3600;

/// Which path component carries the validator index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathScheme {
    /// `m/12381/3600/{index}/0/0`
    Current,
    /// `m/12381/3600/0/0/{index}`, kept for pre-existing deployments.
    Legacy,
}

impl PathScheme {
    pub fn from_legacy_flag(legacy: bool) -> Self {
        if legacy {
            PathScheme::Legacy
        } else {
            PathScheme::Current
        }
    }

    pub fn other(self) -> Self {
        match self {
            PathScheme::Current => PathScheme::Legacy,
            PathScheme::Legacy => PathScheme::Current,
        }
    }
}

/// EIP-2334 signing key path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    pub index: u32,
    pub scheme: PathScheme,
}

impl DerivationPath {
    pub fn new(index: u32, scheme: PathScheme) -> Self {
        Self { index, scheme }
    }

    pub fn nodes(&self) -> [u32; 5] {
        match self.scheme {
            PathScheme::Current => [PURPOSE, COIN_TYPE, self.index, 0, 0],
            PathScheme::Legacy => [PURPOSE, COIN_TYPE, 0, 0, self.index],
        }
    }

    /// Parses a stored path and recovers the index under the given scheme.
    pub fn parse(path: &str, scheme: PathScheme) -> EngineResult<Self> {
        let invalid = || EngineError::InvalidInput(format!("invalid derivation path '{path}'"));

        let mut parts = path.trim().split('/');
        if parts.next() != Some("m") {
            return Err(invalid());
        }
        let nodes = parts
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<EngineResult<Vec<_>>>()?;
        if nodes.len() != 5 || nodes[0] != PURPOSE || nodes[1] != COIN_TYPE {
            return Err(invalid());
        }

        let parsed = Self {
            index: match scheme {
                PathScheme::Current => nodes[2],
                PathScheme::Legacy => nodes[4],
            },
            scheme,
        };
        // a path written under the other scheme does not round-trip
        if parsed.nodes()[..] != nodes[..] {
            return Err(invalid());
        }
        Ok(parsed)
    }
}

/// Index recorded in a stored keystore path.
pub fn index_from_path(path: &str, legacy: bool) -> EngineResult<u32> {
    DerivationPath::parse(path, PathScheme::from_legacy_flag(legacy)).map(|p| p.index)
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [purpose, coin, a, b, c] = self.nodes();
        write!(f, "m/{purpose}/{coin}/{a}/{b}/{c}")
    }
}
