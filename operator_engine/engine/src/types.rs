//! Shared data types for the operator engine: hex byte strings, containers,
//! validator statuses and deposit records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EngineError, EngineResult};

/// Deposit amounts are signed in gwei and published in wei.
pub type Gwei = u64;

pub const WEI_PER_GWEI: u128 = 1_000_000_000;

fn decode_hex_fixed<const N: usize>(value: &str, label: &str) -> EngineResult<[u8; N]> {
    let trimmed = value.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(stripped)
        .map_err(|e| EngineError::InvalidInput(format!("{label}: {e}")))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        EngineError::InvalidInput(format!("{label}: expected {N} bytes, got {len}"))
    })
}

macro_rules! hex_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr, $label:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            /// Parses hex with or without a `0x` prefix, in any case.
            pub fn from_hex(value: &str) -> EngineResult<Self> {
                decode_hex_fixed::<$len>(value, $label).map(Self)
            }

            pub fn from_slice(bytes: &[u8]) -> EngineResult<Self> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    EngineError::InvalidInput(format!(
                        "{}: expected {} bytes, got {}",
                        $label,
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Lowercase `0x`-prefixed hex.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                Self::from_hex(&value).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes!(
    /// Compressed BLS12-381 G1 public key.
    PublicKey,
    48,
    "public key"
);
hex_bytes!(
    /// Compressed BLS12-381 G2 signature.
    SignatureBytes,
    96,
    "signature"
);
hex_bytes!(Bytes32, 32, "bytes32");
hex_bytes!(
    /// Beacon chain fork version.
    Bytes4,
    4,
    "fork version"
);

/// Logical bucket of keystores, served by one validator client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    pub const PREFIX: &'static str = "validator";

    pub fn from_index(index: u32) -> Self {
        ContainerName(format!("{}{index}", Self::PREFIX))
    }

    pub fn parse(name: &str) -> EngineResult<Self> {
        let name = name.trim().trim_matches('/');
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(EngineError::InvalidInput(format!(
                "invalid container name '{name}'"
            )));
        }
        Ok(ContainerName(name.to_string()))
    }

    /// Numeric suffix of a `validator{N}` name, used as the database validator index.
    pub fn index(&self) -> Option<u32> {
        self.0.strip_prefix(Self::PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Beacon chain validator status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    PendingInitialized,
    PendingQueued,
    ActiveOngoing,
    ActiveExiting,
    ActiveSlashed,
    ExitedUnslashed,
    ExitedSlashed,
    WithdrawalPossible,
    WithdrawalDone,
}

impl ValidatorStatus {
    /// Keys in these states no longer need to be served. `active_exiting` still does.
    pub fn is_exited(&self) -> bool {
        matches!(
            self,
            ValidatorStatus::ExitedUnslashed
                | ValidatorStatus::ExitedSlashed
                | ValidatorStatus::WithdrawalPossible
                | ValidatorStatus::WithdrawalDone
        )
    }
}

/// One entry of a published deposit data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleDepositData {
    pub public_key: PublicKey,
    pub signature: SignatureBytes,
    /// Decimal wei amount.
    pub amount: String,
    pub withdrawal_credentials: Bytes32,
    pub deposit_data_root: Bytes32,
    pub proof: Vec<Bytes32>,
}

impl MerkleDepositData {
    pub fn amount_wei(&self) -> EngineResult<u128> {
        self.amount
            .trim()
            .parse::<u128>()
            .map_err(|e| EngineError::InvalidInput(format!("amount '{}': {e}", self.amount)))
    }

    pub fn amount_gwei(&self) -> EngineResult<Gwei> {
        let wei = self.amount_wei()?;
        if wei % WEI_PER_GWEI != 0 {
            return Err(EngineError::InvalidInput(format!(
                "amount {wei} is not a whole number of gwei"
            )));
        }
        Gwei::try_from(wei / WEI_PER_GWEI)
            .map_err(|_| EngineError::InvalidInput(format!("amount {wei} overflows gwei")))
    }
}

/// A stored keystore as enumerated from a persistence backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreRecord {
    pub public_key: PublicKey,
    pub container: ContainerName,
    /// EIP-2334 path the key was derived at.
    pub path: String,
    /// Backend-specific encrypted key material.
    pub payload: Vec<u8>,
}
