//! Centralized operator engine error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Mnemonic failed word-list or checksum validation.
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    /// Shamir split requested with unusable total/threshold values.
    #[error("Invalid share parameters: {0}")]
    InvalidShareParameters(String),
    /// Malformed hex, wrong byte lengths or otherwise unusable input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// BLS signature over the deposit signing root does not verify.
    #[error("Invalid deposit signature for public key {public_key}")]
    InvalidSignature { public_key: String },
    /// Recomputed deposit data root differs from the expected one.
    #[error("Deposit data root mismatch for public key {public_key}")]
    RootMismatch { public_key: String },
    /// The same public key is stored in two containers.
    #[error(
        "Public key {public_key} is present in {first} and {second}. \
         Stop both validators immediately to avoid slashing"
    )]
    DuplicateKeyDetected {
        public_key: String,
        first: String,
        second: String,
    },
    /// Re-deriving the first stored keystore did not reproduce its public key.
    #[error("Mnemonic does not match stored keystore {public_key} at index {index}")]
    MnemonicMismatch { public_key: String, index: u32 },
    /// A configured container limit would be exceeded.
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),
    /// Backend state changed underneath a plan that is being applied.
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),
    /// Generic cryptographic operation failure.
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    SerdeError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl EngineError {
    /// Errors that must stop the operator from running any validator.
    pub fn is_safety_critical(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicateKeyDetected { .. } | EngineError::MnemonicMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerdeError(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_message_names_both_containers() {
        let err = EngineError::DuplicateKeyDetected {
            public_key: "0xabc".into(),
            first: "validator0".into(),
            second: "validator3".into(),
        };
        let text = err.to_string();
        assert!(text.contains("validator0"));
        assert!(text.contains("validator3"));
        assert!(err.is_safety_critical());
    }

    #[test]
    fn test_input_errors_are_not_safety_critical() {
        assert!(!EngineError::InvalidInput("bad hex".into()).is_safety_critical());
        assert!(!EngineError::CapacityExhausted("max 2".into()).is_safety_critical());
    }
}
