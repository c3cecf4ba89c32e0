//! Network presets and engine settings.
//!
//! Settings come from an optional TOML file, then environment overrides
//! (`OPERATOR_NETWORK`, `IS_LEGACY`, `WITHDRAWAL_CREDENTIALS`).

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::reconcile::ReconcileSettings;
use crate::store::keystore::{DEFAULT_KDF_LOG_N, MAX_KDF_LOG_N};
use crate::types::{Bytes4, Bytes32, Gwei};

pub const ENV_NETWORK: &str = "OPERATOR_NETWORK";
pub const ENV_LEGACY: &str = "IS_LEGACY";
pub const ENV_WITHDRAWAL_CREDENTIALS: &str = "WITHDRAWAL_CREDENTIALS";

/// 32 ETH.
pub const VALIDATOR_DEPOSIT_AMOUNT_GWEI: Gwei = 32_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: String,
    pub withdrawal_credentials: Bytes32,
    pub genesis_fork_version: Bytes4,
    pub max_keys_per_validator: usize,
    pub deposit_amount_gwei: Gwei,
}

impl NetworkConfig {
    pub const NAMES: [&'static str; 5] =
        ["mainnet", "goerli", "harbour_mainnet", "harbour_goerli", "gnosis"];

    pub fn preset(name: &str) -> EngineResult<Self> {
        let (withdrawal_credentials, fork) = match name.trim().to_lowercase().as_str() {
            "mainnet" => (
                "0x0100000000000000000000002296e122c1a20fca3cac3371357bdad3be0df079",
                "0x00000000",
            ),
            "goerli" => (
                "0x010000000000000000000000040f15c6b5bfc5f324ecab5864c38d4e1eef4218",
                "0x00001020",
            ),
            "harbour_mainnet" => (
                "0x0100000000000000000000005c631621b897f467dd6a91855a0bc97d77b78dc0",
                "0x00000000",
            ),
            "harbour_goerli" => (
                "0x0100000000000000000000006dfc9682e3c3263758ad96e2b2ba9822167f81ee",
                "0x00001020",
            ),
            "gnosis" => (
                "0x010000000000000000000000fc9b67b6034f6b306ea9bd8ec1baf3efa2490394",
                "0x00000064",
            ),
            other => {
                return Err(EngineError::ConfigError(format!(
                    "unknown network '{other}', expected one of {}",
                    Self::NAMES.join(", ")
                )));
            }
        };
        Ok(Self {
            name: name.trim().to_lowercase(),
            withdrawal_credentials: Bytes32::from_hex(withdrawal_credentials)?,
            genesis_fork_version: Bytes4::from_hex(fork)?,
            max_keys_per_validator: 100,
            deposit_amount_gwei: VALIDATOR_DEPOSIT_AMOUNT_GWEI,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub network: NetworkConfig,
    pub legacy: bool,
    pub status_batch_size: usize,
    pub max_containers: Option<usize>,
    pub keystore_kdf_log_n: u8,
}

/// On-disk shape of the settings file; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    network: Option<String>,
    legacy: Option<bool>,
    withdrawal_credentials: Option<String>,
    max_keys_per_validator: Option<usize>,
    status_batch_size: Option<usize>,
    max_containers: Option<usize>,
    keystore_kdf_log_n: Option<u8>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                name: "mainnet".into(),
                withdrawal_credentials: Bytes32([0u8; 32]),
                genesis_fork_version: Bytes4([0u8; 4]),
                max_keys_per_validator: 100,
                deposit_amount_gwei: VALIDATOR_DEPOSIT_AMOUNT_GWEI,
            },
            legacy: false,
            status_batch_size: 100,
            max_containers: None,
            keystore_kdf_log_n: DEFAULT_KDF_LOG_N,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> EngineResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(EngineError::ConfigError(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}

impl EngineSettings {
    pub fn for_network(network: &str) -> EngineResult<Self> {
        Ok(Self {
            network: NetworkConfig::preset(network)?,
            ..Self::default()
        })
    }

    /// TOML file (if given) then process environment.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let file = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                debug!(path = %path.display(), "loading settings file");
                Some(raw)
            }
            None => None,
        };
        Self::resolve(file.as_deref(), |name| std::env::var(name).ok())
    }

    /// Same as [`Self::load`] with explicit file contents and variable lookup.
    pub fn resolve<F>(toml_text: Option<&str>, env: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: SettingsFile = match toml_text {
            Some(text) => toml::from_str(text)
                .map_err(|e| EngineError::ConfigError(format!("invalid settings file: {e}")))?,
            None => SettingsFile::default(),
        };

        let network_name = env(ENV_NETWORK)
            .filter(|v| !v.trim().is_empty())
            .or(file.network)
            .unwrap_or_else(|| "mainnet".to_string());
        let mut network = NetworkConfig::preset(&network_name)?;

        if let Some(credentials) = env(ENV_WITHDRAWAL_CREDENTIALS)
            .filter(|v| !v.trim().is_empty())
            .or(file.withdrawal_credentials)
        {
            network.withdrawal_credentials = Bytes32::from_hex(&credentials).map_err(|e| {
                EngineError::ConfigError(format!("withdrawal credentials: {e}"))
            })?;
        }
        if let Some(max_keys) = file.max_keys_per_validator {
            network.max_keys_per_validator = max_keys;
        }

        let legacy = match env(ENV_LEGACY) {
            Some(value) => parse_bool(ENV_LEGACY, &value)?,
            None => file.legacy.unwrap_or(false),
        };

        let settings = Self {
            network,
            legacy,
            status_batch_size: file.status_batch_size.unwrap_or(100),
            max_containers: file.max_containers,
            keystore_kdf_log_n: file.keystore_kdf_log_n.unwrap_or(DEFAULT_KDF_LOG_N),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.network.max_keys_per_validator == 0 {
            return Err(EngineError::ConfigError(
                "max_keys_per_validator must be positive".into(),
            ));
        }
        if self.status_batch_size == 0 {
            return Err(EngineError::ConfigError("status_batch_size must be positive".into()));
        }
        if self.max_containers == Some(0) {
            return Err(EngineError::ConfigError("max_containers must be positive".into()));
        }
        if !(1..=MAX_KDF_LOG_N).contains(&self.keystore_kdf_log_n) {
            return Err(EngineError::ConfigError(format!(
                "keystore_kdf_log_n {} is out of range",
                self.keystore_kdf_log_n
            )));
        }
        Ok(())
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            legacy: self.legacy,
            capacity: self.network.max_keys_per_validator,
            batch_size: self.status_batch_size,
            max_containers: self.max_containers,
            ..ReconcileSettings::default()
        }
    }
}
