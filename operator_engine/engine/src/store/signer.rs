//! Files a validator client needs to use keys held by a remote signer:
//! the public keys of its validator index and a lighthouse
//! `validator_definitions.yml` pointing each key at the signer.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use super::memory::DatabaseKeyRecord;
use crate::error::{EngineError, EngineResult};
use crate::types::PublicKey;

pub const PUBLIC_KEYS_CSV_FILENAME: &str = "validator_keys.csv";
pub const LIGHTHOUSE_CONFIG_FILENAME: &str = "validator_definitions.yml";
pub const WEB3SIGNER_URL_ENV: &str = "WEB3SIGNER_URL";

#[derive(Debug, Serialize)]
struct LighthouseDefinition<'a> {
    enabled: bool,
    voting_public_key: &'a PublicKey,
    #[serde(rename = "type")]
    kind: &'static str,
    url: &'a str,
}

/// Public keys assigned to `validator_index`, in record order.
pub fn public_keys_for_validator(
    records: &[DatabaseKeyRecord],
    validator_index: u32,
) -> Vec<PublicKey> {
    records
        .iter()
        .filter(|record| record.validator_index == Some(validator_index))
        .map(|record| record.public_key)
        .collect()
}

pub fn lighthouse_definitions(
    public_keys: &[PublicKey],
    web3signer_url: &str,
) -> EngineResult<String> {
    let items: Vec<LighthouseDefinition<'_>> = public_keys
        .iter()
        .map(|public_key| LighthouseDefinition {
            enabled: true,
            voting_public_key: public_key,
            kind: "web3signer",
            url: web3signer_url,
        })
        .collect();
    let body = serde_yaml::to_string(&items)
        .map_err(|e| EngineError::SerdeError(format!("lighthouse definitions: {e}")))?;
    Ok(format!("---\n{body}"))
}

fn read_csv_keys(path: &Path) -> EngineResult<Option<Vec<PublicKey>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let Some(line) = raw.lines().next().filter(|line| !line.trim().is_empty()) else {
        return Ok(Some(Vec::new()));
    };
    line.split(',')
        .map(|value| PublicKey::from_hex(value.trim()))
        .collect::<EngineResult<Vec<_>>>()
        .map(Some)
}

/// Writes the key list and lighthouse definitions for one validator client.
/// Returns `false` when the directory already holds the same keys.
pub fn write_validator_keys(
    output_dir: &Path,
    public_keys: &[PublicKey],
    web3signer_url: &str,
) -> EngineResult<bool> {
    let csv_path = output_dir.join(PUBLIC_KEYS_CSV_FILENAME);
    if let Some(current) = read_csv_keys(&csv_path)? {
        let mut current = current;
        let mut wanted = public_keys.to_vec();
        current.sort();
        wanted.sort();
        if current == wanted {
            info!(dir = %output_dir.display(), "validator keys already synced");
            return Ok(false);
        }
    }

    fs::create_dir_all(output_dir)?;
    let row = public_keys
        .iter()
        .map(PublicKey::to_hex)
        .collect::<Vec<_>>()
        .join(",");
    fs::write(&csv_path, format!("{row}\n"))?;
    fs::write(
        output_dir.join(LIGHTHOUSE_CONFIG_FILENAME),
        lighthouse_definitions(public_keys, web3signer_url)?,
    )?;
    info!(count = public_keys.len(), dir = %output_dir.display(), "validator keys written");
    Ok(true)
}
