//! EIP-2335 keystores: scrypt KDF, AES-128-CTR cipher, SHA-256 checksum.

use aes::Aes128;
use ctr::Ctr128BE;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::bls::SecretKey;
use crate::error::{EngineError, EngineResult};
use crate::types::PublicKey;

/// log2 of the scrypt cost used by the reference keystore tooling.
pub const DEFAULT_KDF_LOG_N: u8 = 18;
/// Highest scrypt cost accepted when writing keystores (2 GiB per derivation).
pub const MAX_KDF_LOG_N: u8 = 24;
/// Scrypt memory that concurrent keystore encryptions may use together.
pub const KDF_MEMORY_BUDGET: u64 = 2 << 30;
const KDF_R: u32 = 8;
const KDF_P: u32 = 1;
const DK_LEN: usize = 32;

/// Scrypt memory for one derivation: `128 * r * n` bytes.
pub fn kdf_memory(log_n: u8) -> u64 {
    (128 * u64::from(KDF_R)).saturating_mul(1u64.checked_shl(u32::from(log_n)).unwrap_or(u64::MAX))
}

/// How many keystores may be encrypted at once within [`KDF_MEMORY_BUDGET`].
pub fn kdf_parallelism(log_n: u8) -> usize {
    usize::try_from(KDF_MEMORY_BUDGET / kdf_memory(log_n).max(1))
        .unwrap_or(usize::MAX)
        .clamp(1, 64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScryptParams {
    pub dklen: usize,
    pub n: u64,
    pub r: u32,
    pub p: u32,
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfModule {
    pub function: String,
    pub params: ScryptParams,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumModule {
    pub function: String,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherModule {
    pub function: String,
    pub params: CipherParams,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreCrypto {
    pub kdf: KdfModule,
    pub checksum: ChecksumModule,
    pub cipher: CipherModule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystore {
    pub crypto: KeystoreCrypto,
    #[serde(default)]
    pub description: String,
    /// Hex without `0x`.
    pub pubkey: String,
    pub path: String,
    pub uuid: String,
    pub version: u32,
}

/// Drops C0, C1 and DEL control characters.
fn process_password(password: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(
        password
            .chars()
            .filter(|c| !c.is_control())
            .collect::<String>()
            .into_bytes(),
    )
}

fn derive_key(password: &str, salt: &[u8], log_n: u8) -> EngineResult<Zeroizing<[u8; DK_LEN]>> {
    let params = scrypt::Params::new(log_n, KDF_R, KDF_P, DK_LEN)
        .map_err(|e| EngineError::CryptoError(format!("invalid scrypt parameters: {e}")))?;
    let mut derived = Zeroizing::new([0u8; DK_LEN]);
    scrypt::scrypt(&process_password(password), salt, &params, &mut derived[..])
        .map_err(|e| EngineError::CryptoError(format!("scrypt failed: {e}")))?;
    Ok(derived)
}

fn checksum(derived: &[u8; DK_LEN], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(&derived[16..32]);
    hasher.update(ciphertext);
    hasher.finalize().into()
}

fn apply_ctr(derived: &[u8; DK_LEN], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Ctr128BE::<Aes128>::new(
        GenericArray::from_slice(&derived[..16]),
        GenericArray::from_slice(iv),
    );
    cipher.apply_keystream(data);
}

fn decode_hex(field: &str, value: &str) -> EngineResult<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| EngineError::InvalidInput(format!("keystore {field}: {e}")))
}

impl Keystore {
    pub fn encrypt(
        secret: &SecretKey,
        password: &str,
        path: &str,
        log_n: u8,
    ) -> EngineResult<Self> {
        if !(1..=MAX_KDF_LOG_N).contains(&log_n) {
            return Err(EngineError::CryptoError(format!(
                "scrypt cost 2^{log_n} is outside 2^1..=2^{MAX_KDF_LOG_N}"
            )));
        }
        let mut rng = OsRng;
        let mut salt = [0u8; 32];
        rng.fill_bytes(&mut salt);
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut iv);

        let derived = derive_key(password, &salt, log_n)?;
        let mut ciphertext = secret.to_bytes().to_vec();
        apply_ctr(&derived, &iv, &mut ciphertext);

        Ok(Self {
            crypto: KeystoreCrypto {
                kdf: KdfModule {
                    function: "scrypt".into(),
                    params: ScryptParams {
                        dklen: DK_LEN,
                        n: 1u64 << log_n,
                        r: KDF_R,
                        p: KDF_P,
                        salt: hex::encode(salt),
                    },
                    message: String::new(),
                },
                checksum: ChecksumModule {
                    function: "sha256".into(),
                    params: serde_json::Map::new(),
                    message: hex::encode(checksum(&derived, &ciphertext)),
                },
                cipher: CipherModule {
                    function: "aes-128-ctr".into(),
                    params: CipherParams { iv: hex::encode(iv) },
                    message: hex::encode(ciphertext),
                },
            },
            description: String::new(),
            pubkey: hex::encode(secret.public_key().as_bytes()),
            path: path.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            version: 4,
        })
    }

    pub fn decrypt(&self, password: &str) -> EngineResult<SecretKey> {
        let kdf = &self.crypto.kdf;
        if kdf.function != "scrypt" || self.crypto.cipher.function != "aes-128-ctr" {
            return Err(EngineError::InvalidInput(format!(
                "unsupported keystore modules {}/{}",
                kdf.function, self.crypto.cipher.function
            )));
        }
        if kdf.params.dklen != DK_LEN
            || kdf.params.r != KDF_R
            || kdf.params.p != KDF_P
            || !kdf.params.n.is_power_of_two()
        {
            return Err(EngineError::InvalidInput("unsupported scrypt parameters".into()));
        }
        let log_n = kdf.params.n.trailing_zeros() as u8;

        let salt = decode_hex("salt", &kdf.params.salt)?;
        let iv: [u8; 16] = decode_hex("iv", &self.crypto.cipher.params.iv)?
            .try_into()
            .map_err(|_| EngineError::InvalidInput("keystore iv must be 16 bytes".into()))?;
        let ciphertext = decode_hex("cipher message", &self.crypto.cipher.message)?;
        let expected = decode_hex("checksum", &self.crypto.checksum.message)?;

        let derived = derive_key(password, &salt, log_n)?;
        if checksum(&derived, &ciphertext)[..] != expected[..] {
            return Err(EngineError::CryptoError(
                "keystore checksum mismatch; wrong password?".into(),
            ));
        }

        let mut plaintext = Zeroizing::new(ciphertext);
        apply_ctr(&derived, &iv, &mut plaintext);
        SecretKey::from_bytes(&plaintext)
    }

    pub fn public_key(&self) -> EngineResult<PublicKey> {
        PublicKey::from_hex(&self.pubkey)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
