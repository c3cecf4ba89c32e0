//! Hybrid RSA + AES-EAX encryption of committee share files.
//!
//! Wire layout: `[RSA-OAEP(session key)][16-byte nonce][16-byte tag][ciphertext]`.
//! The RSA block is exactly the recipient modulus size, so a reader needs
//! the private key to know where the nonce starts.

use aes::Aes256;
use eax::Eax;
use eax::aead::generic_array::GenericArray;
use eax::aead::{AeadInPlace, KeyInit};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::error::{EngineError, EngineResult};

pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

type SessionCipher = Eax<Aes256>;

/// Committee member public key, from an OpenSSH `ssh-rsa` line or PEM.
#[derive(Debug, Clone)]
pub struct RecipientKey(RsaPublicKey);

impl RecipientKey {
    pub fn parse(text: &str) -> EngineResult<Self> {
        let text = text.trim();
        if text.starts_with("ssh-rsa ") {
            let parsed = ssh_key::PublicKey::from_openssh(text)
                .map_err(|e| EngineError::InvalidInput(format!("invalid ssh public key: {e}")))?;
            let rsa_key = parsed
                .key_data()
                .rsa()
                .ok_or_else(|| EngineError::InvalidInput("ssh public key is not RSA".into()))?;
            let key = RsaPublicKey::try_from(rsa_key)
                .map_err(|e| EngineError::InvalidInput(format!("unusable RSA key: {e}")))?;
            return Ok(Self(key));
        }

        RsaPublicKey::from_public_key_pem(text)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(text))
            .map(Self)
            .map_err(|e| EngineError::InvalidInput(format!("invalid RSA public key: {e}")))
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }
}

/// Committee member private key (PKCS#1 or PKCS#8 PEM).
pub struct RecipientSecret(RsaPrivateKey);

impl RecipientSecret {
    pub fn parse_pem(text: &str) -> EngineResult<Self> {
        RsaPrivateKey::from_pkcs1_pem(text)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(text))
            .map(Self)
            .map_err(|e| EngineError::InvalidInput(format!("invalid RSA private key: {e}")))
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }
}

impl std::fmt::Debug for RecipientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientSecret")
            .field("bits", &(self.0.size() * 8))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub encrypted_session_key: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.encrypted_session_key.len() + NONCE_LEN + TAG_LEN + self.ciphertext.len(),
        );
        out.extend_from_slice(&self.encrypted_session_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8], rsa_size: usize) -> EngineResult<Self> {
        if bytes.len() < rsa_size + NONCE_LEN + TAG_LEN {
            return Err(EngineError::InvalidInput(format!(
                "share file too short: {} bytes",
                bytes.len()
            )));
        }
        let (encrypted_session_key, rest) = bytes.split_at(rsa_size);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut envelope = Envelope {
            encrypted_session_key: encrypted_session_key.to_vec(),
            nonce: [0u8; NONCE_LEN],
            tag: [0u8; TAG_LEN],
            ciphertext: ciphertext.to_vec(),
        };
        envelope.nonce.copy_from_slice(nonce);
        envelope.tag.copy_from_slice(tag);
        Ok(envelope)
    }
}

/// Encrypts `plaintext` under a fresh session key wrapped for `recipient`.
pub fn encrypt_for_recipient(recipient: &RecipientKey, plaintext: &[u8]) -> EngineResult<Envelope> {
    let mut rng = OsRng;
    let mut session_key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
    rng.fill_bytes(&mut session_key[..]);
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let encrypted_session_key = recipient
        .0
        .encrypt(&mut rng, Oaep::new::<Sha1>(), &session_key[..])
        .map_err(|e| EngineError::CryptoError(format!("session key wrap failed: {e}")))?;

    let cipher = SessionCipher::new(GenericArray::from_slice(&session_key[..]));
    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut ciphertext)
        .map_err(|e| EngineError::CryptoError(format!("share encryption failed: {e:?}")))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(&tag);
    Ok(Envelope {
        encrypted_session_key,
        nonce,
        tag: tag_bytes,
        ciphertext,
    })
}

pub fn decrypt_envelope(
    secret: &RecipientSecret,
    bytes: &[u8],
) -> EngineResult<Zeroizing<Vec<u8>>> {
    let envelope = Envelope::from_bytes(bytes, secret.size())?;

    let session_key = Zeroizing::new(
        secret
            .0
            .decrypt(Oaep::new::<Sha1>(), &envelope.encrypted_session_key)
            .map_err(|_| {
                EngineError::CryptoError(
                    "failed to decrypt the session key; check the private key and share file".into(),
                )
            })?,
    );
    if session_key.len() != SESSION_KEY_LEN {
        return Err(EngineError::CryptoError("unexpected session key length".into()));
    }

    let cipher = SessionCipher::new(GenericArray::from_slice(&session_key[..]));
    let mut plaintext = Zeroizing::new(envelope.ciphertext);
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&envelope.nonce),
            b"",
            &mut *plaintext,
            GenericArray::from_slice(&envelope.tag),
        )
        .map_err(|_| EngineError::CryptoError("share file failed authentication".into()))?;
    Ok(plaintext)
}
