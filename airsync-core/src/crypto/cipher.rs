// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Symmetric Frame Encryption (AES-256-GCM)
//!
//! Every frame on the wire is `base64(nonce || ciphertext || tag)` with a
//! fresh 96-bit nonce per call, empty associated data and a 128-bit tag.
//! The key is raw 32 bytes persisted next to the application; it is
//! generated on first use and shared with the mobile peer through the
//! pairing URI.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroize;

/// Nonce size for AES-256-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;
/// Authentication tag size (128 bits = 16 bytes).
const TAG_SIZE: usize = 16;

/// Cipher error types.
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("key file {path}: {source}")]
    KeyIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key file {path} holds {len} bytes, expected 32")]
    InvalidKeyLength { path: PathBuf, len: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: frame may be corrupted or peer uses a different key")]
    DecryptionFailed,

    #[error("frame too short")]
    FrameTooShort,
}

/// 256-bit symmetric encryption key.
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: [u8; 32],
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose key bytes in debug output
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl SymmetricKey {
    /// Generates a new random symmetric key.
    pub fn generate() -> Self {
        let rng = SystemRandom::new();
        let key = ring::rand::generate::<[u8; 32]>(&rng)
            .expect("System RNG should not fail")
            .expose();
        SymmetricKey { bytes: key }
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SymmetricKey { bytes }
    }

    /// Returns a reference to the key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// AES-256-GCM frame cipher with file-backed key lifecycle.
///
/// The key material is read-only after construction; the cipher is shared
/// by every connection of one server.
pub struct Cipher {
    key: SymmetricKey,
}

impl Cipher {
    /// Creates a cipher from an in-memory key.
    pub fn new(key: SymmetricKey) -> Self {
        Cipher { key }
    }

    /// Loads the key from `path`, or generates and persists a fresh one.
    ///
    /// A key file that cannot be read or written is fatal: without stable
    /// key material the pairing URI would change on every start.
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self, CipherError> {
        let path = path.as_ref();

        if path.exists() {
            debug!("loading existing key from {}", path.display());
            let bytes = std::fs::read(path).map_err(|source| CipherError::KeyIo {
                path: path.to_owned(),
                source,
            })?;
            let bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| CipherError::InvalidKeyLength {
                    path: path.to_owned(),
                    len: bytes.len(),
                })?;
            return Ok(Cipher::new(SymmetricKey::from_bytes(bytes)));
        }

        info!("no key found, generating new key at {}", path.display());
        let key = SymmetricKey::generate();
        write_key_file(path, key.as_bytes()).map_err(|source| CipherError::KeyIo {
            path: path.to_owned(),
            source,
        })?;
        Ok(Cipher::new(key))
    }

    /// Returns the key as base64 for the pairing URI.
    pub fn key_base64(&self) -> String {
        BASE64.encode(self.key.as_bytes())
    }

    /// Encrypts a plaintext frame.
    ///
    /// Output is `base64(nonce (12 bytes) || ciphertext || tag (16 bytes))`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| CipherError::EncryptionFailed)?;

        let unbound_key = UnboundKey::new(&AES_256_GCM, self.key.as_bytes())
            .map_err(|_| CipherError::EncryptionFailed)?;
        let sealing_key = LessSafeKey::new(unbound_key);

        let mut in_out = plaintext.as_bytes().to_vec();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        sealing_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + in_out.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&in_out);

        Ok(BASE64.encode(&combined))
    }

    /// Decrypts a frame produced by [`Cipher::encrypt`].
    ///
    /// Strict: any base64, length or authentication-tag failure is an
    /// error. The no-encrypt passthrough policy lives in the codec layer,
    /// which knows the server mode.
    pub fn decrypt(&self, frame: &str) -> Result<String, CipherError> {
        let combined = BASE64
            .decode(frame.as_bytes())
            .map_err(|_| CipherError::DecryptionFailed)?;

        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::FrameTooShort);
        }

        let nonce_bytes: [u8; NONCE_SIZE] = combined[..NONCE_SIZE]
            .try_into()
            .map_err(|_| CipherError::DecryptionFailed)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let unbound_key = UnboundKey::new(&AES_256_GCM, self.key.as_bytes())
            .map_err(|_| CipherError::DecryptionFailed)?;
        let opening_key = LessSafeKey::new(unbound_key);

        let mut buffer = combined[NONCE_SIZE..].to_vec();
        let plaintext = opening_key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CipherError::DecryptionFailed)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CipherError::DecryptionFailed)
    }
}

/// Writes the raw key with restrictive permissions where the platform
/// supports them.
fn write_key_file(path: &Path, key: &[u8; 32]) -> io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key)?;
    Ok(())
}
