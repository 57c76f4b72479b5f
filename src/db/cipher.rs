//! Encryption at rest for memory records
//!
//! Records are sealed with AES-256-GCM. The stored blob is the 12-byte nonce
//! followed by the ciphertext. Fact keys are never stored; rows are addressed
//! by a SHA-256 digest of a derived secret and the key.
//!
//! Keys come from a random key file or from a passphrase stretched with
//! Argon2id over a per-install random salt kept beside the key file.

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::config::MemoryConfig;
use crate::{Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// Seals and opens memory records, and derives opaque row ids for keys
pub struct FactCipher {
    cipher: Aes256Gcm,
    id_secret: [u8; KEY_LEN],
}

impl std::fmt::Debug for FactCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactCipher").finish_non_exhaustive()
    }
}

impl FactCipher {
    /// Build a cipher from raw key material
    #[must_use]
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"arc-memory-key-id");
        hasher.update(key);
        let id_secret: [u8; KEY_LEN] = hasher.finalize().into();

        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            id_secret,
        }
    }

    /// Derive the key from a passphrase with Argon2id
    ///
    /// # Errors
    ///
    /// Returns error if the salt is shorter than Argon2 accepts
    pub fn from_passphrase(passphrase: &SecretString, salt: &[u8]) -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
            .map_err(|e| Error::MemoryStore(format!("key derivation failed: {e}")))?;
        Ok(Self::from_key(&key))
    }

    /// Load the key file, creating it with fresh random bytes if absent
    ///
    /// The file holds the hex-encoded key and is created owner-readable only.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, written, or is malformed
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let key: [u8; KEY_LEN] = load_or_create_secret(path, "key")?;
        Ok(Self::from_key(&key))
    }

    /// Resolve the cipher from memory configuration
    ///
    /// A configured passphrase takes precedence over the key file. Its salt
    /// lives next to the key path with a `.salt` extension.
    ///
    /// # Errors
    ///
    /// Returns error if the key or salt file cannot be loaded or created
    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        match &config.passphrase {
            Some(passphrase) => {
                let salt: [u8; SALT_LEN] = load_or_create_secret(&salt_path(&config.key_path), "salt")?;
                Self::from_passphrase(passphrase, &salt)
            }
            None => Self::load_or_create(&config.key_path),
        }
    }

    /// Opaque, stable row id for a fact key
    #[must_use]
    pub fn key_id(&self, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id_secret);
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Encrypt a plaintext record
    ///
    /// # Errors
    ///
    /// Returns error if encryption fails
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::MemoryStore(format!("encryption failed: {e}")))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed record
    ///
    /// # Errors
    ///
    /// Returns error if the blob is truncated or was sealed with another key
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::MemoryStore("sealed record too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::MemoryStore("failed to decrypt record (wrong key?)".to_string()))
    }
}

/// Salt file used with a passphrase
#[must_use]
pub fn salt_path(key_path: &Path) -> std::path::PathBuf {
    key_path.with_extension("salt")
}

/// Read hex-encoded random bytes, creating the file owner-only if absent
fn load_or_create_secret<const N: usize>(path: &Path, what: &str) -> Result<[u8; N]> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let bytes = hex::decode(content.trim())
            .map_err(|e| Error::MemoryStore(format!("invalid {what} file: {e}")))?;
        let secret: [u8; N] = bytes
            .try_into()
            .map_err(|_| Error::MemoryStore(format!("{what} file must hold {N} bytes")))?;
        tracing::debug!(path = %path.display(), "loaded memory {what}");
        return Ok(secret);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut secret = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    write_private(path, hex::encode(secret).as_bytes())?;

    tracing::info!(path = %path.display(), "created new memory {what}");
    Ok(secret)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let cipher = FactCipher::from_key(&[7u8; 32]);
        let sealed = cipher.seal(b"Alex").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"Alex");
        assert_eq!(cipher.open(&sealed).unwrap(), b"Alex");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = FactCipher::from_key(&[1u8; 32]).seal(b"secret").unwrap();
        let err = FactCipher::from_key(&[2u8; 32]).open(&sealed).unwrap_err();
        assert!(matches!(err, Error::MemoryStore(_)));
    }

    #[test]
    fn key_ids_are_stable_and_keyed() {
        let a = FactCipher::from_key(&[1u8; 32]);
        let b = FactCipher::from_key(&[2u8; 32]);
        assert_eq!(a.key_id("user_name"), a.key_id("user_name"));
        assert_ne!(a.key_id("user_name"), b.key_id("user_name"));
        assert!(!a.key_id("user_name").contains("user"));
    }

    #[test]
    fn passphrase_key_depends_on_salt() {
        let passphrase = SecretString::from("correct horse battery staple".to_string());
        let a = FactCipher::from_passphrase(&passphrase, &[1u8; SALT_LEN]).unwrap();
        let again = FactCipher::from_passphrase(&passphrase, &[1u8; SALT_LEN]).unwrap();
        let b = FactCipher::from_passphrase(&passphrase, &[2u8; SALT_LEN]).unwrap();

        let sealed = a.seal(b"Sam").unwrap();
        assert_eq!(again.open(&sealed).unwrap(), b"Sam");
        assert!(b.open(&sealed).is_err());
        assert_ne!(a.key_id("user_name"), b.key_id("user_name"));
    }

    #[test]
    fn passphrase_config_keeps_its_salt() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            db_path: dir.path().join("arc.db"),
            key_path: dir.path().join("memory.key"),
            passphrase: Some(SecretString::from("hunter2".to_string())),
            decay_days: 0,
        };

        let sealed = FactCipher::from_config(&config).unwrap().seal(b"kept").unwrap();
        assert!(salt_path(&config.key_path).exists());
        assert!(!config.key_path.exists());

        let reopened = FactCipher::from_config(&config).unwrap();
        assert_eq!(reopened.open(&sealed).unwrap(), b"kept");
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.key");

        let first = FactCipher::load_or_create(&path).unwrap();
        let sealed = first.seal(b"kept").unwrap();
        let second = FactCipher::load_or_create(&path).unwrap();
        assert_eq!(second.open(&sealed).unwrap(), b"kept");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
