//! AES-256-GCM sealing of descriptor blobs at rest.
//!
//! Sealed layout: 12-byte random nonce followed by ciphertext and tag.

use crate::traits::StoreError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct DescriptorCipher {
    cipher: Aes256Gcm,
}

impl DescriptorCipher {
    /// Derive the 256-bit key as SHA-256 of the secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Read the secret from a key file; trailing whitespace is ignored.
    pub fn from_key_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read(path)?;
        let end = raw
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        if end == 0 {
            return Err(StoreError::Crypto(format!(
                "key file {} is empty",
                path.display()
            )));
        }
        tracing::info!(path = %path.display(), "descriptor encryption enabled");
        Ok(Self::from_secret(&raw[..end]))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StoreError::Crypto("encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(StoreError::Crypto(format!(
                "sealed blob is {} bytes, shorter than nonce + tag",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Crypto("authentication failed: wrong key or tampered row".into()))
    }
}

impl fmt::Debug for DescriptorCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_blob_opens_with_same_secret() {
        let cipher = DescriptorCipher::from_secret(b"registry secret");
        let sealed = cipher.seal(b"descriptor bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"descriptor bytes");

        let again = DescriptorCipher::from_secret(b"registry secret");
        assert_eq!(again.open(&sealed).unwrap(), b"descriptor bytes");
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let cipher = DescriptorCipher::from_secret(b"k");
        assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sealed = DescriptorCipher::from_secret(b"right").seal(b"payload").unwrap();
        let err = DescriptorCipher::from_secret(b"wrong").open(&sealed).unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }

    #[test]
    fn test_tampered_blob_is_rejected() {
        let cipher = DescriptorCipher::from_secret(b"k");
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).is_err());
        assert!(cipher.open(&sealed[..10]).is_err());
    }

    #[test]
    fn test_key_file_trailing_newline_ignored() {
        let dir = std::env::temp_dir().join(format!("reunite-key-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("registry.key");
        std::fs::write(&path, b"file secret\n").unwrap();

        let from_file = DescriptorCipher::from_key_file(&path).unwrap();
        let sealed = DescriptorCipher::from_secret(b"file secret").seal(b"x").unwrap();
        assert_eq!(from_file.open(&sealed).unwrap(), b"x");

        std::fs::write(&path, b"\n\n").unwrap();
        assert!(DescriptorCipher::from_key_file(&path).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
