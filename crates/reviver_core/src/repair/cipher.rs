//! AES-256-GCM sealing of material files.
//!
//! A sealed body is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! The material header is passed as associated data, so a body cannot be
//! moved under another header without failing authentication.

use crate::error::{CoreError, CoreResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a material key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

const KEY_CONTEXT: &[u8] = b"reviver-material-key-v1";

/// Key protecting material files. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Generates a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Uses raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidKeySize`] unless `bytes` is 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CoreError::invalid_key_size(bytes.len(), KEY_SIZE))?;
        Ok(Self { bytes })
    }

    /// Derives a key from a high-entropy passphrase with HKDF-SHA256.
    ///
    /// The same passphrase and salt always give the same key.
    ///
    /// # Errors
    ///
    /// Returns a cipher error if the expansion fails.
    pub fn from_passphrase(passphrase: &[u8], salt: &[u8]) -> CoreResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(KEY_CONTEXT, &mut bytes)
            .map_err(|_| CoreError::cipher("key expansion failed"))?;
        Ok(Self { bytes })
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seals and opens material bodies.
pub struct MaterialCipher {
    cipher: Aes256Gcm,
}

impl MaterialCipher {
    /// Creates a cipher for `key`.
    #[must_use]
    pub fn new(key: &CipherKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(&key.bytes)),
        }
    }

    /// Encrypts `plaintext`, authenticating `header` alongside.
    ///
    /// # Errors
    ///
    /// Returns a cipher error if encryption fails.
    pub fn seal(&self, plaintext: &[u8], header: &[u8]) -> CoreResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: header,
                },
            )
            .map_err(|_| CoreError::cipher("material encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend(sealed);
        Ok(out)
    }

    /// Decrypts a body produced by [`MaterialCipher::seal`].
    ///
    /// # Errors
    ///
    /// Returns a cipher error for a wrong key, a different header or a
    /// damaged body.
    pub fn open(&self, sealed: &[u8], header: &[u8]) -> CoreResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CoreError::cipher("sealed material is too short"));
        }
        let (nonce, body) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: body,
                    aad: header,
                },
            )
            .map_err(|_| CoreError::cipher("material cannot be decrypted with this key"))
    }
}

impl std::fmt::Debug for MaterialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialCipher").finish_non_exhaustive()
    }
}
