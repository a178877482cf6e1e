use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce, Tag};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Content key length (AES-128).
pub const CONTENT_KEY_LEN: usize = 16;
/// GCM nonce length carried in the `<iv>` element.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;
/// Length of the key‖tag secret wrapped for each recipient.
pub const SECRET_LEN: usize = CONTENT_KEY_LEN + TAG_LEN;

/// The per-message secret (content key ‖ tag) handed to each ratchet.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PayloadSecret([u8; SECRET_LEN]);

impl PayloadSecret {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = <[u8; SECRET_LEN]>::try_from(bytes).map_err(|_| {
            CryptoError::DecryptionError(format!(
                "key material must be {SECRET_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(secret))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    fn content_key(&self) -> &[u8] {
        &self.0[..CONTENT_KEY_LEN]
    }

    fn tag(&self) -> &[u8] {
        &self.0[CONTENT_KEY_LEN..]
    }
}

/// Output of [`seal`]: everything except the secret travels in the clear.
pub struct SealedPayload {
    pub secret: PayloadSecret,
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext without the tag; the tag lives in the secret.
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under a fresh random content key and nonce.
pub fn seal(plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
    let mut key = [0u8; CONTENT_KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = Aes128Gcm::new_from_slice(&key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], &mut buffer)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut secret = [0u8; SECRET_LEN];
    secret[..CONTENT_KEY_LEN].copy_from_slice(&key);
    secret[CONTENT_KEY_LEN..].copy_from_slice(tag.as_slice());
    key.zeroize();

    Ok(SealedPayload {
        secret: PayloadSecret(secret),
        nonce,
        ciphertext: buffer,
    })
}

/// Decrypt a payload sealed by [`seal`]. Any tag mismatch is an error.
pub fn open(secret: &PayloadSecret, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionError(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    let cipher = Aes128Gcm::new_from_slice(secret.content_key())
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            &[],
            &mut buffer,
            Tag::from_slice(secret.tag()),
        )
        .map_err(|_| CryptoError::DecryptionError("payload authentication failed".into()))?;
    Ok(buffer)
}
