use thiserror::Error;

/// Errors from key material, ratchet sessions, and the key store.
///
/// Messages carry ids and addresses only, never key bytes or plaintext.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key material generation failed: {0}")]
    KeyGeneration(String),

    #[error("signature verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("no session with {0}")]
    NoSession(String),

    #[error("ratchet session error: {0}")]
    SessionError(String),

    #[error("prekey error: {0}")]
    PreKeyError(String),

    /// The peer presented an identity key other than the pinned one.
    #[error("identity key for {0} does not match the pinned key")]
    UntrustedIdentity(String),

    #[error("store I/O error: {0}")]
    StorageError(String),

    #[error("store file is corrupt: {0}")]
    CorruptStore(String),
}
