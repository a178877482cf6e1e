use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Length of a serialized identity public key.
pub const IDENTITY_KEY_LEN: usize = 32;

/// A device's long-term identity key pair.
///
/// The Ed25519 key signs the signed prekey; the same scalar, mapped onto
/// Curve25519, takes part in X3DH. The public half is what peers pin under
/// trust-on-first-use.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte private key.
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = <[u8; 32]>::try_from(bytes)
            .map_err(|_| CryptoError::InvalidKey("identity private key wrong length".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// The private key bytes (only ever written to the key store).
    pub fn private_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// The public identity key as published in bundles.
    pub fn public_bytes(&self) -> [u8; IDENTITY_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex fingerprint of the public key, for display.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_bytes())
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// X25519 secret derived from the Ed25519 scalar, for key agreement.
    pub fn x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` by the identity key `public`.
pub fn verify_signature(public: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let key = identity_verifying_key(public)?;
    let sig_bytes = <[u8; 64]>::try_from(signature)
        .map_err(|_| CryptoError::VerificationError("signature must be 64 bytes".into()))?;
    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| CryptoError::VerificationError(e.to_string()))
}

/// Map a peer's public identity key onto Curve25519 for Diffie-Hellman.
pub fn peer_x25519_public(public: &[u8]) -> Result<x25519_dalek::PublicKey, CryptoError> {
    let key = identity_verifying_key(public)?;
    Ok(x25519_dalek::PublicKey::from(key.to_montgomery().to_bytes()))
}

/// Hex fingerprint of any public identity key.
pub fn fingerprint(public: &[u8]) -> String {
    hex::encode(public)
}

fn identity_verifying_key(public: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes = <[u8; IDENTITY_KEY_LEN]>::try_from(public)
        .map_err(|_| CryptoError::InvalidKey("identity key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid identity key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_against_public_key() {
        let identity = IdentityKeyPair::generate();
        let sig = identity.sign(b"signed prekey");
        assert!(verify_signature(&identity.public_bytes(), b"signed prekey", &sig).is_ok());
        assert!(verify_signature(&identity.public_bytes(), b"other bytes", &sig).is_err());
    }

    #[test]
    fn private_bytes_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_private_bytes(identity.private_bytes()).unwrap();
        assert_eq!(identity.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn peer_mapping_matches_own_derivation() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let ab = alice
            .x25519_secret()
            .diffie_hellman(&peer_x25519_public(&bob.public_bytes()).unwrap());
        let ba = bob
            .x25519_secret()
            .diffie_hellman(&peer_x25519_public(&alice.public_bytes()).unwrap());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn short_identity_key_rejected() {
        assert!(peer_x25519_public(&[7u8; 31]).is_err());
    }
}
