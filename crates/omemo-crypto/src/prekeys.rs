//! One-time and signed prekeys, and the bundle a device publishes so peers
//! can open a session while it is offline.

use rand::seq::SliceRandom;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::identity::{verify_signature, IdentityKeyPair};

/// Number of one-time prekeys generated on first run.
pub const PREKEY_BATCH_SIZE: u32 = 100;

const KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

/// A one-time prekey. Consumed by the first inbound session that uses it.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    private: [u8; KEY_LEN],
    #[zeroize(skip)]
    public: [u8; KEY_LEN],
}

impl PreKeyRecord {
    pub fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            id,
            public: X25519Public::from(&secret).to_bytes(),
            private: secret.to_bytes(),
        }
    }

    pub fn public(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private)
    }

    /// Store layout: private (32) || public (32).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * KEY_LEN);
        buf.extend_from_slice(&self.private);
        buf.extend_from_slice(&self.public);
        buf
    }

    pub fn from_bytes(id: u32, bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 2 * KEY_LEN {
            return Err(CryptoError::PreKeyError(format!("prekey {id} record has wrong length")));
        }
        let mut private = [0u8; KEY_LEN];
        let mut public = [0u8; KEY_LEN];
        private.copy_from_slice(&bytes[..KEY_LEN]);
        public.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(Self { id, private, public })
    }
}

/// The medium-term prekey, signed by the identity key.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    #[zeroize(skip)]
    pub id: u32,
    private: [u8; KEY_LEN],
    #[zeroize(skip)]
    public: [u8; KEY_LEN],
    #[zeroize(skip)]
    signature: [u8; SIGNATURE_LEN],
}

impl SignedPreKeyRecord {
    /// Generate a signed prekey; the signature covers the raw public key bytes.
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self {
            id,
            signature: identity.sign(&public),
            public,
            private: secret.to_bytes(),
        }
    }

    pub fn public(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.private)
    }

    /// Store layout: private (32) || public (32) || signature (64).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * KEY_LEN + SIGNATURE_LEN);
        buf.extend_from_slice(&self.private);
        buf.extend_from_slice(&self.public);
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn from_bytes(id: u32, bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 2 * KEY_LEN + SIGNATURE_LEN {
            return Err(CryptoError::PreKeyError(format!(
                "signed prekey {id} record has wrong length"
            )));
        }
        let mut private = [0u8; KEY_LEN];
        let mut public = [0u8; KEY_LEN];
        let mut signature = [0u8; SIGNATURE_LEN];
        private.copy_from_slice(&bytes[..KEY_LEN]);
        public.copy_from_slice(&bytes[KEY_LEN..2 * KEY_LEN]);
        signature.copy_from_slice(&bytes[2 * KEY_LEN..]);
        Ok(Self {
            id,
            private,
            public,
            signature,
        })
    }
}

/// A published one-time prekey (public half only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicPreKey {
    pub id: u32,
    pub public: Vec<u8>,
}

/// A device's publishable key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Public identity key.
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    pub signed_prekey: Vec<u8>,
    /// Signature over `signed_prekey` by `identity_key`.
    pub signed_prekey_signature: Vec<u8>,
    pub prekeys: Vec<PublicPreKey>,
}

impl PreKeyBundle {
    /// Assemble the bundle for our own device.
    pub fn from_records(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKeyRecord,
        prekeys: &[PreKeyRecord],
    ) -> Self {
        Self {
            identity_key: identity.public_bytes().to_vec(),
            signed_prekey_id: signed_prekey.id,
            signed_prekey: signed_prekey.public().to_vec(),
            signed_prekey_signature: signed_prekey.signature().to_vec(),
            prekeys: prekeys
                .iter()
                .map(|pk| PublicPreKey {
                    id: pk.id,
                    public: pk.public().to_vec(),
                })
                .collect(),
        }
    }

    /// Check the signed prekey signature against the bundle's identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        verify_signature(
            &self.identity_key,
            &self.signed_prekey,
            &self.signed_prekey_signature,
        )
    }

    /// Pick one of the advertised one-time prekeys at random.
    pub fn choose_prekey(&self) -> Option<&PublicPreKey> {
        self.prekeys.choose(&mut rand::thread_rng())
    }
}

/// Generate `count` one-time prekeys with consecutive ids starting at `start`.
pub fn generate_prekeys(start: u32, count: u32) -> Vec<PreKeyRecord> {
    (start..start.saturating_add(count))
        .map(PreKeyRecord::generate)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_prekey_signature_verifies() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(1, &identity);
        let bundle = PreKeyBundle::from_records(&identity, &spk, &generate_prekeys(1, 3));
        assert!(bundle.verify().is_ok());
        assert_eq!(bundle.prekeys.len(), 3);
    }

    #[test]
    fn forged_signed_prekey_rejected() {
        let identity = IdentityKeyPair::generate();
        let mallory = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(1, &mallory);
        let bundle = PreKeyBundle::from_records(&identity, &spk, &generate_prekeys(1, 1));
        assert!(matches!(bundle.verify(), Err(CryptoError::VerificationError(_))));
    }

    #[test]
    fn record_bytes_restore() {
        let identity = IdentityKeyPair::generate();
        let spk = SignedPreKeyRecord::generate(4, &identity);
        let restored = SignedPreKeyRecord::from_bytes(4, &spk.to_bytes()).unwrap();
        assert_eq!(restored.public(), spk.public());
        assert_eq!(restored.signature(), spk.signature());

        let pk = PreKeyRecord::generate(9);
        assert!(PreKeyRecord::from_bytes(9, &pk.to_bytes()[..10]).is_err());
    }

    #[test]
    fn prekey_ids_are_consecutive() {
        let ids: Vec<u32> = generate_prekeys(1, PREKEY_BATCH_SIZE).iter().map(|p| p.id).collect();
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&PREKEY_BATCH_SIZE));
    }
}
