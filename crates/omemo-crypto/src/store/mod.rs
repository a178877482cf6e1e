pub mod file_store;

pub use file_store::{store_path, CorruptStorePolicy, OmemoStore};

use crate::identity::IdentityKeyPair;
use crate::prekeys::{PreKeyRecord, SignedPreKeyRecord};
use crate::CryptoError;

/// Which way a message travels when a trust decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Storage for our own identity and the identities we have pinned.
pub trait IdentityKeyStore: Send + Sync {
    /// Our identity key pair, if one has been generated.
    fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, CryptoError>;

    /// Our registration (device) id, if one has been generated.
    fn registration_id(&self) -> Result<Option<u32>, CryptoError>;

    /// The pinned identity key for a peer device.
    fn identity(&self, address: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Pin an identity key, replacing any previous record.
    fn save_identity(&self, address: &str, identity_key: &[u8]) -> Result<(), CryptoError>;

    /// TOFU check: an unseen address is pinned to `identity_key` and trusted;
    /// a known address is trusted only if the key matches byte for byte.
    fn is_trusted_identity(
        &self,
        address: &str,
        identity_key: &[u8],
        direction: Direction,
    ) -> Result<bool, CryptoError>;
}

/// Storage for one-time prekeys. Each is removed once consumed.
pub trait PreKeyStore: Send + Sync {
    fn load_prekey(&self, prekey_id: u32) -> Result<Option<PreKeyRecord>, CryptoError>;

    fn store_prekey(&self, record: &PreKeyRecord) -> Result<(), CryptoError>;

    fn remove_prekey(&self, prekey_id: u32) -> Result<(), CryptoError>;

    /// All stored prekeys in id order.
    fn prekeys(&self) -> Result<Vec<PreKeyRecord>, CryptoError>;
}

/// Storage for signed prekeys.
pub trait SignedPreKeyStore: Send + Sync {
    fn load_signed_prekey(&self, signed_prekey_id: u32)
        -> Result<Option<SignedPreKeyRecord>, CryptoError>;

    fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError>;

    fn remove_signed_prekey(&self, signed_prekey_id: u32) -> Result<(), CryptoError>;

    /// All stored signed prekeys in id order.
    fn signed_prekeys(&self) -> Result<Vec<SignedPreKeyRecord>, CryptoError>;
}

/// Storage for ratchet sessions, keyed by `"<bare>.<device id>"`.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, address: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Overwrite the session for `address`.
    fn store_session(&self, address: &str, session_data: &[u8]) -> Result<(), CryptoError>;

    fn has_session(&self, address: &str) -> Result<bool, CryptoError>;
}

/// Everything the session layer needs from one store.
pub trait ProtocolStore: IdentityKeyStore + PreKeyStore + SignedPreKeyStore + SessionStore {}

impl<T> ProtocolStore for T where T: IdentityKeyStore + PreKeyStore + SignedPreKeyStore + SessionStore {}
