//! The per-account OMEMO store: one JSON document holding the identity,
//! prekeys, sessions, and pinned identities.
//!
//! Every mutation is applied to a copy of the state, written through to disk
//! (temp file, fsync, rename), and only then becomes visible. All writers go
//! through the same mutex, so one store instance has a single writer.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use parking_lot::Mutex;
use rand::Rng as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::IdentityKeyPair;
use crate::prekeys::{generate_prekeys, PreKeyRecord, SignedPreKeyRecord, PREKEY_BATCH_SIZE};
use crate::store::{Direction, IdentityKeyStore, PreKeyStore, SessionStore, SignedPreKeyStore};
use crate::CryptoError;

/// Highest registration id (device ids are positive 31-bit integers).
const MAX_REGISTRATION_ID: u32 = 0x7FFF_FFFF;

const SIGNED_PREKEY_ID: u32 = 1;

/// What to do when the persisted document cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptStorePolicy {
    /// Refuse to open the store.
    #[default]
    Fail,
    /// Move the unreadable file aside and start empty. All sessions and
    /// pinned identities are lost.
    Reset,
}

/// Path of the store file for `account` inside `dir`.
pub fn store_path(dir: &Path, account: &str) -> PathBuf {
    let sanitized: String = account
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{sanitized}.omemo.json"))
}

/// Byte string persisted as standard base64 text.
#[derive(Clone, PartialEq, Eq)]
struct B64(Vec<u8>);

impl Serialize for B64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for B64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map(B64)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct PersistedKeyPair {
    public: B64,
    private: B64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    identity_key_pair: Option<PersistedKeyPair>,
    #[serde(default)]
    registration_id: Option<u32>,
    #[serde(default)]
    sessions: BTreeMap<String, B64>,
    #[serde(default)]
    prekeys: BTreeMap<u32, B64>,
    #[serde(default)]
    signed_prekeys: BTreeMap<u32, B64>,
    #[serde(default)]
    identities: BTreeMap<String, B64>,
}

impl StoreState {
    fn identity(&self) -> Result<Option<IdentityKeyPair>, CryptoError> {
        self.identity_key_pair
            .as_ref()
            .map(|pair| IdentityKeyPair::from_private_bytes(&pair.private.0))
            .transpose()
    }
}

/// File-backed (or purely in-memory) store for one local account.
pub struct OmemoStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl OmemoStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Open the store at `path`, creating an empty one if the file is absent.
    pub fn open(path: impl Into<PathBuf>, policy: CorruptStorePolicy) -> Result<Self, CryptoError> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StoreState>(&bytes) {
                Ok(state) => state,
                Err(e) => Self::recover_corrupt(&path, policy, &e)?,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(CryptoError::StorageError(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };

        tracing::debug!(
            path = %path.display(),
            sessions = state.sessions.len(),
            prekeys = state.prekeys.len(),
            "opened omemo store"
        );

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    fn recover_corrupt(
        path: &Path,
        policy: CorruptStorePolicy,
        error: &serde_json::Error,
    ) -> Result<StoreState, CryptoError> {
        match policy {
            CorruptStorePolicy::Fail => Err(CryptoError::CorruptStore(format!(
                "{}: {error}",
                path.display()
            ))),
            CorruptStorePolicy::Reset => {
                let aside = path.with_extension("json.corrupt");
                std::fs::rename(path, &aside).map_err(|e| {
                    CryptoError::StorageError(format!("move corrupt store aside: {e}"))
                })?;
                tracing::error!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %error,
                    "omemo store unreadable; starting empty, all sessions and trust records are lost"
                );
                Ok(StoreState::default())
            }
        }
    }

    /// Generate whatever key material is missing: identity key pair,
    /// registration id, one signed prekey, and a batch of one-time prekeys.
    ///
    /// Returns `true` if anything was generated.
    pub fn ensure_keys(&self) -> Result<bool, CryptoError> {
        self.mutate(|state| {
            let mut generated = false;

            let identity = if let Some(identity) = state.identity()? {
                identity
            } else {
                let identity = IdentityKeyPair::generate();
                state.identity_key_pair = Some(PersistedKeyPair {
                    public: B64(identity.public_bytes().to_vec()),
                    private: B64(identity.private_bytes().to_vec()),
                });
                generated = true;
                identity
            };

            if state.registration_id.is_none() {
                state.registration_id =
                    Some(rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID));
                generated = true;
            }

            if state.signed_prekeys.is_empty() {
                let spk = SignedPreKeyRecord::generate(SIGNED_PREKEY_ID, &identity);
                state.signed_prekeys.insert(spk.id, B64(spk.to_bytes()));
                generated = true;
            }

            if state.prekeys.is_empty() {
                for pk in generate_prekeys(1, PREKEY_BATCH_SIZE) {
                    state.prekeys.insert(pk.id, B64(pk.to_bytes()));
                }
                generated = true;
            }

            if generated {
                tracing::info!(
                    registration_id = ?state.registration_id,
                    prekeys = state.prekeys.len(),
                    "generated omemo key material"
                );
            }
            Ok(generated)
        })
    }

    /// Use `id` as this device's registration id instead of a random one.
    /// Fails if a different id was already assigned.
    pub fn assign_registration_id(&self, id: u32) -> Result<(), CryptoError> {
        if id == 0 || id > MAX_REGISTRATION_ID {
            return Err(CryptoError::KeyGeneration(format!(
                "registration id {id} out of range"
            )));
        }
        self.mutate(|state| match state.registration_id {
            Some(existing) if existing != id => Err(CryptoError::KeyGeneration(format!(
                "registration id already assigned ({existing})"
            ))),
            _ => {
                state.registration_id = Some(id);
                Ok(())
            }
        })
    }

    /// Apply `f` to a copy of the state, persist it, then publish it.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<R, CryptoError>,
    ) -> Result<R, CryptoError> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        let result = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(result)
    }

    fn persist(&self, state: &StoreState) -> Result<(), CryptoError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| CryptoError::StorageError(format!("serialize store: {e}")))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::StorageError(format!("create store dir: {e}")))?;
        }
        let tmp = path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, path)
        };
        write().map_err(|e| CryptoError::StorageError(format!("write {}: {e}", path.display())))
    }
}

impl IdentityKeyStore for OmemoStore {
    fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, CryptoError> {
        self.state.lock().identity()
    }

    fn registration_id(&self) -> Result<Option<u32>, CryptoError> {
        Ok(self.state.lock().registration_id)
    }

    fn identity(&self, address: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.state.lock().identities.get(address).map(|k| k.0.clone()))
    }

    fn save_identity(&self, address: &str, identity_key: &[u8]) -> Result<(), CryptoError> {
        self.mutate(|state| {
            state
                .identities
                .insert(address.to_string(), B64(identity_key.to_vec()));
            Ok(())
        })
    }

    fn is_trusted_identity(
        &self,
        address: &str,
        identity_key: &[u8],
        direction: Direction,
    ) -> Result<bool, CryptoError> {
        let pinned = self.state.lock().identities.get(address).cloned();
        let trusted = match pinned {
            Some(pinned) => pinned.0 == identity_key,
            // Re-checked under the writer lock so two first contacts cannot
            // pin different keys.
            None => self.mutate(|state| match state.identities.get(address) {
                Some(pinned) => Ok(pinned.0 == identity_key),
                None => {
                    tracing::debug!(address, ?direction, "pinning identity on first use");
                    state
                        .identities
                        .insert(address.to_string(), B64(identity_key.to_vec()));
                    Ok(true)
                }
            })?,
        };
        if !trusted {
            tracing::warn!(address, ?direction, "identity key does not match pinned key");
        }
        Ok(trusted)
    }
}

impl PreKeyStore for OmemoStore {
    fn load_prekey(&self, prekey_id: u32) -> Result<Option<PreKeyRecord>, CryptoError> {
        self.state
            .lock()
            .prekeys
            .get(&prekey_id)
            .map(|bytes| PreKeyRecord::from_bytes(prekey_id, &bytes.0))
            .transpose()
    }

    fn store_prekey(&self, record: &PreKeyRecord) -> Result<(), CryptoError> {
        self.mutate(|state| {
            state.prekeys.insert(record.id, B64(record.to_bytes()));
            Ok(())
        })
    }

    fn remove_prekey(&self, prekey_id: u32) -> Result<(), CryptoError> {
        self.mutate(|state| {
            state.prekeys.remove(&prekey_id);
            Ok(())
        })
    }

    fn prekeys(&self) -> Result<Vec<PreKeyRecord>, CryptoError> {
        self.state
            .lock()
            .prekeys
            .iter()
            .map(|(id, bytes)| PreKeyRecord::from_bytes(*id, &bytes.0))
            .collect()
    }
}

impl SignedPreKeyStore for OmemoStore {
    fn load_signed_prekey(
        &self,
        signed_prekey_id: u32,
    ) -> Result<Option<SignedPreKeyRecord>, CryptoError> {
        self.state
            .lock()
            .signed_prekeys
            .get(&signed_prekey_id)
            .map(|bytes| SignedPreKeyRecord::from_bytes(signed_prekey_id, &bytes.0))
            .transpose()
    }

    fn store_signed_prekey(&self, record: &SignedPreKeyRecord) -> Result<(), CryptoError> {
        self.mutate(|state| {
            state.signed_prekeys.insert(record.id, B64(record.to_bytes()));
            Ok(())
        })
    }

    fn remove_signed_prekey(&self, signed_prekey_id: u32) -> Result<(), CryptoError> {
        self.mutate(|state| {
            state.signed_prekeys.remove(&signed_prekey_id);
            Ok(())
        })
    }

    fn signed_prekeys(&self) -> Result<Vec<SignedPreKeyRecord>, CryptoError> {
        self.state
            .lock()
            .signed_prekeys
            .iter()
            .map(|(id, bytes)| SignedPreKeyRecord::from_bytes(*id, &bytes.0))
            .collect()
    }
}

impl SessionStore for OmemoStore {
    fn load_session(&self, address: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.state.lock().sessions.get(address).map(|s| s.0.clone()))
    }

    fn store_session(&self, address: &str, session_data: &[u8]) -> Result<(), CryptoError> {
        self.mutate(|state| {
            state
                .sessions
                .insert(address.to_string(), B64(session_data.to_vec()));
            Ok(())
        })
    }

    fn has_session(&self, address: &str) -> Result<bool, CryptoError> {
        Ok(self.state.lock().sessions.contains_key(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(store: &OmemoStore) -> (Vec<u8>, u32, Vec<u32>, Vec<Vec<u8>>) {
        let identity = store.identity_key_pair().unwrap().unwrap();
        let prekeys = store.prekeys().unwrap();
        (
            identity.public_bytes().to_vec(),
            store.registration_id().unwrap().unwrap(),
            prekeys.iter().map(|p| p.id).collect(),
            prekeys.iter().map(|p| p.public().to_vec()).collect(),
        )
    }

    #[test]
    fn empty_store_reports_absent_keys() {
        let store = OmemoStore::in_memory();
        assert!(store.identity_key_pair().unwrap().is_none());
        assert!(store.registration_id().unwrap().is_none());
        assert!(store.prekeys().unwrap().is_empty());
    }

    #[test]
    fn ensure_keys_is_idempotent() {
        let store = OmemoStore::in_memory();
        assert!(store.ensure_keys().unwrap());
        let before = snapshot(&store);
        assert_eq!(before.2.len(), PREKEY_BATCH_SIZE as usize);
        assert_eq!(store.signed_prekeys().unwrap().len(), 1);

        assert!(!store.ensure_keys().unwrap());
        assert_eq!(snapshot(&store), before);
    }

    #[test]
    fn registration_id_is_positive_31_bit() {
        let store = OmemoStore::in_memory();
        store.ensure_keys().unwrap();
        let id = store.registration_id().unwrap().unwrap();
        assert!((1..=MAX_REGISTRATION_ID).contains(&id));
    }

    #[test]
    fn assigned_registration_id_is_kept() {
        let store = OmemoStore::in_memory();
        store.assign_registration_id(11).unwrap();
        store.ensure_keys().unwrap();
        assert_eq!(store.registration_id().unwrap(), Some(11));

        store.assign_registration_id(11).unwrap();
        assert!(store.assign_registration_id(22).is_err());
        assert!(OmemoStore::in_memory().assign_registration_id(0).is_err());
    }

    #[test]
    fn tofu_sequence() {
        let store = OmemoStore::in_memory();
        let addr = "b@example.org.11";
        let k1 = [1u8; 32];
        let k2 = [2u8; 32];

        assert!(store.is_trusted_identity(addr, &k1, Direction::Receiving).unwrap());
        assert_eq!(store.identity(addr).unwrap().as_deref(), Some(&k1[..]));
        assert!(!store.is_trusted_identity(addr, &k2, Direction::Receiving).unwrap());
        assert!(store.is_trusted_identity(addr, &k1, Direction::Sending).unwrap());
        assert_eq!(store.identity(addr).unwrap().as_deref(), Some(&k1[..]));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = store_path(dir.path(), "a@example.org");

        let store = OmemoStore::open(&path, CorruptStorePolicy::Fail).unwrap();
        store.ensure_keys().unwrap();
        store.store_session("b@example.org.7", b"ratchet").unwrap();
        store.remove_prekey(3).unwrap();
        let before = snapshot(&store);
        drop(store);

        let reopened = OmemoStore::open(&path, CorruptStorePolicy::Fail).unwrap();
        assert_eq!(snapshot(&reopened), before);
        assert!(reopened.load_prekey(3).unwrap().is_none());
        assert_eq!(
            reopened.load_session("b@example.org.7").unwrap().as_deref(),
            Some(&b"ratchet"[..])
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_store_fails_by_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = store_path(dir.path(), "a@example.org");
        std::fs::write(&path, b"{ not json").unwrap();

        let result = OmemoStore::open(&path, CorruptStorePolicy::Fail);
        assert!(matches!(result, Err(CryptoError::CorruptStore(_))));
        assert!(path.exists());
    }

    #[test]
    fn corrupt_store_reset_moves_file_aside() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = store_path(dir.path(), "a@example.org");
        std::fs::write(&path, b"garbage").unwrap();

        let store = OmemoStore::open(&path, CorruptStorePolicy::Reset).unwrap();
        assert!(store.identity_key_pair().unwrap().is_none());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn store_path_sanitizes_account() {
        let path = store_path(Path::new("/tmp"), "a@example.org/phone");
        assert_eq!(path, Path::new("/tmp/a@example.org_phone.omemo.json"));
    }
}
