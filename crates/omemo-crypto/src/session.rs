use std::collections::BTreeMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::address::DeviceAddress;
use crate::error::CryptoError;
use crate::identity::{peer_x25519_public, IdentityKeyPair, IDENTITY_KEY_LEN};
use crate::prekeys::PreKeyBundle;
use crate::store::{Direction, ProtocolStore};

/// Skipped message keys kept per session for late or reordered messages.
const MAX_SKIPPED_KEYS: u64 = 1000;

/// Replaced session states kept per peer device for decryption.
const MAX_ARCHIVED_STATES: usize = 40;

const COUNTER_LEN: usize = 8;
const GCM_TAG_LEN: usize = 16;
/// registration id + prekey id + signed prekey id + base key + identity key.
const PREKEY_HEADER_LEN: usize = 4 + 4 + 4 + 32 + IDENTITY_KEY_LEN;

/// A key wrapped for one recipient device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub data: Vec<u8>,
    /// The data is a prekey message that bootstraps the recipient's session.
    pub prekey: bool,
}

/// Result of unwrapping a prekey message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyDecrypted {
    pub plaintext: Vec<u8>,
    /// The message opened a new inbound session and consumed a one-time
    /// prekey; `false` when it matched a session we already had.
    pub session_created: bool,
}

/// Manages per-device ratchet sessions: X3DH establishment in both
/// directions, and a symmetric-key ratchet for every message after that.
pub struct SessionManager {
    store: Arc<dyn ProtocolStore>,
}

/// Serialized into the session store after every encrypt/decrypt.
#[derive(Clone, Serialize, Deserialize)]
struct RatchetState {
    sending_chain_key: [u8; 32],
    receiving_chain_key: [u8; 32],
    /// Counter of the next message we send.
    send_counter: u64,
    /// Counter of the next message we expect.
    recv_counter: u64,
    /// Message keys for counters we skipped past.
    #[serde(default)]
    skipped_keys: BTreeMap<u64, [u8; 32]>,
    /// The initiator's ephemeral public key; identifies this session.
    base_key: Vec<u8>,
    their_identity: Vec<u8>,
    /// Set on the initiator until the peer's first reply is decrypted.
    #[serde(default)]
    pending_prekey: Option<PendingPreKey>,
}

/// What is stored per peer device. A new inbound session does not discard
/// the one it replaces: if both sides initiated at once, the peer may still
/// be sending on either, so archived states are tried on decrypt and a
/// match makes that state current again.
#[derive(Clone, Serialize, Deserialize)]
struct SessionRecord {
    current: RatchetState,
    /// Newest first.
    #[serde(default)]
    previous: Vec<RatchetState>,
}

impl SessionRecord {
    fn new(state: RatchetState) -> Self {
        Self {
            current: state,
            previous: Vec::new(),
        }
    }

    fn archive_current(&mut self, state: RatchetState) {
        let replaced = std::mem::replace(&mut self.current, state);
        self.previous.insert(0, replaced);
        self.previous.truncate(MAX_ARCHIVED_STATES);
    }

    fn promote(&mut self, index: usize) {
        let state = self.previous.remove(index);
        self.archive_current(state);
    }

    fn find(&self, base_key: &[u8]) -> Option<Slot> {
        if self.current.base_key == base_key {
            return Some(Slot::Current);
        }
        self.previous
            .iter()
            .position(|state| state.base_key == base_key)
            .map(Slot::Archived)
    }
}

enum Slot {
    Current,
    Archived(usize),
}

#[derive(Clone, Serialize, Deserialize)]
struct PendingPreKey {
    registration_id: u32,
    prekey_id: u32,
    signed_prekey_id: u32,
}

/// The header that turns an ordinary message into a prekey message.
struct PreKeyMessage<'a> {
    prekey_id: u32,
    signed_prekey_id: u32,
    base_key: &'a [u8],
    identity_key: &'a [u8],
    message: &'a [u8],
}

impl SessionManager {
    pub fn new(store: Arc<dyn ProtocolStore>) -> Self {
        Self { store }
    }

    pub fn has_session(&self, address: &DeviceAddress) -> Result<bool, CryptoError> {
        self.store.has_session(&address.to_string())
    }

    /// Assemble our own publishable bundle from the store: all one-time
    /// prekeys and the lowest-id signed prekey.
    pub fn local_bundle(&self) -> Result<PreKeyBundle, CryptoError> {
        let identity = self.local_identity()?;
        let signed = self.store.signed_prekeys()?;
        let signed_prekey = signed
            .first()
            .ok_or_else(|| CryptoError::PreKeyError("no signed prekey in store".into()))?;
        let prekeys = self.store.prekeys()?;
        if prekeys.is_empty() {
            return Err(CryptoError::PreKeyError("no one-time prekeys in store".into()));
        }
        Ok(PreKeyBundle::from_records(&identity, signed_prekey, &prekeys))
    }

    /// Initiator side of X3DH against a fetched bundle.
    ///
    /// The bundle's signed prekey must carry a valid signature by its
    /// identity key, and that identity key must pass the TOFU check.
    pub fn initiate_session(
        &self,
        address: &DeviceAddress,
        bundle: &PreKeyBundle,
    ) -> Result<(), CryptoError> {
        bundle.verify()?;
        let addr = address.to_string();
        if !self
            .store
            .is_trusted_identity(&addr, &bundle.identity_key, Direction::Sending)?
        {
            return Err(CryptoError::UntrustedIdentity(addr));
        }

        let prekey = bundle
            .choose_prekey()
            .ok_or_else(|| CryptoError::PreKeyError("bundle has no one-time prekeys".into()))?;
        let identity = self.local_identity()?;
        let registration_id = self
            .store
            .registration_id()?
            .ok_or_else(|| CryptoError::InvalidKey("no local registration id".into()))?;

        let their_identity = peer_x25519_public(&bundle.identity_key)?;
        let their_signed_prekey = x25519_public(&bundle.signed_prekey, "signed prekey")?;
        let their_prekey = x25519_public(&prekey.public, "one-time prekey")?;

        let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let base_key = X25519Public::from(&ephemeral);

        // DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B),
        // DH3 = DH(EK_A, SPK_B), DH4 = DH(EK_A, OPK_B)
        let our_identity = identity.x25519_secret();
        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(our_identity.diffie_hellman(&their_signed_prekey).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_identity).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_signed_prekey).as_bytes());
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_prekey).as_bytes());

        let (first, second) =
            derive_chains(&ikm, &identity.public_bytes(), &bundle.identity_key)?;

        let state = RatchetState {
            sending_chain_key: first,
            receiving_chain_key: second,
            send_counter: 0,
            recv_counter: 0,
            skipped_keys: BTreeMap::new(),
            base_key: base_key.as_bytes().to_vec(),
            their_identity: bundle.identity_key.clone(),
            pending_prekey: Some(PendingPreKey {
                registration_id,
                prekey_id: prekey.id,
                signed_prekey_id: bundle.signed_prekey_id,
            }),
        };
        let record = match self.load(&addr)? {
            Some(mut record) => {
                record.archive_current(state);
                record
            }
            None => SessionRecord::new(state),
        };
        self.save(&addr, &record)?;

        tracing::debug!(
            peer = %address.bare,
            device_id = address.device_id,
            prekey_id = prekey.id,
            "initiated session"
        );
        Ok(())
    }

    /// Wrap `plaintext` through the session with `address`.
    pub fn encrypt(&self, address: &DeviceAddress, plaintext: &[u8]) -> Result<WrappedKey, CryptoError> {
        let addr = address.to_string();
        let mut record = self.load(&addr)?.ok_or(CryptoError::NoSession(addr.clone()))?;
        let state = &mut record.current;

        let counter = state.send_counter;
        let (message_key, next_chain) = step_chain(&state.sending_chain_key)?;
        state.sending_chain_key = next_chain;
        state.send_counter += 1;

        let ciphertext = Aes256Gcm::new_from_slice(&message_key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?
            .encrypt(
                Nonce::from_slice(&counter_nonce(counter)),
                Payload {
                    msg: plaintext,
                    aad: &counter.to_le_bytes(),
                },
            )
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut message = Vec::with_capacity(COUNTER_LEN + ciphertext.len());
        message.extend_from_slice(&counter.to_le_bytes());
        message.extend_from_slice(&ciphertext);

        let wrapped = match &state.pending_prekey {
            Some(pending) => {
                let identity = self.local_identity()?;
                WrappedKey {
                    data: encode_prekey_message(pending, &state.base_key, &identity, &message),
                    prekey: true,
                }
            }
            None => WrappedKey {
                data: message,
                prekey: false,
            },
        };

        self.save(&addr, &record)?;
        Ok(wrapped)
    }

    /// Unwrap an ordinary message from an established session.
    pub fn decrypt_message(&self, address: &DeviceAddress, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let addr = address.to_string();
        let mut record = self.load(&addr)?.ok_or(CryptoError::NoSession(addr.clone()))?;
        let plaintext = open_with_record(&mut record, message)?;
        // The peer has our session, so stop sending prekey messages.
        record.current.pending_prekey = None;
        self.save(&addr, &record)?;
        Ok(plaintext)
    }

    /// Unwrap a prekey message, establishing the responder side of the
    /// session if it is new.
    ///
    /// A repeat of a known base key reuses that session, current or archived.
    /// A new session becomes current, the previous one is archived, and the
    /// referenced one-time prekey is removed from the store once the message
    /// has been authenticated.
    pub fn decrypt_prekey_message(
        &self,
        address: &DeviceAddress,
        data: &[u8],
    ) -> Result<PreKeyDecrypted, CryptoError> {
        let addr = address.to_string();
        let msg = decode_prekey_message(data)?;
        let mut existing = self.load(&addr)?;

        if let Some(record) = existing.as_mut() {
            if let Some(slot) = record.find(msg.base_key) {
                let plaintext = match slot {
                    Slot::Current => open_with_state(&mut record.current, msg.message)?,
                    Slot::Archived(index) => {
                        let plaintext = open_with_state(&mut record.previous[index], msg.message)?;
                        record.promote(index);
                        plaintext
                    }
                };
                self.save(&addr, record)?;
                return Ok(PreKeyDecrypted {
                    plaintext,
                    session_created: false,
                });
            }
        }

        let signed_prekey = self
            .store
            .load_signed_prekey(msg.signed_prekey_id)?
            .ok_or_else(|| {
                CryptoError::PreKeyError(format!("unknown signed prekey {}", msg.signed_prekey_id))
            })?;
        let prekey = self.store.load_prekey(msg.prekey_id)?.ok_or_else(|| {
            CryptoError::PreKeyError(format!(
                "one-time prekey {} unknown or already consumed",
                msg.prekey_id
            ))
        })?;
        let identity = self.local_identity()?;

        let their_identity = peer_x25519_public(msg.identity_key)?;
        let their_base_key = x25519_public(msg.base_key, "base key")?;

        // Mirror of the initiator:
        // DH1 = DH(SPK_B, IK_A), DH2 = DH(IK_B, EK_A),
        // DH3 = DH(SPK_B, EK_A), DH4 = DH(OPK_B, EK_A)
        let spk = signed_prekey.secret();
        let mut ikm = Vec::with_capacity(128);
        ikm.extend_from_slice(spk.diffie_hellman(&their_identity).as_bytes());
        ikm.extend_from_slice(identity.x25519_secret().diffie_hellman(&their_base_key).as_bytes());
        ikm.extend_from_slice(spk.diffie_hellman(&their_base_key).as_bytes());
        ikm.extend_from_slice(prekey.secret().diffie_hellman(&their_base_key).as_bytes());

        // Responder swaps sending/receiving relative to initiator
        let (first, second) = derive_chains(&ikm, msg.identity_key, &identity.public_bytes())?;
        let mut state = RatchetState {
            sending_chain_key: second,
            receiving_chain_key: first,
            send_counter: 0,
            recv_counter: 0,
            skipped_keys: BTreeMap::new(),
            base_key: msg.base_key.to_vec(),
            their_identity: msg.identity_key.to_vec(),
            pending_prekey: None,
        };
        let plaintext = open_with_state(&mut state, msg.message)?;

        if !self
            .store
            .is_trusted_identity(&addr, msg.identity_key, Direction::Receiving)?
        {
            return Err(CryptoError::UntrustedIdentity(addr));
        }

        let record = match existing {
            Some(mut record) => {
                record.archive_current(state);
                record
            }
            None => SessionRecord::new(state),
        };
        self.save(&addr, &record)?;
        self.store.remove_prekey(msg.prekey_id)?;

        tracing::debug!(
            peer = %address.bare,
            device_id = address.device_id,
            prekey_id = msg.prekey_id,
            archived = record.previous.len(),
            "accepted inbound session, one-time prekey consumed"
        );
        Ok(PreKeyDecrypted {
            plaintext,
            session_created: true,
        })
    }

    fn local_identity(&self) -> Result<IdentityKeyPair, CryptoError> {
        self.store
            .identity_key_pair()?
            .ok_or_else(|| CryptoError::InvalidKey("no local identity key".into()))
    }

    fn load(&self, addr: &str) -> Result<Option<SessionRecord>, CryptoError> {
        self.store
            .load_session(addr)?
            .map(|data| {
                serde_json::from_slice(&data)
                    .map_err(|e| CryptoError::SessionError(format!("corrupt session: {e}")))
            })
            .transpose()
    }

    fn save(&self, addr: &str, record: &SessionRecord) -> Result<(), CryptoError> {
        let data = serde_json::to_vec(record)
            .map_err(|e| CryptoError::SessionError(format!("serialize session: {e}")))?;
        self.store.store_session(addr, &data)
    }
}

/// HKDF over the X3DH output, salted with both identity keys
/// (initiator first). Returns (initiator sending, responder sending).
fn derive_chains(
    ikm: &[u8],
    initiator_identity: &[u8],
    responder_identity: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut salt = Vec::with_capacity(initiator_identity.len() + responder_identity.len());
    salt.extend_from_slice(initiator_identity);
    salt.extend_from_slice(responder_identity);

    let hk = Hkdf::<Sha256>::new(Some(&salt), ikm);
    let mut okm = [0u8; 64];
    hk.expand(b"OmemoX3DH", &mut okm)
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}

/// Advance a chain: returns (message key, next chain key).
fn step_chain(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    let mut message_key = [0u8; 32];
    let mut next_chain_key = [0u8; 32];
    hk.expand(b"OmemoMessageKey", &mut message_key)
        .map_err(|e| CryptoError::SessionError(format!("HKDF: {e}")))?;
    hk.expand(b"OmemoChainKey", &mut next_chain_key)
        .map_err(|e| CryptoError::SessionError(format!("HKDF: {e}")))?;
    Ok((message_key, next_chain_key))
}

/// Message keys are single-use, so the nonce only needs to be unique per key.
fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Decrypt `counter || ciphertext` against the receiving chain, skipping
/// ahead (and remembering skipped keys) as needed. `state` is only
/// modified on success.
fn open_with_state(state: &mut RatchetState, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if message.len() < COUNTER_LEN + GCM_TAG_LEN {
        return Err(CryptoError::DecryptionError("message too short".into()));
    }
    let counter = u64::from_le_bytes(
        message[..COUNTER_LEN]
            .try_into()
            .map_err(|_| CryptoError::DecryptionError("invalid counter".into()))?,
    );
    let ciphertext = &message[COUNTER_LEN..];

    let mut next = state.clone();
    let message_key = if counter < next.recv_counter {
        next.skipped_keys.remove(&counter).ok_or_else(|| {
            CryptoError::DecryptionError(format!("message {counter} already received or expired"))
        })?
    } else {
        if counter - next.recv_counter > MAX_SKIPPED_KEYS {
            return Err(CryptoError::DecryptionError(format!(
                "message {counter} too far ahead of chain"
            )));
        }
        while next.recv_counter < counter {
            let (skipped, chain) = step_chain(&next.receiving_chain_key)?;
            next.skipped_keys.insert(next.recv_counter, skipped);
            next.receiving_chain_key = chain;
            next.recv_counter += 1;
        }
        let (key, chain) = step_chain(&next.receiving_chain_key)?;
        next.receiving_chain_key = chain;
        next.recv_counter = counter + 1;
        key
    };

    while next.skipped_keys.len() as u64 > MAX_SKIPPED_KEYS {
        next.skipped_keys.pop_first();
    }

    let plaintext = Aes256Gcm::new_from_slice(&message_key)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?
        .decrypt(
            Nonce::from_slice(&counter_nonce(counter)),
            Payload {
                msg: ciphertext,
                aad: &counter.to_le_bytes(),
            },
        )
        .map_err(|_| CryptoError::DecryptionError("message authentication failed".into()))?;

    *state = next;
    Ok(plaintext)
}

/// Try the current state, then each archived one, newest first. A match on
/// an archived state makes it current. On failure the error is the current
/// state's.
fn open_with_record(record: &mut SessionRecord, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let current_error = match open_with_state(&mut record.current, message) {
        Ok(plaintext) => return Ok(plaintext),
        Err(e) => e,
    };
    for index in 0..record.previous.len() {
        if let Ok(plaintext) = open_with_state(&mut record.previous[index], message) {
            record.promote(index);
            return Ok(plaintext);
        }
    }
    Err(current_error)
}

fn x25519_public(bytes: &[u8], what: &str) -> Result<X25519Public, CryptoError> {
    let key = <[u8; 32]>::try_from(bytes)
        .map_err(|_| CryptoError::InvalidKey(format!("{what} wrong length")))?;
    Ok(X25519Public::from(key))
}

// Prekey message layout (little endian):
// registration id (4) | prekey id (4) | signed prekey id (4)
// | base key (32) | identity key (32) | ordinary message (rest)
fn encode_prekey_message(
    pending: &PendingPreKey,
    base_key: &[u8],
    identity: &IdentityKeyPair,
    message: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(PREKEY_HEADER_LEN + message.len());
    data.extend_from_slice(&pending.registration_id.to_le_bytes());
    data.extend_from_slice(&pending.prekey_id.to_le_bytes());
    data.extend_from_slice(&pending.signed_prekey_id.to_le_bytes());
    data.extend_from_slice(base_key);
    data.extend_from_slice(&identity.public_bytes());
    data.extend_from_slice(message);
    data
}

fn decode_prekey_message(data: &[u8]) -> Result<PreKeyMessage<'_>, CryptoError> {
    if data.len() < PREKEY_HEADER_LEN + COUNTER_LEN + GCM_TAG_LEN {
        return Err(CryptoError::DecryptionError("prekey message too short".into()));
    }
    let read_u32 = |at: usize| -> Result<u32, CryptoError> {
        data[at..at + 4]
            .try_into()
            .map(u32::from_le_bytes)
            .map_err(|_| CryptoError::DecryptionError("corrupt prekey header".into()))
    };
    Ok(PreKeyMessage {
        prekey_id: read_u32(4)?,
        signed_prekey_id: read_u32(8)?,
        base_key: &data[12..44],
        identity_key: &data[44..PREKEY_HEADER_LEN],
        message: &data[PREKEY_HEADER_LEN..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IdentityKeyStore, OmemoStore, PreKeyStore};

    struct Device {
        store: Arc<OmemoStore>,
        manager: SessionManager,
    }

    fn device() -> Device {
        let store = Arc::new(OmemoStore::in_memory());
        store.ensure_keys().unwrap();
        let manager = SessionManager::new(store.clone());
        Device { store, manager }
    }

    fn open(receiver: &Device, from: &DeviceAddress, wrapped: &WrappedKey) -> Vec<u8> {
        if wrapped.prekey {
            receiver
                .manager
                .decrypt_prekey_message(from, &wrapped.data)
                .unwrap()
                .plaintext
        } else {
            receiver.manager.decrypt_message(from, &wrapped.data).unwrap()
        }
    }

    fn alice_addr() -> DeviceAddress {
        DeviceAddress::new("a@example.org", 1)
    }

    fn bob_addr() -> DeviceAddress {
        DeviceAddress::new("b@example.org", 2)
    }

    /// Alice initiates against Bob's bundle; nothing has been sent yet.
    fn initiated_pair() -> (Device, Device) {
        let alice = device();
        let bob = device();
        let bundle = bob.manager.local_bundle().unwrap();
        alice.manager.initiate_session(&bob_addr(), &bundle).unwrap();
        (alice, bob)
    }

    #[test]
    fn prekey_handshake_then_ordinary_messages() {
        let (alice, bob) = initiated_pair();
        let prekeys_before = bob.store.prekeys().unwrap().len();

        let first = alice.manager.encrypt(&bob_addr(), b"hello bob").unwrap();
        assert!(first.prekey);
        let opened = bob.manager.decrypt_prekey_message(&alice_addr(), &first.data).unwrap();
        assert_eq!(opened.plaintext, b"hello bob");
        assert!(opened.session_created);
        assert_eq!(bob.store.prekeys().unwrap().len(), prekeys_before - 1);

        let reply = bob.manager.encrypt(&alice_addr(), b"hi alice").unwrap();
        assert!(!reply.prekey);
        assert_eq!(
            alice.manager.decrypt_message(&bob_addr(), &reply.data).unwrap(),
            b"hi alice"
        );

        let after_reply = alice.manager.encrypt(&bob_addr(), b"again").unwrap();
        assert!(!after_reply.prekey);
        assert_eq!(
            bob.manager.decrypt_message(&alice_addr(), &after_reply.data).unwrap(),
            b"again"
        );
    }

    #[test]
    fn repeated_prekey_messages_reuse_session() {
        let (alice, bob) = initiated_pair();
        let m1 = alice.manager.encrypt(&bob_addr(), b"one").unwrap();
        let m2 = alice.manager.encrypt(&bob_addr(), b"two").unwrap();
        assert!(m1.prekey && m2.prekey);

        let first = bob.manager.decrypt_prekey_message(&alice_addr(), &m1.data).unwrap();
        assert_eq!(first.plaintext, b"one");
        assert!(first.session_created);
        let second = bob.manager.decrypt_prekey_message(&alice_addr(), &m2.data).unwrap();
        assert_eq!(second.plaintext, b"two");
        assert!(!second.session_created);
    }

    #[test]
    fn simultaneous_initiation_keeps_both_directions_working() {
        let alice = device();
        let bob = device();
        alice
            .manager
            .initiate_session(&bob_addr(), &bob.manager.local_bundle().unwrap())
            .unwrap();
        bob.manager
            .initiate_session(&alice_addr(), &alice.manager.local_bundle().unwrap())
            .unwrap();

        let from_alice = alice.manager.encrypt(&bob_addr(), b"a0").unwrap();
        let from_bob = bob.manager.encrypt(&alice_addr(), b"b0").unwrap();
        assert!(from_alice.prekey && from_bob.prekey);
        let opened = bob.manager.decrypt_prekey_message(&alice_addr(), &from_alice.data).unwrap();
        assert_eq!(opened.plaintext, b"a0");
        let opened = alice.manager.decrypt_prekey_message(&bob_addr(), &from_bob.data).unwrap();
        assert_eq!(opened.plaintext, b"b0");

        // Both encrypt before either has seen the other's next message.
        let a1 = alice.manager.encrypt(&bob_addr(), b"a1").unwrap();
        let b1 = bob.manager.encrypt(&alice_addr(), b"b1").unwrap();
        assert_eq!(open(&bob, &alice_addr(), &a1), b"a1");
        assert_eq!(open(&alice, &bob_addr(), &b1), b"b1");

        for round in 2..6u8 {
            let text = [b'a', b'0' + round];
            let m = alice.manager.encrypt(&bob_addr(), &text).unwrap();
            assert_eq!(open(&bob, &alice_addr(), &m), text);
            let text = [b'b', b'0' + round];
            let m = bob.manager.encrypt(&alice_addr(), &text).unwrap();
            assert_eq!(open(&alice, &bob_addr(), &m), text);
        }
    }

    #[test]
    fn rebuilt_session_replaces_stale_one_on_both_sides() {
        let (alice, bob) = initiated_pair();
        let m0 = alice.manager.encrypt(&bob_addr(), b"zero").unwrap();
        bob.manager.decrypt_prekey_message(&alice_addr(), &m0.data).unwrap();

        // Bob starts over, e.g. after failing to read Alice.
        bob.manager
            .initiate_session(&alice_addr(), &alice.manager.local_bundle().unwrap())
            .unwrap();
        let restart = bob.manager.encrypt(&alice_addr(), b"restart").unwrap();
        assert!(restart.prekey);
        let opened = alice.manager.decrypt_prekey_message(&bob_addr(), &restart.data).unwrap();
        assert!(opened.session_created);

        let m = alice.manager.encrypt(&bob_addr(), b"on new session").unwrap();
        assert!(!m.prekey);
        assert_eq!(
            bob.manager.decrypt_message(&alice_addr(), &m.data).unwrap(),
            b"on new session"
        );
        let m = bob.manager.encrypt(&alice_addr(), b"confirmed").unwrap();
        assert!(!m.prekey);
        assert_eq!(
            alice.manager.decrypt_message(&bob_addr(), &m.data).unwrap(),
            b"confirmed"
        );
    }

    #[test]
    fn out_of_order_messages_decrypt_once() {
        let (alice, bob) = initiated_pair();
        let m0 = alice.manager.encrypt(&bob_addr(), b"zero").unwrap();
        bob.manager.decrypt_prekey_message(&alice_addr(), &m0.data).unwrap();
        let reply = bob.manager.encrypt(&alice_addr(), b"ack").unwrap();
        alice.manager.decrypt_message(&bob_addr(), &reply.data).unwrap();

        let m1 = alice.manager.encrypt(&bob_addr(), b"one").unwrap();
        let m2 = alice.manager.encrypt(&bob_addr(), b"two").unwrap();

        assert_eq!(bob.manager.decrypt_message(&alice_addr(), &m2.data).unwrap(), b"two");
        assert_eq!(bob.manager.decrypt_message(&alice_addr(), &m1.data).unwrap(), b"one");
        assert!(bob.manager.decrypt_message(&alice_addr(), &m1.data).is_err());
    }

    #[test]
    fn tampered_message_fails_without_advancing() {
        let (alice, bob) = initiated_pair();
        let m0 = alice.manager.encrypt(&bob_addr(), b"zero").unwrap();
        bob.manager.decrypt_prekey_message(&alice_addr(), &m0.data).unwrap();

        let reply = bob.manager.encrypt(&alice_addr(), b"secret").unwrap();
        let mut tampered = reply.data.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(matches!(
            alice.manager.decrypt_message(&bob_addr(), &tampered),
            Err(CryptoError::DecryptionError(_))
        ));
        assert_eq!(
            alice.manager.decrypt_message(&bob_addr(), &reply.data).unwrap(),
            b"secret"
        );
    }

    #[test]
    fn consumed_prekey_cannot_be_reused() {
        let bob = device();
        let mut bundle = bob.manager.local_bundle().unwrap();
        bundle.prekeys.truncate(1);

        let alice = device();
        alice.manager.initiate_session(&bob_addr(), &bundle).unwrap();
        let m = alice.manager.encrypt(&bob_addr(), b"first").unwrap();
        bob.manager.decrypt_prekey_message(&alice_addr(), &m.data).unwrap();

        let carol = device();
        let carol_addr = DeviceAddress::new("c@example.org", 3);
        carol.manager.initiate_session(&bob_addr(), &bundle).unwrap();
        let m = carol.manager.encrypt(&bob_addr(), b"replay").unwrap();
        assert!(matches!(
            bob.manager.decrypt_prekey_message(&carol_addr, &m.data),
            Err(CryptoError::PreKeyError(_))
        ));
    }

    #[test]
    fn forged_bundle_rejected() {
        let alice = device();
        let bob = device();
        let mut bundle = bob.manager.local_bundle().unwrap();
        bundle.signed_prekey_signature[0] ^= 0xFF;
        assert!(matches!(
            alice.manager.initiate_session(&bob_addr(), &bundle),
            Err(CryptoError::VerificationError(_))
        ));
        assert!(!alice.manager.has_session(&bob_addr()).unwrap());
    }

    #[test]
    fn changed_identity_is_untrusted() {
        let alice = device();
        let bob = device();
        alice
            .store
            .save_identity(&bob_addr().to_string(), &[9u8; 32])
            .unwrap();
        let bundle = bob.manager.local_bundle().unwrap();
        assert!(matches!(
            alice.manager.initiate_session(&bob_addr(), &bundle),
            Err(CryptoError::UntrustedIdentity(_))
        ));
    }

    #[test]
    fn inbound_from_changed_identity_rejected() {
        let (alice, bob) = initiated_pair();
        bob.store
            .save_identity(&alice_addr().to_string(), &[9u8; 32])
            .unwrap();
        let m = alice.manager.encrypt(&bob_addr(), b"hi").unwrap();
        assert!(matches!(
            bob.manager.decrypt_prekey_message(&alice_addr(), &m.data),
            Err(CryptoError::UntrustedIdentity(_))
        ));
        assert!(!bob.manager.has_session(&alice_addr()).unwrap());
    }

    #[test]
    fn encrypt_without_session_fails() {
        let alice = device();
        assert!(matches!(
            alice.manager.encrypt(&bob_addr(), b"hello"),
            Err(CryptoError::NoSession(_))
        ));
    }

    #[test]
    fn local_bundle_requires_prekeys() {
        let store = Arc::new(OmemoStore::in_memory());
        let manager = SessionManager::new(store.clone());
        assert!(manager.local_bundle().is_err());

        store.ensure_keys().unwrap();
        for pk in store.prekeys().unwrap() {
            store.remove_prekey(pk.id).unwrap();
        }
        assert!(matches!(manager.local_bundle(), Err(CryptoError::PreKeyError(_))));
    }

    #[test]
    fn truncated_prekey_message_rejected() {
        let (_, bob) = initiated_pair();
        assert!(bob.manager.decrypt_prekey_message(&alice_addr(), &[0u8; 40]).is_err());
    }
}
