use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use omemo_crypto::payload::{self, PayloadSecret, SECRET_LEN};
use omemo_crypto::store::ProtocolStore;
use omemo_crypto::{CryptoError, DeviceAddress, PreKeyBundle, SessionManager};
use parking_lot::Mutex;
use rand::RngCore as _;

use crate::element::Element;
use crate::error::ProtocolError;
use crate::pubsub::{
    bundle_element, bundle_node, device_list_element, devicelist_node, items_request,
    parse_bundle, parse_device_list, parse_items_response, publish_request,
};
use crate::request::RequestTracker;
use crate::stanza::{bare_address, Iq, Transport};
use crate::wire::{EncryptedMessage, RecipientKey};

/// Everything a manager needs from its surroundings. Passed in explicitly;
/// nothing is looked up globally.
#[derive(Clone)]
pub struct OmemoContext {
    /// Our own bare address.
    pub account: String,
    pub store: Arc<dyn ProtocolStore>,
    pub transport: Arc<dyn Transport>,
    pub requests: Arc<RequestTracker>,
}

/// Result of a successful decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Plaintext(Vec<u8>),
    /// The message only advanced the session; there is nothing to show.
    KeyTransport,
}

/// A decrypted message plus what it did to the session with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub outcome: DecryptOutcome,
    /// A prekey message opened a new inbound session.
    pub session_created: bool,
}

/// One async lock per remote device, so that the load-mutate-store cycle of
/// a session never interleaves with another on the same session.
///
/// Entries are weak: a lock nobody holds or waits on is dropped and
/// recreated on next use.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<DeviceAddress, Weak<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    fn get(&self, address: &DeviceAddress) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(address).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(address.clone(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Orchestrates key distribution and per-device sessions for one account.
pub struct OmemoManager {
    ctx: OmemoContext,
    sessions: SessionManager,
    device_id: u32,
    locks: SessionLocks,
}

impl OmemoManager {
    /// Build a manager over a store that already holds key material.
    pub fn new(ctx: OmemoContext) -> Result<Self, ProtocolError> {
        let device_id = ctx
            .store
            .registration_id()?
            .ok_or_else(|| ProtocolError::MissingKeyMaterial("no registration id".into()))?;
        Ok(Self {
            sessions: SessionManager::new(Arc::clone(&ctx.store)),
            ctx: OmemoContext {
                account: bare_address(&ctx.account),
                ..ctx
            },
            device_id,
            locks: SessionLocks::default(),
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn account(&self) -> &str {
        &self.ctx.account
    }

    pub fn context(&self) -> &OmemoContext {
        &self.ctx
    }

    /// Hex fingerprint of our identity key.
    pub fn fingerprint(&self) -> Result<String, ProtocolError> {
        let identity = self
            .ctx
            .store
            .identity_key_pair()?
            .ok_or_else(|| ProtocolError::MissingKeyMaterial("no identity key".into()))?;
        Ok(identity.fingerprint())
    }

    /// Pinned identity fingerprint of a peer device, if we have one.
    pub fn peer_fingerprint(&self, bare: &str, device_id: u32) -> Result<Option<String>, ProtocolError> {
        let address = DeviceAddress::new(bare_address(bare), device_id);
        Ok(self
            .ctx
            .store
            .identity(&address.to_string())?
            .map(|key| omemo_crypto::identity::fingerprint(&key)))
    }

    async fn request(&self, iq: Iq) -> Result<Iq, ProtocolError> {
        self.ctx
            .requests
            .request(self.ctx.transport.as_ref(), iq)
            .await
    }

    /// Publish our bundle: identity key, lowest-id signed prekey, and every
    /// remaining one-time prekey.
    pub async fn publish_bundle(&self, device_id: u32) -> Result<(), ProtocolError> {
        let bundle = self.sessions.local_bundle().map_err(|e| match e {
            CryptoError::PreKeyError(msg) | CryptoError::InvalidKey(msg) => {
                ProtocolError::MissingKeyMaterial(msg)
            }
            other => other.into(),
        })?;
        let prekeys = bundle.prekeys.len();
        self.request(publish_request(&bundle_node(device_id), bundle_element(&bundle)))
            .await?;
        tracing::info!(device_id, prekeys, "published bundle");
        Ok(())
    }

    /// Device ids announced by `bare` (`None` = our own account). A node that
    /// does not exist is an empty list.
    pub async fn fetch_device_list(&self, bare: Option<&str>) -> Result<BTreeSet<u32>, ProtocolError> {
        let owner = bare.map(bare_address);
        let response = match self
            .request(items_request(owner.as_deref(), &devicelist_node()))
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_item_not_found() => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        };
        let devices = match parse_items_response(&response)? {
            Some(list) => parse_device_list(&list)?,
            None => BTreeSet::new(),
        };
        tracing::debug!(
            peer = owner.as_deref().unwrap_or(&self.ctx.account),
            devices = devices.len(),
            "fetched device list"
        );
        Ok(devices)
    }

    /// Add `device_id` to our announced list, keeping every other entry.
    pub async fn publish_device_list(&self, device_id: u32) -> Result<BTreeSet<u32>, ProtocolError> {
        let mut devices = self.fetch_device_list(None).await?;
        devices.insert(device_id);
        self.request(publish_request(&devicelist_node(), device_list_element(&devices)))
            .await?;
        tracing::debug!(devices = devices.len(), "published device list");
        Ok(devices)
    }

    /// Replace our announced list with exactly `device_ids`.
    pub async fn overwrite_device_list(
        &self,
        device_ids: impl IntoIterator<Item = u32>,
    ) -> Result<(), ProtocolError> {
        let devices: BTreeSet<u32> = device_ids.into_iter().collect();
        self.request(publish_request(&devicelist_node(), device_list_element(&devices)))
            .await?;
        tracing::debug!(devices = devices.len(), "overwrote device list");
        Ok(())
    }

    /// A peer device's bundle, or `None` if it is absent or incomplete.
    pub async fn fetch_bundle(&self, bare: &str, device_id: u32) -> Result<Option<PreKeyBundle>, ProtocolError> {
        let bare = bare_address(bare);
        let response = match self
            .request(items_request(Some(bare.as_str()), &bundle_node(device_id)))
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_item_not_found() => {
                tracing::debug!(peer = %bare, device_id, "no bundle published");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(element) = parse_items_response(&response)? else {
            return Ok(None);
        };
        match parse_bundle(&element) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) => {
                tracing::warn!(peer = %bare, device_id, error = %e, "ignoring unusable bundle");
                Ok(None)
            }
        }
    }

    /// Establish a session with one peer device from its published bundle.
    ///
    /// Returns `true` if a session was built. An existing session is kept
    /// unless `force` is set; a missing bundle builds nothing.
    pub async fn build_session(&self, bare: &str, device_id: u32, force: bool) -> Result<bool, ProtocolError> {
        let address = DeviceAddress::new(bare_address(bare), device_id);
        let lock = self.locks.get(&address);
        let _held = lock.lock().await;
        self.build_session_locked(&address, force).await
    }

    async fn build_session_locked(&self, address: &DeviceAddress, force: bool) -> Result<bool, ProtocolError> {
        if !force && self.sessions.has_session(address)? {
            return Ok(false);
        }
        let Some(bundle) = self.fetch_bundle(&address.bare, address.device_id).await? else {
            return Ok(false);
        };
        self.sessions.initiate_session(address, &bundle)?;
        Ok(true)
    }

    /// Encrypt `plaintext` for every recipient device we can reach.
    ///
    /// Devices that cannot be wrapped for are logged and left out; an
    /// empty result means nobody could be reached.
    pub async fn encrypt_message(
        &self,
        recipients: &[DeviceAddress],
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, ProtocolError> {
        let sealed = payload::seal(plaintext)?;
        let keys = self.wrap_for_all(recipients, sealed.secret.as_bytes()).await;
        Ok(EncryptedMessage {
            sender_device_id: self.device_id,
            nonce: sealed.nonce.to_vec(),
            payload: Some(sealed.ciphertext),
            keys,
        })
    }

    /// A message with no payload. Used to advance (and confirm) sessions.
    pub async fn encrypt_key_transport(&self, recipients: &[DeviceAddress]) -> Result<EncryptedMessage, ProtocolError> {
        let mut secret = [0u8; SECRET_LEN];
        let mut nonce = [0u8; payload::NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let secret = PayloadSecret::from_bytes(&secret)?;
        let keys = self.wrap_for_all(recipients, secret.as_bytes()).await;
        Ok(EncryptedMessage {
            sender_device_id: self.device_id,
            nonce: nonce.to_vec(),
            payload: None,
            keys,
        })
    }

    async fn wrap_for_all(&self, recipients: &[DeviceAddress], secret: &[u8]) -> Vec<RecipientKey> {
        let mut keys = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            match self.wrap_for(recipient, secret).await {
                Ok(key) => keys.push(key),
                Err(e) => tracing::warn!(
                    peer = %recipient.bare,
                    device_id = recipient.device_id,
                    error = e.kind(),
                    "skipping recipient device"
                ),
            }
        }
        tracing::debug!(
            recipients = recipients.len(),
            wrapped = keys.len(),
            "wrapped message key"
        );
        keys
    }

    async fn wrap_for(&self, address: &DeviceAddress, secret: &[u8]) -> Result<RecipientKey, ProtocolError> {
        let lock = self.locks.get(address);
        let _held = lock.lock().await;
        if !self.sessions.has_session(address)? && !self.build_session_locked(address, false).await? {
            return Err(ProtocolError::NoSession(address.to_string()));
        }
        let wrapped = self.sessions.encrypt(address, secret)?;
        Ok(RecipientKey {
            device_id: address.device_id,
            data: wrapped.data,
            prekey: wrapped.prekey,
        })
    }

    /// Decrypt a message addressed to `local_device`.
    pub async fn decrypt_message(
        &self,
        sender_bare: &str,
        sender_device: u32,
        message: &EncryptedMessage,
        local_device: u32,
    ) -> Result<DecryptOutcome, ProtocolError> {
        self.decrypt_inbound(sender_bare, sender_device, message, local_device)
            .await
            .map(|decrypted| decrypted.outcome)
    }

    /// Like [`decrypt_message`](Self::decrypt_message), also reporting
    /// whether a new inbound session was opened.
    ///
    /// Opening one consumes a one-time prekey, so our bundle is republished
    /// without it before this returns. A failed republish is logged and does
    /// not fail the decryption.
    pub async fn decrypt_inbound(
        &self,
        sender_bare: &str,
        sender_device: u32,
        message: &EncryptedMessage,
        local_device: u32,
    ) -> Result<Decrypted, ProtocolError> {
        let key = message
            .key_for(local_device)
            .ok_or(ProtocolError::MissingKeyForDevice(local_device))?;
        let address = DeviceAddress::new(bare_address(sender_bare), sender_device);

        let (secret, session_created) = {
            let lock = self.locks.get(&address);
            let _held = lock.lock().await;
            if key.prekey {
                let opened = self
                    .sessions
                    .decrypt_prekey_message(&address, &key.data)
                    .map_err(decryption_failure)?;
                (opened.plaintext, opened.session_created)
            } else {
                let secret = self
                    .sessions
                    .decrypt_message(&address, &key.data)
                    .map_err(decryption_failure)?;
                (secret, false)
            }
        };

        if session_created {
            if let Err(e) = self.publish_bundle(self.device_id).await {
                tracing::warn!(
                    device_id = self.device_id,
                    error = e.kind(),
                    "could not republish bundle after prekey use"
                );
            }
        }

        let Some(ciphertext) = &message.payload else {
            tracing::debug!(peer = %address.bare, device_id = sender_device, "received key transport");
            return Ok(Decrypted {
                outcome: DecryptOutcome::KeyTransport,
                session_created,
            });
        };
        let secret = PayloadSecret::from_bytes(&secret).map_err(decryption_failure)?;
        let plaintext = payload::open(&secret, &message.nonce, ciphertext).map_err(decryption_failure)?;
        Ok(Decrypted {
            outcome: DecryptOutcome::Plaintext(plaintext),
            session_created,
        })
    }

    /// Parse and decrypt an `<encrypted>` element from `sender_bare`.
    pub async fn decrypt_element(&self, sender_bare: &str, encrypted: &Element) -> Result<DecryptOutcome, ProtocolError> {
        let message = EncryptedMessage::from_element(encrypted)?;
        self.decrypt_message(sender_bare, message.sender_device_id, &message, self.device_id)
            .await
    }
}

/// Anything that goes wrong while unwrapping is a decryption failure, except
/// trust and storage problems which keep their own class.
fn decryption_failure(e: CryptoError) -> ProtocolError {
    match ProtocolError::from(e) {
        e @ (ProtocolError::Decryption(_) | ProtocolError::UntrustedIdentity(_) | ProtocolError::Storage(_)) => e,
        other => ProtocolError::Decryption(other.to_string()),
    }
}
