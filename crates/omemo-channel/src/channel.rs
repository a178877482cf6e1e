use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use omemo_crypto::store::{store_path, ProtocolStore};
use omemo_crypto::{DeviceAddress, OmemoStore};
use omemo_protocol::{
    bare_address, construct_wire_element, DecryptOutcome, Element, EncryptedMessage, Message,
    MessageKind, OmemoContext, OmemoManager, ProtocolError, RequestTracker, Stanza, Transport,
    NS_OMEMO,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::OmemoConfig;
use crate::error::ChannelError;

/// Archival hint attached to encrypted messages.
const NS_HINTS: &str = "urn:xmpp:hints";

/// Minimum time between two session rebuilds for the same sender device.
const SESSION_REPAIR_INTERVAL: Duration = Duration::from_secs(60);

/// How an inbound message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Security {
    Plaintext,
    Encrypted { sender_device: u32 },
    /// Carried an encrypted element we could not open; the body is the
    /// configured placeholder.
    Undecryptable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub kind: MessageKind,
    pub body: String,
    pub security: Security,
}

/// Events streamed from the channel to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum ChannelEvent {
    MessageReceived(InboundMessage),
    /// Emitted alongside the placeholder message so the user can be told
    /// that the sender may need to rebuild the session.
    DecryptionFailed {
        from: String,
        device_id: Option<u32>,
        reason: &'static str,
    },
}

/// Outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    pub encrypted: bool,
    /// Devices the message key was wrapped for.
    pub devices: usize,
}

/// Background tasks owned by a connected channel.
struct Tasks {
    shutdown_tx: mpsc::Sender<()>,
    router: JoinHandle<()>,
    worker: JoinHandle<()>,
}

/// A messaging connection with OMEMO encryption layered over it.
pub struct OmemoChannel {
    config: Arc<OmemoConfig>,
    account: String,
    transport: Arc<dyn Transport>,
    requests: Arc<RequestTracker>,
    /// `None` when encryption is disabled.
    manager: Option<Arc<OmemoManager>>,
    tasks: Mutex<Option<Tasks>>,
}

impl OmemoChannel {
    /// Bring the channel up over an established transport.
    ///
    /// With encryption enabled this opens the account's store, generates any
    /// missing key material, publishes our bundle and announces this device
    /// as the account's only device.
    pub async fn connect(
        config: OmemoConfig,
        account: &str,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<Stanza>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let account = bare_address(account);
        let config = Arc::new(config);
        let requests = Arc::new(RequestTracker::new(config.request_timeout()));

        let manager = if config.enabled {
            let store = open_store(&config, &account)?;
            let manager = OmemoManager::new(OmemoContext {
                account: account.clone(),
                store,
                transport: Arc::clone(&transport),
                requests: Arc::clone(&requests),
            })?;
            Some(Arc::new(manager))
        } else {
            tracing::info!(account = %account, "omemo disabled, channel runs in plaintext");
            None
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tasks = spawn_tasks(
            inbound,
            Arc::clone(&requests),
            Worker {
                config: Arc::clone(&config),
                manager: manager.clone(),
                transport: Arc::clone(&transport),
                events: event_tx,
                repaired: Mutex::new(HashMap::new()),
            },
        );

        let channel = Self {
            config,
            account,
            transport,
            requests,
            manager,
            tasks: Mutex::new(Some(tasks)),
        };

        if let Err(e) = channel.announce().await {
            channel.disconnect().await;
            return Err(e);
        }
        Ok((channel, event_rx))
    }

    async fn announce(&self) -> Result<(), ChannelError> {
        let Some(manager) = &self.manager else {
            return Ok(());
        };
        let device_id = manager.device_id();
        manager.publish_bundle(device_id).await?;
        manager.overwrite_device_list([device_id]).await?;
        tracing::info!(
            account = %self.account,
            device_id,
            "omemo channel connected"
        );
        Ok(())
    }

    /// Abandon pending requests and stop the background tasks. Requests the
    /// worker makes while winding down fail at once.
    pub async fn disconnect(&self) {
        self.requests.close();
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };
        let _ = tasks.shutdown_tx.send(()).await;
        let _ = tasks.router.await;
        let _ = tasks.worker.await;
        tracing::info!(account = %self.account, "omemo channel disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.tasks.lock().is_some()
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn manager(&self) -> Option<&Arc<OmemoManager>> {
        self.manager.as_ref()
    }

    pub fn device_id(&self) -> Option<u32> {
        self.manager.as_ref().map(|m| m.device_id())
    }

    /// Send `body` to `to`, encrypted for every device the recipient
    /// announces. If none of them can be reached the body goes out in
    /// plaintext.
    pub async fn send_direct(&self, to: &str, body: &str) -> Result<SentMessage, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        let bare = bare_address(to);
        let mut message = Message::chat(bare.clone());

        let encrypted = match &self.manager {
            Some(manager) => {
                let recipients: Vec<DeviceAddress> = manager
                    .fetch_device_list(Some(bare.as_str()))
                    .await?
                    .into_iter()
                    .map(|id| DeviceAddress::new(bare.clone(), id))
                    .collect();
                if recipients.is_empty() {
                    None
                } else {
                    Some(manager.encrypt_message(&recipients, body.as_bytes()).await?)
                }
            }
            None => None,
        };

        let sent = match encrypted.filter(|e| !e.is_empty()) {
            Some(encrypted) => {
                message.body = Some(self.config.fallback_body.clone());
                message.payloads.push(construct_wire_element(&encrypted));
                message.payloads.push(Element::with_namespace("store", NS_HINTS));
                SentMessage {
                    id: message.id.clone(),
                    encrypted: true,
                    devices: encrypted.keys.len(),
                }
            }
            None => {
                if self.manager.is_some() {
                    tracing::warn!(to = %bare, "no reachable omemo devices, sending plaintext");
                }
                message.body = Some(body.to_string());
                SentMessage {
                    id: message.id.clone(),
                    encrypted: false,
                    devices: 0,
                }
            }
        };

        self.transport.send(Stanza::Message(message))?;
        tracing::debug!(
            to = %bare,
            message_id = %sent.id,
            encrypted = sent.encrypted,
            devices = sent.devices,
            "sent message"
        );
        Ok(sent)
    }
}

fn open_store(config: &OmemoConfig, account: &str) -> Result<Arc<dyn ProtocolStore>, ChannelError> {
    let path = store_path(&config.store_dir, account);
    let store = OmemoStore::open(&path, config.corrupt_store)?;
    if let Some(device_id) = config.device_id {
        store.assign_registration_id(device_id)?;
    }
    store.ensure_keys()?;
    Ok(Arc::new(store))
}

/// Two tasks: the router resolves responses the moment they arrive, and the
/// worker handles messages in arrival order. A message waiting on a session
/// lock can therefore never hold up the response another session is
/// waiting for.
fn spawn_tasks(
    mut inbound: mpsc::UnboundedReceiver<Stanza>,
    requests: Arc<RequestTracker>,
    handler: Worker,
) -> Tasks {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<Message>();

    let router = tokio::spawn(async move {
        loop {
            tokio::select! {
                stanza = inbound.recv() => {
                    let Some(stanza) = stanza else {
                        tracing::debug!("transport closed, router stopping");
                        break;
                    };
                    match stanza {
                        Stanza::Iq(iq) if iq.is_response() => {
                            requests.resolve(iq);
                        }
                        Stanza::Iq(iq) => {
                            tracing::debug!(request_id = %iq.id, "ignoring inbound request");
                        }
                        Stanza::Message(message) => {
                            if message_tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("router shutting down");
                    break;
                }
            }
        }
    });

    let worker = tokio::spawn(async move {
        while let Some(message) = message_rx.recv().await {
            handler.handle_message(message).await;
        }
    });

    Tasks {
        shutdown_tx,
        router,
        worker,
    }
}

/// Inbound message handling, run on its own task.
struct Worker {
    config: Arc<OmemoConfig>,
    manager: Option<Arc<OmemoManager>>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    /// Last session rebuild per sender device.
    repaired: Mutex<HashMap<DeviceAddress, Instant>>,
}

impl Worker {
    async fn handle_message(&self, message: Message) {
        let Some(from) = message.from.as_deref().map(bare_address) else {
            tracing::debug!(message_id = %message.id, "dropping message without sender");
            return;
        };

        let encrypted = match (&self.manager, message.kind) {
            (_, MessageKind::GroupChat) | (None, _) => None,
            (Some(manager), _) => message
                .payload("encrypted", NS_OMEMO)
                .map(|element| (manager, element)),
        };

        let (body, security) = match encrypted {
            Some((manager, element)) => {
                match self.decrypt(manager, &from, element).await {
                    Some(result) => result,
                    // Key transport: nothing for the transcript.
                    None => return,
                }
            }
            None => match &message.body {
                Some(body) => (body.clone(), Security::Plaintext),
                None => return,
            },
        };

        self.emit(ChannelEvent::MessageReceived(InboundMessage {
            id: message.id,
            from,
            kind: message.kind,
            body,
            security,
        }));
    }

    /// Returns `None` for key transport messages.
    async fn decrypt(
        &self,
        manager: &OmemoManager,
        from: &str,
        element: &Element,
    ) -> Option<(String, Security)> {
        let wire = match EncryptedMessage::from_element(element) {
            Ok(wire) => wire,
            Err(e) => return Some(self.undecryptable(from, None, &e)),
        };
        let sender_device = wire.sender_device_id;
        let decrypted = match manager
            .decrypt_inbound(from, sender_device, &wire, manager.device_id())
            .await
        {
            Ok(decrypted) => decrypted,
            Err(e) => {
                let placeholder = self.undecryptable(from, Some(sender_device), &e);
                if matches!(e, ProtocolError::Decryption(_)) {
                    self.repair_session(manager, from, sender_device).await;
                }
                return Some(placeholder);
            }
        };

        if decrypted.session_created && self.config.confirm_sessions {
            match self.send_key_transport(manager, from, sender_device).await {
                Ok(()) => tracing::debug!(peer = %from, device_id = sender_device, "confirmed inbound session"),
                Err(e) => tracing::warn!(
                    peer = %from,
                    device_id = sender_device,
                    error = e.kind(),
                    "could not confirm inbound session"
                ),
            }
        }

        match decrypted.outcome {
            DecryptOutcome::Plaintext(bytes) => match String::from_utf8(bytes) {
                Ok(body) => Some((body, Security::Encrypted { sender_device })),
                Err(_) => Some(self.undecryptable(
                    from,
                    Some(sender_device),
                    &ProtocolError::Decryption("plaintext is not utf-8".into()),
                )),
            },
            DecryptOutcome::KeyTransport => None,
        }
    }

    fn undecryptable(&self, from: &str, device_id: Option<u32>, error: &ProtocolError) -> (String, Security) {
        tracing::warn!(
            peer = %from,
            device_id = ?device_id,
            error = error.kind(),
            "could not decrypt message"
        );
        self.emit(ChannelEvent::DecryptionFailed {
            from: from.to_string(),
            device_id,
            reason: error.kind(),
        });
        (
            self.config.decrypt_failure_placeholder.clone(),
            Security::Undecryptable,
        )
    }

    /// Build a fresh session with a sender we could not read and send it a
    /// key transport message over it. The sender adopts the new session on
    /// receipt, so its next message is readable again.
    async fn repair_session(&self, manager: &OmemoManager, from: &str, device_id: u32) {
        let address = DeviceAddress::new(from, device_id);
        {
            let mut repaired = self.repaired.lock();
            let now = Instant::now();
            if repaired
                .get(&address)
                .is_some_and(|last| now.duration_since(*last) < SESSION_REPAIR_INTERVAL)
            {
                tracing::debug!(peer = %from, device_id, "session rebuilt recently, not repeating");
                return;
            }
            repaired.retain(|_, last| now.duration_since(*last) < SESSION_REPAIR_INTERVAL);
            repaired.insert(address, now);
        }

        let result = match manager.build_session(from, device_id, true).await {
            Ok(true) => self.send_key_transport(manager, from, device_id).await,
            Ok(false) => {
                tracing::debug!(peer = %from, device_id, "no bundle to rebuild session from");
                return;
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::info!(peer = %from, device_id, "rebuilt session after decryption failure"),
            Err(e) => tracing::warn!(
                peer = %from,
                device_id,
                error = e.kind(),
                "could not rebuild session"
            ),
        }
    }

    /// Reply to a prekey message with an empty key transport message so the
    /// sender learns the session is established.
    async fn send_key_transport(&self, manager: &OmemoManager, to: &str, device_id: u32) -> Result<(), ProtocolError> {
        let encrypted = manager
            .encrypt_key_transport(&[DeviceAddress::new(to, device_id)])
            .await?;
        if encrypted.is_empty() {
            return Ok(());
        }
        let mut message = Message::chat(to);
        message.payloads.push(construct_wire_element(&encrypted));
        self.transport.send(Stanza::Message(message))
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}
