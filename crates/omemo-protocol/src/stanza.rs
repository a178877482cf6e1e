use rand::RngCore as _;
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::error::ProtocolError;

/// Everything that crosses the transport boundary. Inbound dispatch matches
/// on this closed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stanza", rename_all = "snake_case")]
pub enum Stanza {
    Message(Message),
    Iq(Iq),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    GroupChat,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Stamped by the transport on delivery.
    #[serde(default)]
    pub from: Option<String>,
    pub to: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub body: Option<String>,
    /// Extension elements (encrypted payload, hints, ...).
    #[serde(default)]
    pub payloads: Vec<Element>,
}

impl Message {
    pub fn chat(to: impl Into<String>) -> Self {
        Self {
            id: new_stanza_id(),
            from: None,
            to: to.into(),
            kind: MessageKind::Chat,
            body: None,
            payloads: Vec::new(),
        }
    }

    /// First payload with the given name and namespace.
    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.payloads.iter().find(|p| p.is(name, namespace))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error { condition: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iq {
    pub id: String,
    #[serde(default)]
    pub from: Option<String>,
    /// `None` addresses our own account.
    #[serde(default)]
    pub to: Option<String>,
    pub kind: IqKind,
    #[serde(default)]
    pub payload: Option<Element>,
}

impl Iq {
    pub fn get(to: Option<&str>, payload: Element) -> Self {
        Self::request(IqKind::Get, to, payload)
    }

    pub fn set(to: Option<&str>, payload: Element) -> Self {
        Self::request(IqKind::Set, to, payload)
    }

    fn request(kind: IqKind, to: Option<&str>, payload: Element) -> Self {
        Self {
            id: new_stanza_id(),
            from: None,
            to: to.map(str::to_string),
            kind,
            payload: Some(payload),
        }
    }

    /// Build the reply to this request.
    pub fn reply(&self, kind: IqKind, payload: Option<Element>) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind,
            payload,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, IqKind::Result | IqKind::Error { .. })
    }
}

/// The outbound half of the transport collaborator. Inbound stanzas arrive on
/// the channel handed over when the connection is established.
pub trait Transport: Send + Sync {
    fn send(&self, stanza: Stanza) -> Result<(), ProtocolError>;
}

/// Random id for correlating requests and responses.
pub fn new_stanza_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Canonical device-independent form of an address: resource stripped,
/// lowercased.
pub fn bare_address(address: &str) -> String {
    address
        .split_once('/')
        .map_or(address, |(bare, _)| bare)
        .trim()
        .to_lowercase()
}
