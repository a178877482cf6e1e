//! The `<encrypted>` element carried inside a message.

use crate::element::Element;
use crate::error::ProtocolError;
use crate::pubsub::NS_OMEMO;

/// Key material wrapped for one recipient device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientKey {
    pub device_id: u32,
    pub data: Vec<u8>,
    /// `data` is a prekey message.
    pub prekey: bool,
}

/// An encrypted message before it is serialized into a wire element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub sender_device_id: u32,
    pub nonce: Vec<u8>,
    /// `None` for key transport messages.
    pub payload: Option<Vec<u8>>,
    pub keys: Vec<RecipientKey>,
}

impl EncryptedMessage {
    /// No recipient could be wrapped for. Callers fall back to plaintext.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_key_transport(&self) -> bool {
        self.payload.is_none()
    }

    pub fn key_for(&self, device_id: u32) -> Option<&RecipientKey> {
        self.keys.iter().find(|k| k.device_id == device_id)
    }

    pub fn to_element(&self) -> Element {
        let header = self.keys.iter().fold(
            Element::new("header").attr("sid", self.sender_device_id),
            |header, key| {
                let mut el = Element::new("key").attr("rid", key.device_id);
                if key.prekey {
                    el = el.attr("prekey", "true");
                }
                header.child(el.base64(&key.data))
            },
        );
        let header = header.child(Element::new("iv").base64(&self.nonce));

        let encrypted = Element::with_namespace("encrypted", NS_OMEMO).child(header);
        match &self.payload {
            Some(payload) => encrypted.child(Element::new("payload").base64(payload)),
            None => encrypted,
        }
    }

    /// Parse an `<encrypted>` element. Any missing or undecodable part is an
    /// error; nothing is skipped.
    pub fn from_element(el: &Element) -> Result<Self, ProtocolError> {
        if !el.is("encrypted", NS_OMEMO) {
            return Err(ProtocolError::Malformed(format!(
                "expected encrypted element, got <{}>",
                el.name
            )));
        }
        let header = el.required("header")?;
        let keys = header
            .find_all("key")
            .map(|key| {
                Ok(RecipientKey {
                    device_id: key.parse_attr("rid")?,
                    data: key.base64_text()?,
                    prekey: matches!(key.get_attr("prekey"), Some("true" | "1")),
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        Ok(Self {
            sender_device_id: header.parse_attr("sid")?,
            nonce: header.required("iv")?.base64_text()?,
            payload: el.find("payload").map(Element::base64_text).transpose()?,
            keys,
        })
    }
}

/// Serialize an encrypted message into its wire element.
pub fn construct_wire_element(message: &EncryptedMessage) -> Element {
    message.to_element()
}
