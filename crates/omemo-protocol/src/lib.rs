pub mod element;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod pubsub;
pub mod request;
pub mod stanza;
pub mod wire;

pub use element::Element;
pub use error::ProtocolError;
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use manager::{DecryptOutcome, Decrypted, OmemoContext, OmemoManager};
pub use pubsub::NS_OMEMO;
pub use request::{RequestTracker, DEFAULT_REQUEST_TIMEOUT};
pub use stanza::{bare_address, Iq, IqKind, Message, MessageKind, Stanza, Transport};
pub use wire::{construct_wire_element, EncryptedMessage, RecipientKey};
