pub mod channel;
pub mod config;
pub mod error;

pub use channel::{ChannelEvent, InboundMessage, OmemoChannel, Security, SentMessage};
pub use config::OmemoConfig;
pub use error::ChannelError;
