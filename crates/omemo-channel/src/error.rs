use omemo_crypto::CryptoError;
use omemo_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] CryptoError),

    #[error("channel is disconnected")]
    Disconnected,
}
