use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request {request_id} timed out")]
    Timeout { request_id: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("remote error: {condition}")]
    Remote { condition: String },

    #[error("malformed element: {0}")]
    Malformed(String),

    #[error("missing key material: {0}")]
    MissingKeyMaterial(String),

    #[error("no key for device {0}")]
    MissingKeyForDevice(u32),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("untrusted identity for {0}")]
    UntrustedIdentity(String),

    #[error("no session for {0}")]
    NoSession(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    CryptoError(String),
}

impl ProtocolError {
    /// Short error class for logs; never carries message content.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Remote { .. } => "remote",
            Self::Malformed(_) => "malformed",
            Self::MissingKeyMaterial(_) => "missing_key_material",
            Self::MissingKeyForDevice(_) => "missing_key_for_device",
            Self::Decryption(_) => "decryption",
            Self::UntrustedIdentity(_) => "untrusted_identity",
            Self::NoSession(_) => "no_session",
            Self::Storage(_) => "storage",
            Self::CryptoError(_) => "crypto",
        }
    }

    /// `item-not-found` from the distribution service.
    pub fn is_item_not_found(&self) -> bool {
        matches!(self, Self::Remote { condition } if condition == "item-not-found")
    }
}

impl From<omemo_crypto::CryptoError> for ProtocolError {
    fn from(e: omemo_crypto::CryptoError) -> Self {
        use omemo_crypto::CryptoError as C;
        match e {
            C::DecryptionError(msg) => Self::Decryption(msg),
            C::UntrustedIdentity(addr) => Self::UntrustedIdentity(addr),
            C::NoSession(addr) => Self::NoSession(addr),
            C::StorageError(msg) | C::CorruptStore(msg) => Self::Storage(msg),
            other => Self::CryptoError(other.to_string()),
        }
    }
}
