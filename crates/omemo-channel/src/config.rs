use std::path::{Path, PathBuf};
use std::time::Duration;

use omemo_crypto::CorruptStorePolicy;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Channel settings, read from a JSON file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmemoConfig {
    /// When off, messages go out and come in as plaintext.
    pub enabled: bool,
    /// Directory holding one store file per account.
    pub store_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub corrupt_store: CorruptStorePolicy,
    /// Body sent alongside an encrypted element for clients without OMEMO.
    pub fallback_body: String,
    /// Shown in place of a message that could not be decrypted.
    pub decrypt_failure_placeholder: String,
    /// Fixed device id for a new store; random when unset.
    pub device_id: Option<u32>,
    /// Answer the first message of a new inbound session with a key
    /// transport message so the sender stops attaching prekey headers.
    pub confirm_sessions: bool,
}

impl Default for OmemoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_dir: PathBuf::from("omemo"),
            request_timeout_secs: 10,
            corrupt_store: CorruptStorePolicy::Fail,
            fallback_body: "I sent you an OMEMO encrypted message but your client doesn't seem to support that.".into(),
            decrypt_failure_placeholder: "[This message could not be decrypted]".into(),
            device_id: None,
            confirm_sessions: true,
        }
    }
}

impl OmemoConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ChannelError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ChannelError::Config(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&text)
            .map_err(|e| ChannelError::Config(format!("parse {}: {e}", path.display())))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = OmemoConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, OmemoConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("omemo.json");
        std::fs::write(&path, r#"{ "corrupt_store": "reset", "request_timeout_secs": 3 }"#).unwrap();

        let config = OmemoConfig::load(&path).unwrap();
        assert_eq!(config.corrupt_store, CorruptStorePolicy::Reset);
        assert_eq!(config.request_timeout_secs, 3);
        assert!(config.enabled);
        assert_eq!(config.fallback_body, OmemoConfig::default().fallback_body);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("omemo.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(OmemoConfig::load(&path), Err(ChannelError::Config(_))));
    }
}
