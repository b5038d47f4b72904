// Конфигурация оркестратора
// Подробное логирование включено только в режиме разработки

use crate::error::PeerError;
use crate::peer::types::{ServerConfig, MESSAGE_CHANNEL_LABEL};
use serde::Deserialize;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "peerlink=debug"; // В режиме отладки пишем всё

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "peerlink=warn"; // В продакшене только предупреждения

/// Максимальный размер одного блока; слишком большие блоки рвут канал
pub const DEFAULT_CHUNK_SIZE: usize = 100 * 1024;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PeerOptions {
    pub ice_servers: Vec<ServerConfig>,
    pub chunk_size: usize,
    pub candidate_batch_window_ms: u64,
    pub open_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub transfer_prefix: String,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
                ServerConfig::stun(
                    "default-twilio",
                    "stun:global.stun.twilio.com:3478?transport=udp",
                ),
            ],
            chunk_size: DEFAULT_CHUNK_SIZE,
            candidate_batch_window_ms: 1000,
            open_timeout_ms: 10_000,
            disconnect_grace_ms: 10_000,
            transfer_prefix: "data".into(),
        }
    }
}

impl PeerOptions {
    pub fn from_json(s: &str) -> Result<Self, PeerError> {
        let options: PeerOptions =
            serde_json::from_str(s).map_err(|e| PeerError::InvalidConfig(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), PeerError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(PeerError::InvalidConfig(
                    "server URL cannot be empty".into(),
                ));
            }
            if server.r#type == "turn"
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(PeerError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        if self.chunk_size == 0 {
            return Err(PeerError::InvalidConfig("chunk size must be positive".into()));
        }
        if self.transfer_prefix.is_empty()
            || self.transfer_prefix == MESSAGE_CHANNEL_LABEL
            || self.transfer_prefix.contains('-')
        {
            return Err(PeerError::InvalidConfig(format!(
                "bad transfer prefix {:?}",
                self.transfer_prefix
            )));
        }
        Ok(())
    }

    pub fn candidate_batch_window(&self) -> Duration {
        Duration::from_millis(self.candidate_batch_window_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let o = PeerOptions::from_json(r#"{"chunk_size": 4096}"#).unwrap();
        assert_eq!(o.chunk_size, 4096);
        assert_eq!(o.candidate_batch_window(), Duration::from_secs(1));
        assert_eq!(o.open_timeout(), Duration::from_secs(10));
        assert_eq!(o.ice_servers.len(), 2);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let json = r#"{"ice_servers":[{"id":"t","type":"turn","url":"turn:example.org"}]}"#;
        assert!(matches!(
            PeerOptions::from_json(json),
            Err(PeerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn prefix_must_not_clash_with_message_label() {
        let options = PeerOptions {
            transfer_prefix: "message".into(),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
