use serde::{Deserialize, Serialize};

/// Метка канала для обмена короткими сообщениями
pub const MESSAGE_CHANNEL_LABEL: &str = "message";

/// Тип описания сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
}

/// Описание сессии (offer/answer) в формате, совместимом с браузерным JSON
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат для WebRTC соединения
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: &str, url: &str) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

/// Назначение пары соединений, которую согласуют две стороны
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Media,
    Data,
    Message,
}

/// Структурированный заголовок data-канала.
///
/// Передаётся в конверте рядом с меткой канала; сама метка собирается
/// и разбирается только здесь. Для передачи: `<prefix>-<dataId>-<offset>`,
/// offset берётся после последнего `-`, поэтому в dataId дефис допустим.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChannelHeader {
    Message,
    #[serde(rename_all = "camelCase")]
    Transfer { data_id: String, offset: u64 },
}

impl ChannelHeader {
    pub fn transfer(data_id: impl Into<String>, offset: u64) -> Self {
        ChannelHeader::Transfer {
            data_id: data_id.into(),
            offset,
        }
    }

    pub fn to_label(&self, transfer_prefix: &str) -> String {
        match self {
            ChannelHeader::Message => MESSAGE_CHANNEL_LABEL.to_string(),
            ChannelHeader::Transfer { data_id, offset } => {
                format!("{}-{}-{}", transfer_prefix, data_id, offset)
            }
        }
    }

    /// На любую другую метку возвращается None
    pub fn parse(label: &str, transfer_prefix: &str) -> Option<Self> {
        if label == MESSAGE_CHANNEL_LABEL {
            return Some(ChannelHeader::Message);
        }
        let rest = label.strip_prefix(transfer_prefix)?.strip_prefix('-')?;
        let (data_id, offset) = rest.rsplit_once('-')?;
        if data_id.is_empty() {
            return None;
        }
        let offset = offset.parse().ok()?;
        Some(ChannelHeader::transfer(data_id, offset))
    }
}

/// Параметры создаваемого data-канала
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u16>,
}

/// Состояние data-канала
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Состояние соединения, сообщаемое провайдером
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Состояние записи пира в оркестраторе
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    AwaitingConsent,
    Negotiating,
    Open,
    Closed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Локальный или удалённый медиа-трек
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Медиапоток: набор треков под общим идентификатором
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &MediaTrack> + '_ {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(MediaKind::Audio).cloned().collect()
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(MediaKind::Video).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_label_keeps_dashes_in_data_id() {
        let header = ChannelHeader::transfer("img-2024-01", 4096);
        let label = header.to_label("data");
        assert_eq!(label, "data-img-2024-01-4096");
        assert_eq!(ChannelHeader::parse(&label, "data"), Some(header));
    }

    #[test]
    fn message_label_and_garbage() {
        assert_eq!(
            ChannelHeader::parse("message", "data"),
            Some(ChannelHeader::Message)
        );
        assert_eq!(ChannelHeader::parse("chat", "data"), None);
        assert_eq!(ChannelHeader::parse("data-file", "data"), None);
        assert_eq!(ChannelHeader::parse("data--5", "data"), None);
        assert_eq!(ChannelHeader::parse("data-file-x", "data"), None);
        assert_eq!(ChannelHeader::parse("database-f-1", "data"), None);
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 2 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let c: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
    }
}
