//! Конверты сигналинга и контракт ретранслятора.
//!
//! Формат совпадает с тем, что пересылает push-сервер:
//! `{ room?, pushData: { peer: true, type, from?, target?, channel?, ... } }`.

use crate::error::RelayError;
use crate::peer::types::{ChannelHeader, ChannelInit, ChannelKind, IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Разделитель частей идентификатора `userId$$uuid`
pub const KEY_SEPARATOR: &str = "$$";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    #[serde(rename = "preOffer")]
    PreOffer,
    #[serde(rename = "offerConfirm")]
    OfferConfirm,
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "icecandidate")]
    IceCandidate,
    #[serde(rename = "closeMedia")]
    CloseMedia,
}

/// Полезная нагрузка: описание сессии либо пачка кандидатов
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidates(Vec<IceCandidate>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    pub peer: bool,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SignalPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_header: Option<ChannelHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_config: Option<ChannelInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl PushData {
    pub fn new(kind: SignalKind, channel: ChannelKind) -> Self {
        Self {
            peer: true,
            kind,
            from: None,
            target: None,
            channel: Some(channel),
            auth: None,
            data: None,
            channel_label: None,
            channel_header: None,
            channel_config: None,
            channel_size: None,
            offset: None,
        }
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.data {
            Some(SignalPayload::Description(d)) => Some(d),
            _ => None,
        }
    }

    pub fn candidates(&self) -> Option<&[IceCandidate]> {
        match &self.data {
            Some(SignalPayload::Candidates(c)) => Some(c),
            _ => None,
        }
    }

    /// Заголовок канала: структурный, если есть, иначе из legacy-метки
    pub fn resolve_header(&self, transfer_prefix: &str) -> Option<ChannelHeader> {
        self.channel_header.clone().or_else(|| {
            self.channel_label
                .as_deref()
                .and_then(|l| ChannelHeader::parse(l, transfer_prefix))
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub push_data: PushData,
}

impl SignalingEnvelope {
    /// Широковещательный конверт для комнаты
    pub fn broadcast(room: &str, from: &str, mut push_data: PushData) -> Self {
        push_data.from = Some(from.to_string());
        push_data.target = None;
        Self {
            room: Some(room.to_string()),
            push_data,
        }
    }

    /// Адресный конверт: доставляется в персональную комнату получателя
    pub fn direct(from: &str, target: &str, mut push_data: PushData) -> Self {
        push_data.from = Some(from.to_string());
        push_data.target = Some(target.to_string());
        Self {
            room: Some(user_room(target)),
            push_data,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.push_data.target.is_some()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Составной идентификатор конечной точки
pub fn peer_key(user_id: &str, uuid: &str) -> String {
    format!("{}{}{}", user_id, KEY_SEPARATOR, uuid)
}

/// Персональная комната пользователя, через которую идут адресные конверты
pub fn user_room(key: &str) -> String {
    let user = key.split(KEY_SEPARATOR).next().unwrap_or(key);
    format!("user_{}", user)
}

/// Ретранслятор сигналинга (внешний транспорт)
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Если target задан, доставка адресная доставка, иначе рассылка по комнате
    async fn send(&self, envelope: SignalingEnvelope, target: Option<&str>)
        -> Result<(), RelayError>;

    /// Следующий входящий конверт; None, если ретранслятор закрыт
    async fn recv(&self) -> Option<SignalingEnvelope>;
}

#[async_trait]
impl<T: SignalingRelay + ?Sized> SignalingRelay for Arc<T> {
    async fn send(
        &self,
        envelope: SignalingEnvelope,
        target: Option<&str>,
    ) -> Result<(), RelayError> {
        (**self).send(envelope, target).await
    }

    async fn recv(&self) -> Option<SignalingEnvelope> {
        (**self).recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SdpType;

    #[test]
    fn direct_envelope_targets_user_room() {
        let target = peer_key("bob", "k2");
        let env = SignalingEnvelope::direct(
            "alice$$k1",
            &target,
            PushData::new(SignalKind::PreOffer, ChannelKind::Message),
        );
        assert_eq!(env.room.as_deref(), Some("user_bob"));
        assert_eq!(env.push_data.target.as_deref(), Some("bob$$k2"));
        assert!(env.is_direct());
    }

    #[test]
    fn offer_envelope_wire_format() {
        let mut push = PushData::new(SignalKind::Offer, ChannelKind::Media);
        push.auth = Some("t0k3n".into());
        push.data = Some(SignalPayload::Description(SessionDescription::offer("v=0")));
        let env = SignalingEnvelope::direct("a", "b", push);

        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["pushData"]["type"], "offer");
        assert_eq!(value["pushData"]["channel"], "media");
        assert_eq!(value["pushData"]["data"]["type"], "offer");
        assert!(value["pushData"].get("channelSize").is_none());

        let back = SignalingEnvelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(back.push_data.description().map(|d| d.sdp_type), Some(SdpType::Offer));
    }

    #[test]
    fn candidate_batch_payload_parses_as_list() {
        let json = r#"{"pushData":{"peer":true,"type":"icecandidate","from":"x",
            "data":[{"candidate":"candidate:0","sdpMid":"0","sdpMLineIndex":0}]}}"#;
        let env = SignalingEnvelope::from_json(json).unwrap();
        assert_eq!(env.push_data.candidates().map(|c| c.len()), Some(1));
        assert_eq!(env.push_data.channel, None);
    }

    #[test]
    fn legacy_label_resolves_header() {
        let mut push = PushData::new(SignalKind::PreOffer, ChannelKind::Data);
        push.channel_label = Some("data-file1-0".into());
        assert_eq!(
            push.resolve_header("data"),
            Some(ChannelHeader::transfer("file1", 0))
        );
    }
}
