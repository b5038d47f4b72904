//! Контракт провайдера соединений.
//!
//! Оркестратор не знает про конкретный WebRTC-стек: он работает с
//! соединениями и каналами через эти трейты, а события провайдера
//! получает по каналу `ConnectionEvent`.

use crate::error::ProviderError;
use crate::peer::types::{
    ChannelHeader, ChannelInit, ChannelState, ConnectionState, IceCandidate, MediaKind,
    MediaStream, MediaTrack, SessionDescription,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// События соединения, которые провайдер отправляет оркестратору
pub enum ConnectionEvent {
    /// Новый локальный кандидат
    IceCandidate(IceCandidate),
    /// Канал, открытый удалённой стороной
    DataChannel(Arc<dyn DataChannel>),
    /// Удалённый медиапоток
    Track(MediaStream),
    StateChange(ConnectionState),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            ConnectionEvent::DataChannel(dc) => {
                f.debug_tuple("DataChannel").field(&dc.label()).finish()
            }
            ConnectionEvent::Track(s) => f.debug_tuple("Track").field(&s.id).finish(),
            ConnectionEvent::StateChange(s) => f.debug_tuple("StateChange").field(s).finish(),
        }
    }
}

/// События data-канала
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Error(String),
    Close,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn ready_state(&self) -> ChannelState;

    /// Отправка одного сообщения; завершается, когда транспорт принял данные
    async fn send(&self, data: Bytes) -> Result<(), ProviderError>;

    /// Следующее событие канала; None, если источник событий исчерпан
    async fn next_event(&self) -> Option<ChannelEvent>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, ProviderError>;

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ProviderError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), ProviderError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError>;

    async fn create_data_channel(
        &self,
        header: &ChannelHeader,
        init: &ChannelInit,
    ) -> Result<Arc<dyn DataChannel>, ProviderError>;

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), ProviderError>;

    /// Снимает отправляемые треки; при None снимаются все
    async fn remove_tracks(&self, kind: Option<MediaKind>) -> Result<(), ProviderError>;

    fn state(&self) -> ConnectionState;

    async fn close(&self);
}

#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Создаёт соединение с `remote`; события уходят в `events`
    async fn create_connection(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ProviderError>;
}

#[async_trait]
impl<T: ConnectionProvider + ?Sized> ConnectionProvider for Arc<T> {
    async fn create_connection(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ProviderError> {
        (**self).create_connection(remote, events).await
    }
}
