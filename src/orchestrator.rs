//! Оркестратор соединений.
//!
//! Ведёт таблицу пиров, проводит рукопожатие через ретранслятор
//! (preOffer → offerConfirm → offer → answer, плюс icecandidate и
//! closeMedia), проверяет токен авторизации и связывает пакетирование
//! кандидатов, блочную передачу, канал сообщений и раздачу медиа.
//!
//! Входящие конверты обрабатываются строго по одному в фоновом цикле,
//! запущенном в `setup`. Блокировки таблицы пиров никогда не удерживаются
//! во время ожидания провайдера или ретранслятора.

use crate::config::PeerOptions;
use crate::error::{CaptureError, NegotiationStage, PeerError, ProviderError};
use crate::event_bus::{Consent, EventBus, EventKind, Listener, PeerEvent};
use crate::media::{LocalMediaState, MediaCapture, MediaConstraints, MediaShareController};
use crate::peer::ice::{analyze_candidates, apply_candidates};
use crate::peer::message::MessageChannel;
use crate::peer::provider::{ConnectionEvent, ConnectionProvider, DataChannel, PeerConnection};
use crate::peer::state::{PeerTable, TaskGuard};
use crate::peer::types::{
    ChannelHeader, ChannelInit, ChannelKind, ConnectionState, IceCandidate, MediaKind,
    MediaStream, PeerState,
};
use crate::signaling::{PushData, SignalKind, SignalPayload, SignalingEnvelope, SignalingRelay};
use crate::transfer::{receive_chunks, send_chunks, FetchHandle, FetchLedger};
use crate::utils::random_id;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Параметры, заданные в `setup`
#[derive(Clone)]
struct Session {
    local: String,
    relay: Arc<dyn SignalingRelay>,
    options: Arc<PeerOptions>,
}

struct Inner {
    auth: String,
    provider: Arc<dyn ConnectionProvider>,
    bus: Arc<EventBus>,
    media: MediaShareController,
    peers: PeerTable,
    ledger: FetchLedger,
    data_store: Mutex<HashMap<String, Bytes>>,
    session: RwLock<Option<Session>>,
    relay_loop: Mutex<Option<TaskGuard>>,
}

#[derive(Clone)]
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl ConnectionOrchestrator {
    pub fn new(provider: Arc<dyn ConnectionProvider>, capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            inner: Arc::new(Inner {
                auth: random_id(),
                provider,
                bus: Arc::new(EventBus::new()),
                media: MediaShareController::new(capture),
                peers: PeerTable::new(),
                ledger: FetchLedger::new(),
                data_store: Mutex::new(HashMap::new()),
                session: RwLock::new(None),
                relay_loop: Mutex::new(None),
            }),
        }
    }

    /// Привязка к ретранслятору; входящие конверты обрабатываются по очереди
    pub fn setup(
        &self,
        local: &str,
        relay: Arc<dyn SignalingRelay>,
        options: PeerOptions,
    ) -> Result<(), PeerError> {
        options.validate()?;
        *self.inner.session.write() = Some(Session {
            local: local.to_string(),
            relay: relay.clone(),
            options: Arc::new(options),
        });

        let weak = Arc::downgrade(&self.inner);
        let local = local.to_string();
        let task = TaskGuard::spawn(async move {
            while let Some(envelope) = relay.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = inner.handle_envelope(envelope).await {
                    match e {
                        PeerError::AuthInvalid { .. } | PeerError::NoActivePeer { .. } => {
                            warn!(%local, "Inbound envelope dropped: {e}")
                        }
                        _ => error!(%local, "Inbound envelope failed: {e}"),
                    }
                }
            }
            debug!(%local, "Relay closed, inbound loop finished");
        });
        *self.inner.relay_loop.lock() = Some(task);
        info!("Orchestrator set up");
        Ok(())
    }

    /// Токен авторизации этого экземпляра
    pub fn auth(&self) -> &str {
        &self.inner.auth
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> Result<(), PeerError> {
        self.inner.bus.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, kind: EventKind, listener: Option<&Listener>) {
        self.inner.bus.unsubscribe(kind, listener)
    }

    /// Данные, которые пиры смогут забрать через fetch_data
    pub fn add_data(&self, data_id: &str, data: impl Into<Bytes>) {
        self.inner
            .data_store
            .lock()
            .insert(data_id.to_string(), data.into());
    }

    /// Запрос данных у пира; `size`: сколько байт ожидается начиная с `offset`
    pub async fn fetch_data(
        &self,
        remote: &str,
        data_id: &str,
        size: u64,
        offset: u64,
    ) -> Result<FetchHandle, PeerError> {
        self.fetch_data_with(remote, data_id, size, offset, ChannelInit::default())
            .await
    }

    pub async fn fetch_data_with(
        &self,
        remote: &str,
        data_id: &str,
        size: u64,
        offset: u64,
        config: ChannelInit,
    ) -> Result<FetchHandle, PeerError> {
        let session = self.inner.session()?;
        let header = ChannelHeader::transfer(data_id, offset);

        let mut push = PushData::new(SignalKind::PreOffer, ChannelKind::Data);
        push.offset = Some(offset);
        push.channel_size = Some(size);
        push.channel_label = Some(header.to_label(&session.options.transfer_prefix));
        push.channel_header = Some(header);
        push.channel_config = Some(config);

        // запись нужна, чтобы remove_peer / close_all_peer отклонили ожидание
        let created = !self.inner.peers.contains(remote);
        self.inner.peers.with_or_insert(remote, |_| ());
        let handle = self.inner.ledger.insert(remote, data_id);
        if let Err(e) = self.inner.send_direct(&session, remote, push).await {
            self.inner.ledger.take(remote, data_id);
            if created {
                self.inner.peers.take(remote);
            }
            return Err(e);
        }
        debug!(remote, data_id, size, offset, "Fetch requested");
        Ok(handle)
    }

    /// Просит текущих раздающих в комнате прислать offer этому пиру
    pub async fn fetch_media(&self, room: &str) -> Result<(), PeerError> {
        let session = self.inner.session()?;
        if room.is_empty() {
            return Err(PeerError::MissingRoom);
        }
        let mut push = PushData::new(SignalKind::OfferConfirm, ChannelKind::Media);
        push.auth = Some(self.inner.auth.clone());
        self.inner.send_room(&session, room, push).await
    }

    pub async fn share_media_stream(&self, room: &str) -> Result<(), PeerError> {
        let session = self.inner.session()?;
        self.inner.media.begin_share(room)?;
        let push = PushData::new(SignalKind::PreOffer, ChannelKind::Media);
        self.inner.send_room(&session, room, push).await
    }

    pub async fn stop_share_media_stream(&self) {
        self.inner.stop_share().await;
    }

    /// При выключенном звуке аудиотреки снимаются со всех медиа-пиров
    pub async fn set_mute(&self, muted: bool) {
        let Some(stream) = self.inner.media.set_mute(muted) else {
            return;
        };
        for remote in self.inner.peers.media_keys() {
            let Some(conn) = self.inner.peers.connection(&remote) else {
                continue;
            };
            let result = if muted {
                conn.remove_tracks(Some(MediaKind::Audio)).await
            } else {
                let mut result = Ok(());
                for track in stream.audio_tracks() {
                    if let Err(e) = conn.add_track(&track, &stream.id).await {
                        result = Err(e);
                    }
                }
                result
            };
            if let Err(e) = result {
                warn!(%remote, muted, "Failed to update audio tracks: {e}");
            }
        }
    }

    /// Захват локального медиа. Отказ в доступе и невыполнимые ограничения
    /// публикуются как `MediaError`, результатом будет `None`.
    pub async fn get_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Option<MediaStream>, PeerError> {
        let media = &self.inner.media;
        if media.stream().is_some() {
            self.inner.stop_share().await;
            media.release_stream().await;
        }

        let capture = media.resolve_constraints(&constraints).await;
        match media.capture(&capture).await {
            Ok(stream) => {
                info!(stream = %stream.id, tracks = stream.tracks.len(), "Local media captured");
                Ok(Some(stream))
            }
            Err(condition @ (CaptureError::PermissionDenied | CaptureError::ConstraintNotSatisfied)) => {
                warn!("Local media unavailable: {condition}");
                self.inner.bus.publish(PeerEvent::MediaError { condition });
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn local_media(&self) -> LocalMediaState {
        self.inner.media.snapshot()
    }

    pub async fn send_message(&self, remote: &str, payload: impl Into<Bytes>) -> Result<(), PeerError> {
        self.inner.send_message(remote, payload.into()).await
    }

    /// Останавливает раздачу и удаляет всех пиров
    pub async fn close_all_peer(&self) {
        self.inner.stop_share().await;
        for remote in self.inner.peers.keys() {
            self.inner.remove_peer(&remote);
        }
        let orphaned = self.inner.ledger.reject_all();
        if orphaned > 0 {
            debug!(orphaned, "Rejected fetches without peer");
        }
    }

    /// Обработка одного входящего конверта
    pub async fn handle_envelope(&self, envelope: SignalingEnvelope) -> Result<(), PeerError> {
        self.inner.handle_envelope(envelope).await
    }

    /// Локальный кандидат для пакетной отправки
    pub fn record_candidate(&self, remote: &str, candidate: IceCandidate) {
        self.inner.record_candidate(remote, candidate);
    }

    pub fn cancel_candidates(&self, remote: &str) {
        self.inner.peers.with(remote, |r| r.candidates.cancel());
    }

    pub fn remove_peer(&self, remote: &str) -> bool {
        self.inner.remove_peer(remote)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn peer_state(&self, remote: &str) -> Option<PeerState> {
        self.inner.peers.state(remote)
    }

    pub fn is_media_peer(&self, remote: &str) -> bool {
        self.inner.peers.with(remote, |r| r.is_media).unwrap_or(false)
    }

    /// Сколько пиров ждут отправки пачки кандидатов
    pub fn pending_batch_count(&self) -> usize {
        self.inner.peers.scheduled_batches()
    }

    pub fn pending_fetch_count(&self) -> usize {
        self.inner.ledger.len()
    }
}

impl Inner {
    fn session(&self) -> Result<Session, PeerError> {
        self.session.read().clone().ok_or(PeerError::NotSetup)
    }

    async fn send_direct(
        &self,
        session: &Session,
        target: &str,
        push: PushData,
    ) -> Result<(), PeerError> {
        let envelope = SignalingEnvelope::direct(&session.local, target, push);
        session.relay.send(envelope, Some(target)).await?;
        Ok(())
    }

    async fn send_room(&self, session: &Session, room: &str, push: PushData) -> Result<(), PeerError> {
        let envelope = SignalingEnvelope::broadcast(room, &session.local, push);
        session.relay.send(envelope, None).await?;
        Ok(())
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: SignalingEnvelope) -> Result<(), PeerError> {
        let session = self.session()?;
        let push = envelope.push_data;

        // чужие и нерелевантные конверты молча пропускаем
        if !push.peer {
            return Ok(());
        }
        if push.target.as_deref().is_some_and(|t| t != session.local) {
            return Ok(());
        }
        let Some(from) = push.from.clone() else {
            debug!("Envelope without sender ignored");
            return Ok(());
        };
        if from == session.local {
            return Ok(());
        }

        debug!(remote = %from, kind = ?push.kind, channel = ?push.channel, "Inbound signal");
        let kind = push.kind;
        match kind {
            SignalKind::PreOffer => self.on_pre_offer(&session, &from, push).await,
            SignalKind::OfferConfirm => self.on_offer_confirm(&session, &from, push).await,
            SignalKind::Offer => self.on_offer(&session, &from, push).await,
            SignalKind::Answer => self.on_answer(&from, push).await,
            SignalKind::IceCandidate => self.on_candidates(&from, push).await,
            SignalKind::CloseMedia => {
                self.on_close_media(&from);
                Ok(())
            }
        }
    }

    async fn on_pre_offer(
        self: &Arc<Self>,
        session: &Session,
        from: &str,
        push: PushData,
    ) -> Result<(), PeerError> {
        let channel = push
            .channel
            .ok_or_else(|| PeerError::MalformedEnvelope("preOffer without channel".into()))?;

        if channel != ChannelKind::Media {
            self.peers.with_or_insert(from, |_| ());
            return self.confirm_offer(session, from, channel, Some(&push)).await;
        }

        // медиа требует согласия пользователя
        self.peers.with_or_insert(from, |r| {
            if r.state == PeerState::Idle {
                r.state = PeerState::AwaitingConsent;
            }
        });
        let weak = Arc::downgrade(self);
        let session = session.clone();
        let remote = from.to_string();
        let consent = Consent::new(async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Err(e) = inner
                .confirm_offer(&session, &remote, ChannelKind::Media, None)
                .await
            {
                warn!(remote, "Media consent failed: {e}");
            }
        });
        self.bus.publish(PeerEvent::ShareMedia {
            key: from.to_string(),
            consent,
        });
        Ok(())
    }

    /// offerConfirm с нашим токеном: offer от пира будет проверен по нему
    async fn confirm_offer(
        &self,
        session: &Session,
        remote: &str,
        channel: ChannelKind,
        request: Option<&PushData>,
    ) -> Result<(), PeerError> {
        let mut push = PushData::new(SignalKind::OfferConfirm, channel);
        push.auth = Some(self.auth.clone());
        if let Some(request) = request {
            push.channel_label = request.channel_label.clone();
            push.channel_header = request.channel_header.clone();
            push.channel_config = request.channel_config.clone();
            push.channel_size = request.channel_size;
            push.offset = request.offset;
        }
        self.peers.with(remote, |r| {
            if matches!(r.state, PeerState::Idle | PeerState::AwaitingConsent) {
                r.state = PeerState::Negotiating;
            }
        });
        self.send_direct(session, remote, push).await
    }

    async fn on_offer_confirm(
        self: &Arc<Self>,
        session: &Session,
        from: &str,
        push: PushData,
    ) -> Result<(), PeerError> {
        let channel = push
            .channel
            .ok_or_else(|| PeerError::MalformedEnvelope("offerConfirm without channel".into()))?;
        if channel == ChannelKind::Media && !(self.media.is_sending() && self.media.stream().is_some())
        {
            debug!(remote = from, "Media confirm ignored, not sharing");
            return Ok(());
        }
        if channel == ChannelKind::Data && !self.fetch_pending(session, from, &push) {
            warn!(remote = from, "Data confirm without pending fetch");
            return Ok(());
        }

        let (conn, _) = self.ensure_connection(session, from).await?;
        self.peers.with(from, |r| {
            r.remote_auth = push.auth.clone();
            if r.state != PeerState::Open {
                r.state = PeerState::Negotiating;
            }
            if channel == ChannelKind::Media {
                r.is_media = true;
            }
        });

        match channel {
            ChannelKind::Media => self.attach_tracks(from, &conn).await?,
            ChannelKind::Data => {
                if !self.bind_transfer(session, from, &conn, &push).await? {
                    return Ok(());
                }
            }
            ChannelKind::Message => {
                let has_channel = self.peers.with(from, |r| r.message.is_some()).unwrap_or(false);
                if !has_channel {
                    let dc = conn
                        .create_data_channel(&ChannelHeader::Message, &ChannelInit::default())
                        .await
                        .map_err(|e| PeerError::negotiation(from, NegotiationStage::CreateChannel, e))?;
                    self.install_message_channel(from, dc);
                }
            }
        }

        self.send_offer(from, &conn, channel, session).await
    }

    /// Ошибки заголовка сообщает bind_transfer
    fn fetch_pending(&self, session: &Session, from: &str, push: &PushData) -> bool {
        match push.resolve_header(&session.options.transfer_prefix) {
            Some(ChannelHeader::Transfer { data_id, .. }) => self.ledger.contains(from, &data_id),
            _ => true,
        }
    }

    /// Канал приёма для ожидающего fetch_data; false, если ждать некому
    async fn bind_transfer(
        &self,
        session: &Session,
        from: &str,
        conn: &Arc<dyn PeerConnection>,
        push: &PushData,
    ) -> Result<bool, PeerError> {
        let header = push
            .resolve_header(&session.options.transfer_prefix)
            .ok_or_else(|| PeerError::MalformedEnvelope("data confirm without header".into()))?;
        let ChannelHeader::Transfer { data_id, .. } = &header else {
            return Err(PeerError::MalformedEnvelope(
                "data confirm with message header".into(),
            ));
        };
        let Some(reply) = self.ledger.take(from, data_id) else {
            warn!(remote = from, data_id, "No pending fetch for confirm");
            return Ok(false);
        };

        let init = push.channel_config.clone().unwrap_or_default();
        let dc = match conn.create_data_channel(&header, &init).await {
            Ok(dc) => dc,
            Err(e) => {
                let err = PeerError::negotiation(from, NegotiationStage::CreateChannel, e);
                let _ = reply.send(Err(err.clone()));
                return Err(err);
            }
        };

        let expected = push.channel_size.unwrap_or(0);
        let open_timeout = session.options.open_timeout();
        let bus = self.bus.clone();
        let remote = from.to_string();
        let data_id = data_id.clone();
        tokio::spawn(async move {
            let result = receive_chunks(dc, &remote, &data_id, expected, open_timeout, &bus)
                .await
                .map_err(PeerError::from);
            if let Err(e) = &result {
                warn!(%remote, %data_id, "Fetch failed: {e}");
            }
            let _ = reply.send(result);
        });
        Ok(true)
    }

    async fn send_offer(
        &self,
        remote: &str,
        conn: &Arc<dyn PeerConnection>,
        channel: ChannelKind,
        session: &Session,
    ) -> Result<(), PeerError> {
        let offer = conn
            .create_offer()
            .await
            .map_err(|e| PeerError::negotiation(remote, NegotiationStage::CreateOffer, e))?;
        conn.set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::negotiation(remote, NegotiationStage::SetLocalDescription, e))?;

        let mut push = PushData::new(SignalKind::Offer, channel);
        push.auth = self.peers.with(remote, |r| r.remote_auth.clone()).flatten();
        push.data = Some(SignalPayload::Description(offer));
        self.send_direct(session, remote, push).await
    }

    async fn on_offer(
        self: &Arc<Self>,
        session: &Session,
        from: &str,
        push: PushData,
    ) -> Result<(), PeerError> {
        if push.auth.as_deref() != Some(self.auth.as_str()) {
            return Err(PeerError::AuthInvalid {
                remote: from.to_string(),
            });
        }
        let channel = push
            .channel
            .ok_or_else(|| PeerError::MalformedEnvelope("offer without channel".into()))?;
        let offer = push
            .description()
            .cloned()
            .ok_or_else(|| PeerError::MalformedEnvelope("offer without description".into()))?;

        let (conn, _) = self.ensure_connection(session, from).await?;
        if channel == ChannelKind::Media {
            self.peers.with(from, |r| r.is_media = true);
        }

        conn.set_remote_description(offer)
            .await
            .map_err(|e| PeerError::negotiation(from, NegotiationStage::SetRemoteDescription, e))?;
        self.remote_described(from, &conn).await;

        let answer = conn
            .create_answer()
            .await
            .map_err(|e| PeerError::negotiation(from, NegotiationStage::CreateAnswer, e))?;
        conn.set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::negotiation(from, NegotiationStage::SetLocalDescription, e))?;

        let mut reply = PushData::new(SignalKind::Answer, channel);
        reply.data = Some(SignalPayload::Description(answer));
        self.send_direct(session, from, reply).await?;

        if channel == ChannelKind::Media {
            self.bus.publish(PeerEvent::ReadyForShareMedia {
                key: from.to_string(),
            });
        }
        Ok(())
    }

    async fn on_answer(&self, from: &str, push: PushData) -> Result<(), PeerError> {
        let answer = push
            .description()
            .cloned()
            .ok_or_else(|| PeerError::MalformedEnvelope("answer without description".into()))?;
        let conn = self.peers.connection(from).ok_or_else(|| PeerError::NoActivePeer {
            remote: from.to_string(),
        })?;
        conn.set_remote_description(answer)
            .await
            .map_err(|e| PeerError::negotiation(from, NegotiationStage::SetRemoteDescription, e))?;
        self.remote_described(from, &conn).await;
        Ok(())
    }

    async fn on_candidates(&self, from: &str, push: PushData) -> Result<(), PeerError> {
        let candidates = push
            .candidates()
            .map(<[IceCandidate]>::to_vec)
            .ok_or_else(|| PeerError::MalformedEnvelope("icecandidate without list".into()))?;
        let conn = self.peers.connection(from).ok_or_else(|| PeerError::NoActivePeer {
            remote: from.to_string(),
        })?;

        // до remote description кандидаты копятся в записи
        let ready = self
            .peers
            .with(from, |r| {
                if r.remote_described {
                    Some(candidates)
                } else {
                    debug!(remote = from, "Remote description not set yet, queuing candidates");
                    r.pending_remote.extend(candidates);
                    None
                }
            })
            .flatten();
        if let Some(candidates) = ready {
            apply_candidates(&conn, from, candidates).await;
        }
        Ok(())
    }

    fn on_close_media(&self, from: &str) {
        // сообщения и передачи данных с этим пиром не трогаем
        if self.peers.with(from, |r| r.is_media) != Some(true) {
            debug!(remote = from, "closeMedia for non-media peer");
            return;
        }
        self.bus.publish(PeerEvent::StopMedia {
            key: from.to_string(),
        });
        self.remove_peer(from);
    }

    async fn remote_described(&self, remote: &str, conn: &Arc<dyn PeerConnection>) {
        let pending = self
            .peers
            .with(remote, |r| {
                r.remote_described = true;
                std::mem::take(&mut r.pending_remote)
            })
            .unwrap_or_default();
        if !pending.is_empty() {
            apply_candidates(conn, remote, pending).await;
        }
    }

    /// Соединение с пиром; создаётся при первом обращении
    async fn ensure_connection(
        self: &Arc<Self>,
        session: &Session,
        remote: &str,
    ) -> Result<(Arc<dyn PeerConnection>, bool), PeerError> {
        if let Some(conn) = self.peers.connection(remote) {
            return Ok((conn, false));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = self
            .provider
            .create_connection(remote, tx)
            .await
            .map_err(|e| PeerError::negotiation(remote, NegotiationStage::CreateConnection, e))?;

        // пока ждали провайдера, соединение мог создать другой обработчик
        let weak = Arc::downgrade(self);
        let existing = self.peers.with_or_insert(remote, |r| match &r.connection {
            Some(existing) => Some(existing.clone()),
            None => {
                r.connection = Some(conn.clone());
                if matches!(r.state, PeerState::Idle | PeerState::AwaitingConsent) {
                    r.state = PeerState::Negotiating;
                }
                r.events = Some(TaskGuard::spawn(connection_events(
                    weak,
                    remote.to_string(),
                    rx,
                )));
                None
            }
        });

        match existing {
            Some(existing) => {
                tokio::spawn(async move { conn.close().await });
                Ok((existing, false))
            }
            None => {
                debug!(local = %session.local, remote, "Peer connection created");
                Ok((conn, true))
            }
        }
    }

    async fn attach_tracks(
        &self,
        remote: &str,
        conn: &Arc<dyn PeerConnection>,
    ) -> Result<(), PeerError> {
        let stream = self.media.stream().ok_or(PeerError::MissingStream)?;
        let muted = self.media.is_muted();
        let failed = |e: ProviderError| PeerError::negotiation(remote, NegotiationStage::AttachTracks, e);

        // треки добавляются до создания offer
        conn.remove_tracks(None).await.map_err(failed)?;
        for track in &stream.tracks {
            if muted && track.kind == MediaKind::Audio {
                continue;
            }
            conn.add_track(track, &stream.id).await.map_err(failed)?;
        }
        Ok(())
    }

    async fn send_message(self: &Arc<Self>, remote: &str, payload: Bytes) -> Result<(), PeerError> {
        let session = self.session()?;

        let existing = self
            .peers
            .with(remote, |r| r.message.as_ref().map(|m| m.send(payload.clone())))
            .flatten();
        if let Some(result) = existing {
            return result;
        }

        let (conn, created) = self.ensure_connection(&session, remote).await?;
        let dc = conn
            .create_data_channel(&ChannelHeader::Message, &ChannelInit::default())
            .await
            .map_err(|e| PeerError::negotiation(remote, NegotiationStage::CreateChannel, e))?;
        self.install_message_channel(remote, dc);

        let queued = self
            .peers
            .with(remote, |r| r.message.as_ref().map(|m| m.send(payload)))
            .flatten()
            .ok_or_else(|| PeerError::PeerRemoved {
                remote: remote.to_string(),
            })?;
        queued?;

        if created {
            let push = PushData::new(SignalKind::PreOffer, ChannelKind::Message);
            self.send_direct(&session, remote, push).await?;
        }
        Ok(())
    }

    fn install_message_channel(&self, remote: &str, dc: Arc<dyn DataChannel>) {
        let channel = MessageChannel::install(remote, dc, Arc::downgrade(&self.bus));
        let replaced = self
            .peers
            .with(remote, |r| r.message.replace(channel))
            .flatten();
        if let Some(old) = replaced {
            old.shutdown();
        }
    }

    fn record_candidate(self: &Arc<Self>, remote: &str, candidate: IceCandidate) {
        let Ok(session) = self.session() else {
            return;
        };
        let window = session.options.candidate_batch_window();
        let weak = Arc::downgrade(self);
        let target = remote.to_string();
        self.peers.with(remote, |r| {
            r.candidates.record(candidate, window, move |batch| {
                let Some(inner) = weak.upgrade() else { return };
                analyze_candidates(&batch);
                let channel = if inner.peers.with(&target, |r| r.is_media).unwrap_or(false) {
                    ChannelKind::Media
                } else {
                    ChannelKind::Data
                };
                let mut push = PushData::new(SignalKind::IceCandidate, channel);
                push.data = Some(SignalPayload::Candidates(batch));
                tokio::spawn(async move {
                    if let Err(e) = inner.send_direct(&session, &target, push).await {
                        warn!(remote = %target, "Candidate batch not sent: {e}");
                    }
                });
            });
        });
    }

    async fn on_connection_event(self: &Arc<Self>, remote: &str, event: ConnectionEvent) {
        match event {
            ConnectionEvent::IceCandidate(candidate) => self.record_candidate(remote, candidate),
            ConnectionEvent::DataChannel(channel) => self.accept_channel(remote, channel),
            ConnectionEvent::Track(stream) => {
                debug!(remote, stream = %stream.id, "Remote media received");
                self.bus.publish(PeerEvent::NewMedia {
                    key: remote.to_string(),
                    stream,
                });
            }
            ConnectionEvent::StateChange(state) => self.on_state_change(remote, state),
        }
    }

    fn on_state_change(self: &Arc<Self>, remote: &str, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.peers.with(remote, |r| {
                    if r.grace.take().is_some() {
                        info!(remote, "Connection recovered during grace period");
                    }
                    r.state = PeerState::Open;
                });
            }
            ConnectionState::Disconnected => {
                let Ok(session) = self.session() else { return };
                let grace = session.options.disconnect_grace();
                let weak = Arc::downgrade(self);
                let target = remote.to_string();
                self.peers.with(remote, |r| {
                    if r.grace.is_some() {
                        return;
                    }
                    info!(remote, "Peer disconnected, grace period {:?}", grace);
                    r.grace = Some(TaskGuard::spawn(async move {
                        sleep(grace).await;
                        if let Some(inner) = weak.upgrade() {
                            warn!(remote = %target, "Grace period over, removing peer");
                            inner.remove_peer(&target);
                        }
                    }));
                });
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                if self.remove_peer(remote) {
                    info!(remote, ?state, "Peer connection ended");
                }
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// Канал, открытый пиром: назначение определяется только по метке
    fn accept_channel(&self, remote: &str, channel: Arc<dyn DataChannel>) {
        let Ok(session) = self.session() else { return };
        let label = channel.label();
        match ChannelHeader::parse(&label, &session.options.transfer_prefix) {
            Some(ChannelHeader::Transfer { data_id, offset }) => {
                let source = self.data_store.lock().get(&data_id).cloned();
                let Some(source) = source else {
                    warn!(remote, %data_id, "There is no data for requested id");
                    tokio::spawn(async move { channel.close().await });
                    return;
                };
                let chunk_size = session.options.chunk_size;
                let remote = remote.to_string();
                tokio::spawn(async move {
                    if let Err(e) = send_chunks(channel, source, chunk_size, offset).await {
                        warn!(%remote, %data_id, "Send failed: {e}");
                    }
                });
            }
            Some(ChannelHeader::Message) => self.install_message_channel(remote, channel),
            None => warn!(remote, %label, "Unexpected channel label, ignoring"),
        }
    }

    fn stop_share_peers(&self) -> Vec<String> {
        self.media.end_share();
        self.peers.media_keys()
    }

    async fn stop_share(&self) {
        let remotes = self.stop_share_peers();
        let session = self.session().ok();
        for remote in remotes {
            // сначала уведомляем пира, потом закрываем у себя
            if let Some(session) = &session {
                let push = PushData::new(SignalKind::CloseMedia, ChannelKind::Media);
                if let Err(e) = self.send_direct(session, &remote, push).await {
                    warn!(%remote, "closeMedia not sent: {e}");
                }
            }
            self.remove_peer(&remote);
        }
    }

    /// Удаляет запись пира: таймеры и задачи снимаются, ожидающие fetch
    /// отклоняются, соединение закрывается в фоне
    fn remove_peer(&self, remote: &str) -> bool {
        let Some(mut record) = self.peers.take(remote) else {
            return false;
        };
        let rejected = self.ledger.reject_remote(remote);
        let connection = record.connection.take();
        record.shutdown();
        drop(record);

        debug!(remote, rejected, "Peer removed");
        self.bus.publish(PeerEvent::PeerRemove {
            key: remote.to_string(),
        });
        if let Some(connection) = connection {
            tokio::spawn(async move { connection.close().await });
        }
        true
    }
}

async fn connection_events(
    inner: Weak<Inner>,
    remote: String,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_connection_event(&remote, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::listener;
    use crate::mock::{MockCapture, MockNetwork, MockProvider, MockRelay};
    use crate::peer::types::SessionDescription;
    use std::ops::ControlFlow;
    use std::time::Duration;

    fn orchestrator(local: &str) -> (ConnectionOrchestrator, Arc<MockRelay>, Arc<MockProvider>) {
        let provider = MockProvider::new(local, MockNetwork::new());
        let relay = MockRelay::new(local);
        let orch = ConnectionOrchestrator::new(provider.clone(), Arc::new(MockCapture::new()));
        orch.setup(local, relay.clone(), PeerOptions::default()).unwrap();
        (orch, relay, provider)
    }

    fn inbound(from: &str, to: &str, push: PushData) -> SignalingEnvelope {
        SignalingEnvelope::direct(from, to, push)
    }

    #[tokio::test]
    async fn offer_with_wrong_auth_is_dropped() {
        let (orch, relay, provider) = orchestrator("bob$$1");
        let mut push = PushData::new(SignalKind::Offer, ChannelKind::Data);
        push.auth = Some("not-the-token".into());
        push.data = Some(SignalPayload::Description(SessionDescription::offer("v=0")));

        let result = orch.handle_envelope(inbound("alice$$1", "bob$$1", push)).await;
        assert_eq!(
            result,
            Err(PeerError::AuthInvalid {
                remote: "alice$$1".into()
            })
        );
        assert_eq!(orch.peer_count(), 0);
        assert!(provider.connections().is_empty());
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn answer_without_peer_is_no_active_peer() {
        let (orch, _relay, _provider) = orchestrator("bob$$1");
        let mut push = PushData::new(SignalKind::Answer, ChannelKind::Data);
        push.data = Some(SignalPayload::Description(SessionDescription::answer("v=0")));
        let result = orch.handle_envelope(inbound("alice$$1", "bob$$1", push)).await;
        assert!(matches!(result, Err(PeerError::NoActivePeer { .. })));
    }

    #[tokio::test]
    async fn envelopes_for_others_are_ignored() {
        let (orch, relay, _provider) = orchestrator("bob$$1");
        let push = PushData::new(SignalKind::PreOffer, ChannelKind::Message);
        orch.handle_envelope(inbound("alice$$1", "carol$$1", push.clone()))
            .await
            .unwrap();
        orch.handle_envelope(inbound("bob$$1", "bob$$1", push)).await.unwrap();
        assert_eq!(orch.peer_count(), 0);
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn data_pre_offer_is_confirmed_with_local_token() {
        let (orch, relay, _provider) = orchestrator("bob$$1");
        let mut push = PushData::new(SignalKind::PreOffer, ChannelKind::Data);
        push.channel_header = Some(ChannelHeader::transfer("f", 0));
        push.channel_size = Some(42);
        orch.handle_envelope(inbound("alice$$1", "bob$$1", push)).await.unwrap();

        let sent = relay.next_sent().await.unwrap();
        assert_eq!(sent.push_data.kind, SignalKind::OfferConfirm);
        assert_eq!(sent.push_data.auth.as_deref(), Some(orch.auth()));
        assert_eq!(sent.push_data.channel_size, Some(42));
        assert_eq!(sent.push_data.target.as_deref(), Some("alice$$1"));
        assert_eq!(orch.peer_state("alice$$1"), Some(PeerState::Negotiating));
    }

    #[tokio::test]
    async fn media_pre_offer_waits_for_consent() {
        let (orch, relay, _provider) = orchestrator("bob$$1");
        let consents = Arc::new(Mutex::new(Vec::new()));
        orch.subscribe(
            EventKind::ShareMedia,
            listener({
                let consents = consents.clone();
                move |e| {
                    if let PeerEvent::ShareMedia { consent, .. } = e {
                        consents.lock().push(consent.clone());
                    }
                    ControlFlow::Continue(())
                }
            }),
        )
        .unwrap();

        let push = PushData::new(SignalKind::PreOffer, ChannelKind::Media);
        orch.handle_envelope(inbound("alice$$1", "bob$$1", push)).await.unwrap();
        assert!(relay.sent().is_empty());
        assert_eq!(orch.peer_state("alice$$1"), Some(PeerState::AwaitingConsent));

        let consent = consents.lock().pop().unwrap();
        consent.agree();
        let sent = relay.next_sent().await.unwrap();
        assert_eq!(sent.push_data.kind, SignalKind::OfferConfirm);
        assert_eq!(sent.push_data.channel, Some(ChannelKind::Media));
    }

    #[tokio::test]
    async fn share_without_stream_sends_nothing() {
        let (orch, relay, _provider) = orchestrator("alice$$1");
        assert_eq!(
            orch.share_media_stream("room1").await,
            Err(PeerError::MissingStream)
        );
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn candidates_before_description_are_queued() {
        let (orch, _relay, provider) = orchestrator("alice$$1");
        // исходящий запрос сообщений создаёт соединение без remote description
        orch.send_message("bob$$1", "hi").await.unwrap();

        let mut push = PushData::new(SignalKind::IceCandidate, ChannelKind::Message);
        push.data = Some(SignalPayload::Candidates(vec![IceCandidate::new("candidate:9")]));
        orch.handle_envelope(inbound("bob$$1", "alice$$1", push)).await.unwrap();
        let conn = provider.connection("bob$$1").unwrap();
        assert!(conn.candidates().is_empty());

        let mut answer = PushData::new(SignalKind::Answer, ChannelKind::Message);
        answer.data = Some(SignalPayload::Description(SessionDescription::answer("v=0")));
        orch.handle_envelope(inbound("bob$$1", "alice$$1", answer)).await.unwrap();
        assert_eq!(conn.candidates(), vec![IceCandidate::new("candidate:9")]);
    }

    #[tokio::test]
    async fn negotiation_failure_keeps_peer() {
        let (orch, relay, provider) = orchestrator("bob$$1");
        provider.fail_at(NegotiationStage::CreateAnswer);
        let mut push = PushData::new(SignalKind::Offer, ChannelKind::Data);
        push.auth = Some(orch.auth().to_string());
        push.data = Some(SignalPayload::Description(SessionDescription::offer("v=0")));

        let result = orch.handle_envelope(inbound("alice$$1", "bob$$1", push)).await;
        assert!(matches!(
            result,
            Err(PeerError::NegotiationFailure {
                stage: NegotiationStage::CreateAnswer,
                ..
            })
        ));
        assert_eq!(orch.peer_count(), 1);
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn removing_peer_rejects_pending_fetch() {
        let (orch, _relay, _provider) = orchestrator("alice$$1");
        let handle = orch.fetch_data("bob$$1", "file1", 10, 0).await.unwrap();
        assert_eq!(orch.peer_count(), 1);
        assert!(orch.remove_peer("bob$$1"));
        assert_eq!(
            handle.await,
            Err(PeerError::PeerRemoved {
                remote: "bob$$1".into()
            })
        );
        assert_eq!(orch.pending_fetch_count(), 0);
    }

    #[tokio::test]
    async fn close_all_rejects_fetch_to_silent_peer() {
        let (orch, _relay, _provider) = orchestrator("alice$$1");
        let handle = orch.fetch_data("bob$$1", "file1", 10, 0).await.unwrap();
        orch.close_all_peer().await;
        assert_eq!(
            handle.await,
            Err(PeerError::PeerRemoved {
                remote: "bob$$1".into()
            })
        );
        assert_eq!(orch.peer_count(), 0);
        assert_eq!(orch.pending_fetch_count(), 0);
    }

    #[tokio::test]
    async fn data_confirm_without_fetch_sends_no_offer() {
        let (orch, relay, provider) = orchestrator("alice$$1");
        let mut push = PushData::new(SignalKind::OfferConfirm, ChannelKind::Data);
        push.auth = Some("bob-token".into());
        push.channel_header = Some(ChannelHeader::transfer("file1", 0));
        push.channel_size = Some(10);

        orch.handle_envelope(inbound("bob$$1", "alice$$1", push)).await.unwrap();
        assert!(relay.sent().is_empty());
        assert!(provider.connections().is_empty());
        assert_eq!(orch.peer_count(), 0);
    }

    #[tokio::test]
    async fn close_media_leaves_message_peer() {
        let (orch, _relay, _provider) = orchestrator("bob$$1");
        let stops = Arc::new(Mutex::new(0));
        orch.subscribe(
            EventKind::StopMedia,
            listener({
                let stops = stops.clone();
                move |_| {
                    *stops.lock() += 1;
                    ControlFlow::Continue(())
                }
            }),
        )
        .unwrap();
        orch.send_message("alice$$1", "hi").await.unwrap();
        assert!(!orch.is_media_peer("alice$$1"));

        let push = PushData::new(SignalKind::CloseMedia, ChannelKind::Media);
        orch.handle_envelope(inbound("alice$$1", "bob$$1", push)).await.unwrap();
        assert_eq!(orch.peer_count(), 1);
        assert_eq!(*stops.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_all_cancels_candidate_batches() {
        let (orch, relay, _provider) = orchestrator("alice$$1");
        orch.send_message("bob$$1", "hi").await.unwrap();
        orch.record_candidate("bob$$1", IceCandidate::new("candidate:1"));
        assert_eq!(orch.pending_batch_count(), 1);

        orch.close_all_peer().await;
        sleep(Duration::from_secs(2)).await;
        assert_eq!(orch.pending_batch_count(), 0);
        assert!(relay
            .sent()
            .iter()
            .all(|(e, _)| e.push_data.kind != SignalKind::IceCandidate));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_grace_removes_peer() {
        let network = MockNetwork::new();
        let provider = MockProvider::new("alice$$1", network.clone());
        let relay = MockRelay::new("alice$$1");
        let orch = ConnectionOrchestrator::new(provider, Arc::new(MockCapture::new()));
        orch.setup("alice$$1", relay, PeerOptions::default()).unwrap();

        orch.send_message("bob$$1", "hi").await.unwrap();
        network.set_state("alice$$1", "bob$$1", ConnectionState::Disconnected);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(orch.peer_count(), 1);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(orch.peer_count(), 0);
    }
}
