//! Моки для тестов и симуляции.
//!
//! Ретранслятор, провайдер соединений, data-каналы и устройство захвата
//! работают на каналах в памяти вместо сети и WebRTC.

use crate::config::PeerOptions;
use crate::error::{CaptureError, NegotiationStage, ProviderError, RelayError};
use crate::media::{CaptureConstraints, DeviceInfo, MediaCapture};
use crate::peer::provider::{
    ChannelEvent, ConnectionEvent, ConnectionProvider, DataChannel, PeerConnection,
};
use crate::peer::types::{
    ChannelHeader, ChannelInit, ChannelState, ConnectionState, IceCandidate, MediaKind,
    MediaStream, MediaTrack, SdpType, SessionDescription,
};
use crate::signaling::{SignalingEnvelope, SignalingRelay};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

// ============================================================================
// Ретранслятор
// ============================================================================

/// Общая шина ретрансляторов: адресные конверты идут получателю,
/// широковещательные всем, кроме отправителя
#[derive(Default)]
pub struct MockHub {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<SignalingEnvelope>>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn relay(self: &Arc<Self>, identity: &str) -> Arc<MockRelay> {
        let relay = MockRelay::build(identity, Arc::downgrade(self));
        self.inboxes
            .lock()
            .insert(identity.to_string(), relay.inbox_tx.clone());
        relay
    }

    fn route(&self, from: &str, envelope: &SignalingEnvelope, target: Option<&str>) {
        let inboxes = self.inboxes.lock();
        match target {
            Some(target) => {
                if let Some(tx) = inboxes.get(target) {
                    let _ = tx.send(envelope.clone());
                }
            }
            None => {
                for (identity, tx) in inboxes.iter() {
                    if identity != from {
                        let _ = tx.send(envelope.clone());
                    }
                }
            }
        }
    }
}

pub struct MockRelay {
    identity: String,
    hub: Weak<MockHub>,
    inbox_tx: mpsc::UnboundedSender<SignalingEnvelope>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingEnvelope>>,
    sent: Mutex<Vec<(SignalingEnvelope, Option<String>)>>,
    sent_tx: mpsc::UnboundedSender<SignalingEnvelope>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingEnvelope>>,
}

impl MockRelay {
    /// Ретранслятор без шины: только журнал отправленного
    pub fn new(identity: &str) -> Arc<Self> {
        Self::build(identity, Weak::new())
    }

    fn build(identity: &str, hub: Weak<MockHub>) -> Arc<Self> {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            identity: identity.to_string(),
            hub,
            inbox_tx,
            inbox: tokio::sync::Mutex::new(inbox),
            sent: Mutex::new(Vec::new()),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        })
    }

    /// Подложить входящий конверт
    pub fn inject(&self, envelope: SignalingEnvelope) {
        let _ = self.inbox_tx.send(envelope);
    }

    pub fn sent(&self) -> Vec<(SignalingEnvelope, Option<String>)> {
        self.sent.lock().clone()
    }

    /// Следующий отправленный конверт (ждёт, если ещё не отправлен)
    pub async fn next_sent(&self) -> Option<SignalingEnvelope> {
        self.sent_rx.lock().await.recv().await
    }
}

#[async_trait]
impl SignalingRelay for MockRelay {
    async fn send(
        &self,
        envelope: SignalingEnvelope,
        target: Option<&str>,
    ) -> Result<(), RelayError> {
        self.sent
            .lock()
            .push((envelope.clone(), target.map(str::to_string)));
        let _ = self.sent_tx.send(envelope.clone());
        if let Some(hub) = self.hub.upgrade() {
            hub.route(&self.identity, &envelope, target);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<SignalingEnvelope> {
        self.inbox.lock().await.recv().await
    }
}

// ============================================================================
// Data-канал
// ============================================================================

/// Один конец пары каналов; состояние у концов общее
pub struct MockDataChannel {
    label: String,
    state: Arc<Mutex<ChannelState>>,
    own_tx: mpsc::UnboundedSender<ChannelEvent>,
    peer_tx: mpsc::UnboundedSender<ChannelEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    sent: Mutex<Vec<Bytes>>,
}

impl MockDataChannel {
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let state = Arc::new(Mutex::new(ChannelState::Connecting));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            label: label.to_string(),
            state: state.clone(),
            own_tx: a_tx.clone(),
            peer_tx: b_tx.clone(),
            events: tokio::sync::Mutex::new(a_rx),
            sent: Mutex::new(Vec::new()),
        });
        let b = Arc::new(Self {
            label: label.to_string(),
            state,
            own_tx: b_tx,
            peer_tx: a_tx,
            events: tokio::sync::Mutex::new(b_rx),
            sent: Mutex::new(Vec::new()),
        });
        (a, b)
    }

    /// Открывает пару: оба конца получают Open
    pub fn open(&self) {
        let mut state = self.state.lock();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Open;
            let _ = self.own_tx.send(ChannelEvent::Open);
            let _ = self.peer_tx.send(ChannelEvent::Open);
        }
    }

    pub fn inject(&self, event: ChannelEvent) {
        let _ = self.own_tx.send(event);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn sent_sizes(&self) -> Vec<usize> {
        self.sent.lock().iter().map(Bytes::len).collect()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send(&self, data: Bytes) -> Result<(), ProviderError> {
        let state = *self.state.lock();
        if state != ChannelState::Open {
            return Err(ProviderError::ChannelNotOpen(state));
        }
        self.sent.lock().push(data.clone());
        let _ = self.peer_tx.send(ChannelEvent::Message(data));
        Ok(())
    }

    async fn next_event(&self) -> Option<ChannelEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Closed;
            let _ = self.own_tx.send(ChannelEvent::Close);
            let _ = self.peer_tx.send(ChannelEvent::Close);
        }
    }
}

// ============================================================================
// Провайдер соединений
// ============================================================================

/// Сторона соединения `owner -> peer` в общей сети
#[derive(Default)]
struct Endpoint {
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    /// Локальные концы каналов, созданных владельцем
    channels: Vec<Arc<MockDataChannel>>,
    /// Удалённые концы, ещё не доставленные второй стороне
    undelivered: Vec<Arc<MockDataChannel>>,
    undelivered_tracks: Vec<(String, MediaTrack)>,
    connected: bool,
}

/// Сеть, общая для всех MockProvider одного теста
#[derive(Default)]
pub struct MockNetwork {
    endpoints: Mutex<HashMap<(String, String), Endpoint>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn emit(&self, owner: &str, peer: &str, event: ConnectionEvent) {
        let endpoints = self.endpoints.lock();
        if let Some(tx) = endpoints
            .get(&(owner.to_string(), peer.to_string()))
            .and_then(|e| e.events.as_ref())
        {
            let _ = tx.send(event);
        }
    }

    /// Вторая сторона применила offer: отдаём ей каналы и треки
    fn deliver_offer(&self, offerer: &str, answerer: &str) {
        let (channels, tracks) = {
            let mut endpoints = self.endpoints.lock();
            let endpoint = endpoints
                .entry((offerer.to_string(), answerer.to_string()))
                .or_default();
            (
                std::mem::take(&mut endpoint.undelivered),
                std::mem::take(&mut endpoint.undelivered_tracks),
            )
        };
        for channel in channels {
            self.emit(answerer, offerer, ConnectionEvent::DataChannel(channel));
        }
        let mut streams: Vec<MediaStream> = Vec::new();
        for (stream_id, track) in tracks {
            match streams.iter_mut().find(|s| s.id == stream_id) {
                Some(stream) => stream.tracks.push(track),
                None => streams.push(MediaStream {
                    id: stream_id,
                    tracks: vec![track],
                }),
            }
        }
        for stream in streams {
            self.emit(answerer, offerer, ConnectionEvent::Track(stream));
        }
    }

    /// Offerer применил answer: соединение установлено, каналы открываются
    fn connect(&self, offerer: &str, answerer: &str) {
        let channels = {
            let mut endpoints = self.endpoints.lock();
            let mut channels = Vec::new();
            for key in [
                (offerer.to_string(), answerer.to_string()),
                (answerer.to_string(), offerer.to_string()),
            ] {
                let endpoint = endpoints.entry(key).or_default();
                endpoint.connected = true;
                channels.extend(endpoint.channels.iter().cloned());
            }
            channels
        };
        self.emit(offerer, answerer, ConnectionEvent::StateChange(ConnectionState::Connected));
        self.emit(answerer, offerer, ConnectionEvent::StateChange(ConnectionState::Connected));
        for channel in channels {
            channel.open();
        }
    }

    /// Сообщить владельцу о смене состояния (обрыв, сбой)
    pub fn set_state(&self, owner: &str, peer: &str, state: ConnectionState) {
        self.emit(owner, peer, ConnectionEvent::StateChange(state));
    }

    /// Подложить владельцу локальный кандидат
    pub fn discover_candidate(&self, owner: &str, peer: &str, candidate: IceCandidate) {
        self.emit(owner, peer, ConnectionEvent::IceCandidate(candidate));
    }
}

pub struct MockProvider {
    identity: String,
    network: Arc<MockNetwork>,
    transfer_prefix: String,
    fail_stage: Mutex<Option<NegotiationStage>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockProvider {
    pub fn new(identity: &str, network: Arc<MockNetwork>) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.to_string(),
            network,
            transfer_prefix: PeerOptions::default().transfer_prefix,
            fail_stage: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Все последующие соединения падают на указанном этапе
    pub fn fail_at(&self, stage: NegotiationStage) {
        *self.fail_stage.lock() = Some(stage);
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    /// Последнее соединение с `remote`
    pub fn connection(&self, remote: &str) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|c| c.remote == remote)
            .cloned()
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    async fn create_connection(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ProviderError> {
        let fail_stage = *self.fail_stage.lock();
        if fail_stage == Some(NegotiationStage::CreateConnection) {
            return Err(ProviderError::Backend("mock create failure".into()));
        }
        {
            let mut endpoints = self.network.endpoints.lock();
            let endpoint = endpoints
                .entry((self.identity.clone(), remote.to_string()))
                .or_default();
            *endpoint = Endpoint {
                events: Some(events),
                ..Default::default()
            };
        }
        let connection = Arc::new(MockConnection {
            local: self.identity.clone(),
            remote: remote.to_string(),
            network: self.network.clone(),
            transfer_prefix: self.transfer_prefix.clone(),
            fail_stage,
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::New),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
        });
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

/// Соединение, которое записывает все вызовы
pub struct MockConnection {
    local: String,
    remote: String,
    network: Arc<MockNetwork>,
    transfer_prefix: String,
    fail_stage: Option<NegotiationStage>,
    calls: Mutex<Vec<&'static str>>,
    state: Mutex<ConnectionState>,
    remote_description: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<MediaTrack>>,
}

impl MockConnection {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == ConnectionState::Closed
    }

    fn enter(&self, call: &'static str, stage: NegotiationStage) -> Result<(), ProviderError> {
        self.calls.lock().push(call);
        if *self.state.lock() == ConnectionState::Closed {
            return Err(ProviderError::Closed);
        }
        if self.fail_stage == Some(stage) {
            return Err(ProviderError::Backend(format!("mock {call} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ProviderError> {
        self.enter("create_offer", NegotiationStage::CreateOffer)?;
        Ok(SessionDescription::offer(format!("mock-offer {}", self.local)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        self.enter("create_answer", NegotiationStage::CreateAnswer)?;
        Ok(SessionDescription::answer(format!("mock-answer {}", self.local)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), ProviderError> {
        self.enter("set_local_description", NegotiationStage::SetLocalDescription)?;
        // после установки локального описания начинается сбор кандидатов
        self.network.discover_candidate(
            &self.local,
            &self.remote,
            IceCandidate::new(format!("candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host ufrag {}", self.local)),
        );
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ProviderError> {
        self.enter("set_remote_description", NegotiationStage::SetRemoteDescription)?;
        let sdp_type = desc.sdp_type;
        *self.remote_description.lock() = Some(desc);
        match sdp_type {
            SdpType::Offer => self.network.deliver_offer(&self.remote, &self.local),
            SdpType::Answer => self.network.connect(&self.local, &self.remote),
            SdpType::Pranswer => {}
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError> {
        self.calls.lock().push("add_ice_candidate");
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        header: &ChannelHeader,
        _init: &ChannelInit,
    ) -> Result<Arc<dyn DataChannel>, ProviderError> {
        self.enter("create_data_channel", NegotiationStage::CreateChannel)?;
        let (local, remote) = MockDataChannel::pair(&header.to_label(&self.transfer_prefix));
        let connected = {
            let mut endpoints = self.network.endpoints.lock();
            let endpoint = endpoints
                .entry((self.local.clone(), self.remote.clone()))
                .or_default();
            endpoint.channels.push(local.clone());
            if !endpoint.connected {
                endpoint.undelivered.push(remote.clone());
            }
            endpoint.connected
        };
        // на установленном соединении канал открывается без пересогласования
        if connected {
            self.network.emit(
                &self.remote,
                &self.local,
                ConnectionEvent::DataChannel(remote),
            );
            local.open();
        }
        Ok(local)
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), ProviderError> {
        self.enter("add_track", NegotiationStage::AttachTracks)?;
        self.tracks.lock().push(track.clone());
        let mut endpoints = self.network.endpoints.lock();
        endpoints
            .entry((self.local.clone(), self.remote.clone()))
            .or_default()
            .undelivered_tracks
            .push((stream_id.to_string(), track.clone()));
        Ok(())
    }

    async fn remove_tracks(&self, kind: Option<MediaKind>) -> Result<(), ProviderError> {
        self.calls.lock().push("remove_tracks");
        self.tracks
            .lock()
            .retain(|t| kind.is_some_and(|k| t.kind != k));
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn close(&self) {
        self.calls.lock().push("close");
        *self.state.lock() = ConnectionState::Closed;
        let channels = {
            let mut endpoints = self.network.endpoints.lock();
            let endpoint = endpoints
                .entry((self.local.clone(), self.remote.clone()))
                .or_default();
            endpoint.connected = false;
            std::mem::take(&mut endpoint.channels)
        };
        for channel in channels {
            channel.close().await;
        }
        self.network.emit(
            &self.local,
            &self.remote,
            ConnectionEvent::StateChange(ConnectionState::Closed),
        );
    }
}

// ============================================================================
// Устройство захвата
// ============================================================================

#[derive(Default)]
pub struct MockCapture {
    devices: Vec<DeviceInfo>,
    failure: Mutex<Option<CaptureError>>,
    captured: Mutex<Vec<CaptureConstraints>>,
    released: Mutex<Vec<String>>,
}

impl MockCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(mut self, devices: Vec<DeviceInfo>) -> Self {
        self.devices = devices;
        self
    }

    /// Следующий захват завершится ошибкой
    pub fn fail_next(&self, error: CaptureError) {
        *self.failure.lock() = Some(error);
    }

    pub fn captured(&self) -> Vec<CaptureConstraints> {
        self.captured.lock().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for MockCapture {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        Ok(self.devices.clone())
    }

    async fn capture(&self, constraints: &CaptureConstraints) -> Result<MediaStream, CaptureError> {
        if let Some(error) = self.failure.lock().take() {
            return Err(error);
        }
        let n = {
            let mut captured = self.captured.lock();
            captured.push(constraints.clone());
            captured.len()
        };
        let mut tracks = vec![MediaTrack::new(format!("audio-{n}"), MediaKind::Audio)];
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(format!("video-{n}"), MediaKind::Video));
        }
        Ok(MediaStream {
            id: format!("local-stream-{n}"),
            tracks,
        })
    }

    async fn release(&self, stream: &MediaStream) {
        self.released.lock().push(stream.id.clone());
    }
}
