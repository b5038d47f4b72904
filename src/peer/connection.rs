use crate::config::PeerOptions;
use crate::error::ProviderError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::WebRtcDataChannel;
use crate::peer::provider::{ConnectionEvent, ConnectionProvider, DataChannel, PeerConnection};
use crate::peer::types::{
    ChannelHeader, ChannelInit, ConnectionState, IceCandidate, MediaKind, MediaStream, MediaTrack,
    SdpType, ServerConfig, SessionDescription,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Провайдер соединений на webrtc-rs
pub struct WebRtcProvider {
    api: API,
    config: RTCConfiguration,
    transfer_prefix: String,
    /// Локальные треки по id: один трек раздаётся во все соединения
    tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
}

impl WebRtcProvider {
    pub fn new(options: &PeerOptions) -> Result<Self, ProviderError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            config: rtc_config(&options.ice_servers),
            transfer_prefix: options.transfer_prefix.clone(),
            tracks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Трек, в который конвейер захвата пишет сэмплы
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().get(track_id).cloned()
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn connection_state(st: RTCPeerConnectionState) -> ConnectionState {
    match st {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, ProviderError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, ProviderError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        other => {
            return Err(ProviderError::Unsupported(format!(
                "session description type {other:?}"
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl ConnectionProvider for WebRtcProvider {
    async fn create_connection(
        &self,
        remote: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ProviderError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let remote = remote.to_string();

        pc.on_ice_candidate(Box::new({
            let events = events.clone();
            let remote = remote.clone();
            move |cand: Option<RTCIceCandidate>| {
                match cand.map(|c| c.to_json()) {
                    Some(Ok(init)) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        dump_candidate("LOCAL", &remote, &candidate);
                        let _ = events.send(ConnectionEvent::IceCandidate(candidate));
                    }
                    Some(Err(e)) => warn!(%remote, "Failed to serialize candidate: {e}"),
                    // cand == None означает конец сбора
                    None => debug!(%remote, "ICE candidate gathering completed"),
                }
                Box::pin(async {})
            }
        }));

        pc.on_data_channel(Box::new({
            let events = events.clone();
            move |dc: Arc<RTCDataChannel>| {
                let channel: Arc<dyn DataChannel> = WebRtcDataChannel::attach(dc);
                let _ = events.send(ConnectionEvent::DataChannel(channel));
                Box::pin(async {})
            }
        }));

        pc.on_track(Box::new({
            let events = events.clone();
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let stream = MediaStream {
                    id: track.stream_id(),
                    tracks: vec![MediaTrack::new(track.id(), kind)],
                };
                let _ = events.send(ConnectionEvent::Track(stream));
                Box::pin(async {})
            }
        }));

        // слабая ссылка: обработчик живёт внутри самого pc
        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new({
            let remote = remote.clone();
            move |st: RTCPeerConnectionState| {
                info!(%remote, "Peer connection state changed to: {:?}", st);
                if st == RTCPeerConnectionState::Failed {
                    if let Some(pc) = weak_pc.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                let _ = events.send(ConnectionEvent::StateChange(connection_state(st)));
                Box::pin(async {})
            }
        }));

        Ok(Arc::new(WebRtcConnection {
            pc,
            remote,
            transfer_prefix: self.transfer_prefix.clone(),
            tracks: self.tracks.clone(),
            senders: Mutex::new(Vec::new()),
        }))
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    remote: String,
    transfer_prefix: String,
    tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
    senders: Mutex<Vec<(MediaKind, Arc<RTCRtpSender>)>>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ProviderError> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ProviderError> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ProviderError> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ProviderError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ProviderError> {
        dump_candidate("REMOTE", &self.remote, &candidate);
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        header: &ChannelHeader,
        init: &ChannelInit,
    ) -> Result<Arc<dyn DataChannel>, ProviderError> {
        let label = header.to_label(&self.transfer_prefix);
        let dc = self
            .pc
            .create_data_channel(
                &label,
                Some(RTCDataChannelInit {
                    ordered: init.ordered,
                    max_retransmits: init.max_retransmits,
                    max_packet_life_time: init.max_packet_life_time,
                    ..Default::default()
                }),
            )
            .await?;
        debug!(remote = %self.remote, label, "Data channel created");
        Ok(WebRtcDataChannel::attach(dc))
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), ProviderError> {
        let local = {
            let mut tracks = self.tracks.lock();
            tracks
                .entry(track.id.clone())
                .or_insert_with(|| {
                    Arc::new(TrackLocalStaticSample::new(
                        codec_for(track.kind),
                        track.id.clone(),
                        stream_id.to_string(),
                    ))
                })
                .clone()
        };
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.senders.lock().push((track.kind, sender));
        Ok(())
    }

    async fn remove_tracks(&self, kind: Option<MediaKind>) -> Result<(), ProviderError> {
        let removed: Vec<_> = {
            let mut senders = self.senders.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = senders
                .drain(..)
                .partition(|(k, _)| kind.map_or(true, |want| *k == want));
            *senders = kept;
            removed
        };
        for (_, sender) in removed {
            self.pc.remove_track(&sender).await?;
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(remote = %self.remote, "Failed to close peer connection: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_scheme_and_credentials() {
        let mut turn = ServerConfig::stun("t", "turn.example.org:3478");
        turn.r#type = "turn".into();
        turn.username = Some("u".into());
        turn.credential = Some("p".into());

        let servers = get_user_ice_servers(&[turn]);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "p");
    }

    #[test]
    fn config_uses_bundle_and_mux() {
        let config = rtc_config(&PeerOptions::default().ice_servers);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(config.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
    }

    #[tokio::test]
    async fn offer_carries_message_channel() {
        let options = PeerOptions {
            ice_servers: Vec::new(),
            ..PeerOptions::default()
        };
        let provider = WebRtcProvider::new(&options).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = provider.create_connection("bob$$1", tx).await.unwrap();

        let dc = conn
            .create_data_channel(&ChannelHeader::Message, &ChannelInit::default())
            .await
            .unwrap();
        assert_eq!(dc.label(), "message");

        let offer = conn.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=application"));
        conn.close().await;
    }

    #[test]
    fn state_mapping() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
    }
}
