use crate::event_bus::EventKind;
use crate::peer::types::ChannelState;
use thiserror::Error;

/// Ошибки внешнего провайдера соединений (SDP, ICE, каналы, треки)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider backend error: {0}")]
    Backend(String),
    #[error("connection closed")]
    Closed,
    #[error("channel not open: {0:?}")]
    ChannelNotOpen(ChannelState),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<webrtc::Error> for ProviderError {
    fn from(e: webrtc::Error) -> Self {
        ProviderError::Backend(e.to_string())
    }
}

/// Ошибки ретранслятора сигналинга
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay send failed: {0}")]
    SendFailed(String),
    #[error("relay not connected")]
    NotConnected,
}

/// Ошибки устройства захвата медиа
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission to capture media was denied")]
    PermissionDenied,
    #[error("capture device cannot satisfy the constraints")]
    ConstraintNotSatisfied,
    #[error("no capture device available")]
    NoDevice,
    #[error("capture failed: {0}")]
    Other(String),
}

/// Ошибки блочной передачи данных
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("channel open timeout")]
    OpenTimeout,
    #[error("channel error: {0}")]
    Channel(String),
    #[error("there is no data for id {0}")]
    MissingData(String),
}

/// Этап согласования, на котором произошёл сбой
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreateConnection,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AttachTracks,
    CreateChannel,
}

/// Основная таксономия ошибок оркестратора
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PeerError {
    #[error("listener already registered for {0:?}")]
    DuplicateListener(EventKind),
    #[error("auth invalid for offer from {remote}")]
    AuthInvalid { remote: String },
    #[error("no active peer for {remote}")]
    NoActivePeer { remote: String },
    #[error("channel readyState: {state:?}")]
    ChannelStateError { state: ChannelState },
    #[error("there is no room")]
    MissingRoom,
    #[error("there is no media stream")]
    MissingStream,
    #[error("negotiation with {remote} failed at {stage:?}: {source}")]
    NegotiationFailure {
        remote: String,
        stage: NegotiationStage,
        #[source]
        source: ProviderError,
    },
    #[error("peer {remote} removed")]
    PeerRemoved { remote: String },
    #[error("fetch of {data_id} from {remote} cancelled")]
    FetchCancelled { remote: String, data_id: String },
    #[error("orchestrator is not set up")]
    NotSetup,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl PeerError {
    pub(crate) fn negotiation(remote: &str, stage: NegotiationStage, source: ProviderError) -> Self {
        PeerError::NegotiationFailure {
            remote: remote.to_string(),
            stage,
            source,
        }
    }
}
