//! Оркестрация P2P-соединений: сигналинг через ретранслятор, пакеты
//! ICE-кандидатов, блочная передача данных, канал сообщений и раздача медиа.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod logger;
pub mod media;
pub mod mock;
pub mod orchestrator;
pub mod peer;
pub mod signaling;
pub mod transfer;
pub mod utils;

pub use config::PeerOptions;
pub use error::{CaptureError, PeerError, ProviderError, RelayError, TransferError};
pub use event_bus::{listener, Consent, EventBus, EventKind, Listener, PeerEvent};
pub use media::{MediaCapture, MediaConstraints, MediaMode};
pub use orchestrator::ConnectionOrchestrator;
pub use peer::connection::WebRtcProvider;
pub use signaling::{SignalingEnvelope, SignalingRelay};
pub use transfer::FetchHandle;
