pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod message;
pub mod provider;
pub mod state;
pub mod types;

pub use provider::{ChannelEvent, ConnectionEvent, ConnectionProvider, DataChannel, PeerConnection};
pub use types::{
    ChannelHeader, ChannelInit, ChannelKind, ChannelState, ConnectionState, IceCandidate,
    MediaKind, MediaStream, MediaTrack, PeerState, ServerConfig, SessionDescription,
};
