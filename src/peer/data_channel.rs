use crate::error::ProviderError;
use crate::peer::provider::{ChannelEvent, DataChannel};
use crate::peer::types::ChannelState;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Канал webrtc-rs: колбэки переводятся в поток `ChannelEvent`
pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    events: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl WebRtcDataChannel {
    /// общий обработчик data-channel
    pub fn attach(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = dc.label().to_string();

        dc.on_open(Box::new({
            let tx = tx.clone();
            let label = label.clone();
            move || {
                debug!(%label, "Data channel opened");
                let _ = tx.send(ChannelEvent::Open);
                Box::pin(async {})
            }
        }));

        dc.on_message(Box::new({
            let tx = tx.clone();
            move |msg: DataChannelMessage| {
                let _ = tx.send(ChannelEvent::Message(msg.data));
                Box::pin(async {})
            }
        }));

        dc.on_error(Box::new({
            let tx = tx.clone();
            let label = label.clone();
            move |e: webrtc::Error| {
                warn!(%label, "Data channel error: {e}");
                let _ = tx.send(ChannelEvent::Error(e.to_string()));
                Box::pin(async {})
            }
        }));

        dc.on_close(Box::new({
            let tx = tx.clone();
            move || {
                debug!(%label, "Data channel closed");
                let _ = tx.send(ChannelEvent::Close);
                Box::pin(async {})
            }
        }));

        // канал мог открыться до регистрации обработчика
        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        Arc::new(Self {
            dc,
            events: Mutex::new(rx),
        })
    }
}

fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn ready_state(&self) -> ChannelState {
        channel_state(self.dc.ready_state())
    }

    async fn send(&self, data: Bytes) -> Result<(), ProviderError> {
        let state = self.ready_state();
        if state != ChannelState::Open {
            return Err(ProviderError::ChannelNotOpen(state));
        }
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn next_event(&self) -> Option<ChannelEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(label = self.dc.label(), "Close failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping() {
        assert_eq!(channel_state(RTCDataChannelState::Open), ChannelState::Open);
        assert_eq!(
            channel_state(RTCDataChannelState::Unspecified),
            ChannelState::Connecting
        );
        assert_eq!(channel_state(RTCDataChannelState::Closed), ChannelState::Closed);
    }
}
