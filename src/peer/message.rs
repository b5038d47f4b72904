//! Канал коротких сообщений с удалённым пиром.
//!
//! Пока канал в состоянии connecting, исходящие сообщения копятся в
//! очереди и уходят по порядку после открытия.

use crate::error::PeerError;
use crate::event_bus::{EventBus, PeerEvent};
use crate::peer::provider::{ChannelEvent, DataChannel};
use crate::peer::state::TaskGuard;
use crate::peer::types::{ChannelState, MESSAGE_CHANNEL_LABEL};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MessageChannel {
    channel: Arc<dyn DataChannel>,
    outbound: mpsc::UnboundedSender<Bytes>,
    _pump: TaskGuard,
}

impl MessageChannel {
    pub fn install(remote: &str, channel: Arc<dyn DataChannel>, bus: Weak<EventBus>) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        let pump = TaskGuard::spawn(pump(remote.to_string(), channel.clone(), rx, bus));
        Self {
            channel,
            outbound,
            _pump: pump,
        }
    }

    pub fn ready_state(&self) -> ChannelState {
        self.channel.ready_state()
    }

    pub fn send(&self, payload: Bytes) -> Result<(), PeerError> {
        match self.channel.ready_state() {
            ChannelState::Connecting | ChannelState::Open => self
                .outbound
                .send(payload)
                .map_err(|_| PeerError::ChannelStateError {
                    state: ChannelState::Closed,
                }),
            state => Err(PeerError::ChannelStateError { state }),
        }
    }

    /// Очередь сбрасывается, канал закрывается в фоне
    pub fn shutdown(self) {
        let channel = self.channel.clone();
        drop(self);
        tokio::spawn(async move { channel.close().await });
    }
}

async fn pump(
    remote: String,
    channel: Arc<dyn DataChannel>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    bus: Weak<EventBus>,
) {
    let mut queue: VecDeque<Bytes> = VecDeque::new();
    let mut open = channel.ready_state() == ChannelState::Open;

    loop {
        tokio::select! {
            Some(payload) = outbound.recv() => {
                queue.push_back(payload);
                if !open && channel.ready_state() == ChannelState::Open {
                    open = true;
                }
            }
            event = channel.next_event() => match event {
                Some(ChannelEvent::Open) => {
                    debug!(%remote, "Message channel opened, flushing {} queued", queue.len());
                    open = true;
                }
                Some(ChannelEvent::Message(message)) => {
                    if let Some(bus) = bus.upgrade() {
                        bus.publish(PeerEvent::Message {
                            key: remote.clone(),
                            channel: MESSAGE_CHANNEL_LABEL.to_string(),
                            message,
                        });
                    }
                }
                Some(ChannelEvent::Error(detail)) => {
                    warn!(%remote, "Message channel error: {detail}");
                    if let Some(bus) = bus.upgrade() {
                        bus.publish(PeerEvent::ChannelError {
                            key: remote.clone(),
                            detail,
                        });
                    }
                }
                Some(ChannelEvent::Close) | None => {
                    debug!(%remote, "Message channel closed");
                    return;
                }
            }
        }

        if open {
            while let Some(payload) = queue.pop_front() {
                if let Err(e) = channel.send(payload).await {
                    warn!(%remote, "Message send failed: {e}");
                    if let Some(bus) = bus.upgrade() {
                        bus.publish(PeerEvent::ChannelError {
                            key: remote.clone(),
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{listener, EventKind};
    use crate::mock::MockDataChannel;
    use parking_lot::Mutex;
    use std::ops::ControlFlow;

    #[tokio::test]
    async fn queued_messages_flush_in_order_after_open() {
        let bus = Arc::new(EventBus::new());
        let (local, remote) = MockDataChannel::pair("message");
        let channel = MessageChannel::install("bob", local.clone(), Arc::downgrade(&bus));

        channel.send(Bytes::from_static(b"one")).unwrap();
        channel.send(Bytes::from_static(b"two")).unwrap();
        tokio::task::yield_now().await;
        assert!(local.sent().is_empty());

        local.open();
        assert_eq!(remote.next_event().await, Some(ChannelEvent::Open));
        assert_eq!(
            remote.next_event().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"one")))
        );
        assert_eq!(
            remote.next_event().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"two")))
        );
    }

    #[tokio::test]
    async fn inbound_message_is_published() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventKind::Message,
            listener({
                let seen = seen.clone();
                move |e| {
                    if let PeerEvent::Message { key, message, .. } = e {
                        seen.lock().push((key.clone(), message.clone()));
                    }
                    ControlFlow::Continue(())
                }
            }),
        )
        .unwrap();

        let (local, remote) = MockDataChannel::pair("message");
        let _channel = MessageChannel::install("bob", local.clone(), Arc::downgrade(&bus));
        local.open();
        remote.send(Bytes::from_static(b"hi")).await.unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *seen.lock(),
            vec![("bob".to_string(), Bytes::from_static(b"hi"))]
        );
    }

    #[tokio::test]
    async fn closed_channel_reports_state() {
        let bus = Arc::new(EventBus::new());
        let (local, _remote) = MockDataChannel::pair("message");
        let channel = MessageChannel::install("bob", local.clone(), Arc::downgrade(&bus));
        local.close().await;
        assert_eq!(
            channel.send(Bytes::from_static(b"late")),
            Err(PeerError::ChannelStateError {
                state: ChannelState::Closed
            })
        );
    }
}
