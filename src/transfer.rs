//! Блочная передача данных поверх data-канала.
//!
//! Отправитель режет источник на блоки фиксированного размера и пишет
//! следующий блок только после того, как канал принял предыдущий.
//! Получатель копит блоки и сообщает о прогрессе через шину.

use crate::error::{PeerError, TransferError};
use crate::event_bus::{EventBus, PeerEvent};
use crate::peer::provider::{ChannelEvent, DataChannel};
use crate::peer::types::ChannelState;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Отправка `source[start_offset..]` блоками по `chunk_size`
pub async fn send_chunks(
    channel: Arc<dyn DataChannel>,
    source: Bytes,
    chunk_size: usize,
    start_offset: u64,
) -> Result<(), TransferError> {
    let label = channel.label();

    if channel.ready_state() != ChannelState::Open {
        loop {
            match channel.next_event().await {
                Some(ChannelEvent::Open) => break,
                Some(ChannelEvent::Message(_)) => continue,
                Some(ChannelEvent::Error(e)) => return Err(TransferError::Channel(e)),
                Some(ChannelEvent::Close) | None => {
                    debug!(%label, "Channel closed before open, nothing sent");
                    return Ok(());
                }
            }
        }
    }

    let total = source.len();
    let mut offset = usize::try_from(start_offset).unwrap_or(usize::MAX).min(total);
    let chunk_size = chunk_size.max(1);
    debug!(%label, total, offset, chunk_size, "Sending data");

    while offset < total {
        let end = (offset + chunk_size).min(total);
        let chunk = source.slice(offset..end);
        let written = chunk.len();
        channel
            .send(chunk)
            .await
            .map_err(|e| TransferError::Channel(e.to_string()))?;
        offset += written;
    }

    channel.close().await;
    debug!(%label, "Data sent, channel closed");
    Ok(())
}

/// Приём блоков до `expected_size` байт или до закрытия канала
pub async fn receive_chunks(
    channel: Arc<dyn DataChannel>,
    remote: &str,
    transfer_id: &str,
    expected_size: u64,
    open_timeout: Duration,
    bus: &EventBus,
) -> Result<Vec<Bytes>, TransferError> {
    let mut buffer: Vec<Bytes> = Vec::new();
    let mut received: u64 = 0;

    let first = if channel.ready_state() == ChannelState::Open {
        None
    } else {
        // Ok(None): канал закрылся, так и не открывшись
        let waited = timeout(open_timeout, async {
            loop {
                match channel.next_event().await {
                    Some(ChannelEvent::Open) => return Ok(Some(None)),
                    // данные пришли раньше open: канал уже открыт
                    Some(ChannelEvent::Message(m)) => return Ok(Some(Some(m))),
                    Some(ChannelEvent::Error(e)) => return Err(TransferError::Channel(e)),
                    Some(ChannelEvent::Close) | None => return Ok(None),
                }
            }
        })
        .await;
        match waited {
            Ok(Ok(Some(first))) => first,
            Ok(Ok(None)) => return Ok(buffer),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(remote, transfer_id, "Channel did not open in {:?}", open_timeout);
                channel.close().await;
                return Err(TransferError::OpenTimeout);
            }
        }
    };

    let mut pending = first;
    loop {
        let message = match pending.take() {
            Some(m) => m,
            None => match channel.next_event().await {
                Some(ChannelEvent::Message(m)) => m,
                Some(ChannelEvent::Open) => continue,
                Some(ChannelEvent::Error(e)) => {
                    warn!(remote, transfer_id, "Transfer channel error: {e}");
                    return Err(TransferError::Channel(e));
                }
                Some(ChannelEvent::Close) | None => {
                    debug!(remote, transfer_id, received, expected_size, "Channel closed");
                    return Ok(buffer);
                }
            },
        };

        received += message.len() as u64;
        buffer.push(message);
        let scale = if expected_size == 0 {
            1.0
        } else {
            received as f64 / expected_size as f64
        };
        bus.publish(PeerEvent::ReceiveData {
            key: remote.to_string(),
            file_id: transfer_id.to_string(),
            size: received,
            scale,
        });

        if received >= expected_size {
            channel.close().await;
            debug!(remote, transfer_id, received, "Transfer complete");
            return Ok(buffer);
        }
    }
}

type FetchSender = oneshot::Sender<Result<Vec<Bytes>, PeerError>>;

/// Ожидающие вызовы fetch_data по ключу `(remote, data_id)`
#[derive(Default)]
pub struct FetchLedger {
    pending: Mutex<HashMap<(String, String), FetchSender>>,
}

impl FetchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Регистрирует ожидание; прежнее ожидание того же ключа отменяется
    pub fn insert(&self, remote: &str, data_id: &str) -> FetchHandle {
        let (tx, rx) = oneshot::channel();
        let key = (remote.to_string(), data_id.to_string());
        if let Some(previous) = self.pending.lock().insert(key, tx) {
            let _ = previous.send(Err(PeerError::FetchCancelled {
                remote: remote.to_string(),
                data_id: data_id.to_string(),
            }));
        }
        FetchHandle {
            remote: remote.to_string(),
            data_id: data_id.to_string(),
            rx,
        }
    }

    pub fn take(&self, remote: &str, data_id: &str) -> Option<FetchSender> {
        self.pending
            .lock()
            .remove(&(remote.to_string(), data_id.to_string()))
    }

    pub fn contains(&self, remote: &str, data_id: &str) -> bool {
        self.pending
            .lock()
            .contains_key(&(remote.to_string(), data_id.to_string()))
    }

    /// Отклоняет все ожидания пира, которого больше нет
    pub fn reject_remote(&self, remote: &str) -> usize {
        let rejected: Vec<_> = {
            let mut pending = self.pending.lock();
            let keys: Vec<_> = pending.keys().filter(|(r, _)| r == remote).cloned().collect();
            keys.into_iter().filter_map(|k| pending.remove(&k)).collect()
        };
        let count = rejected.len();
        for tx in rejected {
            let _ = tx.send(Err(PeerError::PeerRemoved {
                remote: remote.to_string(),
            }));
        }
        count
    }

    /// Отклоняет все ожидания; возвращает их число
    pub fn reject_all(&self) -> usize {
        let rejected: Vec<_> = self.pending.lock().drain().collect();
        let count = rejected.len();
        for ((remote, _), tx) in rejected {
            let _ = tx.send(Err(PeerError::PeerRemoved { remote }));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Результат fetch_data; можно ждать или отменить
pub struct FetchHandle {
    remote: String,
    data_id: String,
    rx: oneshot::Receiver<Result<Vec<Bytes>, PeerError>>,
}

impl FetchHandle {
    pub fn data_id(&self) -> &str {
        &self.data_id
    }

    /// Отказ от результата; передача доработает, но результат будет отброшен
    pub fn cancel(mut self) {
        self.rx.close();
    }
}

impl Future for FetchHandle {
    type Output = Result<Vec<Bytes>, PeerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PeerError::FetchCancelled {
                remote: this.remote.clone(),
                data_id: this.data_id.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{listener, EventKind};
    use crate::mock::MockDataChannel;
    use std::ops::ControlFlow;

    #[tokio::test]
    async fn sender_writes_ceil_chunks_in_order() {
        let (local, remote) = MockDataChannel::pair("data-f-0");
        let source = Bytes::from(vec![7u8; 250]);
        let task = tokio::spawn(send_chunks(local.clone(), source, 100, 0));
        local.open();
        task.await.unwrap().unwrap();

        assert_eq!(local.sent_sizes(), vec![100, 100, 50]);
        assert_eq!(local.ready_state(), ChannelState::Closed);
        assert_eq!(remote.ready_state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn sender_resumes_from_offset() {
        let (local, _remote) = MockDataChannel::pair("data-f-200");
        local.open();
        send_chunks(local.clone(), Bytes::from(vec![1u8; 300]), 100, 200)
            .await
            .unwrap();
        assert_eq!(local.sent_sizes(), vec![100]);
    }

    #[tokio::test]
    async fn sender_fails_on_channel_error() {
        let (local, _remote) = MockDataChannel::pair("data-f-0");
        local.inject(ChannelEvent::Error("boom".into()));
        let result = send_chunks(local.clone(), Bytes::from_static(b"abc"), 2, 0).await;
        assert_eq!(result, Err(TransferError::Channel("boom".into())));
        assert!(local.sent_sizes().is_empty());
    }

    #[tokio::test]
    async fn receiver_reports_monotonic_progress() {
        let bus = EventBus::new();
        let scales = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            EventKind::ReceiveData,
            listener({
                let scales = scales.clone();
                move |e| {
                    if let PeerEvent::ReceiveData { scale, .. } = e {
                        scales.lock().push(*scale);
                    }
                    ControlFlow::Continue(())
                }
            }),
        )
        .unwrap();

        let (local, remote) = MockDataChannel::pair("data-f-0");
        let sender = tokio::spawn(send_chunks(remote.clone(), Bytes::from(vec![0u8; 300]), 100, 0));
        local.open();
        let chunks = receive_chunks(
            local.clone(),
            "peerX",
            "f",
            300,
            Duration::from_secs(10),
            &bus,
        )
        .await
        .unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), 300);
        let scales = scales.lock().clone();
        assert_eq!(scales.len(), 3);
        assert!(scales.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(scales.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn receiver_returns_partial_buffer_on_close() {
        let bus = EventBus::new();
        let (local, remote) = MockDataChannel::pair("data-f-0");
        local.open();
        remote.send(Bytes::from_static(b"12345")).await.unwrap();
        remote.close().await;

        let chunks = receive_chunks(local, "peerX", "f", 100, Duration::from_secs(10), &bus)
            .await
            .unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"12345")]);
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_times_out_when_channel_never_opens() {
        let bus = EventBus::new();
        let (local, _remote) = MockDataChannel::pair("data-f-0");
        let result =
            receive_chunks(local, "peerX", "f", 10, Duration::from_millis(10_000), &bus).await;
        assert_eq!(result, Err(TransferError::OpenTimeout));
    }

    #[tokio::test]
    async fn ledger_supersedes_and_rejects() {
        let ledger = FetchLedger::new();
        let old = ledger.insert("bob", "f");
        let newer = ledger.insert("bob", "f");
        assert_eq!(
            old.await,
            Err(PeerError::FetchCancelled {
                remote: "bob".into(),
                data_id: "f".into()
            })
        );
        let _other = ledger.insert("carol", "f");

        assert_eq!(ledger.reject_remote("bob"), 1);
        assert_eq!(
            newer.await,
            Err(PeerError::PeerRemoved {
                remote: "bob".into()
            })
        );
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn ledger_rejects_everything_on_shutdown() {
        let ledger = FetchLedger::new();
        let bob = ledger.insert("bob", "f");
        let carol = ledger.insert("carol", "g");

        assert_eq!(ledger.reject_all(), 2);
        assert!(ledger.is_empty());
        assert_eq!(
            bob.await,
            Err(PeerError::PeerRemoved {
                remote: "bob".into()
            })
        );
        assert_eq!(
            carol.await,
            Err(PeerError::PeerRemoved {
                remote: "carol".into()
            })
        );
    }
}
