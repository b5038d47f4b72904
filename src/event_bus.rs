//! Синхронная шина уведомлений для приложения.
//!
//! Слушатели вызываются в порядке регистрации в том же потоке, что и
//! `publish`. Слушатель, вернувший `ControlFlow::Break`, останавливает
//! рассылку текущего события: так реализуется семантика «первый
//! согласившийся обработчик побеждает».

use crate::error::{CaptureError, PeerError};
use crate::peer::types::MediaStream;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Закрытый набор уведомлений
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ShareMedia,
    NewMedia,
    ReadyForShareMedia,
    ReceiveData,
    Message,
    PeerRemove,
    ChannelError,
    StopMedia,
    MediaError,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ShareMedia => "sharemedia",
            EventKind::NewMedia => "newmedia",
            EventKind::ReadyForShareMedia => "readyforsharemedia",
            EventKind::ReceiveData => "receivedata",
            EventKind::Message => "message",
            EventKind::PeerRemove => "peerremove",
            EventKind::ChannelError => "channelerror",
            EventKind::StopMedia => "stopmedia",
            EventKind::MediaError => "mediaerror",
        }
    }
}

/// Одноразовое согласие на входящий media pre-offer
#[derive(Clone)]
pub struct Consent {
    action: Arc<Mutex<Option<BoxFuture<'static, ()>>>>,
    runtime: Handle,
}

impl Consent {
    /// Создаётся внутри runtime ядра; согласование запускается в нём же
    pub(crate) fn new<F>(action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            action: Arc::new(Mutex::new(Some(Box::pin(action)))),
            runtime: Handle::current(),
        }
    }

    /// Запускает согласование из любого потока; повторные вызовы ничего не делают
    pub fn agree(&self) {
        if let Some(action) = self.action.lock().take() {
            self.runtime.spawn(action);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.action.lock().is_some()
    }
}

impl fmt::Debug for Consent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consent")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Уведомления, которые ядро публикует для приложения
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ShareMedia { key: String, consent: Consent },
    NewMedia { key: String, stream: MediaStream },
    ReadyForShareMedia { key: String },
    ReceiveData {
        key: String,
        file_id: String,
        size: u64,
        scale: f64,
    },
    Message {
        key: String,
        channel: String,
        message: Bytes,
    },
    PeerRemove { key: String },
    ChannelError { key: String, detail: String },
    StopMedia { key: String },
    MediaError { condition: CaptureError },
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PeerEvent::ShareMedia { .. } => EventKind::ShareMedia,
            PeerEvent::NewMedia { .. } => EventKind::NewMedia,
            PeerEvent::ReadyForShareMedia { .. } => EventKind::ReadyForShareMedia,
            PeerEvent::ReceiveData { .. } => EventKind::ReceiveData,
            PeerEvent::Message { .. } => EventKind::Message,
            PeerEvent::PeerRemove { .. } => EventKind::PeerRemove,
            PeerEvent::ChannelError { .. } => EventKind::ChannelError,
            PeerEvent::StopMedia { .. } => EventKind::StopMedia,
            PeerEvent::MediaError { .. } => EventKind::MediaError,
        }
    }
}

pub type Listener = Arc<dyn Fn(&PeerEvent) -> ControlFlow<()> + Send + Sync>;

/// Оборачивает замыкание в разделяемый слушатель
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&PeerEvent) -> ControlFlow<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> Result<(), PeerError> {
        let mut map = self.listeners.lock();
        let list = map.entry(kind).or_default();
        if list.iter().any(|l| same_listener(l, &listener)) {
            return Err(PeerError::DuplicateListener(kind));
        }
        list.push(listener);
        Ok(())
    }

    /// Без слушателя снимает всех подписчиков события
    pub fn unsubscribe(&self, kind: EventKind, listener: Option<&Listener>) {
        let mut map = self.listeners.lock();
        match listener {
            None => {
                map.remove(&kind);
            }
            Some(target) => {
                if let Some(list) = map.get_mut(&kind) {
                    list.retain(|l| !same_listener(l, target));
                }
            }
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn publish(&self, event: PeerEvent) {
        let kind = event.kind();
        // снимок списка: слушатель может (от)подписываться прямо из обработчика
        let snapshot = match self.listeners.lock().get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };
        for (index, listener) in snapshot.iter().enumerate() {
            if listener(&event).is_break() {
                debug!(event = kind.name(), index, "dispatch stopped by listener");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remove_event(key: &str) -> PeerEvent {
        PeerEvent::PeerRemove { key: key.into() }
    }

    #[test]
    fn duplicate_listener_is_rejected() {
        let bus = EventBus::new();
        let l = listener(|_| ControlFlow::Continue(()));
        bus.subscribe(EventKind::PeerRemove, l.clone()).unwrap();
        assert_eq!(
            bus.subscribe(EventKind::PeerRemove, l.clone()),
            Err(PeerError::DuplicateListener(EventKind::PeerRemove))
        );
        // тот же слушатель на другом событии допустим
        bus.subscribe(EventKind::Message, l).unwrap();
    }

    #[test]
    fn unsubscribe_without_listener_removes_all() {
        let bus = EventBus::new();
        let a = listener(|_| ControlFlow::Continue(()));
        let b = listener(|_| ControlFlow::Continue(()));
        bus.subscribe(EventKind::PeerRemove, a.clone()).unwrap();
        bus.subscribe(EventKind::PeerRemove, b).unwrap();
        bus.subscribe(EventKind::Message, a.clone()).unwrap();

        bus.unsubscribe(EventKind::Message, Some(&a));
        assert_eq!(bus.listener_count(EventKind::Message), 0);
        assert_eq!(bus.listener_count(EventKind::PeerRemove), 2);

        bus.unsubscribe(EventKind::PeerRemove, None);
        assert_eq!(bus.listener_count(EventKind::PeerRemove), 0);
    }

    #[test]
    fn break_stops_later_listeners() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for (name, stop) in [("first", false), ("second", true), ("third", false)] {
            let calls = calls.clone();
            bus.subscribe(
                EventKind::PeerRemove,
                listener(move |_| {
                    calls.lock().push(name);
                    if stop {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }),
            )
            .unwrap();
        }

        bus.publish(remove_event("x"));
        assert_eq!(*calls.lock(), vec!["first", "second"]);
    }

    #[test]
    fn all_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let calls = calls.clone();
            bus.subscribe(
                EventKind::PeerRemove,
                listener(move |e| {
                    if let PeerEvent::PeerRemove { key } = e {
                        calls.lock().push(format!("{n}:{key}"));
                    }
                    ControlFlow::Continue(())
                }),
            )
            .unwrap();
        }
        bus.publish(remove_event("a"));
        assert_eq!(*calls.lock(), vec!["0:a", "1:a", "2:a"]);
    }

    #[tokio::test]
    async fn consent_runs_once() {
        let hits = Arc::new(Mutex::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let consent = Consent::new({
            let hits = hits.clone();
            async move {
                *hits.lock() += 1;
                let _ = tx.send(());
            }
        });
        assert!(consent.is_pending());
        consent.agree();
        consent.agree();
        rx.await.unwrap();
        assert!(!consent.is_pending());
        assert_eq!(*hits.lock(), 1);
    }

    #[tokio::test]
    async fn consent_agreed_from_plain_thread() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let consent = Consent::new(async move {
            let _ = tx.send(());
        });
        let remote = consent.clone();
        std::thread::spawn(move || remote.agree()).join().unwrap();
        rx.await.unwrap();
        assert!(!consent.is_pending());
    }
}
