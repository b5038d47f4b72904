use crate::peer::ice::CandidateBatch;
use crate::peer::message::MessageChannel;
use crate::peer::provider::PeerConnection;
use crate::peer::types::{IceCandidate, PeerState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Задача, которая снимается при удалении владельца
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        TaskGuard(tokio::spawn(future))
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Всё, что оркестратор знает об одном удалённом пире
pub struct PeerRecord {
    pub remote: String,
    pub state: PeerState,
    pub connection: Option<Arc<dyn PeerConnection>>,
    /// Токен, который удалённая сторона прислала в offerConfirm
    pub remote_auth: Option<String>,
    pub is_media: bool,
    pub candidates: CandidateBatch,
    /// Кандидаты, полученные до установки remote description
    pub pending_remote: Vec<IceCandidate>,
    pub remote_described: bool,
    pub message: Option<MessageChannel>,
    pub events: Option<TaskGuard>,
    pub grace: Option<TaskGuard>,
}

impl PeerRecord {
    pub fn new(remote: &str) -> Self {
        Self {
            remote: remote.to_string(),
            state: PeerState::Idle,
            connection: None,
            remote_auth: None,
            is_media: false,
            candidates: CandidateBatch::default(),
            pending_remote: Vec::new(),
            remote_described: false,
            message: None,
            events: None,
            grace: None,
        }
    }

    /// Снимает все задачи записи; соединение закрывает вызывающий
    pub fn shutdown(&mut self) {
        self.state = PeerState::Closed;
        self.candidates.cancel();
        self.pending_remote.clear();
        if let Some(message) = self.message.take() {
            message.shutdown();
        }
        self.events = None;
        self.grace = None;
    }
}

/// Таблица пиров: не больше одной записи на удалённый идентификатор
#[derive(Default)]
pub struct PeerTable {
    records: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Доступ к записи под блокировкой; замыкание не должно ждать
    pub fn with<R>(&self, remote: &str, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        self.records.lock().get_mut(remote).map(f)
    }

    pub fn with_or_insert<R>(&self, remote: &str, f: impl FnOnce(&mut PeerRecord) -> R) -> R {
        let mut records = self.records.lock();
        let record = records
            .entry(remote.to_string())
            .or_insert_with(|| PeerRecord::new(remote));
        f(record)
    }

    pub fn contains(&self, remote: &str) -> bool {
        self.records.lock().contains_key(remote)
    }

    pub fn connection(&self, remote: &str) -> Option<Arc<dyn PeerConnection>> {
        self.records
            .lock()
            .get(remote)
            .and_then(|r| r.connection.clone())
    }

    pub fn take(&self, remote: &str) -> Option<PeerRecord> {
        self.records.lock().remove(remote)
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    pub fn media_keys(&self) -> Vec<String> {
        self.records
            .lock()
            .values()
            .filter(|r| r.is_media)
            .map(|r| r.remote.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn state(&self, remote: &str) -> Option<PeerState> {
        self.records.lock().get(remote).map(|r| r.state)
    }

    /// Сколько пиров ждут отправки пачки кандидатов
    pub fn scheduled_batches(&self) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| r.candidates.is_scheduled())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guard_aborts_task_on_drop() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let guard = TaskGuard::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(());
        });
        drop(guard);
        // отправитель уничтожен вместе с задачей
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn one_record_per_remote() {
        let table = PeerTable::new();
        table.with_or_insert("a", |r| r.is_media = true);
        table.with_or_insert("a", |r| r.remote_auth = Some("t".into()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.media_keys(), vec!["a".to_string()]);
        assert_eq!(table.with("a", |r| r.remote_auth.clone()).flatten(), Some("t".into()));
        assert!(table.take("a").is_some());
        assert!(table.is_empty());
    }
}
