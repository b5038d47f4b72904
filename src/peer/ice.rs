use crate::peer::provider::PeerConnection;
use crate::peer::state::TaskGuard;
use crate::peer::types::IceCandidate;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Отложенная отправка локальных кандидатов одного пира.
///
/// Каждый новый кандидат перезапускает таймер; по истечении окна весь
/// накопленный список уходит одной пачкой.
#[derive(Default)]
pub struct CandidateBatch {
    pending: Arc<Mutex<Vec<IceCandidate>>>,
    timer: Option<TaskGuard>,
}

impl CandidateBatch {
    pub fn record<F>(&mut self, candidate: IceCandidate, window: Duration, flush: F)
    where
        F: FnOnce(Vec<IceCandidate>) + Send + 'static,
    {
        self.pending.lock().push(candidate);
        let pending = self.pending.clone();
        // старый таймер снимается при замене
        self.timer = Some(TaskGuard::spawn(async move {
            sleep(window).await;
            let batch = std::mem::take(&mut *pending.lock());
            if !batch.is_empty() {
                flush(batch);
            }
        }));
    }

    pub fn cancel(&mut self) {
        self.timer = None;
        self.pending.lock().clear();
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Применяет кандидаты от удаленной стороны; сбой одного не мешает остальным
pub async fn apply_candidates(
    pc: &Arc<dyn PeerConnection>,
    remote: &str,
    candidates: Vec<IceCandidate>,
) {
    for candidate in candidates {
        debug!(remote, "Applying candidate: {}", candidate.candidate);
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!(remote, "Failed to add ICE candidate: {e}");
        }
    }
}

/// Подсчёт кандидатов по типам
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.relay == 0 {
        debug!("No TURN relay candidates in batch, connection through NAT may fail");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_within_window_are_coalesced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut batch = CandidateBatch::default();
        let window = Duration::from_millis(1000);

        for n in 0..3 {
            let tx = tx.clone();
            batch.record(cand(n), window, move |b| {
                let _ = tx.send(b);
            });
            sleep(Duration::from_millis(400)).await;
        }
        assert!(batch.is_scheduled());

        let flushed = rx.recv().await.unwrap();
        assert_eq!(flushed.len(), 3);
        assert!(batch.is_empty());

        // кандидат после окна уходит отдельной пачкой
        sleep(Duration::from_millis(1500)).await;
        let tx2 = tx.clone();
        batch.record(cand(9), window, move |b| {
            let _ = tx2.send(b);
        });
        assert_eq!(rx.recv().await.unwrap(), vec![cand(9)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_buffer_and_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<IceCandidate>>();
        let mut batch = CandidateBatch::default();
        batch.record(cand(1), Duration::from_millis(1000), move |b| {
            let _ = tx.send(b);
        });
        batch.cancel();
        assert!(!batch.is_scheduled());
        assert_eq!(batch.len(), 0);
        // отправитель ушёл вместе с отменённой задачей
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn analysis_counts_types() {
        let list = vec![
            cand(1),
            IceCandidate::new("candidate:2 1 udp 1 1.2.3.4 5000 typ srflx raddr 0.0.0.0"),
            IceCandidate::new("candidate:3 1 udp 1 5.6.7.8 3478 typ relay raddr 0.0.0.0"),
        ];
        assert_eq!(
            analyze_candidates(&list),
            CandidateSummary {
                host: 1,
                srflx: 1,
                relay: 1
            }
        );
    }
}
