/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The three-queue scheduler: `Foreground` (user-initiated saves/deletes,
//! low latency), `Load` (reads driven by the load policy engine) and
//! `Background` (retry-executor replay), each with its own concurrency
//! limit, pending capacity and admission timeout, plus one idempotency-key
//! set shared across all three so a coalesced operation can't run twice
//! concurrently regardless of which queue it was admitted to.
//!
//! Cancellation on disconnect is cooperative, the same pattern
//! `interrupt_support::InterruptScope` uses: a shared epoch counter. A
//! task captures the epoch at admission time; bumping the counter marks
//! every task admitted before the bump as cancelled, without needing a
//! handle to each one individually.

pub mod retry_executor;

use crate::config::QueueConfig;
use crate::error::{Error, ErrorKind};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Foreground,
    Load,
    Background,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub active: usize,
    pub pending: usize,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Queue {
    tx: mpsc::Sender<Job>,
    concurrency: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    admission_timeout: std::time::Duration,
    cancel_epoch: Arc<AtomicU64>,
    _dispatcher: tokio::task::JoinHandle<()>,
}

impl Queue {
    fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_pending.max(1));
        let concurrency = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let active = Arc::new(AtomicUsize::new(0));
        let pending = Arc::new(AtomicUsize::new(0));
        let cancel_epoch = Arc::new(AtomicU64::new(0));
        let dispatcher = spawn_dispatcher(rx, concurrency.clone());
        Self {
            tx,
            concurrency,
            active,
            pending,
            admission_timeout: config.admission_timeout,
            cancel_epoch,
            _dispatcher: dispatcher,
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            active: self.active.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
        }
    }
}

fn spawn_dispatcher(
    mut rx: mpsc::Receiver<Job>,
    concurrency: Arc<Semaphore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Ok(permit) = concurrency.clone().acquire_owned().await else {
                break;
            };
            tokio::spawn(async move {
                job.await;
                drop(permit);
            });
        }
    })
}

struct IdempotencyGuard<'a> {
    manager: &'a QueueManager,
    key: Option<String>,
}

impl Drop for IdempotencyGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = &self.key {
            self.manager.idempotency_keys.lock().remove(key);
        }
    }
}

pub struct QueueManager {
    foreground: Queue,
    load: Queue,
    background: Queue,
    idempotency_keys: Mutex<HashSet<String>>,
}

impl QueueManager {
    pub fn new(config: &crate::config::Config) -> Arc<Self> {
        Arc::new(Self {
            foreground: Queue::new(config.foreground),
            load: Queue::new(config.load),
            background: Queue::new(config.background),
            idempotency_keys: Mutex::new(HashSet::new()),
        })
    }

    fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Foreground => &self.foreground,
            QueueKind::Load => &self.load,
            QueueKind::Background => &self.background,
        }
    }

    pub fn stats(&self, kind: QueueKind) -> QueueStats {
        self.queue(kind).stats()
    }

    /// Admits `fut` onto `kind`'s queue. Rejects with `Duplicate` if
    /// `idempotency_key` is already in flight anywhere, with `QueueFull`
    /// if no slot opens up within the queue's admission timeout, and
    /// resolves to `QueueCancelled` if `clear_on_disconnect` fires before
    /// (or while) the task runs.
    pub async fn enqueue<T, Fut>(
        &self,
        kind: QueueKind,
        idempotency_key: Option<String>,
        fut: Fut,
    ) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        if let Some(key) = &idempotency_key {
            let mut keys = self.idempotency_keys.lock();
            if !keys.insert(key.clone()) {
                return Err(Error::from(ErrorKind::Duplicate));
            }
        }
        let _guard = IdempotencyGuard {
            manager: self,
            key: idempotency_key,
        };

        let queue = self.queue(kind);
        queue.pending.fetch_add(1, Ordering::SeqCst);
        let epoch_at_enqueue = queue.cancel_epoch.load(Ordering::SeqCst);

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let active = queue.active.clone();
        let pending = queue.pending.clone();
        let cancel_epoch = queue.cancel_epoch.clone();
        let job: Job = Box::pin(async move {
            pending.fetch_sub(1, Ordering::SeqCst);
            if cancel_epoch.load(Ordering::SeqCst) != epoch_at_enqueue {
                let _ = result_tx.send(Err(Error::from(ErrorKind::QueueCancelled)));
                return;
            }
            active.fetch_add(1, Ordering::SeqCst);
            let out = fut.await;
            active.fetch_sub(1, Ordering::SeqCst);
            let out = if cancel_epoch.load(Ordering::SeqCst) != epoch_at_enqueue {
                Err(Error::from(ErrorKind::QueueCancelled))
            } else {
                out
            };
            let _ = result_tx.send(out);
        });

        let reserved = tokio::time::timeout(queue.admission_timeout, queue.tx.reserve()).await;
        let permit = match reserved {
            Ok(Ok(permit)) => permit,
            _ => {
                queue.pending.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::from(ErrorKind::QueueFull));
            }
        };
        permit.send(job);

        match result_rx.await {
            Ok(out) => out,
            Err(_) => Err(Error::from(ErrorKind::QueueCancelled)),
        }
    }

    /// Cancels every task admitted before this call across all three
    /// queues. Tasks already mid-flight finish executing (this crate
    /// can't interrupt arbitrary `Future`s) but resolve as
    /// `QueueCancelled` to their caller rather than their real outcome.
    pub fn clear_on_disconnect(&self) {
        for kind in [QueueKind::Foreground, QueueKind::Load, QueueKind::Background] {
            self.queue(kind).cancel_epoch.fetch_add(1, Ordering::SeqCst);
        }
        log::info!("queue manager: cleared all queues for disconnect");
    }

    /// Symmetric with `clear_on_disconnect`: re-arms the queues for new
    /// work by clearing the in-flight idempotency set, so a key that was
    /// in flight during the disconnect (and whose task resolved as
    /// `QueueCancelled` rather than running its `Drop` cleanup normally)
    /// doesn't keep rejecting a legitimate retry as a duplicate forever.
    pub fn restore_on_connect(&self) {
        self.idempotency_keys.lock().clear();
        log::info!("queue manager: connectivity restored, idempotency set cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn manager() -> Arc<QueueManager> {
        QueueManager::new(&Config::default())
    }

    #[tokio::test]
    async fn runs_a_task_and_returns_its_result() {
        let m = manager();
        let out = m
            .enqueue(QueueKind::Foreground, None, async { Ok::<_, Error>(42) })
            .await
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let m = manager();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(Some(gate_rx)));
        let m2 = m.clone();
        let gate_rx2 = gate_rx.clone();
        let first = tokio::spawn(async move {
            m2.enqueue(QueueKind::Background, Some("k1".into()), async move {
                let rx = gate_rx2.lock().await.take().unwrap();
                let _ = rx.await;
                Ok::<_, Error>(())
            })
            .await
        });
        // give the dispatcher a tick to admit and start the first task
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = m
            .enqueue(QueueKind::Background, Some("k1".into()), async { Ok::<_, Error>(()) })
            .await;
        assert!(matches!(second, Err(e) if matches!(e.kind(), ErrorKind::Duplicate)));

        let _ = gate_tx.send(());
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn clear_on_disconnect_cancels_pending_task() {
        let mut config = Config::default();
        config.background.concurrency = 1;
        let m = QueueManager::new(&config);
        let m2 = m.clone();
        // occupy the only worker slot
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        let occupying = tokio::spawn({
            let m = m.clone();
            async move {
                m.enqueue(QueueKind::Background, None, async move {
                    let _ = hold_rx.await;
                    Ok::<_, Error>(())
                })
                .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let waiting = tokio::spawn(async move {
            m2.enqueue(QueueKind::Background, None, async { Ok::<_, Error>(()) })
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        m.clear_on_disconnect();
        let _ = hold_tx.send(());

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(e) if e.is_queue_cancelled()));
        occupying.await.unwrap().unwrap();
    }
}
