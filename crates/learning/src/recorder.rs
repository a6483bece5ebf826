//! Bounded background writer for experiences.
//!
//! Submissions go into a fixed-capacity queue drained by a small pool of
//! Tokio workers, so the chat caller never waits on the store. When the
//! queue is full the configured [`BackpressurePolicy`] decides what happens.
//!
//! `Block` and `DropNewest` sit on a bounded `mpsc` channel whose receiver
//! the workers share. `DropOldest` has to evict from the head of the queue,
//! which a channel cannot do, so it keeps a ring buffer instead.

use chrono::Utc;
use kestrel_config::{BackpressurePolicy, LearningConfig};
use kestrel_core::error::LearningError;
use kestrel_core::event::{DomainEvent, EventBus};
use kestrel_core::experience::Experience;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::experience_store::ExperienceStore;

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub capacity: usize,
    pub workers: usize,
    pub policy: BackpressurePolicy,
}

impl From<&LearningConfig> for RecorderSettings {
    fn from(config: &LearningConfig) -> Self {
        Self {
            capacity: config.recorder_capacity,
            workers: config.recorder_workers,
            policy: config.backpressure,
        }
    }
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self::from(&LearningConfig::default())
    }
}

/// Counters since the recorder started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderStats {
    pub submitted: u64,
    pub written: u64,
    pub dropped: u64,
    pub failed: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Intake {
    Channel {
        /// Taken on close so workers see the channel end once it drains
        sender: Mutex<Option<mpsc::Sender<Experience>>>,
        receiver: tokio::sync::Mutex<mpsc::Receiver<Experience>>,
    },
    Ring {
        queue: Mutex<VecDeque<Experience>>,
        capacity: usize,
        /// Signalled when an item is queued or the recorder closes
        items: Notify,
    },
}

impl Intake {
    fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        match policy {
            BackpressurePolicy::DropOldest => Intake::Ring {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                items: Notify::new(),
            },
            BackpressurePolicy::Block | BackpressurePolicy::DropNewest => {
                let (sender, receiver) = mpsc::channel(capacity);
                Intake::Channel {
                    sender: Mutex::new(Some(sender)),
                    receiver: tokio::sync::Mutex::new(receiver),
                }
            }
        }
    }
}

struct Shared {
    intake: Intake,
    policy: BackpressurePolicy,
    /// Signalled when a write finishes
    idle: Notify,
    /// Accepted but not yet picked up by a worker
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    submitted: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    store: Arc<ExperienceStore>,
    events: Option<Arc<EventBus>>,
}

impl Shared {
    fn record_drop(&self, experience: &Experience, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(experience_id = %experience.id, reason, "Experience dropped");
        if let Some(bus) = &self.events {
            bus.publish(DomainEvent::ExperienceDropped {
                experience_id: experience.id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Next experience for a worker, or `None` once closed and drained.
    async fn next(&self) -> Option<Experience> {
        let experience = match &self.intake {
            Intake::Channel { receiver, .. } => receiver.lock().await.recv().await?,
            Intake::Ring { queue, items, .. } => loop {
                // registered before the queue check so a close or push in between is not missed
                let wakeup = items.notified();
                tokio::pin!(wakeup);
                wakeup.as_mut().enable();

                if let Some(experience) = lock(queue).pop_front() {
                    break experience;
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
                wakeup.await;
            },
        };
        // in_flight first so flush never sees both at zero mid-handoff
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Some(experience)
    }

    async fn write(&self, experience: Experience) {
        match self.store.record(&experience).await {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                if let Some(bus) = &self.events {
                    bus.publish(DomainEvent::ExperienceRecorded {
                        experience_id: experience.id.clone(),
                        success: experience.success,
                        timestamp: Utc::now(),
                    });
                }
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                debug!(experience_id = %experience.id, error = %e, "Experience write failed");
            }
        }
    }

    /// Undo a `queued` reservation for an experience that never entered the queue.
    fn release(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

async fn worker(shared: Arc<Shared>, worker_id: usize) {
    while let Some(experience) = shared.next().await {
        shared.write(experience).await;
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        shared.idle.notify_waiters();
    }
    debug!(worker_id, "Experience recorder worker stopped");
}

/// The bounded recorder.
pub struct ExperienceRecorder {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ExperienceRecorder {
    /// Start the worker pool on the current Tokio runtime.
    pub fn spawn(
        store: Arc<ExperienceStore>,
        settings: RecorderSettings,
        events: Option<Arc<EventBus>>,
    ) -> Result<Self, LearningError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| LearningError::NoRuntime(e.to_string()))?;

        let capacity = settings.capacity.max(1);
        let shared = Arc::new(Shared {
            intake: Intake::new(capacity, settings.policy),
            policy: settings.policy,
            idle: Notify::new(),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            store,
            events,
        });

        let workers = (0..settings.workers.max(1))
            .map(|id| handle.spawn(worker(shared.clone(), id)))
            .collect();

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queue an experience for writing.
    ///
    /// Returns `Ok(false)` when this experience was dropped by the
    /// backpressure policy. Under `Block`, waits for space.
    pub async fn submit(&self, experience: Experience) -> Result<bool, LearningError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(LearningError::RecorderClosed);
        }
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        match &self.shared.intake {
            Intake::Channel { sender, .. } => {
                let Some(sender) = lock(sender).clone() else {
                    return Err(LearningError::RecorderClosed);
                };
                // reserved before sending so a worker never decrements below zero
                self.shared.queued.fetch_add(1, Ordering::SeqCst);
                let outcome = match self.shared.policy {
                    BackpressurePolicy::DropNewest => match sender.try_send(experience) {
                        Ok(()) => Ok(true),
                        Err(TrySendError::Full(experience)) => {
                            self.shared.record_drop(&experience, "queue full, newest dropped");
                            Ok(false)
                        }
                        Err(TrySendError::Closed(_)) => Err(LearningError::RecorderClosed),
                    },
                    _ => sender
                        .send(experience)
                        .await
                        .map(|()| true)
                        .map_err(|_| LearningError::RecorderClosed),
                };
                if !matches!(outcome, Ok(true)) {
                    self.shared.release();
                }
                outcome
            }
            Intake::Ring {
                queue,
                capacity,
                items,
            } => {
                let evicted = {
                    let mut queue = lock(queue);
                    let evicted = if queue.len() >= *capacity {
                        queue.pop_front()
                    } else {
                        None
                    };
                    queue.push_back(experience);
                    if evicted.is_none() {
                        self.shared.queued.fetch_add(1, Ordering::SeqCst);
                    }
                    evicted
                };
                if let Some(evicted) = evicted {
                    self.shared.record_drop(&evicted, "queue full, oldest dropped");
                }
                items.notify_one();
                Ok(true)
            }
        }
    }

    /// Wait until the queue is empty and no write is in flight.
    pub async fn flush(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending() == 0 && self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            written: self.shared.written.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Queued, not yet picked up.
    pub fn pending(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<ExperienceStore> {
        &self.shared.store
    }

    /// Drain the queue, then stop the workers.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.close();
        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        match &self.shared.intake {
            Intake::Channel { sender, .. } => drop(lock(sender).take()),
            Intake::Ring { items, .. } => items.notify_waiters(),
        }
    }
}

impl Drop for ExperienceRecorder {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience_store::tests::{memory_store, success};
    use kestrel_core::experience::Intent;
    use std::time::Duration;

    fn exp(i: usize) -> Experience {
        success(&format!("query {i}"), "calculator", Intent::Calculation, 5)
    }

    fn settings(capacity: usize, workers: usize, policy: BackpressurePolicy) -> RecorderSettings {
        RecorderSettings {
            capacity,
            workers,
            policy,
        }
    }

    #[tokio::test]
    async fn writes_everything_and_flushes() {
        let store = Arc::new(memory_store());
        let recorder =
            ExperienceRecorder::spawn(store.clone(), settings(64, 2, BackpressurePolicy::Block), None).unwrap();
        for i in 0..20 {
            assert!(recorder.submit(exp(i)).await.unwrap());
        }
        recorder.flush().await;

        assert_eq!(store.count().await.unwrap(), 20);
        let stats = recorder.stats();
        assert_eq!(stats.submitted, 20);
        assert_eq!(stats.written, 20);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn drop_newest_rejects_when_full() {
        let store = Arc::new(memory_store());
        let recorder =
            ExperienceRecorder::spawn(store.clone(), settings(2, 1, BackpressurePolicy::DropNewest), None).unwrap();

        // current-thread runtime: workers cannot run until we yield
        assert!(recorder.submit(exp(0)).await.unwrap());
        assert!(recorder.submit(exp(1)).await.unwrap());
        assert!(!recorder.submit(exp(2)).await.unwrap());
        assert_eq!(recorder.pending(), 2);

        recorder.flush().await;
        let stats = recorder.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.written, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn drop_newest_never_waits_on_a_full_channel() {
        let store = Arc::new(memory_store());
        let recorder =
            ExperienceRecorder::spawn(store.clone(), settings(1, 1, BackpressurePolicy::DropNewest), None).unwrap();

        // would hang here if a full channel made submit await a worker
        let accepted = tokio::time::timeout(Duration::from_secs(5), async {
            let mut accepted = 0;
            for i in 0..50 {
                if recorder.submit(exp(i)).await.unwrap() {
                    accepted += 1;
                }
            }
            accepted
        })
        .await
        .unwrap();

        assert_eq!(accepted, 1);
        assert_eq!(recorder.stats().dropped, 49);
        recorder.flush().await;
        assert_eq!(recorder.pending(), 0);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest() {
        let store = Arc::new(memory_store());
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let recorder = ExperienceRecorder::spawn(
            store.clone(),
            settings(2, 1, BackpressurePolicy::DropOldest),
            Some(bus),
        )
        .unwrap();

        let first = exp(0);
        let first_id = first.id.clone();
        assert!(recorder.submit(first).await.unwrap());
        assert!(recorder.submit(exp(1)).await.unwrap());
        assert!(recorder.submit(exp(2)).await.unwrap());
        assert_eq!(recorder.pending(), 2);
        recorder.flush().await;

        let queries: Vec<_> = store
            .query(&crate::ExperienceQuery::recent(10))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.query)
            .collect();
        assert_eq!(queries.len(), 2);
        assert!(!queries.contains(&"query 0".to_string()));

        match rx.recv().await.unwrap().as_ref() {
            DomainEvent::ExperienceDropped { experience_id, .. } => assert_eq!(experience_id, &first_id),
            other => panic!("expected ExperienceDropped, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn block_waits_for_space() {
        let store = Arc::new(memory_store());
        let recorder = Arc::new(
            ExperienceRecorder::spawn(store.clone(), settings(1, 1, BackpressurePolicy::Block), None).unwrap(),
        );
        let submitter = {
            let recorder = recorder.clone();
            tokio::spawn(async move {
                for i in 0..10 {
                    assert!(recorder.submit(exp(i)).await.unwrap());
                }
            })
        };
        tokio::time::timeout(Duration::from_secs(10), submitter)
            .await
            .unwrap()
            .unwrap();
        recorder.flush().await;

        assert_eq!(store.count().await.unwrap(), 10);
        assert_eq!(recorder.stats().dropped, 0);
    }

    #[tokio::test]
    async fn unavailable_store_counts_failures() {
        let recorder = ExperienceRecorder::spawn(
            Arc::new(ExperienceStore::disabled()),
            RecorderSettings::default(),
            None,
        )
        .unwrap();
        recorder.submit(exp(0)).await.unwrap();
        recorder.flush().await;
        assert_eq!(recorder.stats().failed, 1);
        assert_eq!(recorder.stats().written, 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let recorder = ExperienceRecorder::spawn(Arc::new(memory_store()), RecorderSettings::default(), None).unwrap();
        recorder.submit(exp(0)).await.unwrap();
        recorder.shutdown().await;
        assert_eq!(recorder.stats().written, 1);
        assert!(matches!(
            recorder.submit(exp(1)).await,
            Err(LearningError::RecorderClosed)
        ));
    }

    #[test]
    fn spawn_outside_runtime_fails() {
        let result = ExperienceRecorder::spawn(Arc::new(ExperienceStore::disabled()), RecorderSettings::default(), None);
        assert!(matches!(result, Err(LearningError::NoRuntime(_))));
    }
}
