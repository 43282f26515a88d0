//! In-process fan-out of job output.
//!
//! Each live job owns an append-only chunk list and a set of outgoing channels.
//! Appending and subscribing happen under the same lock, so a subscriber that
//! attaches mid-build sees the replay followed by live chunks with no gap.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures_util::Stream;
use shipyard_job::{JobId, JobStatus, LogEvent};
use tokio::sync::mpsc;

pub type SubscriberId = u64;

#[derive(Default)]
struct JobLog {
    chunks: Vec<String>,
    subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<LogEvent>)>,
}

#[derive(Default)]
struct BrokerInner {
    jobs: Mutex<HashMap<JobId, JobLog>>,
    next_subscriber: AtomicU64,
}

impl BrokerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobLog>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_subscriber(&self, job_id: JobId, subscriber: SubscriberId) {
        if let Some(log) = self.lock().get_mut(&job_id) {
            log.subscribers.retain(|(id, _)| *id != subscriber);
        }
    }
}

#[derive(Clone, Default)]
pub struct LogBroker {
    inner: Arc<BrokerInner>,
}

impl LogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start buffering output for a job. Idempotent.
    pub fn open(&self, job_id: JobId) {
        self.inner.lock().entry(job_id).or_default();
    }

    pub fn is_live(&self, job_id: JobId) -> bool {
        self.inner.lock().contains_key(&job_id)
    }

    /// Record a chunk and hand it to every subscriber.
    ///
    /// Never waits on subscribers: delivery goes through unbounded channels, and
    /// subscribers whose receiving side is gone are pruned.
    pub fn append(&self, job_id: JobId, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }

        let mut jobs = self.inner.lock();
        let log = jobs.entry(job_id).or_default();
        log.subscribers.retain(|(_, tx)| {
            tx.send(LogEvent::Chunk {
                text: chunk.clone(),
            })
            .is_ok()
        });
        log.chunks.push(chunk);
    }

    /// Everything produced so far, concatenated.
    pub fn snapshot(&self, job_id: JobId) -> Option<String> {
        self.inner.lock().get(&job_id).map(|log| log.chunks.concat())
    }

    /// Attach to a live job. Returns `None` when the job has no live buffer.
    pub fn subscribe(&self, job_id: JobId) -> Option<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut jobs = self.inner.lock();
        let log = jobs.get_mut(&job_id)?;
        for chunk in &log.chunks {
            let _ = tx.send(LogEvent::Chunk {
                text: chunk.clone(),
            });
        }
        log.subscribers.push((id, tx));
        drop(jobs);

        tracing::debug!(%job_id, subscriber = id, "log subscriber attached");
        Some(Subscription {
            id,
            job_id,
            rx,
            broker: Arc::downgrade(&self.inner),
        })
    }

    /// Detach a subscriber. Safe to call repeatedly and after the job finished.
    pub fn unsubscribe(&self, job_id: JobId, subscriber: SubscriberId) {
        self.inner.remove_subscriber(job_id, subscriber);
    }

    /// Close every subscription for a job with an end marker and drop its buffer.
    pub fn finish(&self, job_id: JobId, status: JobStatus, error_message: Option<String>) {
        let Some(log) = self.inner.lock().remove(&job_id) else {
            return;
        };
        for (_, tx) in log.subscribers {
            let _ = tx.send(LogEvent::End {
                status,
                error_message: error_message.clone(),
            });
        }
    }

    /// A subscription over a job that already finished: replay, then end.
    pub fn replay_finished(
        &self,
        job_id: JobId,
        logs: &str,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if !logs.is_empty() {
            let _ = tx.send(LogEvent::Chunk {
                text: logs.to_string(),
            });
        }
        let _ = tx.send(LogEvent::End {
            status,
            error_message,
        });

        Subscription {
            id: self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed),
            job_id,
            rx,
            broker: Weak::new(),
        }
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.inner
            .lock()
            .get(&job_id)
            .map(|log| log.subscribers.len())
            .unwrap_or(0)
    }

    pub fn sink(&self, job_id: JobId) -> LogSink {
        LogSink {
            broker: self.clone(),
            job_id,
        }
    }
}

/// Line-oriented writer bound to one job.
#[derive(Clone)]
pub struct LogSink {
    broker: LogBroker,
    job_id: JobId,
}

impl LogSink {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn line(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        let mut chunk = String::with_capacity(line.len() + 1);
        chunk.push_str(line);
        if !chunk.ends_with('\n') {
            chunk.push('\n');
        }
        self.broker.append(self.job_id, chunk);
    }

    /// Control-plane message, distinguishable from command output.
    pub fn note(&self, message: impl AsRef<str>) {
        self.line(format!("[shipyard] {}", message.as_ref()));
    }
}

/// Ordered stream of one job's output. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    job_id: JobId,
    rx: mpsc::UnboundedReceiver<LogEvent>,
    broker: Weak<BrokerInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = LogEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.remove_subscriber(self.job_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn chunk(text: &str) -> LogEvent {
        LogEvent::Chunk {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_then_live() {
        let broker = LogBroker::new();
        let job = JobId(1);
        broker.open(job);
        broker.append(job, "a\n");
        broker.append(job, "b\n");

        let mut sub = broker.subscribe(job).unwrap();
        broker.append(job, "c\n");
        broker.finish(job, JobStatus::Completed, None);

        let events: Vec<LogEvent> = (&mut sub).collect().await;
        assert_eq!(
            events,
            vec![
                chunk("a\n"),
                chunk("b\n"),
                chunk("c\n"),
                LogEvent::End {
                    status: JobStatus::Completed,
                    error_message: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_chunk() {
        let broker = LogBroker::new();
        let job = JobId(7);
        broker.open(job);

        let mut first = broker.subscribe(job).unwrap();
        broker.append(job, "one");
        let mut second = broker.subscribe(job).unwrap();
        broker.append(job, "two");
        broker.finish(job, JobStatus::Failed, Some("install failed".into()));

        let a: Vec<LogEvent> = (&mut first).collect().await;
        let b: Vec<LogEvent> = (&mut second).collect().await;
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let broker = LogBroker::new();
        let job = JobId(3);
        broker.open(job);
        let sub = broker.subscribe(job).unwrap();
        assert_eq!(broker.subscriber_count(job), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(job), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent_after_finish() {
        let broker = LogBroker::new();
        let job = JobId(4);
        broker.open(job);
        let sub = broker.subscribe(job).unwrap();
        let id = sub.id();
        broker.unsubscribe(job, id);
        broker.finish(job, JobStatus::Completed, None);
        broker.unsubscribe(job, id);
        broker.unsubscribe(job, id);
        assert!(!broker.is_live(job));
    }

    #[test]
    fn subscribe_to_unknown_job_is_none() {
        let broker = LogBroker::new();
        assert!(broker.subscribe(JobId(99)).is_none());
    }

    #[tokio::test]
    async fn replay_of_finished_job_ends_with_status() {
        let broker = LogBroker::new();
        let mut sub = broker.replay_finished(JobId(5), "done\n", JobStatus::Completed, None);
        assert_eq!(sub.recv().await, Some(chunk("done\n")));
        assert!(matches!(sub.recv().await, Some(LogEvent::End { .. })));
        assert_eq!(sub.recv().await, None);
    }
}
